//! waypoint/src/logging.rs
//! Logging initialization and runtime level updates, via the same
//! `Once` + `EnvFilter` + reload-handle pattern the teacher used. Unlike
//! `AppState`'s per-process resources, the `tracing` global subscriber is
//! itself a singleton by design, so a small module-local static for its
//! reload handle is the idiomatic seam rather than a redesign smell.

use lazy_static::lazy_static;
use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt, reload::Handle as ReloadHandle, reload::Layer as ReloadLayer};

static LOG_INIT: Once = Once::new();

lazy_static! {
    static ref RELOAD_HANDLE: std::sync::Mutex<Option<ReloadHandle<EnvFilter, tracing_subscriber::Registry>>> =
        std::sync::Mutex::new(None);
}

/// Installs the global subscriber once per process. `default` is an
/// `EnvFilter` directive string (e.g. `"waypoint=info,warn"`), overridden
/// by `RUST_LOG` if set.
pub fn init_logging(default: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let (reload_layer, handle) = ReloadLayer::new(filter);
        let subscriber = tracing_subscriber::registry()
            .with(reload_layer)
            .with(fmt::layer());
        tracing::subscriber::set_global_default(subscriber).ok();
        *RELOAD_HANDLE.lock().unwrap() = Some(handle);
    });
}

/// Replaces the active filter directive at runtime, e.g. in response to a
/// config reload. No-op if logging hasn't been initialized yet.
pub fn set_log_level(directive: &str) {
    if let Some(handle) = RELOAD_HANDLE.lock().unwrap().as_ref() {
        let _ = handle.reload(EnvFilter::new(directive));
    }
}
