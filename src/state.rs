//! waypoint/src/state.rs
//! Process-wide shared state, owned by one `AppState` value rather than
//! scattered through process statics (spec.md §9's redesign flag against a
//! global mutable DB handle — generalized here to every shared resource
//! the teacher kept in `lazy_static!` globals).

use crate::geoip::IpCountryLookup;
use crate::policy::PolicyRegistry;
use crate::rule::Matcher;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Per-process counters, read by an operator surface and written from the
/// coordinator's accept/splice loop. Owned here instead of free statics so
/// tests can construct an isolated instance.
#[derive(Default)]
pub struct Metrics {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl Metrics {
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }
}

/// Cooperative shutdown signal, checked at every suspension point (spec.md
/// §5). Cloning shares the same underlying channel.
#[derive(Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called. Safe to await alongside
    /// socket reads/writes in a `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a connection worker needs to dispatch a request, shared
/// read-many/write-rare across the whole process (spec.md §5 "Shared
/// resources"). The matcher is swapped generationally; the policy
/// registry's only mutable part (group selection) is internally
/// synchronized, so the registry itself is just shared by `Arc`.
pub struct AppState {
    matcher: ArcSwap<Matcher>,
    registry: Arc<PolicyRegistry>,
    geoip: Arc<dyn IpCountryLookup>,
    pub metrics: Metrics,
    pub shutdown: ShutdownToken,
}

impl AppState {
    pub fn new(
        matcher: Matcher,
        registry: PolicyRegistry,
        geoip: Arc<dyn IpCountryLookup>,
    ) -> Self {
        Self {
            matcher: ArcSwap::from_pointee(matcher),
            registry: Arc::new(registry),
            geoip,
            metrics: Metrics::default(),
            shutdown: ShutdownToken::new(),
        }
    }

    /// The matcher generation in effect right now. Connections hold this
    /// snapshot for their whole lifetime, per spec.md §5's "Rule matcher"
    /// guarantee.
    pub fn matcher(&self) -> Arc<Matcher> {
        self.matcher.load_full()
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn geoip(&self) -> &dyn IpCountryLookup {
        self.geoip.as_ref()
    }

    /// Publishes a newly compiled matcher generation atomically. In-flight
    /// connections keep the `Arc<Matcher>` they already loaded.
    pub fn swap_matcher(&self, matcher: Matcher) {
        self.matcher.store(Arc::new(matcher));
    }
}
