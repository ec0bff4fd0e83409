//! waypoint/src/coordinator.rs
//! The connection lifecycle coordinator (spec.md §4.G): accept loop with a
//! quiescer, per-connection handshake timeout, and the post-`Ready` splice
//! with an optional connection-wide idle deadline.

use crate::dialer::BoxedStream;
use crate::error::{Error, Result};
use crate::http::recipient::{self, DispatchContext, Outcome};
use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Knobs the accept loop and splice honor. `handshake_timeout` bounds only
/// `Setup`/`Waiting`/`Preparing`; once `Ready`, only `idle_deadline`
/// (default off) applies, per spec.md §5.
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub handshake_timeout: Duration,
    pub idle_deadline: Option<Duration>,
    pub proxy_authorization: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(60),
            idle_deadline: None,
            proxy_authorization: None,
        }
    }
}

/// Binds a TCP listener the way the accept loop expects. `TCP_NODELAY` is
/// applied per accepted stream rather than on the listener (ztunnel's
/// `DefaultSocketFactory` does the same split between listener- and
/// stream-level socket options).
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    Ok(listener)
}

/// Runs the accept loop until `state.shutdown` is cancelled, then waits for
/// every in-flight connection to finish before returning (the quiescer).
pub async fn run(listener: TcpListener, state: Arc<AppState>, config: CoordinatorConfig) -> Result<()> {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true).ok();
                let state = state.clone();
                let config = config.clone();
                state.metrics.connection_opened();
                in_flight.spawn(async move {
                    if let Err(e) = handle_connection(stream, state.clone(), &config).await {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                    state.metrics.connection_closed();
                });
            }
        }
    }

    info!(in_flight = in_flight.len(), "quiescing: draining in-flight connections");
    while in_flight.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    mut inbound: TcpStream,
    state: Arc<AppState>,
    config: &CoordinatorConfig,
) -> Result<()> {
    let matcher = state.matcher();
    let ctx = DispatchContext {
        matcher: &matcher,
        geoip: state.geoip(),
        registry: state.registry(),
        proxy_authorization: config.proxy_authorization.as_deref(),
    };

    let outcome = tokio::select! {
        _ = state.shutdown.cancelled() => {
            return Err(Error::UserCancelled("shutdown during handshake".into()));
        }
        result = tokio::time::timeout(config.handshake_timeout, recipient::handle(&mut inbound, &ctx)) => {
            match result {
                Err(_elapsed) => {
                    warn!("handshake timed out");
                    return Err(Error::RequestTimeout);
                }
                Ok(inner) => inner?,
            }
        }
    };

    match outcome {
        Outcome::Closed => Ok(()),
        Outcome::Connect(outbound) => splice(inbound, outbound, &state, config.idle_deadline).await,
        Outcome::Relay { mut outbound, prelude } => {
            outbound.write_all(&prelude).await?;
            splice(inbound, outbound, &state, config.idle_deadline).await
        }
    }
}

/// Installs the symmetric bidirectional pipe spec.md §4.G describes.
/// `tokio::io::copy_bidirectional` already honors the "pause on a full
/// write buffer, resume once drained" backpressure contract internally, so
/// the coordinator only needs to enforce the optional idle deadline and
/// record byte counts.
async fn splice(
    mut inbound: TcpStream,
    mut outbound: BoxedStream,
    state: &AppState,
    idle_deadline: Option<Duration>,
) -> Result<()> {
    let copy = tokio::io::copy_bidirectional(&mut inbound, &mut outbound);
    let (sent, received) = match idle_deadline {
        Some(deadline) => tokio::time::timeout(deadline, copy)
            .await
            .map_err(|_| Error::RequestTimeout)??,
        None => copy.await?,
    };
    state.metrics.record_transfer(sent, received);
    Ok(())
}
