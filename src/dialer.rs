//! waypoint/src/dialer.rs
//! The `OutboundDialer` contract (spec.md §4.D) plus the built-in leaf
//! dialers (`Direct`, `Reject`, `RejectTinyGif`) and the two upstream-proxy
//! dialers this crate implements directly (HTTP-CONNECT and SOCKS5).
//! Shadowsocks/VMESS/TLS dialers are external collaborators — the contract
//! only constrains their ordering.

use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::http::connect_client;
use crate::profile::Proxy;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte pipe, erased over the concrete transport (raw TCP,
/// an upstream-proxy tunnel, ...).
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub type BoxedStream = Box<dyn IoStream>;

#[async_trait]
pub trait OutboundDialer: Send + Sync {
    async fn dial(&self, destination: &Destination) -> Result<BoxedStream>;

    /// `true` only for the `REJECT-TINYGIF` builtin; tells the HTTP
    /// recipient whether a rejected CONNECT/request should get the canned
    /// GIF body instead of a bare close (spec.md §9).
    fn is_tiny_gif_reject(&self) -> bool {
        false
    }
}

pub struct DirectDialer;

#[async_trait]
impl OutboundDialer for DirectDialer {
    async fn dial(&self, destination: &Destination) -> Result<BoxedStream> {
        let Destination::HostPort { host, port } = destination else {
            return Err(Error::UnsupportedAddress);
        };
        let addr = format!("{host}:{port}");
        debug!(%addr, "dialing direct");
        let stream = TcpStream::connect(&addr).await?;
        Ok(Box::new(stream))
    }
}

pub struct RejectDialer;

#[async_trait]
impl OutboundDialer for RejectDialer {
    async fn dial(&self, _destination: &Destination) -> Result<BoxedStream> {
        Err(Error::Rejected)
    }
}

pub struct RejectTinyGifDialer;

#[async_trait]
impl OutboundDialer for RejectTinyGifDialer {
    async fn dial(&self, _destination: &Destination) -> Result<BoxedStream> {
        Err(Error::Rejected)
    }

    fn is_tiny_gif_reject(&self) -> bool {
        true
    }
}

/// Opens TCP (optionally TLS — via an injected connector, not implemented
/// here) to the proxy server, then layers the spec.md §4.F CONNECT
/// handshake on top of it.
pub struct HttpConnectDialer {
    pub proxy: Proxy,
}

#[async_trait]
impl OutboundDialer for HttpConnectDialer {
    async fn dial(&self, destination: &Destination) -> Result<BoxedStream> {
        let server = format!("{}:{}", self.proxy.server_address, self.proxy.port);
        let stream = TcpStream::connect(&server).await?;
        let tunneled = connect_client::handshake(stream, destination, &self.proxy).await?;
        Ok(Box::new(tunneled))
    }
}

/// Tunnels through a SOCKS5 upstream using `tokio-socks`, as the teacher's
/// `connection.rs` already does for its own upstream-proxy support.
pub struct Socks5Dialer {
    pub proxy: Proxy,
}

#[async_trait]
impl OutboundDialer for Socks5Dialer {
    async fn dial(&self, destination: &Destination) -> Result<BoxedStream> {
        use tokio_socks::tcp::Socks5Stream;

        let server = format!("{}:{}", self.proxy.server_address, self.proxy.port);
        let authority = destination.as_authority()?;

        let stream = if !self.proxy.username.is_empty() {
            Socks5Stream::connect_with_password(
                server.as_str(),
                authority.as_str(),
                self.proxy.username.as_str(),
                self.proxy.password.as_str(),
            )
            .await
        } else {
            Socks5Stream::connect(server.as_str(), authority.as_str()).await
        }
        .map_err(|e| {
            debug!(cause = %e, %server, "socks5 dial failed");
            Error::DialFailed(Box::new(Error::UnacceptableRead))
        })?;

        Ok(Box::new(stream))
    }
}

/// Not yet backed by a concrete transport in this crate; registered so the
/// policy registry can still resolve the name and report a clear
/// `DialFailed` instead of panicking. A real implementation plugs in via
/// `OutboundDialer` from outside this crate.
pub struct UnimplementedDialer {
    pub protocol: &'static str,
}

#[async_trait]
impl OutboundDialer for UnimplementedDialer {
    async fn dial(&self, _destination: &Destination) -> Result<BoxedStream> {
        Err(Error::DialFailed(Box::new(Error::UnknownPolicy(format!(
            "no {} dialer registered",
            self.protocol
        )))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reject_dialer_never_does_io() {
        let dialer = RejectDialer;
        let dest = Destination::host_port("example.com", 443);
        assert!(matches!(dialer.dial(&dest).await, Err(Error::Rejected)));
        assert!(!dialer.is_tiny_gif_reject());
    }

    #[tokio::test]
    async fn reject_tiny_gif_is_tagged() {
        let dialer = RejectTinyGifDialer;
        assert!(dialer.is_tiny_gif_reject());
        let dest = Destination::host_port("example.com", 443);
        assert!(matches!(dialer.dial(&dest).await, Err(Error::Rejected)));
    }

    #[tokio::test]
    async fn direct_dialer_rejects_unix_destination() {
        let dialer = DirectDialer;
        let dest = Destination::Unix {
            path: "/tmp/x.sock".into(),
        };
        assert!(matches!(
            dialer.dial(&dest).await,
            Err(Error::UnsupportedAddress)
        ));
    }
}
