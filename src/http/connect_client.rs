//! waypoint/src/http/connect_client.rs
//! The upstream HTTP-CONNECT client handshake (spec.md §4.F): `Setup ->
//! Waiting(timeout) -> Preparing(timeout) -> Ready | Failed`.

use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::profile::Proxy;
use base64::Engine;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Sends `CONNECT <authority> HTTP/1.1`, optionally with
/// `Proxy-Authorization`, and waits for the response head. On a `2xx`
/// response the returned stream replays any bytes the proxy sent
/// immediately after the head (there must be none per spec, but a
/// pipelining proxy's first response byte can race with the request
/// write) before reading further from the underlying connection.
pub async fn handshake<S>(mut stream: S, destination: &Destination, proxy: &Proxy) -> Result<PrefixedStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let authority = destination.as_authority()?;
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\n");
    if proxy.auth_required {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", proxy.username, proxy.password));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");

    tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.write_all(request.as_bytes()))
        .await
        .map_err(|_| Error::RequestTimeout)??;

    let mut buf = Vec::new();
    let (status, consumed) = loop {
        if let Some(result) = parse_response_head(&buf)? {
            break result;
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::UnacceptableRead);
        }
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::RequestTimeout)??;
        if n == 0 {
            return Err(Error::ChannelInactive);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let leftover = buf.split_off(consumed);
    match status {
        200..=299 => Ok(PrefixedStream::new(leftover, stream)),
        407 => Err(Error::ProxyAuthenticationRequired),
        other => Err(Error::UnacceptableStatus(other)),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(u16, usize)>> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut raw_headers);
    let status = response.parse(buf).map_err(|_| Error::UnacceptableRead)?;
    let httparse::Status::Complete(consumed) = status else {
        return Ok(None);
    };
    let code = response.code.ok_or(Error::UnacceptableRead)?;
    if (200..300).contains(&code) {
        let has_body_header = response.headers.iter().any(|h| {
            h.name.eq_ignore_ascii_case("content-length")
                || h.name.eq_ignore_ascii_case("transfer-encoding")
        });
        if has_body_header {
            // A successful CONNECT response must not carry a body.
            return Err(Error::UnacceptableRead);
        }
    }
    Ok(Some((code, consumed)))
}

/// Wraps an upstream stream so bytes already read during the handshake are
/// replayed to the first caller before the underlying connection is read
/// from again. Implements `AsyncRead`/`AsyncWrite` by delegation; `S: Unpin`
/// makes the wrapper itself structurally `Unpin`.
pub struct PrefixedStream<S> {
    leftover: Vec<u8>,
    cursor: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(leftover: Vec<u8>, inner: S) -> Self {
        Self {
            leftover,
            cursor: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.cursor < self.leftover.len() {
            let remaining = &self.leftover[self.cursor..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.cursor += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProxyProtocol;
    use tokio::io::{duplex, AsyncReadExt};

    fn test_proxy(auth_required: bool) -> Proxy {
        Proxy {
            server_address: "proxy.example".into(),
            port: 8080,
            protocol: ProxyProtocol::Http,
            username: "user".into(),
            password: "pass".into(),
            auth_required,
            prefer_http_tunneling: false,
            over_tls: false,
            over_websocket: false,
            ws_path: None,
            skip_cert_verify: false,
            sni: None,
            cert_pinning: None,
            algorithm: None,
        }
    }

    #[tokio::test]
    async fn successful_connect_yields_ready_stream() {
        let (mut server, client) = duplex(4096);
        let destination = Destination::host_port("example.com", 443);
        let proxy = test_proxy(true);

        let client_task = tokio::spawn(async move { handshake(client, &destination, &proxy).await });

        let mut request = vec![0u8; 4096];
        let n = server.read(&mut request).await.unwrap();
        let request = String::from_utf8_lossy(&request[..n]);
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic"));

        server
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();

        let mut tunneled = client_task.await.unwrap().unwrap();
        server.write_all(b"payload").await.unwrap();
        let mut got = [0u8; 7];
        tunneled.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"payload");
    }

    #[tokio::test]
    async fn proxy_auth_failure_maps_to_407() {
        let (mut server, client) = duplex(4096);
        let destination = Destination::host_port("example.com", 443);
        let proxy = test_proxy(false);

        let client_task = tokio::spawn(async move { handshake(client, &destination, &proxy).await });

        let mut request = vec![0u8; 4096];
        server.read(&mut request).await.unwrap();
        server
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        let result = client_task.await.unwrap();
        assert!(matches!(result, Err(Error::ProxyAuthenticationRequired)));
    }

    #[tokio::test]
    async fn unexpected_status_is_unacceptable() {
        let (mut server, client) = duplex(4096);
        let destination = Destination::host_port("example.com", 443);
        let proxy = test_proxy(false);

        let client_task = tokio::spawn(async move { handshake(client, &destination, &proxy).await });

        let mut request = vec![0u8; 4096];
        server.read(&mut request).await.unwrap();
        server.write_all(b"HTTP/1.1 503 Busy\r\n\r\n").await.unwrap();

        let result = client_task.await.unwrap();
        assert!(matches!(result, Err(Error::UnacceptableStatus(503))));
    }
}
