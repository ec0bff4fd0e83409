//! waypoint/src/http/recipient.rs
//! The HTTP proxy recipient state machine (spec.md §4.E): parses the
//! inbound request, authenticates, dispatches through the matcher and
//! policy registry, dials, and hands off to the coordinator for splicing.

use super::message::{
    apply_framing, chunk_end, chunk_frame, decide_framing, parse_request_head, Framing,
    RequestHead,
};
use crate::dialer::{BoxedStream, OutboundDialer};
use crate::error::{Error, Result};
use crate::geoip::IpCountryLookup;
use crate::policy::PolicyRegistry;
use crate::rule::Matcher;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_SIZE: usize = 64 * 1024;

/// 1x1 transparent GIF, served in place of a bare close when a
/// `REJECT-TINYGIF` policy rejects a request whose `Accept` header asks for
/// an image (spec.md §9's resolved open question).
pub const TINY_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff,
    0xff, 0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Immutable references the recipient dispatches through. Constructed once
/// per matcher generation and shared across connections.
pub struct DispatchContext<'a> {
    pub matcher: &'a Matcher,
    pub geoip: &'a dyn IpCountryLookup,
    pub registry: &'a PolicyRegistry,
    /// `Some(expected_value)` when proxy authentication is required; the
    /// request's `Proxy-Authorization` header must string-equal it.
    pub proxy_authorization: Option<&'a str>,
}

/// What the recipient decided, handed back to the coordinator.
pub enum Outcome {
    /// CONNECT succeeded: the `200 Connection Established` response has
    /// already been written. The coordinator installs a raw splice.
    Connect(BoxedStream),
    /// A plain-HTTP request was dispatched: `prelude` (the re-serialized,
    /// framed head + body + end marker) must be written to `outbound`
    /// before the coordinator makes the connection transparent in both
    /// directions.
    Relay { outbound: BoxedStream, prelude: Vec<u8> },
    /// The connection was already handled (error response, or no further
    /// bytes to exchange) and should simply be closed.
    Closed,
}

/// Drives one inbound HTTP request through `Setup -> Waiting -> Preparing
/// -> Ready|Failed`. `inbound` is read from directly; any error response
/// required by spec.md §4.E step 7 is written to it before returning
/// `Ok(Outcome::Closed)`.
pub async fn handle<I>(inbound: &mut I, ctx: &DispatchContext<'_>) -> Result<Outcome>
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    match try_handle(inbound, ctx).await {
        Ok(outcome) => Ok(outcome),
        Err(Error::UserCancelled(reason)) => Err(Error::UserCancelled(reason)),
        Err(e) => {
            write_error_response(inbound, &e).await.ok();
            Ok(Outcome::Closed)
        }
    }
}

async fn try_handle<I>(inbound: &mut I, ctx: &DispatchContext<'_>) -> Result<Outcome>
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = HeadReader::new(inbound);
    let head = reader.read_head().await?;

    if head.is_connect() {
        return finish_connect(&mut reader, head, ctx).await;
    }
    finish_relay(&mut reader, head, ctx).await
}

async fn finish_connect<I>(
    reader: &mut HeadReader<'_, I>,
    head: RequestHead,
    ctx: &DispatchContext<'_>,
) -> Result<Outcome>
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    authenticate(&head, ctx)?;
    let dest = head.destination()?;
    let (dialer, outbound_result) = dial_for(&dest, ctx).await;

    match outbound_result {
        Ok(outbound) => {
            reader
                .write_all(b"HTTP/1.1 200 Connection Established\r\nContent-Length: 0\r\n\r\n")
                .await?;
            Ok(Outcome::Connect(outbound))
        }
        Err(Error::Rejected) if dialer.is_tiny_gif_reject() && accepts_image(&head) => {
            reader.write_tiny_gif().await?;
            Ok(Outcome::Closed)
        }
        Err(e) => Err(e),
    }
}

async fn finish_relay<I>(
    reader: &mut HeadReader<'_, I>,
    head: RequestHead,
    ctx: &DispatchContext<'_>,
) -> Result<Outcome>
where
    I: AsyncRead + AsyncWrite + Unpin + Send,
{
    authenticate(&head, ctx)?;

    let framing = decide_framing(&head)?;
    let mut rewritten = head.stripped();
    apply_framing(&mut rewritten, framing);

    let mut prelude = rewritten.serialize();
    let trailers = reader.read_body_into(framing, &head, &mut prelude).await?;
    if framing == Framing::Chunked {
        prelude.extend(chunk_end(trailers.as_deref()));
    }

    let dest = head.destination()?;
    let (dialer, outbound_result) = dial_for(&dest, ctx).await;

    match outbound_result {
        Ok(outbound) => Ok(Outcome::Relay { outbound, prelude }),
        Err(Error::Rejected) if dialer.is_tiny_gif_reject() && accepts_image(&head) => {
            reader.write_tiny_gif().await?;
            Ok(Outcome::Closed)
        }
        Err(e) => Err(e),
    }
}

async fn dial_for(
    dest: &crate::destination::Destination,
    ctx: &DispatchContext<'_>,
) -> (std::sync::Arc<dyn OutboundDialer>, Result<BoxedStream>) {
    let rule = match ctx.matcher.match_destination(dest, ctx.geoip) {
        Some(rule) => rule,
        None => {
            return (
                std::sync::Arc::new(crate::dialer::RejectDialer),
                Err(Error::BadRequest),
            )
        }
    };
    let dialer = match ctx.registry.resolve(rule.policy_name()) {
        Ok(d) => d,
        Err(e) => return (std::sync::Arc::new(crate::dialer::RejectDialer), Err(e)),
    };
    let result = dialer.dial(dest).await;
    (dialer, result)
}

fn authenticate(head: &RequestHead, ctx: &DispatchContext<'_>) -> Result<()> {
    let Some(expected) = ctx.proxy_authorization else {
        return Ok(());
    };
    match head.headers.get("proxy-authorization") {
        Some(actual) if actual == expected => Ok(()),
        _ => Err(Error::ProxyAuthenticationRequired),
    }
}

fn accepts_image(head: &RequestHead) -> bool {
    head.headers
        .get("accept")
        .map(|v| v.contains("image/"))
        .unwrap_or(false)
}

async fn write_error_response<I: AsyncWrite + Unpin>(inbound: &mut I, err: &Error) -> Result<()> {
    let status = err.as_http_status();
    let reason = match status {
        400 => "Bad Request",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        _ => "Bad Gateway",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    );
    inbound.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Buffers raw bytes off `inbound` until a complete head is parsed, then
/// serves body reads out of the same buffer before touching the socket
/// again. This is the concrete (in-crate) HTTP codec feeding the
/// recipient; spec.md §4.E only specifies the `{Head, Body, End}` part
/// sequence it must see, not how those parts are produced.
struct HeadReader<'a, I> {
    inbound: &'a mut I,
    buf: Vec<u8>,
}

impl<'a, I: AsyncRead + Unpin> HeadReader<'a, I> {
    fn new(inbound: &'a mut I) -> Self {
        Self {
            inbound,
            buf: Vec::new(),
        }
    }

    async fn read_head(&mut self) -> Result<RequestHead> {
        loop {
            if let Some((head, consumed)) = parse_request_head(&self.buf)? {
                self.buf.drain(..consumed);
                return Ok(head);
            }
            if self.buf.len() >= MAX_HEAD_SIZE {
                return Err(Error::BadRequest);
            }
            let mut chunk = [0u8; 4096];
            let n = self.inbound.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ChannelInactive);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn fill_at_least(&mut self, n: usize) -> Result<()> {
        while self.buf.len() < n {
            let mut chunk = [0u8; 4096];
            let read = self.inbound.read(&mut chunk).await?;
            if read == 0 {
                return Err(Error::BadRequest);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }

    /// Reads and re-frames the request body per `framing`, appending the
    /// wire bytes to `out`. Returns trailers, if any were present on a
    /// chunked body. `framing` governs the *output* encoding; what's
    /// actually read off the wire is decided from `head`'s own
    /// `Content-Length`/`Transfer-Encoding` — an HTTP/1.1 request with
    /// neither present has a zero-length body even when `framing` chose
    /// `Chunked` for the (otherwise empty) relayed request.
    async fn read_body_into(
        &mut self,
        framing: Framing,
        head: &RequestHead,
        out: &mut Vec<u8>,
    ) -> Result<Option<Vec<(String, String)>>> {
        let chunked_inbound = head
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        match framing {
            Framing::None => Ok(None),
            Framing::ContentLength => {
                let len: usize = head
                    .headers
                    .get("content-length")
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or(Error::BadRequest)?;
                self.read_content_length_body(len, out).await?;
                Ok(None)
            }
            Framing::Chunked if chunked_inbound => self.read_chunked_body(out).await,
            Framing::Chunked => Ok(None),
            Framing::IdentityUntilClose => {
                self.read_until_eof(out).await?;
                Ok(None)
            }
        }
    }

    async fn read_until_eof(&mut self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.buf);
        self.buf.clear();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.inbound.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    async fn read_chunked_body(
        &mut self,
        out: &mut Vec<u8>,
    ) -> Result<Option<Vec<(String, String)>>> {
        loop {
            let line = self.read_line().await?;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16).map_err(|_| Error::BadRequest)?;
            if size == 0 {
                let trailers = self.read_trailers().await?;
                return Ok(if trailers.is_empty() {
                    None
                } else {
                    Some(trailers)
                });
            }
            self.fill_at_least(size + 2).await?;
            let data: Vec<u8> = self.buf.drain(..size).collect();
            let crlf: Vec<u8> = self.buf.drain(..2).collect();
            if crlf != b"\r\n" {
                return Err(Error::BadRequest);
            }
            if let Some(frame) = chunk_frame(&data) {
                out.extend(frame);
            }
        }
    }

    async fn read_trailers(&mut self) -> Result<Vec<(String, String)>> {
        let mut trailers = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(trailers);
            }
            if let Some((name, value)) = line.split_once(':') {
                trailers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return Ok(String::from_utf8_lossy(&line[..line.len() - 2]).into_owned());
            }
            if self.buf.len() >= MAX_HEAD_SIZE {
                return Err(Error::BadRequest);
            }
            let mut chunk = [0u8; 4096];
            let n = self.inbound.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::BadRequest);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_content_length_body(&mut self, len: usize, out: &mut Vec<u8>) -> Result<()> {
        self.fill_at_least(len).await?;
        let data: Vec<u8> = self.buf.drain(..len).collect();
        out.extend_from_slice(&data);
        Ok(())
    }
}

/// Writes go straight through to the underlying stream; `HeadReader` owns
/// the only `&mut I` for the lifetime of the handshake, so routing both
/// directions through it (rather than threading a second `&mut I` alongside
/// it) is what keeps this a single borrow.
impl<'a, I: AsyncRead + AsyncWrite + Unpin> HeadReader<'a, I> {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inbound.write_all(buf).await?;
        Ok(())
    }

    async fn write_tiny_gif(&mut self) -> Result<()> {
        self.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: image/gif\r\nContent-Length: 43\r\n\r\n")
            .await?;
        self.write_all(&TINY_GIF).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::{DirectDialer, RejectDialer};
    use crate::geoip::NoopGeoIp;
    use crate::policy::PolicyRegistry;
    use crate::rule::{Matcher, Rule};
    use tokio::io::duplex;

    fn direct_final_matcher() -> Matcher {
        Matcher::new(
            vec![Rule::Final {
                policy_name: "DIRECT".into(),
                reason: None,
            }],
            1,
            "/tmp/waypoint-test",
        )
    }

    fn reject_suffix_matcher() -> Matcher {
        Matcher::new(
            vec![
                Rule::DomainSuffix {
                    expression: "example.net".into(),
                    policy_name: "REJECT".into(),
                    comment: None,
                },
                Rule::Final {
                    policy_name: "DIRECT".into(),
                    reason: None,
                },
            ],
            1,
            "/tmp/waypoint-test",
        )
    }

    #[tokio::test]
    async fn scenario_3_connect_bad_auth_gets_407() {
        let matcher = direct_final_matcher();
        let geo = NoopGeoIp;
        let registry = PolicyRegistry::new(vec![], vec![]).unwrap();
        let ctx = DispatchContext {
            matcher: &matcher,
            geoip: &geo,
            registry: &registry,
            proxy_authorization: Some("Basic dXNlcjpwYXNz"),
        };

        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"CONNECT a.b:443 HTTP/1.1\r\nProxy-Authorization: Basic d3Jvbmc=\r\n\r\n")
            .await
            .unwrap();

        let outcome = handle(&mut server, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Closed));

        let mut response = vec![0u8; 4096];
        let n = client.read(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response[..n]);
        assert_eq!(
            response,
            "HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn scenario_2_rejects_without_dialing() {
        let matcher = reject_suffix_matcher();
        let geo = NoopGeoIp;
        let registry = PolicyRegistry::new(vec![], vec![]).unwrap();
        let ctx = DispatchContext {
            matcher: &matcher,
            geoip: &geo,
            registry: &registry,
            proxy_authorization: None,
        };

        let (mut client, mut server) = duplex(4096);
        client
            .write_all(
                b"GET http://ads.example.net/x HTTP/1.1\r\nHost: ads.example.net\r\nProxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();
        drop(client);

        let outcome = handle(&mut server, &ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Closed));
    }

    #[test]
    fn tiny_gif_is_43_bytes() {
        assert_eq!(TINY_GIF.len(), 43);
    }

    #[test]
    fn dialer_arc_types_compile() {
        let _: std::sync::Arc<dyn OutboundDialer> = std::sync::Arc::new(DirectDialer);
        let _: std::sync::Arc<dyn OutboundDialer> = std::sync::Arc::new(RejectDialer);
    }

    fn head(method: &str, target: &str, version: (u8, u8), headers: Vec<(&str, &str)>) -> RequestHead {
        RequestHead {
            version,
            method: method.to_string(),
            target: target.to_string(),
            headers: crate::http::message::Headers(
                headers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            hop_by_hop_stripped: false,
        }
    }

    #[tokio::test]
    async fn decodes_chunked_inbound_body_and_reframes_it() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(b"5\r\nabcde\r\n7\r\n1234567\r\n0\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        let mut reader = HeadReader::new(&mut server);
        let h = head(
            "POST",
            "/",
            (1, 1),
            vec![("Transfer-Encoding", "chunked")],
        );
        let mut out = Vec::new();
        reader.read_body_into(Framing::Chunked, &h, &mut out).await.unwrap();
        assert_eq!(out, b"5\r\nabcde\r\n7\r\n1234567\r\n".to_vec());
    }

    #[tokio::test]
    async fn bodyless_get_reads_nothing() {
        let (client, mut server) = duplex(4096);
        drop(client);

        let mut reader = HeadReader::new(&mut server);
        let h = head("GET", "/", (1, 1), vec![]);
        let mut out = Vec::new();
        reader
            .read_body_into(Framing::Chunked, &h, &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
