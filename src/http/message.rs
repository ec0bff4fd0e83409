//! waypoint/src/http/message.rs
//! `RequestHead`, the hop-by-hop stripping rewriter, and the framing rules
//! from spec.md §4.E: content-length passthrough, chunked re-framing for
//! HTTP/1.1+, and identity-until-close for HTTP/1.0.

use crate::destination::Destination;
use crate::error::{Error, Result};

/// Headers that must not be forwarded by a proxy (RFC 2616 §13.5.1).
pub const HOP_BY_HOP: &[&str] = &[
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "connection",
];

/// An ordered multimap preserving header insertion order and duplicates,
/// as spec.md §3 requires, with the first `Host` authoritative.
#[derive(Debug, Clone, Default)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn strip_hop_by_hop(&self) -> Headers {
        let retained = self
            .0
            .iter()
            .filter(|(k, _)| !HOP_BY_HOP.iter().any(|h| k.eq_ignore_ascii_case(h)))
            .cloned()
            .collect();
        Headers(retained)
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub version: (u8, u8),
    pub method: String,
    /// Whatever followed the method on the request line: `host:port` for
    /// CONNECT, an absolute URL for absolute-form, or a path for
    /// origin-form.
    pub target: String,
    pub headers: Headers,
    pub hop_by_hop_stripped: bool,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// The destination this head addresses, per spec.md §4.E step 5(ii):
    /// CONNECT's request-target for CONNECT, otherwise `Host` + path.
    pub fn destination(&self) -> Result<Destination> {
        if self.is_connect() {
            return parse_host_port(&self.target).ok_or(Error::BadRequest);
        }
        if let Some(rest) = self
            .target
            .strip_prefix("http://")
            .or_else(|| self.target.strip_prefix("https://"))
        {
            let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
            return parse_host_port(authority)
                .or_else(|| parse_host_only(authority, 80))
                .ok_or(Error::BadRequest);
        }
        let host = self.headers.get("host").ok_or(Error::BadRequest)?;
        parse_host_port(host)
            .or_else(|| parse_host_only(host, 80))
            .ok_or(Error::BadRequest)
    }

    /// Strips hop-by-hop headers, returning a new head ready for relay.
    pub fn stripped(&self) -> RequestHead {
        RequestHead {
            version: self.version,
            method: self.method.clone(),
            target: self.target.clone(),
            headers: self.headers.strip_hop_by_hop(),
            hop_by_hop_stripped: true,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(
            format!(
                "{} {} HTTP/{}.{}\r\n",
                self.method, self.target, self.version.0, self.version.1
            )
            .as_bytes(),
        );
        for (k, v) in &self.headers.0 {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn parse_host_port(s: &str) -> Option<Destination> {
    let (host, port) = s.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(Destination::host_port(host, port))
}

fn parse_host_only(s: &str, default_port: u16) -> Option<Destination> {
    if s.is_empty() {
        return None;
    }
    Some(Destination::host_port(s, default_port))
}

/// How a re-serialized request head's body must be framed for relay
/// (spec.md §4.E's framing rules).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// The method doesn't admit a body (`TRACE`).
    None,
    /// `Content-Length` was present; pass bodies through unchanged.
    ContentLength,
    /// HTTP/1.1+ without `Content-Length`: chunked transfer-encoding.
    Chunked,
    /// HTTP/1.0 without `Content-Length`: identity, relies on close.
    IdentityUntilClose,
}

/// Decides framing from the *original* head (before hop-by-hop stripping,
/// since `Content-Length` is not itself hop-by-hop and survives it).
pub fn decide_framing(head: &RequestHead) -> Result<Framing> {
    let admits_body = !head.method.eq_ignore_ascii_case("TRACE");
    let has_content_length = head.headers.contains("content-length");
    let chunked_te = head
        .headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if has_content_length && chunked_te {
        return Err(Error::BadRequest);
    }
    if !admits_body {
        return Ok(Framing::None);
    }
    if has_content_length {
        return Ok(Framing::ContentLength);
    }
    if head.version >= (1, 1) {
        Ok(Framing::Chunked)
    } else {
        Ok(Framing::IdentityUntilClose)
    }
}

/// Applies `framing` to a stripped head's headers in place: drops
/// `Content-Length` for `None`/`Chunked`, adds `Transfer-Encoding: chunked`
/// for `Chunked`.
pub fn apply_framing(head: &mut RequestHead, framing: Framing) {
    match framing {
        Framing::None => {
            head.headers.remove_all("content-length");
            head.headers.remove_all("transfer-encoding");
        }
        Framing::ContentLength | Framing::IdentityUntilClose => {}
        Framing::Chunked => {
            head.headers.remove_all("content-length");
            head.headers.remove_all("transfer-encoding");
            head.headers.push("Transfer-Encoding", "chunked");
        }
    }
}

/// One chunked-encoding frame for a non-empty body part. Empty parts are
/// suppressed entirely, never emitted as a zero-length chunk (spec.md
/// §8 scenario 5).
pub fn chunk_frame(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    let mut out = format!("{:x}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    Some(out)
}

/// The terminating `0\r\n[trailers]\r\n` chunked frame.
pub fn chunk_end(trailers: Option<&[(String, String)]>) -> Vec<u8> {
    let mut out = b"0\r\n".to_vec();
    if let Some(trailers) = trailers {
        for (k, v) in trailers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Parses a request head out of a buffer using `httparse`, returning the
/// head and the number of bytes it consumed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut raw_headers);
    let status = req.parse(buf).map_err(|_| Error::BadRequest)?;
    let httparse::Status::Complete(consumed) = status else {
        return Ok(None);
    };
    let version = match req.version {
        Some(0) => (1, 0),
        Some(1) => (1, 1),
        _ => return Err(Error::BadRequest),
    };
    let method = req.method.ok_or(Error::BadRequest)?.to_string();
    let target = req.path.ok_or(Error::BadRequest)?.to_string();
    let headers = req
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
    Ok(Some((
        RequestHead {
            version,
            method,
            target,
            headers: Headers(headers),
            hop_by_hop_stripped: false,
        },
        consumed,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, target: &str, version: (u8, u8), headers: Vec<(&str, &str)>) -> RequestHead {
        RequestHead {
            version,
            method: method.to_string(),
            target: target.to_string(),
            headers: Headers(
                headers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            hop_by_hop_stripped: false,
        }
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let h = head(
            "GET",
            "http://ads.example.net/x",
            (1, 1),
            vec![
                ("Host", "ads.example.net"),
                ("Proxy-Connection", "keep-alive"),
                ("Connection", "keep-alive"),
                ("X-Custom", "keep-me"),
            ],
        );
        let stripped = h.stripped();
        assert!(stripped.hop_by_hop_stripped);
        assert!(!stripped.headers.contains("proxy-connection"));
        assert!(!stripped.headers.contains("connection"));
        assert!(stripped.headers.contains("x-custom"));
    }

    #[test]
    fn connect_destination_from_authority_target() {
        let h = head("CONNECT", "example.com:443", (1, 1), vec![]);
        let dest = h.destination().unwrap();
        assert_eq!(dest, Destination::host_port("example.com", 443));
    }

    #[test]
    fn absolute_form_destination_from_url() {
        let h = head(
            "GET",
            "http://ads.example.net/x",
            (1, 1),
            vec![("Host", "ads.example.net")],
        );
        let dest = h.destination().unwrap();
        assert_eq!(dest, Destination::host_port("ads.example.net", 80));
    }

    #[test]
    fn origin_form_destination_from_host_header() {
        let h = head("GET", "/x", (1, 1), vec![("Host", "example.com:8080")]);
        let dest = h.destination().unwrap();
        assert_eq!(dest, Destination::host_port("example.com", 8080));
    }

    #[test]
    fn trace_never_admits_a_body() {
        let h = head("TRACE", "/", (1, 1), vec![("Content-Length", "5")]);
        // Assertion failure case aside, TRACE with a body is non-sensical;
        // framing must still come out as None once applied.
        let mut stripped = h.stripped();
        apply_framing(&mut stripped, Framing::None);
        assert!(!stripped.headers.contains("content-length"));
    }

    #[test]
    fn both_content_length_and_chunked_te_is_bad_request() {
        let h = head(
            "POST",
            "/",
            (1, 1),
            vec![("Content-Length", "5"), ("Transfer-Encoding", "chunked")],
        );
        assert!(matches!(decide_framing(&h), Err(Error::BadRequest)));
    }

    #[test]
    fn http11_without_content_length_uses_chunked() {
        let h = head("POST", "/", (1, 1), vec![]);
        assert_eq!(decide_framing(&h).unwrap(), Framing::Chunked);
    }

    #[test]
    fn http10_without_content_length_is_identity_until_close() {
        let h = head("POST", "/", (1, 0), vec![]);
        assert_eq!(decide_framing(&h).unwrap(), Framing::IdentityUntilClose);
    }

    #[test]
    fn chunked_reframing_matches_scenario_5() {
        // POST with body parts of size 5, 0, 7, no Content-Length, HTTP/1.1.
        let h = head("POST", "/", (1, 1), vec![]);
        assert_eq!(decide_framing(&h).unwrap(), Framing::Chunked);

        let mut out = Vec::new();
        out.extend(chunk_frame(b"abcde").unwrap());
        assert!(chunk_frame(b"").is_none());
        out.extend(chunk_frame(b"1234567").unwrap());
        out.extend(chunk_end(None));

        assert_eq!(out, b"5\r\nabcde\r\n7\r\n1234567\r\n0\r\n\r\n".to_vec());
    }

    #[test]
    fn parses_connect_request_line() {
        let buf = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (head, consumed) = parse_request_head(buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
    }

    #[test]
    fn incomplete_head_returns_none() {
        let buf = b"GET / HTTP/1.1\r\nHost: a";
        assert!(parse_request_head(buf).unwrap().is_none());
    }
}
