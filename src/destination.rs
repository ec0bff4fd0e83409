//! waypoint/src/destination.rs
//! The `Destination` sum type the matcher and dialer operate over
//! (spec.md §3).

use std::fmt;
use std::net::IpAddr;

/// A hostname, as the client asked for it. `Ip` destinations never need a
/// DNS lookup for `DomainSuffix`/`Domain`/`DomainKeyword` matching; they
/// only ever match `GeoIp` rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    Host(String),
    Ip(IpAddr),
}

impl Name {
    pub fn as_host_str(&self) -> String {
        match self {
            Name::Host(h) => h.clone(),
            Name::Ip(ip) => ip.to_string(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Name::Ip(ip) => Some(*ip),
            Name::Host(h) => h.parse().ok(),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Host(h) => write!(f, "{h}"),
            Name::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    HostPort { host: Name, port: u16 },
    Unix { path: String },
    Url { url: String },
}

impl Destination {
    pub fn host_port(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = host
            .parse::<IpAddr>()
            .map(Name::Ip)
            .unwrap_or(Name::Host(host));
        Destination::HostPort { host: name, port }
    }

    /// The hostname used for domain-family rule matching. `None` for `Unix`
    /// and for `Url` destinations that fail to parse an authority.
    pub fn match_host(&self) -> Option<String> {
        match self {
            Destination::HostPort { host, .. } => Some(host.as_host_str()),
            Destination::Unix { .. } => None,
            Destination::Url { url } => url::Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string())),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Destination::HostPort { port, .. } => Some(*port),
            Destination::Unix { .. } => None,
            Destination::Url { url } => url::Url::parse(url).ok().and_then(|u| u.port_or_known_default()),
        }
    }

    /// Resolves to `host:port`, as required by the HTTP CONNECT client
    /// handshake (spec.md §4.F). Unix destinations are unsupported there.
    pub fn as_authority(&self) -> crate::error::Result<String> {
        match self {
            Destination::HostPort { host, port } => Ok(format!("{host}:{port}")),
            Destination::Unix { .. } => Err(crate::error::Error::UnsupportedAddress),
            Destination::Url { url } => {
                let parsed =
                    url::Url::parse(url).map_err(|_| crate::error::Error::UnsupportedAddress)?;
                let host = parsed
                    .host_str()
                    .ok_or(crate::error::Error::UnsupportedAddress)?;
                let port = parsed
                    .port_or_known_default()
                    .ok_or(crate::error::Error::UnsupportedAddress)?;
                Ok(format!("{host}:{port}"))
            }
        }
    }

    pub fn is_ip_literal(&self) -> Option<IpAddr> {
        match self {
            Destination::HostPort { host, .. } => host.ip(),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::HostPort { host, port } => write!(f, "{host}:{port}"),
            Destination::Unix { path } => write!(f, "unix:{path}"),
            Destination::Url { url } => write!(f, "{url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_detects_ip_literal() {
        let d = Destination::host_port("93.184.216.34", 443);
        assert!(d.is_ip_literal().is_some());
        assert_eq!(d.match_host().as_deref(), Some("93.184.216.34"));
    }

    #[test]
    fn host_port_authority_roundtrip() {
        let d = Destination::host_port("example.com", 443);
        assert_eq!(d.as_authority().unwrap(), "example.com:443");
    }

    #[test]
    fn unix_destination_rejects_authority() {
        let d = Destination::Unix {
            path: "/tmp/x.sock".into(),
        };
        assert!(matches!(
            d.as_authority(),
            Err(crate::error::Error::UnsupportedAddress)
        ));
    }
}
