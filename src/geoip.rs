//! waypoint/src/geoip.rs
//! `IpCountryLookup` is the seam the matcher calls into for `GeoIp` rules.
//! The concrete MaxMind DB reader is an external collaborator (spec.md §1);
//! this module only defines the contract plus a couple of trivial
//! implementations useful without one configured.

use std::net::IpAddr;

/// Resolves an IP address to an ISO 3166-1 alpha-2 country code. Injected
/// once at startup (spec.md §9's redesign flag against a global mutable DB
/// handle) rather than reached for through a process-wide static.
pub trait IpCountryLookup: Send + Sync {
    /// Returns `None` if the address is unresolvable (private range, reader
    /// not loaded, lookup miss) — `GeoIp` matching treats that as "no
    /// match", never as an error (spec.md §4.B).
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Used when no GeoIP database is configured; every lookup misses, so
/// `GeoIp` rules simply never match.
pub struct NoopGeoIp;

impl IpCountryLookup for NoopGeoIp {
    fn lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}

#[cfg(test)]
pub(crate) struct StaticGeoIp(pub Vec<(IpAddr, &'static str)>);

#[cfg(test)]
impl IpCountryLookup for StaticGeoIp {
    fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.0
            .iter()
            .find(|(addr, _)| *addr == ip)
            .map(|(_, code)| code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_never_matches() {
        let geo = NoopGeoIp;
        assert_eq!(geo.lookup("1.1.1.1".parse().unwrap()), None);
    }

    #[test]
    fn static_lookup_resolves_known_ip() {
        let geo = StaticGeoIp(vec![("1.1.1.1".parse().unwrap(), "AU")]);
        assert_eq!(geo.lookup("1.1.1.1".parse().unwrap()), Some("AU".into()));
        assert_eq!(geo.lookup("8.8.8.8".parse().unwrap()), None);
    }
}
