//! waypoint/src/cli.rs
//! Command-line surface (spec.md §6 "CLI surface (delegated)"): flags that
//! mirror `basic_settings`, plus the process-level switches.

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutboundMode {
    Direct,
    Global,
}

#[derive(Debug, Parser)]
#[command(name = "waypoint", about = "Rule-based HTTP/SOCKS proxy gateway")]
pub struct Cli {
    /// Path to the JSON profile (basic_settings, rules, mitm, policies, policy_groups).
    #[arg(long)]
    pub config_file: String,

    #[arg(long, value_enum, default_value_t = OutboundMode::Direct)]
    pub outbound_mode: OutboundMode,

    #[arg(long, default_value_t = false)]
    pub enable_http_capture: bool,

    #[arg(long, default_value_t = false)]
    pub enable_mitm: bool,

    /// Overrides `basic_settings.http_listen_address`.
    #[arg(long)]
    pub http_listen_address: Option<String>,

    /// Overrides `basic_settings.http_listen_port`.
    #[arg(long)]
    pub http_listen_port: Option<u16>,

    /// Overrides `basic_settings.socks_listen_address`.
    #[arg(long)]
    pub socks_listen_address: Option<String>,

    /// Overrides `basic_settings.socks_listen_port`.
    #[arg(long)]
    pub socks_listen_port: Option<u16>,

    /// Overrides `basic_settings.log_level`.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to a MaxMind GeoIP database; omitted means GeoIP rules never match.
    #[arg(long)]
    pub geoip_db: Option<String>,

    /// The exact `Proxy-Authorization` header value clients must present.
    /// Not part of the profile's `basic_settings` (spec.md §6 enumerates
    /// that set exhaustively and it has no room for this); omitted means
    /// the gateway accepts unauthenticated requests.
    #[arg(long)]
    pub proxy_authorization: Option<String>,

    /// Connection-wide idle deadline once past the handshake, in seconds.
    /// Off (`None`) by default, per spec.md §5.
    #[arg(long)]
    pub idle_deadline_secs: Option<u64>,
}
