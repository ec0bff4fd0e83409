//! waypoint/src/main.rs
//! Binary entry point: loads the profile, compiles rules and policies into
//! an `AppState`, binds the HTTP listener, and runs the coordinator until
//! a shutdown signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use waypoint::cli::Cli;
use waypoint::coordinator::{self, CoordinatorConfig};
use waypoint::dialer::{
    DirectDialer, HttpConnectDialer, OutboundDialer, RejectDialer, RejectTinyGifDialer,
    Socks5Dialer, UnimplementedDialer,
};
use waypoint::geoip::{IpCountryLookup, NoopGeoIp};
use waypoint::policy::PolicyRegistry;
use waypoint::profile::{PolicyConfig, Profile, ProxyProtocol};
use waypoint::rule::Matcher;
use waypoint::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    waypoint::logging::init_logging(cli.log_level.as_deref().unwrap_or("waypoint=info,warn"));

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            Err(e)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let profile_text = tokio::fs::read_to_string(&cli.config_file)
        .await
        .with_context(|| format!("reading profile at {}", cli.config_file))?;
    let profile = Profile::from_json(&profile_text).context("parsing profile")?;

    let rules = profile.compile_rules().context("compiling rules")?;
    let matcher = Matcher::new(rules, 1, cache_root());

    let leaves = profile
        .policies
        .iter()
        .map(|(name, config)| build_dialer(config).map(|dialer| (name.clone(), dialer)))
        .collect::<Result<Vec<_>>>()?;
    let groups = profile
        .policy_groups
        .iter()
        .cloned()
        .map(Into::into)
        .collect();
    let registry = PolicyRegistry::new(leaves, groups).context("building policy registry")?;

    let geoip: Arc<dyn IpCountryLookup> = if let Some(path) = &cli.geoip_db {
        tracing::warn!(%path, "geoip_db configured but no MaxMind reader is linked in; GeoIp rules will never match");
        Arc::new(NoopGeoIp)
    } else {
        Arc::new(NoopGeoIp)
    };

    let state = Arc::new(AppState::new(matcher, registry, geoip));

    let http_address = cli
        .http_listen_address
        .clone()
        .or(profile.basic_settings.http_listen_address.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let http_port = cli
        .http_listen_port
        .or(profile.basic_settings.http_listen_port)
        .unwrap_or(6152);
    let listener = coordinator::bind(&format!("{http_address}:{http_port}"))
        .await
        .with_context(|| format!("binding HTTP listener on {http_address}:{http_port}"))?;

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    let config = CoordinatorConfig {
        handshake_timeout: Duration::from_secs(60),
        idle_deadline: cli.idle_deadline_secs.map(Duration::from_secs),
        proxy_authorization: cli.proxy_authorization.clone(),
    };

    coordinator::run(listener, state, config)
        .await
        .context("coordinator run loop")?;
    Ok(())
}

fn cache_root() -> std::path::PathBuf {
    std::env::var_os("WAYPOINT_CACHE_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp/waypoint"))
}

fn build_dialer(config: &PolicyConfig) -> Result<Arc<dyn OutboundDialer>> {
    Ok(match config {
        PolicyConfig::Direct => Arc::new(DirectDialer),
        PolicyConfig::Reject => Arc::new(RejectDialer),
        PolicyConfig::RejectTinyGif => Arc::new(RejectTinyGifDialer),
        PolicyConfig::Proxy { proxy } => {
            proxy.validate().context("validating proxy policy")?;
            match proxy.protocol {
                ProxyProtocol::Http | ProxyProtocol::Https => Arc::new(HttpConnectDialer {
                    proxy: proxy.clone(),
                }),
                ProxyProtocol::Socks5 | ProxyProtocol::Socks5Tls => Arc::new(Socks5Dialer {
                    proxy: proxy.clone(),
                }),
                ProxyProtocol::Shadowsocks => Arc::new(UnimplementedDialer {
                    protocol: "shadowsocks",
                }),
                ProxyProtocol::Vmess => Arc::new(UnimplementedDialer { protocol: "vmess" }),
            }
        }
    })
}
