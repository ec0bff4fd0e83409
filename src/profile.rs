//! waypoint/src/profile.rs
//! The parsed `Profile` value the core consumes (spec.md §3, §6). The
//! on-disk grammar (e.g. an INI-style dialect) is the declared Non-goal
//! collaborator; this module defines the JSON shape this crate accepts
//! once that collaborator has done its job, plus the rule-line grammar
//! referenced by `rules` (`TYPE,expression,policy[,comment]`).

use crate::error::{Error, Result};
use crate::policy::Group;
use crate::rule::Rule;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
    Socks5Tls,
    Shadowsocks,
    Vmess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub server_address: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub prefer_http_tunneling: bool,
    #[serde(default)]
    pub over_tls: bool,
    #[serde(default)]
    pub over_websocket: bool,
    #[serde(default)]
    pub ws_path: Option<String>,
    #[serde(default)]
    pub skip_cert_verify: bool,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub cert_pinning: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
}

impl Proxy {
    /// Per spec.md §3: for `vmess` proxies, `username` must parse as a UUID.
    pub fn validate(&self) -> Result<()> {
        if self.protocol == ProxyProtocol::Vmess && Uuid::parse_str(&self.username).is_err() {
            return Err(Error::InvalidRule {
                cursor: 0,
                reason: format!("vmess proxy username {:?} is not a UUID", self.username),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicyConfig {
    Direct,
    Reject,
    RejectTinyGif,
    Proxy { proxy: Proxy },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyGroupConfig {
    pub name: String,
    pub members: Vec<String>,
    pub selected: String,
}

impl From<PolicyGroupConfig> for Group {
    fn from(cfg: PolicyGroupConfig) -> Self {
        Group::new(cfg.name, cfg.members, cfg.selected)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MitmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hostnames: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BasicSettings {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default)]
    pub exceptions: Vec<String>,
    #[serde(default)]
    pub http_listen_address: Option<String>,
    #[serde(default)]
    pub http_listen_port: Option<u16>,
    #[serde(default)]
    pub socks_listen_address: Option<String>,
    #[serde(default)]
    pub socks_listen_port: Option<u16>,
    #[serde(default)]
    pub exclude_simple_hostnames: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub basic_settings: BasicSettings,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub mitm: MitmConfig,
    #[serde(default)]
    pub policies: Vec<(String, PolicyConfig)>,
    #[serde(default)]
    pub policy_groups: Vec<PolicyGroupConfig>,
}

impl Profile {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compiles `rules` (one `TYPE,expression,policy[,comment]` string per
    /// line) into `Rule` values, failing fast with a line-numbered
    /// `InvalidRule` on the first malformed line (spec.md §7: per-rule
    /// parse errors abort startup, unlike per-line errors *inside* an
    /// already-downloaded external resource).
    pub fn compile_rules(&self) -> Result<Vec<Rule>> {
        let mut out = Vec::with_capacity(self.rules.len());
        let mut seen_final = false;
        for (idx, line) in self.rules.iter().enumerate() {
            let rule = crate::rule_line::parse(line, idx)?;
            if matches!(rule, Rule::Final { .. }) {
                if seen_final {
                    return Err(Error::InvalidRule {
                        cursor: idx,
                        reason: "FINAL rule may appear at most once".into(),
                    });
                }
                seen_final = true;
            }
            out.push(rule);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmess_requires_uuid_username() {
        let proxy = Proxy {
            server_address: "proxy.example".into(),
            port: 443,
            protocol: ProxyProtocol::Vmess,
            username: "not-a-uuid".into(),
            password: String::new(),
            auth_required: false,
            prefer_http_tunneling: false,
            over_tls: true,
            over_websocket: false,
            ws_path: None,
            skip_cert_verify: false,
            sni: None,
            cert_pinning: None,
            algorithm: None,
        };
        assert!(proxy.validate().is_err());
    }

    #[test]
    fn profile_parses_from_json() {
        let json = r#"{
            "basic_settings": {"http_listen_port": 6152},
            "rules": ["FINAL,DIRECT"]
        }"#;
        let profile = Profile::from_json(json).unwrap();
        assert_eq!(profile.basic_settings.http_listen_port, Some(6152));
        assert_eq!(profile.compile_rules().unwrap().len(), 1);
    }
}
