//! waypoint/src/rule.rs
//! Rule model and matcher (spec.md §4.B): first-match dispatch over domain,
//! GeoIP, and external-resource rules, with a `Final` fallback.

use crate::cache::LruCache;
use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::geoip::IpCountryLookup;
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

/// Builtin tokens that never trigger a download for `DomainSet`/`RuleSet`.
pub const BUILTIN_NO_DOWNLOAD: &[&str] = &["SYSTEM", "LAN"];

#[derive(Debug, Clone)]
pub enum Rule {
    Domain {
        expression: String,
        policy_name: String,
        comment: Option<String>,
    },
    DomainSuffix {
        expression: String,
        policy_name: String,
        comment: Option<String>,
    },
    DomainKeyword {
        expression: String,
        policy_name: String,
        comment: Option<String>,
    },
    GeoIp {
        country_iso_code: String,
        policy_name: String,
        comment: Option<String>,
    },
    DomainSet {
        expression: String,
        policy_name: String,
        comment: Option<String>,
        children: std::sync::Arc<RwLock<Vec<Rule>>>,
    },
    RuleSet {
        expression: String,
        policy_name: String,
        comment: Option<String>,
        children: std::sync::Arc<RwLock<Vec<Rule>>>,
    },
    Final {
        policy_name: String,
        reason: Option<String>,
    },
}

impl Rule {
    pub fn policy_name(&self) -> &str {
        match self {
            Rule::Domain { policy_name, .. }
            | Rule::DomainSuffix { policy_name, .. }
            | Rule::DomainKeyword { policy_name, .. }
            | Rule::GeoIp { policy_name, .. }
            | Rule::DomainSet { policy_name, .. }
            | Rule::RuleSet { policy_name, .. }
            | Rule::Final { policy_name, .. } => policy_name,
        }
    }

    /// The external-resource URL, for `DomainSet`/`RuleSet` variants.
    fn external_url(&self) -> Option<&str> {
        match self {
            Rule::DomainSet { expression, .. } | Rule::RuleSet { expression, .. } => {
                Some(expression)
            }
            _ => None,
        }
    }

    pub fn matches(&self, dest: &Destination, geoip: &dyn IpCountryLookup) -> bool {
        match self {
            Rule::Domain { expression, .. } => {
                dest.match_host().as_deref() == Some(expression.as_str())
            }
            Rule::DomainSuffix { expression, .. } => match dest.match_host() {
                Some(host) => host == *expression || host.ends_with(&format!(".{expression}")),
                None => false,
            },
            Rule::DomainKeyword { expression, .. } => match dest.match_host() {
                Some(host) => host.contains(expression.as_str()),
                None => false,
            },
            Rule::GeoIp { country_iso_code, .. } => match dest.is_ip_literal() {
                Some(ip) => geoip
                    .lookup(ip)
                    .map(|code| code.eq_ignore_ascii_case(country_iso_code))
                    .unwrap_or(false),
                None => false,
            },
            Rule::DomainSet { children, .. } | Rule::RuleSet { children, .. } => children
                .read()
                .unwrap()
                .iter()
                .any(|r| r.matches(dest, geoip)),
            Rule::Final { .. } => true,
        }
    }
}

/// Fetches the raw bytes of an external rule resource. The concrete HTTP
/// client is an external collaborator; the matcher only needs this seam.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, String>;
}

/// An immutable, versioned snapshot of the compiled rule list. New
/// generations are published atomically (spec.md §5); connections keep
/// using the generation they started with.
pub struct Matcher {
    rules: Vec<Rule>,
    final_rule: Option<usize>,
    generation: u64,
    cache_root: PathBuf,
    cache: LruCache<(String, u64), String>,
}

impl Matcher {
    pub fn new(rules: Vec<Rule>, generation: u64, cache_root: impl Into<PathBuf>) -> Self {
        let final_rule = rules.iter().position(|r| matches!(r, Rule::Final { .. }));
        Self {
            rules,
            final_rule,
            generation,
            cache_root: cache_root.into(),
            cache: LruCache::unbounded_by_count(1 << 20),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the policy name of the first matching rule, or the `Final`
    /// rule's policy if nothing else matched. `None` only when there is no
    /// `Final` rule and nothing else matched (spec.md §8: with a `Final`
    /// rule present, this never returns `None`).
    pub fn match_destination<'a>(
        &'a self,
        dest: &Destination,
        geoip: &dyn IpCountryLookup,
    ) -> Option<&'a Rule> {
        let key = (dest.to_string(), self.generation);
        if let Some(cached_policy) = self.cache.get(&key) {
            return self
                .rules
                .iter()
                .find(|r| r.policy_name() == cached_policy);
        }

        for rule in &self.rules {
            if matches!(rule, Rule::Final { .. }) {
                continue;
            }
            if rule.matches(dest, geoip) {
                self.cache.set(key, rule.policy_name().to_string(), 1);
                return Some(rule);
            }
        }

        self.final_rule.map(|idx| &self.rules[idx])
    }

    fn storage_path(&self, expression: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(expression.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.cache_root.join("External Resources").join(digest)
    }

    /// Downloads and recompiles the child rules of a `DomainSet`/`RuleSet`
    /// rule in place. `SYSTEM`/`LAN` tokens never download (spec.md §4.B).
    /// Per-line parse errors inside the resource are dropped silently; the
    /// whole reload only fails if the fetch itself fails.
    pub async fn reload_external(&self, rule: &Rule, fetcher: &dyn ResourceFetcher) -> Result<()> {
        let (Some(url), is_ruleset) = (
            rule.external_url(),
            matches!(rule, Rule::RuleSet { .. }),
        ) else {
            return Ok(());
        };
        if BUILTIN_NO_DOWNLOAD.contains(&url) {
            return Ok(());
        }

        let body = fetcher
            .fetch(url)
            .await
            .map_err(Error::ExternalResourceFetch)?;

        let path = self.storage_path(url);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let text = String::from_utf8_lossy(&body);
        let children = parse_external_lines(&text, rule.policy_name(), is_ruleset);

        match rule {
            Rule::DomainSet { children: slot, .. } | Rule::RuleSet { children: slot, .. } => {
                *slot.write().unwrap() = children;
            }
            _ => {}
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cache_path(&self) -> &Path {
        &self.cache_root
    }
}

/// Parses the lines of a downloaded `DomainSet` (bare suffixes) or
/// `RuleSet` (`TYPE,expr[,policy]` lines) body. Malformed lines are
/// skipped, never fail the whole collection (spec.md §4.B).
fn parse_external_lines(text: &str, default_policy: &str, is_ruleset: bool) -> Vec<Rule> {
    let mut out = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if !is_ruleset {
            out.push(Rule::DomainSuffix {
                expression: line.to_string(),
                policy_name: default_policy.to_string(),
                comment: None,
            });
            continue;
        }
        let parts: Vec<&str> = line.split(',').map(|p| p.trim()).collect();
        let rule = match parts.as_slice() {
            ["DOMAIN", expr] => Some(Rule::Domain {
                expression: expr.to_string(),
                policy_name: default_policy.to_string(),
                comment: None,
            }),
            ["DOMAIN-SUFFIX", expr] => Some(Rule::DomainSuffix {
                expression: expr.to_string(),
                policy_name: default_policy.to_string(),
                comment: None,
            }),
            ["DOMAIN-KEYWORD", expr] => Some(Rule::DomainKeyword {
                expression: expr.to_string(),
                policy_name: default_policy.to_string(),
                comment: None,
            }),
            ["GEOIP", code] => Some(Rule::GeoIp {
                country_iso_code: code.to_string(),
                policy_name: default_policy.to_string(),
                comment: None,
            }),
            _ => {
                warn!(line = raw_line, "skipping unparseable external rule line");
                None
            }
        };
        if let Some(rule) = rule {
            out.push(rule);
        }
    }
    out
}
