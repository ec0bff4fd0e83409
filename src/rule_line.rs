//! waypoint/src/rule_line.rs
//! Parses one `TYPE,expression,policy[,comment]` profile rule line
//! (spec.md §3) into a `Rule`. Kept separate from `rule.rs` so the matcher
//! module stays focused on matching rather than profile grammar.

use crate::error::{Error, Result};
use crate::rule::Rule;
use std::sync::{Arc, RwLock};

pub fn parse(line: &str, cursor: usize) -> Result<Rule> {
    let trimmed = line.trim();
    let parts: Vec<&str> = trimmed.splitn(4, ',').map(|p| p.trim()).collect();
    let bad = |reason: &str| Error::InvalidRule {
        cursor,
        reason: reason.to_string(),
    };

    match parts.as_slice() {
        ["DOMAIN", expr, policy] => Ok(Rule::Domain {
            expression: expr.to_string(),
            policy_name: policy.to_string(),
            comment: None,
        }),
        ["DOMAIN", expr, policy, comment] => Ok(Rule::Domain {
            expression: expr.to_string(),
            policy_name: policy.to_string(),
            comment: Some(comment.to_string()),
        }),
        ["DOMAIN-SUFFIX", expr, policy] => Ok(Rule::DomainSuffix {
            expression: expr.to_string(),
            policy_name: policy.to_string(),
            comment: None,
        }),
        ["DOMAIN-SUFFIX", expr, policy, comment] => Ok(Rule::DomainSuffix {
            expression: expr.to_string(),
            policy_name: policy.to_string(),
            comment: Some(comment.to_string()),
        }),
        ["DOMAIN-KEYWORD", expr, policy] => Ok(Rule::DomainKeyword {
            expression: expr.to_string(),
            policy_name: policy.to_string(),
            comment: None,
        }),
        ["DOMAIN-KEYWORD", expr, policy, comment] => Ok(Rule::DomainKeyword {
            expression: expr.to_string(),
            policy_name: policy.to_string(),
            comment: Some(comment.to_string()),
        }),
        ["GEOIP", code, policy] => Ok(Rule::GeoIp {
            country_iso_code: code.to_string(),
            policy_name: policy.to_string(),
            comment: None,
        }),
        ["GEOIP", code, policy, comment] => Ok(Rule::GeoIp {
            country_iso_code: code.to_string(),
            policy_name: policy.to_string(),
            comment: Some(comment.to_string()),
        }),
        ["DOMAIN-SET", url, policy] => Ok(Rule::DomainSet {
            expression: url.to_string(),
            policy_name: policy.to_string(),
            comment: None,
            children: Arc::new(RwLock::new(Vec::new())),
        }),
        ["RULE-SET", url, policy] => Ok(Rule::RuleSet {
            expression: url.to_string(),
            policy_name: policy.to_string(),
            comment: None,
            children: Arc::new(RwLock::new(Vec::new())),
        }),
        ["FINAL", policy] => Ok(Rule::Final {
            policy_name: policy.to_string(),
            reason: None,
        }),
        ["FINAL", policy, reason] => Ok(Rule::Final {
            policy_name: policy.to_string(),
            reason: Some(reason.to_string()),
        }),
        [] | [""] => Err(bad("empty rule line")),
        _ => Err(bad(&format!("unrecognized rule line: {trimmed:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domain_suffix_with_policy() {
        let rule = parse("DOMAIN-SUFFIX,example.net,REJECT", 0).unwrap();
        assert_eq!(rule.policy_name(), "REJECT");
        assert!(matches!(rule, Rule::DomainSuffix { .. }));
    }

    #[test]
    fn parses_geoip_with_trailing_comment() {
        let rule = parse("GEOIP,US,PROXY,domestic", 0).unwrap();
        match rule {
            Rule::GeoIp {
                country_iso_code,
                policy_name,
                comment,
            } => {
                assert_eq!(country_iso_code, "US");
                assert_eq!(policy_name, "PROXY");
                assert_eq!(comment.as_deref(), Some("domestic"));
            }
            other => panic!("expected GeoIp, got {other:?}"),
        }
    }

    #[test]
    fn parses_final_with_reason() {
        let rule = parse("FINAL,DIRECT,dns-failed", 0).unwrap();
        match rule {
            Rule::Final { policy_name, reason } => {
                assert_eq!(policy_name, "DIRECT");
                assert_eq!(reason.as_deref(), Some("dns-failed"));
            }
            _ => panic!("expected Final"),
        }
    }

    #[test]
    fn rejects_garbage_line_with_cursor() {
        let err = parse("NOT,A,REAL,RULE,TYPE", 7).unwrap_err();
        match err {
            Error::InvalidRule { cursor, .. } => assert_eq!(cursor, 7),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
