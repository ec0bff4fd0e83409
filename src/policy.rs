//! waypoint/src/policy.rs
//! Policy registry (spec.md §4.C): name resolution for leaves and groups,
//! with cycle detection at load time and atomic group-selection updates.

use crate::dialer::OutboundDialer;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const REJECT_TINYGIF: &str = "REJECT-TINYGIF";

#[derive(Clone)]
pub struct Group {
    pub name: String,
    pub members: Vec<String>,
    selected: Arc<RwLock<String>>,
}

impl Group {
    pub fn new(name: impl Into<String>, members: Vec<String>, selected: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members,
            selected: Arc::new(RwLock::new(selected.into())),
        }
    }

    pub fn selected(&self) -> String {
        self.selected.read().unwrap().clone()
    }
}

/// Flat leaf policies plus groups, validated once at construction.
/// Resolution afterward never fails on structure (only on an unknown
/// name, which load-time validation already rules out for configured
/// rules).
pub struct PolicyRegistry {
    leaves: HashMap<String, Arc<dyn OutboundDialer>>,
    groups: HashMap<String, Group>,
}

impl PolicyRegistry {
    pub fn new(
        leaves: Vec<(String, Arc<dyn OutboundDialer>)>,
        groups: Vec<Group>,
    ) -> Result<Self> {
        let mut leaf_map: HashMap<String, Arc<dyn OutboundDialer>> = leaves.into_iter().collect();
        leaf_map
            .entry(DIRECT.to_string())
            .or_insert_with(|| Arc::new(crate::dialer::DirectDialer));
        leaf_map
            .entry(REJECT.to_string())
            .or_insert_with(|| Arc::new(crate::dialer::RejectDialer));
        leaf_map
            .entry(REJECT_TINYGIF.to_string())
            .or_insert_with(|| Arc::new(crate::dialer::RejectTinyGifDialer));

        let mut group_map = HashMap::new();
        for g in groups {
            if leaf_map.contains_key(&g.name) || group_map.contains_key(&g.name) {
                return Err(Error::InvalidRule {
                    cursor: 0,
                    reason: format!("duplicate policy name: {}", g.name),
                });
            }
            group_map.insert(g.name.clone(), g);
        }

        let registry = Self {
            leaves: leaf_map,
            groups: group_map,
        };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        #[derive(PartialEq, Clone, Copy)]
        enum Color {
            Grey,
            Black,
        }
        let mut colors: HashMap<&str, Color> = HashMap::new();

        fn visit<'a>(
            registry: &'a PolicyRegistry,
            name: &'a str,
            colors: &mut HashMap<&'a str, Color>,
        ) -> Result<()> {
            match colors.get(name) {
                Some(Color::Black) => return Ok(()),
                Some(Color::Grey) => {
                    return Err(Error::InvalidRule {
                        cursor: 0,
                        reason: format!("cycle detected at policy group {name}"),
                    });
                }
                None => {}
            }
            let Some(group) = registry.groups.get(name) else {
                if registry.leaves.contains_key(name) {
                    return Ok(());
                }
                return Err(Error::UnknownPolicy(name.to_string()));
            };
            colors.insert(name, Color::Grey);
            for member in &group.members {
                visit(registry, member, colors)?;
            }
            colors.insert(name, Color::Black);
            Ok(())
        }

        for name in self.groups.keys() {
            visit(self, name, &mut colors)?;
        }
        Ok(())
    }

    /// Resolves a policy name to a dialer, following a group's current
    /// selection recursively.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn OutboundDialer>> {
        let mut current = name.to_string();
        let mut hops = 0;
        loop {
            if let Some(dialer) = self.leaves.get(&current) {
                return Ok(dialer.clone());
            }
            let Some(group) = self.groups.get(&current) else {
                return Err(Error::UnknownPolicy(current));
            };
            current = group.selected();
            hops += 1;
            if hops > self.groups.len() + 1 {
                // Unreachable given load-time cycle validation, but guards
                // against a selection mutated into a cycle concurrently.
                return Err(Error::InvalidRule {
                    cursor: 0,
                    reason: "policy group selection cycle at resolve time".into(),
                });
            }
        }
    }

    /// Atomically changes a group's current selection. `member` must be one
    /// of the group's declared members.
    pub fn select(&self, group: &str, member: &str) -> Result<()> {
        let g = self.groups.get(group).ok_or_else(|| Error::UnknownPolicy(group.to_string()))?;
        if !g.members.iter().any(|m| m == member) {
            return Err(Error::InvalidRule {
                cursor: 0,
                reason: format!("{member} is not a member of group {group}"),
            });
        }
        *g.selected.write().unwrap() = member.to_string();
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::DirectDialer;

    fn leaf(name: &str) -> (String, Arc<dyn OutboundDialer>) {
        (name.to_string(), Arc::new(DirectDialer))
    }

    #[test]
    fn builtins_are_preregistered() {
        let registry = PolicyRegistry::new(vec![], vec![]).unwrap();
        assert!(registry.resolve(DIRECT).is_ok());
        assert!(registry.resolve(REJECT).is_ok());
        assert!(registry.resolve(REJECT_TINYGIF).is_ok());
    }

    #[test]
    fn group_resolves_to_selected_member() {
        let registry = PolicyRegistry::new(
            vec![leaf("US"), leaf("JP")],
            vec![Group::new("Auto", vec!["US".into(), "JP".into()], "US")],
        )
        .unwrap();
        assert!(registry.resolve("Auto").is_ok());
        registry.select("Auto", "JP").unwrap();
        assert_eq!(registry.group("Auto").unwrap().selected(), "JP");
    }

    #[test]
    fn cycle_between_groups_is_rejected() {
        let result = PolicyRegistry::new(
            vec![],
            vec![
                Group::new("A", vec!["B".into()], "B"),
                Group::new("B", vec!["A".into()], "A"),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_member_is_rejected() {
        let result = PolicyRegistry::new(vec![], vec![Group::new("A", vec!["Ghost".into()], "Ghost")]);
        assert!(result.is_err());
    }

    #[test]
    fn select_rejects_non_member() {
        let registry = PolicyRegistry::new(
            vec![leaf("US")],
            vec![Group::new("Auto", vec!["US".into()], "US")],
        )
        .unwrap();
        assert!(registry.select("Auto", "NotAMember").is_err());
    }
}
