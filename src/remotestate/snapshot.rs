use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::network::Address;
use crate::state::Settings;
use crate::types::{Life, RelationId, RelationUnitsChange, ResolvedMode};

/// Everything the unit's execution loop needs to decide what to do next.
/// Compared by value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub life: Life,
    pub resolved: ResolvedMode,
    pub charm_url: Option<String>,
    pub force_charm_upgrade: bool,
    pub config_hash: String,
    pub addresses_hash: String,
    pub leader: bool,
    /// Bumped on every leader-settings event after the first.  Leadership
    /// changes arrive on the same source, so they bump it too.
    pub leader_settings_version: u64,
    /// Bumped on every update-status tick.
    pub update_status_version: u64,
    pub storage: BTreeMap<String, Life>,
    pub relations: BTreeMap<RelationId, RelationSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationSnapshot {
    pub life: Life,
    /// Remote units in scope with their settings change version.
    pub members: BTreeMap<String, i64>,
    /// Flips on every application settings change.
    pub app_changed: bool,
}

impl RelationSnapshot {
    pub fn apply(&mut self, change: RelationUnitsChange) {
        for (unit, version) in change.changed {
            self.members.insert(unit, version);
        }
        for unit in &change.departed {
            self.members.remove(unit);
        }
        if change.app_changed {
            self.app_changed = !self.app_changed;
        }
    }
}

/// Hash of the canonical JSON encoding of `settings`.
pub fn config_hash(settings: &Settings) -> String {
    // BTreeMap keys serialise in order, so equal settings hash equally.
    let encoded = serde_json::to_vec(settings).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

/// Order-independent hash of an address set.
pub fn addresses_hash(addresses: &[Address]) -> String {
    let mut lines: Vec<String> = addresses
        .iter()
        .map(|a| format!("{}:{:?}", a.value, a.scope))
        .collect();
    lines.sort();
    lines.dedup();
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Origin, Scope};
    use std::collections::BTreeSet;

    #[test]
    fn relation_changes_apply_incrementally() {
        let mut rel = RelationSnapshot::default();
        rel.apply(RelationUnitsChange {
            changed: BTreeMap::from([("mysql/0".into(), 0), ("mysql/1".into(), 3)]),
            app_changed: true,
            departed: BTreeSet::new(),
        });
        rel.apply(RelationUnitsChange {
            changed: BTreeMap::from([("mysql/0".into(), 1)]),
            app_changed: false,
            departed: BTreeSet::from(["mysql/1".into()]),
        });
        assert_eq!(rel.members, BTreeMap::from([("mysql/0".into(), 1)]));
        assert!(rel.app_changed);

        rel.apply(RelationUnitsChange {
            app_changed: true,
            ..Default::default()
        });
        assert!(!rel.app_changed);
    }

    #[test]
    fn addresses_hash_ignores_order_and_origin() {
        let a = Address::parse("10.0.0.1", Scope::CloudLocal, Origin::Provider).unwrap();
        let b = Address::parse("4.3.2.1", Scope::Public, Origin::Machine).unwrap();
        let moved = Address { origin: Origin::Machine, ..a.clone() };
        assert_eq!(addresses_hash(&[a.clone(), b.clone()]), addresses_hash(&[b.clone(), moved]));
        assert_ne!(addresses_hash(&[a]), addresses_hash(&[b]));
    }

    #[test]
    fn config_hash_tracks_values() {
        let mut settings = Settings::new();
        settings.insert("blog-title".into(), serde_json::json!("My Blog"));
        let before = config_hash(&settings);
        assert_eq!(before, config_hash(&settings.clone()));
        settings.insert("blog-title".into(), serde_json::json!("Other"));
        assert_ne!(before, config_hash(&settings));
    }
}
