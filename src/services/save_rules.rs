//! Save validation rule chain
//!
//! Each incoming item hash runs through an ordered list of rules. A rule
//! either passes, skips (the change is already applied, treat as saved),
//! or raises a conflict of a specific kind. The first non-pass outcome
//! wins and the remaining rules are not consulted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::db::items::{Item, ItemHash};
use crate::db::shared_vault_users::SharedVaultPermission;

/// Kind of a per-item save conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Create failed because the uuid exists under a different owner
    UuidConflict,
    /// The write is based on a stale read of the item
    SyncConflict,
    /// The write targets a forbidden or missing content type
    ContentTypeError,
    /// The requesting session has read-only access
    ReadOnlyError,
    /// The writer lacks membership or write permission on the vault
    SharedVaultPermissionError,
}

/// One rejected item in a save response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemConflict {
    pub unsaved_item: ItemHash,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_item: Option<Item>,
    #[serde(rename = "type")]
    pub kind: ConflictKind,
}

/// Decision produced by a rule
#[derive(Debug, Clone)]
pub enum RuleOutcome {
    Pass,
    /// Treat as successfully saved without touching storage
    Skip(Item),
    Conflict {
        kind: ConflictKind,
        server_item: Option<Item>,
    },
}

impl RuleOutcome {
    fn is_pass(&self) -> bool {
        matches!(self, RuleOutcome::Pass)
    }
}

/// Everything a rule may inspect for one incoming hash
pub struct SaveContext<'a> {
    pub user_uuid: &'a str,
    pub item_hash: &'a ItemHash,
    pub existing: Option<&'a Item>,
    /// The writer's vault memberships, resolved once per request
    pub vault_permissions: &'a HashMap<String, SharedVaultPermission>,
}

/// A single save rule
pub trait SaveRule: Send + Sync {
    fn check(&self, ctx: &SaveContext) -> RuleOutcome;
}

/// Rejects writes touching a shared vault the writer cannot mutate. Both
/// the vault the hash targets and the vault the item currently lives in
/// need write permission, so members cannot pull items out of vaults they
/// can only read.
struct SharedVaultAccessRule;

impl SharedVaultAccessRule {
    fn can_write(ctx: &SaveContext, vault_uuid: &str) -> bool {
        ctx.vault_permissions
            .get(vault_uuid)
            .map(|p| p.can_write())
            .unwrap_or(false)
    }
}

impl SaveRule for SharedVaultAccessRule {
    fn check(&self, ctx: &SaveContext) -> RuleOutcome {
        let mut touched: Vec<&str> = vec![];

        // A vault named by an explicit signal is being written into; an
        // omitted vault field touches no new vault
        if let Some(signal) = ctx.item_hash.shared_vault_uuid.as_ref() {
            if let Some(target) = signal.as_deref() {
                touched.push(target);
            }
        }

        // Mutating an item that lives in a vault always needs write
        // access to that vault, whether or not the hash moves it
        if let Some(current) = ctx.existing.and_then(|i| i.shared_vault_uuid.as_deref()) {
            if !touched.contains(&current) {
                touched.push(current);
            }
        }

        for vault_uuid in touched {
            if !Self::can_write(ctx, vault_uuid) {
                return RuleOutcome::Conflict {
                    kind: ConflictKind::SharedVaultPermissionError,
                    server_item: ctx.existing.cloned(),
                };
            }
        }

        RuleOutcome::Pass
    }
}

/// Rejects creates without a usable content type
struct ContentTypeRule;

impl SaveRule for ContentTypeRule {
    fn check(&self, ctx: &SaveContext) -> RuleOutcome {
        let supplied = ctx.item_hash.content_type.as_deref();

        if supplied == Some("") {
            return RuleOutcome::Conflict {
                kind: ConflictKind::ContentTypeError,
                server_item: ctx.existing.cloned(),
            };
        }

        if ctx.existing.is_none() && supplied.is_none() {
            return RuleOutcome::Conflict {
                kind: ConflictKind::ContentTypeError,
                server_item: None,
            };
        }

        RuleOutcome::Pass
    }
}

/// Skips hashes whose application would not change the stored item, so a
/// client re-sending an already-applied change gets an ack instead of a
/// spurious stale-write conflict. Must run before the time rule.
struct AlreadyAppliedRule;

impl SaveRule for AlreadyAppliedRule {
    fn check(&self, ctx: &SaveContext) -> RuleOutcome {
        match ctx.existing {
            Some(existing) if !ctx.item_hash.would_change(existing) => {
                RuleOutcome::Skip(existing.clone())
            }
            _ => RuleOutcome::Pass,
        }
    }
}

/// Flags writes based on a stale read: the hash's notion of the item's
/// update time must match the server's, within the tolerance window.
struct TimeDifferenceRule {
    tolerance_micros: i64,
}

impl SaveRule for TimeDifferenceRule {
    fn check(&self, ctx: &SaveContext) -> RuleOutcome {
        let existing = match ctx.existing {
            Some(existing) => existing,
            None => return RuleOutcome::Pass,
        };

        let incoming = ctx.item_hash.updated_at_timestamp.unwrap_or(0);
        let drift = (existing.updated_at_timestamp - incoming).abs();

        if drift > self.tolerance_micros {
            return RuleOutcome::Conflict {
                kind: ConflictKind::SyncConflict,
                server_item: Some(existing.clone()),
            };
        }

        RuleOutcome::Pass
    }
}

/// Ordered rule chain applied to every incoming hash
pub struct SaveValidator {
    rules: Vec<Box<dyn SaveRule>>,
}

impl SaveValidator {
    pub fn new(tolerance_micros: i64) -> Self {
        Self {
            rules: vec![
                Box::new(SharedVaultAccessRule),
                Box::new(ContentTypeRule),
                Box::new(AlreadyAppliedRule),
                Box::new(TimeDifferenceRule { tolerance_micros }),
            ],
        }
    }

    /// Run the chain; the first non-pass outcome wins
    pub fn validate(&self, ctx: &SaveContext) -> RuleOutcome {
        for rule in &self.rules {
            let outcome = rule.check(ctx);
            if !outcome.is_pass() {
                return outcome;
            }
        }
        RuleOutcome::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(uuid: &str, updated_at: i64) -> Item {
        Item {
            uuid: uuid.to_string(),
            user_uuid: "u-1".to_string(),
            content: Some("003:encrypted".to_string()),
            content_type: Some("Note".to_string()),
            enc_item_key: Some("003:key".to_string()),
            created_at_timestamp: updated_at,
            updated_at_timestamp: updated_at,
            ..Default::default()
        }
    }

    fn matching_hash(item: &Item) -> ItemHash {
        ItemHash {
            uuid: item.uuid.clone(),
            content: item.content.clone(),
            content_type: item.content_type.clone(),
            enc_item_key: item.enc_item_key.clone(),
            shared_vault_uuid: Some(item.shared_vault_uuid.clone()),
            updated_at_timestamp: Some(item.updated_at_timestamp),
            ..Default::default()
        }
    }

    fn no_vaults() -> HashMap<String, SharedVaultPermission> {
        HashMap::new()
    }

    #[test]
    fn test_fresh_create_passes() {
        let validator = SaveValidator::new(0);
        let hash = ItemHash {
            uuid: "a-1".to_string(),
            content_type: Some("Note".to_string()),
            ..Default::default()
        };
        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: None,
            vault_permissions: &vaults,
        };
        assert!(matches!(validator.validate(&ctx), RuleOutcome::Pass));
    }

    #[test]
    fn test_create_without_content_type_conflicts() {
        let validator = SaveValidator::new(0);
        let hash = ItemHash {
            uuid: "a-1".to_string(),
            ..Default::default()
        };
        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: None,
            vault_permissions: &vaults,
        };
        assert!(matches!(
            validator.validate(&ctx),
            RuleOutcome::Conflict {
                kind: ConflictKind::ContentTypeError,
                ..
            }
        ));
    }

    #[test]
    fn test_stale_write_is_sync_conflict() {
        let validator = SaveValidator::new(0);
        let existing = note("a-1", 1000);
        let mut hash = matching_hash(&existing);
        hash.content = Some("003:newer".to_string());
        hash.updated_at_timestamp = Some(900);
        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        match validator.validate(&ctx) {
            RuleOutcome::Conflict {
                kind: ConflictKind::SyncConflict,
                server_item: Some(server),
            } => assert_eq!(server.uuid, "a-1"),
            other => panic!("expected sync conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_tolerance_window_absorbs_drift() {
        let validator = SaveValidator::new(50);
        let existing = note("a-1", 1000);
        let mut hash = matching_hash(&existing);
        hash.content = Some("003:newer".to_string());
        hash.updated_at_timestamp = Some(960);
        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        assert!(matches!(validator.validate(&ctx), RuleOutcome::Pass));
    }

    #[test]
    fn test_reapplied_hash_skips_before_time_rule() {
        let validator = SaveValidator::new(0);
        // Server already applied this hash and moved the timestamp forward
        let existing = note("a-1", 2000);
        let mut hash = matching_hash(&existing);
        hash.updated_at_timestamp = Some(1000);
        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        match validator.validate(&ctx) {
            RuleOutcome::Skip(item) => assert_eq!(item.uuid, "a-1"),
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn test_vault_write_requires_permission() {
        let validator = SaveValidator::new(0);
        let existing = note("a-1", 1000);
        let mut hash = matching_hash(&existing);
        hash.shared_vault_uuid = Some(Some("v-1".to_string()));

        let mut vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        assert!(matches!(
            validator.validate(&ctx),
            RuleOutcome::Conflict {
                kind: ConflictKind::SharedVaultPermissionError,
                ..
            }
        ));

        vaults.insert("v-1".to_string(), SharedVaultPermission::Read);
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        assert!(matches!(
            validator.validate(&ctx),
            RuleOutcome::Conflict {
                kind: ConflictKind::SharedVaultPermissionError,
                ..
            }
        ));
    }

    #[test]
    fn test_vault_removal_requires_permission_on_old_vault() {
        let validator = SaveValidator::new(0);
        let mut existing = note("a-1", 1000);
        existing.shared_vault_uuid = Some("v-1".to_string());
        // Hash explicitly drops the vault
        let mut hash = matching_hash(&existing);
        hash.shared_vault_uuid = Some(None);

        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        assert!(matches!(
            validator.validate(&ctx),
            RuleOutcome::Conflict {
                kind: ConflictKind::SharedVaultPermissionError,
                ..
            }
        ));
    }

    #[test]
    fn test_editing_vaulted_item_requires_permission_even_without_signal() {
        let validator = SaveValidator::new(0);
        let mut existing = note("a-1", 1000);
        existing.shared_vault_uuid = Some("v-1".to_string());
        // Content edit that never mentions the vault field
        let mut hash = matching_hash(&existing);
        hash.shared_vault_uuid = None;
        hash.content = Some("003:edited".to_string());

        let vaults = no_vaults();
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        assert!(matches!(
            validator.validate(&ctx),
            RuleOutcome::Conflict {
                kind: ConflictKind::SharedVaultPermissionError,
                ..
            }
        ));
    }

    #[test]
    fn test_vault_write_passes_with_write_permission() {
        let validator = SaveValidator::new(0);
        let existing = note("a-1", 1000);
        let mut hash = matching_hash(&existing);
        hash.shared_vault_uuid = Some(Some("v-1".to_string()));
        hash.content = Some("003:moved".to_string());

        let mut vaults = no_vaults();
        vaults.insert("v-1".to_string(), SharedVaultPermission::Write);
        let ctx = SaveContext {
            user_uuid: "u-1",
            item_hash: &hash,
            existing: Some(&existing),
            vault_permissions: &vaults,
        };
        assert!(matches!(validator.validate(&ctx), RuleOutcome::Pass));
    }
}
