//! Shared-vault membership store
//!
//! Read-only collaborator for the sync engine: the validator checks write
//! permission here, and `get_items` scopes vault reads to memberships.
//! The upsert/remove surface exists for deployment administration.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Permission level of a vault member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedVaultPermission {
    Read,
    Write,
    Admin,
}

impl SharedVaultPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            SharedVaultPermission::Read => "read",
            SharedVaultPermission::Write => "write",
            SharedVaultPermission::Admin => "admin",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "write" => SharedVaultPermission::Write,
            "admin" => SharedVaultPermission::Admin,
            _ => SharedVaultPermission::Read,
        }
    }

    /// Whether this permission allows mutating vault items
    pub fn can_write(&self) -> bool {
        matches!(
            self,
            SharedVaultPermission::Write | SharedVaultPermission::Admin
        )
    }
}

/// Membership record of one user in one shared vault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedVaultUser {
    pub shared_vault_uuid: String,
    pub user_uuid: String,
    pub permission: SharedVaultPermission,
    pub created_at_timestamp: i64,
}

impl SharedVaultUser {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let permission_text: String = row.get("permission")?;
        Ok(Self {
            shared_vault_uuid: row.get("shared_vault_uuid")?,
            user_uuid: row.get("user_uuid")?,
            permission: SharedVaultPermission::from_str(&permission_text),
            created_at_timestamp: row.get("created_at_timestamp")?,
        })
    }
}

/// List all vault memberships of a user
pub fn find_all_for_user(
    conn: &Connection,
    user_uuid: &str,
) -> Result<Vec<SharedVaultUser>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT * FROM shared_vault_users WHERE user_uuid = ? ORDER BY shared_vault_uuid")
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let rows = stmt
        .query_map(params![user_uuid], SharedVaultUser::from_row)
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Internal(format!("Row parse failed: {}", e)))
}

/// Upsert a membership
pub fn upsert(conn: &Connection, member: &SharedVaultUser) -> Result<(), SyncError> {
    conn.execute(
        r#"
        INSERT INTO shared_vault_users (
            shared_vault_uuid, user_uuid, permission, created_at_timestamp
        ) VALUES (?, ?, ?, ?)
        ON CONFLICT (shared_vault_uuid, user_uuid) DO UPDATE SET
            permission = excluded.permission
        "#,
        params![
            member.shared_vault_uuid,
            member.user_uuid,
            member.permission.as_str(),
            member.created_at_timestamp,
        ],
    )
    .map_err(|e| SyncError::Internal(format!("Membership upsert failed: {}", e)))?;

    Ok(())
}

/// Remove a membership
pub fn remove(
    conn: &Connection,
    shared_vault_uuid: &str,
    user_uuid: &str,
) -> Result<bool, SyncError> {
    let changes = conn
        .execute(
            "DELETE FROM shared_vault_users WHERE shared_vault_uuid = ? AND user_uuid = ?",
            params![shared_vault_uuid, user_uuid],
        )
        .map_err(|e| SyncError::Internal(format!("Membership delete failed: {}", e)))?;

    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ItemDb;

    #[test]
    fn test_membership_round_trip() {
        let db = ItemDb::open_in_memory().unwrap();
        db.write(|conn| {
            let member = SharedVaultUser {
                shared_vault_uuid: "v-1".to_string(),
                user_uuid: "u-1".to_string(),
                permission: SharedVaultPermission::Write,
                created_at_timestamp: 1000,
            };
            upsert(conn, &member)?;

            let memberships = find_all_for_user(conn, "u-1")?;
            assert_eq!(memberships, vec![member]);

            assert!(remove(conn, "v-1", "u-1")?);
            assert!(find_all_for_user(conn, "u-1")?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_permission_levels() {
        assert!(!SharedVaultPermission::Read.can_write());
        assert!(SharedVaultPermission::Write.can_write());
        assert!(SharedVaultPermission::Admin.can_write());
        assert_eq!(
            SharedVaultPermission::from_str("unknown"),
            SharedVaultPermission::Read
        );
    }
}
