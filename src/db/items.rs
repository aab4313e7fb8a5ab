//! Item repository
//!
//! CRUD and ordered, filtered, paginated access to encrypted items. All
//! reads used by the sync engine honor the same filter set so the uuid
//! projection, the hydrating fetch and the total count always agree.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;

/// Content types with sync-engine-visible behavior
pub const CONTENT_TYPE_NOTE: &str = "Note";
pub const CONTENT_TYPE_FILE: &str = "File";
pub const CONTENT_TYPE_ITEMS_KEY: &str = "ItemsKey";

/// Encrypted item record, the unit of sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub uuid: String,
    pub user_uuid: String,
    #[serde(default)]
    pub shared_vault_uuid: Option<String>,
    #[serde(default)]
    pub key_system_identifier: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_size: i64,
    #[serde(default)]
    pub enc_item_key: Option<String>,
    #[serde(default)]
    pub auth_hash: Option<String>,
    #[serde(default)]
    pub items_key_id: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub duplicate_of: Option<String>,
    #[serde(default)]
    pub last_edited_by_uuid: Option<String>,
    #[serde(default)]
    pub updated_with_session: Option<String>,
    #[serde(default)]
    pub created_at_timestamp: i64,
    #[serde(default)]
    pub updated_at_timestamp: i64,
}

impl Item {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            uuid: row.get("uuid")?,
            user_uuid: row.get("user_uuid")?,
            shared_vault_uuid: row.get("shared_vault_uuid")?,
            key_system_identifier: row.get("key_system_identifier")?,
            content: row.get("content")?,
            content_type: row.get("content_type")?,
            content_size: row.get("content_size")?,
            enc_item_key: row.get("enc_item_key")?,
            auth_hash: row.get("auth_hash")?,
            items_key_id: row.get("items_key_id")?,
            deleted: row.get::<_, i64>("deleted")? != 0,
            duplicate_of: row.get("duplicate_of")?,
            last_edited_by_uuid: row.get("last_edited_by_uuid")?,
            updated_with_session: row.get("updated_with_session")?,
            created_at_timestamp: row.get("created_at_timestamp")?,
            updated_at_timestamp: row.get("updated_at_timestamp")?,
        })
    }

    /// Size in bytes of the canonical serialization of this item. The
    /// stored `content_size` is excluded from the measurement so the value
    /// is stable across recomputations.
    pub fn canonical_size(&self) -> i64 {
        let mut canonical = self.clone();
        canonical.content_size = 0;
        serde_json::to_string(&canonical)
            .map(|s| s.len() as i64)
            .unwrap_or(0)
    }

    /// Clear content and the crypto envelope for a tombstoned item
    pub fn clear_for_tombstone(&mut self) {
        self.deleted = true;
        self.content = None;
        self.content_size = 0;
        self.enc_item_key = None;
        self.auth_hash = None;
        self.items_key_id = None;
    }

    /// Content-level equality used by the transition runner to decide
    /// whether a copy is redundant. Provenance fields and `created_at`
    /// are deliberately excluded so a faithful re-copy is not treated as
    /// divergence.
    pub fn is_identical_to(&self, other: &Item) -> bool {
        self.content == other.content
            && self.content_type == other.content_type
            && self.deleted == other.deleted
            && self.enc_item_key == other.enc_item_key
            && self.auth_hash == other.auth_hash
            && self.items_key_id == other.items_key_id
            && self.duplicate_of == other.duplicate_of
            && self.shared_vault_uuid == other.shared_vault_uuid
            && self.key_system_identifier == other.key_system_identifier
            && self.updated_at_timestamp == other.updated_at_timestamp
    }
}

/// Client-supplied upload shape. All fields except `uuid` are optional;
/// an omitted field means "do not change".
///
/// `shared_vault_uuid` is nullable on the wire, so omission and an
/// explicit `null` mean different things: omission leaves the item's
/// vault membership alone, `null` pulls it out of its vault. The field is
/// double-wrapped to keep the two distinguishable after parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemHash {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_item_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<String>,
    #[serde(
        default,
        deserialize_with = "nullable_field",
        skip_serializing_if = "Option::is_none"
    )]
    pub shared_vault_uuid: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_system_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_timestamp: Option<i64>,
}

/// Wraps a present-but-possibly-null JSON value so `{"field": null}` and
/// a missing key survive deserialization as distinct states
fn nullable_field<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

impl ItemHash {
    /// Whether applying this hash to `existing` would change any stored
    /// field. Used to recognize a re-sent, already-applied change.
    pub fn would_change(&self, existing: &Item) -> bool {
        fn differs<T: PartialEq>(incoming: &Option<T>, current: &Option<T>) -> bool {
            match incoming {
                Some(v) => current.as_ref() != Some(v),
                None => false,
            }
        }

        differs(&self.content, &existing.content)
            || differs(&self.content_type, &existing.content_type)
            || self.deleted.map(|d| d != existing.deleted).unwrap_or(false)
            || differs(&self.enc_item_key, &existing.enc_item_key)
            || differs(&self.auth_hash, &existing.auth_hash)
            || differs(&self.items_key_id, &existing.items_key_id)
            || differs(&self.duplicate_of, &existing.duplicate_of)
            || self
                .shared_vault_uuid
                .as_ref()
                .map(|signal| *signal != existing.shared_vault_uuid)
                .unwrap_or(false)
            || differs(&self.key_system_identifier, &existing.key_system_identifier)
    }
}

/// Comparator applied to `last_sync_time`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeComparator {
    /// Strictly after (sync token)
    #[default]
    After,
    /// At or after (cursor token)
    AtOrAfter,
}

impl TimeComparator {
    fn sql(&self) -> &'static str {
        match self {
            TimeComparator::After => ">",
            TimeComparator::AtOrAfter => ">=",
        }
    }
}

/// Sort key for item queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    CreatedAt,
    #[default]
    UpdatedAt,
}

impl SortKey {
    fn column(&self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at_timestamp",
            SortKey::UpdatedAt => "updated_at_timestamp",
        }
    }
}

/// Sort direction for item queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter and ordering parameters for item queries
#[derive(Debug, Clone, Default)]
pub struct ItemQuery {
    pub user_uuid: String,
    /// Restrict to these uuids
    pub uuids: Option<Vec<String>>,
    pub content_type: Option<String>,
    pub deleted: Option<bool>,
    /// Widen the user scope to items in these shared vaults
    pub include_shared_vault_uuids: Option<Vec<String>>,
    /// Restrict to items in these shared vaults only
    pub exclusive_shared_vault_uuids: Option<Vec<String>>,
    pub last_sync_time: Option<i64>,
    pub comparator: TimeComparator,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl ItemQuery {
    pub fn for_user(user_uuid: &str) -> Self {
        Self {
            user_uuid: user_uuid.to_string(),
            ..Default::default()
        }
    }
}

/// Build the WHERE clause and parameter list shared by every item query
fn build_filters(query: &ItemQuery) -> (Vec<String>, Vec<Box<dyn rusqlite::ToSql>>) {
    let mut conditions = vec![];
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

    match &query.include_shared_vault_uuids {
        Some(vaults) if !vaults.is_empty() => {
            let placeholders: Vec<_> = vaults.iter().map(|_| "?").collect();
            conditions.push(format!(
                "(user_uuid = ? OR shared_vault_uuid IN ({}))",
                placeholders.join(", ")
            ));
            params.push(Box::new(query.user_uuid.clone()));
            for vault in vaults {
                params.push(Box::new(vault.clone()));
            }
        }
        _ => {
            conditions.push("user_uuid = ?".to_string());
            params.push(Box::new(query.user_uuid.clone()));
        }
    }

    if let Some(ref vaults) = query.exclusive_shared_vault_uuids {
        if !vaults.is_empty() {
            let placeholders: Vec<_> = vaults.iter().map(|_| "?").collect();
            conditions.push(format!(
                "shared_vault_uuid IN ({})",
                placeholders.join(", ")
            ));
            for vault in vaults {
                params.push(Box::new(vault.clone()));
            }
        }
    }

    if let Some(ref uuids) = query.uuids {
        if !uuids.is_empty() {
            let placeholders: Vec<_> = uuids.iter().map(|_| "?").collect();
            conditions.push(format!("uuid IN ({})", placeholders.join(", ")));
            for uuid in uuids {
                params.push(Box::new(uuid.clone()));
            }
        }
    }

    if let Some(ref ct) = query.content_type {
        conditions.push("content_type = ?".to_string());
        params.push(Box::new(ct.clone()));
    }

    if let Some(deleted) = query.deleted {
        conditions.push("deleted = ?".to_string());
        params.push(Box::new(deleted as i64));
    }

    if let Some(since) = query.last_sync_time {
        conditions.push(format!("updated_at_timestamp {} ?", query.comparator.sql()));
        params.push(Box::new(since));
    }

    (conditions, params)
}

/// Append ordering and pagination to a query. Ties on the sort key are
/// broken by uuid so pagination is deterministic.
fn push_order_and_limit(
    sql: &mut String,
    params: &mut Vec<Box<dyn rusqlite::ToSql>>,
    query: &ItemQuery,
) {
    sql.push_str(&format!(
        " ORDER BY {} {}, uuid ASC",
        query.sort_by.column(),
        query.sort_order.sql()
    ));

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(Box::new(limit as i64));
        params.push(Box::new(query.offset.unwrap_or(0) as i64));
    }
}

/// Find one item by uuid within a user's scope
pub fn find_by_uuid(
    conn: &Connection,
    user_uuid: &str,
    uuid: &str,
) -> Result<Option<Item>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT * FROM items WHERE user_uuid = ? AND uuid = ?")
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let mut rows = stmt
        .query(params![user_uuid, uuid])
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    match rows
        .next()
        .map_err(|e| SyncError::Internal(format!("Row fetch failed: {}", e)))?
    {
        Some(row) => Ok(Some(Item::from_row(row).map_err(|e| {
            SyncError::Internal(format!("Row parse failed: {}", e))
        })?)),
        None => Ok(None),
    }
}

/// Find one item by uuid regardless of owner (collision checks)
pub fn find_any_by_uuid(conn: &Connection, uuid: &str) -> Result<Option<Item>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT * FROM items WHERE uuid = ?")
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let mut rows = stmt
        .query(params![uuid])
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    match rows
        .next()
        .map_err(|e| SyncError::Internal(format!("Row fetch failed: {}", e)))?
    {
        Some(row) => Ok(Some(Item::from_row(row).map_err(|e| {
            SyncError::Internal(format!("Row parse failed: {}", e))
        })?)),
        None => Ok(None),
    }
}

/// List items matching the query, ordered and paginated
pub fn find_all(conn: &Connection, query: &ItemQuery) -> Result<Vec<Item>, SyncError> {
    let (conditions, mut params) = build_filters(query);

    let mut sql = String::from("SELECT * FROM items");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    push_order_and_limit(&mut sql, &mut params, query);

    debug!("Executing item query: {}", sql);

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), Item::from_row)
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    let mut results = vec![];
    for row_result in rows {
        results.push(
            row_result.map_err(|e| SyncError::Internal(format!("Row parse failed: {}", e)))?,
        );
    }

    Ok(results)
}

/// Count items matching the query's filters, ignoring order and pagination
pub fn count_all(conn: &Connection, query: &ItemQuery) -> Result<i64, SyncError> {
    let (conditions, params) = build_filters(query);

    let mut sql = String::from("SELECT COUNT(*) FROM items");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
        .map_err(|e| SyncError::Internal(format!("Count failed: {}", e)))
}

/// One row of the transfer-calculator projection
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSizeRow {
    pub uuid: String,
    pub content_size: i64,
    pub updated_at_timestamp: i64,
}

/// Stream the `(uuid, content_size, updated_at_timestamp)` projection
/// under the same filters, order and limit as the full query. Used by the
/// transfer calculator.
pub fn content_sizes(conn: &Connection, query: &ItemQuery) -> Result<Vec<ItemSizeRow>, SyncError> {
    let (conditions, mut params) = build_filters(query);

    let mut sql = String::from("SELECT uuid, content_size, updated_at_timestamp FROM items");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    push_order_and_limit(&mut sql, &mut params, query);

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SyncError::Internal(format!("Prepare failed: {}", e)))?;

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(ItemSizeRow {
                uuid: row.get(0)?,
                content_size: row.get(1)?,
                updated_at_timestamp: row.get(2)?,
            })
        })
        .map_err(|e| SyncError::Internal(format!("Query failed: {}", e)))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| SyncError::Internal(format!("Row parse failed: {}", e)))
}

/// Insert a new item. A uuid collision surfaces as `ConflictingItem`.
pub fn insert_item(conn: &Connection, item: &Item) -> Result<(), SyncError> {
    let result = conn.execute(
        r#"
        INSERT INTO items (
            uuid, user_uuid, shared_vault_uuid, key_system_identifier,
            content, content_type, content_size, enc_item_key, auth_hash,
            items_key_id, deleted, duplicate_of, last_edited_by_uuid,
            updated_with_session, created_at_timestamp, updated_at_timestamp
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            item.uuid,
            item.user_uuid,
            item.shared_vault_uuid,
            item.key_system_identifier,
            item.content,
            item.content_type,
            item.content_size,
            item.enc_item_key,
            item.auth_hash,
            item.items_key_id,
            item.deleted as i64,
            item.duplicate_of,
            item.last_edited_by_uuid,
            item.updated_with_session,
            item.created_at_timestamp,
            item.updated_at_timestamp,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(SyncError::ConflictingItem(item.uuid.clone()))
        }
        Err(e) => Err(SyncError::Internal(format!("Insert failed: {}", e))),
    }
}

/// Update an existing item in place
pub fn update_item(conn: &Connection, item: &Item) -> Result<(), SyncError> {
    conn.execute(
        r#"
        UPDATE items SET
            user_uuid = ?, shared_vault_uuid = ?, key_system_identifier = ?,
            content = ?, content_type = ?, content_size = ?, enc_item_key = ?,
            auth_hash = ?, items_key_id = ?, deleted = ?, duplicate_of = ?,
            last_edited_by_uuid = ?, updated_with_session = ?,
            created_at_timestamp = ?, updated_at_timestamp = ?
        WHERE uuid = ?
        "#,
        params![
            item.user_uuid,
            item.shared_vault_uuid,
            item.key_system_identifier,
            item.content,
            item.content_type,
            item.content_size,
            item.enc_item_key,
            item.auth_hash,
            item.items_key_id,
            item.deleted as i64,
            item.duplicate_of,
            item.last_edited_by_uuid,
            item.updated_with_session,
            item.created_at_timestamp,
            item.updated_at_timestamp,
            item.uuid,
        ],
    )
    .map_err(|e| SyncError::Internal(format!("Update failed: {}", e)))?;

    Ok(())
}

/// Upsert an item by uuid and return the persisted entity. Rejects an
/// upsert that would re-home a uuid to a different user.
pub fn save_item(conn: &Connection, item: &Item) -> Result<Item, SyncError> {
    match find_any_by_uuid(conn, &item.uuid)? {
        Some(existing) if existing.user_uuid != item.user_uuid => {
            Err(SyncError::ConflictingItem(item.uuid.clone()))
        }
        Some(_) => {
            update_item(conn, item)?;
            find_by_uuid(conn, &item.user_uuid, &item.uuid)?
                .ok_or_else(|| SyncError::Internal("Item not found after update".to_string()))
        }
        None => {
            insert_item(conn, item)?;
            find_by_uuid(conn, &item.user_uuid, &item.uuid)?
                .ok_or_else(|| SyncError::Internal("Item not found after insert".to_string()))
        }
    }
}

/// Remove one item by uuid
pub fn remove_by_uuid(conn: &Connection, uuid: &str) -> Result<bool, SyncError> {
    let changes = conn
        .execute("DELETE FROM items WHERE uuid = ?", params![uuid])
        .map_err(|e| SyncError::Internal(format!("Delete failed: {}", e)))?;

    Ok(changes > 0)
}

/// Bulk delete of a user's private items, leaving shared-vault items in
/// place. Used by the transition cleanup phase only.
pub fn delete_by_user_uuid_and_not_in_shared_vault(
    conn: &Connection,
    user_uuid: &str,
) -> Result<usize, SyncError> {
    conn.execute(
        "DELETE FROM items WHERE user_uuid = ? AND shared_vault_uuid IS NULL",
        params![user_uuid],
    )
    .map_err(|e| SyncError::Internal(format!("Bulk delete failed: {}", e)))
}
