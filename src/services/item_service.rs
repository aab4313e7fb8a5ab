//! Item service - sync orchestration
//!
//! The two entry points of the sync engine. `get_items` delivers changes
//! since the client's sync point, paginated and byte-budgeted.
//! `save_items` applies a batch of client hashes one item at a time,
//! reporting conflicts without ever aborting the batch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::Timer;
use crate::config::Config;
use crate::db::items::{
    self, Item, ItemHash, ItemQuery, SortKey, SortOrder, TimeComparator, CONTENT_TYPE_FILE,
    CONTENT_TYPE_ITEMS_KEY, CONTENT_TYPE_NOTE,
};
use crate::db::shared_vault_users::{self, SharedVaultPermission};
use crate::db::ItemDb;
use crate::error::SyncError;
use crate::tokens;

use super::events::{DomainEvent, EventBus};
use super::save_rules::{ConflictKind, ItemConflict, RuleOutcome, SaveContext, SaveValidator};
use super::transfer;
use super::user_events::UserEventService;
use super::CancelFlag;

/// Tunables of the sync engine, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct ItemServiceConfig {
    pub default_limit: u32,
    pub max_sync_limit: u32,
    pub content_transfer_budget: u64,
    pub revision_frequency_micros: i64,
    pub sync_conflict_tolerance_micros: i64,
}

impl ItemServiceConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_limit: config.default_sync_limit,
            max_sync_limit: config.max_sync_limit,
            content_transfer_budget: config.content_transfer_budget,
            revision_frequency_micros: config.revision_frequency_micros(),
            sync_conflict_tolerance_micros: config.sync_conflict_tolerance_micros,
        }
    }
}

impl Default for ItemServiceConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Read-sync request
#[derive(Debug, Clone, Default)]
pub struct GetItemsRequest {
    pub user_uuid: String,
    pub sync_token: Option<String>,
    pub cursor_token: Option<String>,
    pub limit: Option<u32>,
    pub content_type: Option<String>,
    pub shared_vault_uuids: Option<Vec<String>>,
}

/// Read-sync result
#[derive(Debug, Clone)]
pub struct GetItemsResult {
    pub items: Vec<Item>,
    pub sync_token: String,
    pub cursor_token: Option<String>,
}

/// Write-sync request
#[derive(Debug, Clone, Default)]
pub struct SaveItemsRequest {
    pub user_uuid: String,
    pub session_uuid: Option<String>,
    pub api_version: String,
    pub sdk_version: Option<String>,
    pub read_only_access: bool,
    pub item_hashes: Vec<ItemHash>,
}

/// Write-sync result. `saved_items` preserves request order.
#[derive(Debug, Clone)]
pub struct SaveItemsResult {
    pub saved_items: Vec<Item>,
    pub conflicts: Vec<ItemConflict>,
    pub sync_token: String,
}

/// Classification of one successful save
#[derive(Debug, Clone, PartialEq)]
enum SaveOperation {
    Create,
    Update,
    AddToSharedVault,
    RemoveFromSharedVault { previous_vault: String },
    NoopInVault,
}

pub struct ItemService {
    db: Arc<ItemDb>,
    events: Arc<EventBus>,
    user_events: Arc<UserEventService>,
    validator: SaveValidator,
    timer: Arc<Timer>,
    config: ItemServiceConfig,
}

impl ItemService {
    pub fn new(
        db: Arc<ItemDb>,
        events: Arc<EventBus>,
        user_events: Arc<UserEventService>,
        timer: Arc<Timer>,
        config: ItemServiceConfig,
    ) -> Self {
        let validator = SaveValidator::new(config.sync_conflict_tolerance_micros);
        Self {
            db,
            events,
            user_events,
            validator,
            timer,
            config,
        }
    }

    // =========================================================================
    // Read sync
    // =========================================================================

    /// Deliver items changed since the client's sync point.
    ///
    /// On cancellation before hydration an empty partial result is
    /// returned; the caller decides whether to discard it.
    pub fn get_items(
        &self,
        request: &GetItemsRequest,
        cancel: &CancelFlag,
    ) -> Result<GetItemsResult, SyncError> {
        // Cursor token wins over sync token; cursor pairs with an
        // inclusive comparator so boundary writes are re-read, not lost.
        let (last_sync_time, comparator) = match (
            non_empty(&request.cursor_token),
            non_empty(&request.sync_token),
        ) {
            (Some(cursor), _) => (Some(tokens::decode(cursor)?), TimeComparator::AtOrAfter),
            (None, Some(sync)) => (Some(tokens::decode(sync)?), TimeComparator::After),
            (None, None) => (None, TimeComparator::After),
        };

        let limit = request
            .limit
            .unwrap_or(self.config.default_limit)
            .max(1)
            .min(self.config.max_sync_limit);

        let effective_vaults = self.effective_vault_uuids(
            &request.user_uuid,
            request.shared_vault_uuids.as_deref(),
        )?;

        let query = ItemQuery {
            user_uuid: request.user_uuid.clone(),
            uuids: None,
            content_type: request.content_type.clone(),
            // Initial syncs hide tombstones; incremental syncs must
            // deliver them so clients learn of deletions.
            deleted: if last_sync_time.is_none() {
                Some(false)
            } else {
                None
            },
            include_shared_vault_uuids: effective_vaults,
            exclusive_shared_vault_uuids: None,
            last_sync_time,
            comparator,
            sort_by: SortKey::UpdatedAt,
            sort_order: SortOrder::Asc,
            offset: None,
            limit: Some(limit),
        };

        if cancel.is_cancelled() {
            return Ok(GetItemsResult {
                items: vec![],
                sync_token: tokens::encode(last_sync_time.unwrap_or(0)),
                cursor_token: None,
            });
        }

        let cursor_boundary = match comparator {
            TimeComparator::AtOrAfter => last_sync_time,
            TimeComparator::After => None,
        };

        let plan = transfer::select_uuids_under_budget(
            &self.db,
            &query,
            self.config.content_transfer_budget,
            cursor_boundary,
        )?;

        let mut items = if plan.uuids.is_empty() {
            vec![]
        } else {
            let mut hydrate = query.clone();
            hydrate.uuids = Some(plan.uuids.clone());
            hydrate.limit = None;
            self.db.read(|conn| items::find_all(conn, &hydrate))?
        };

        let mut count_query = query.clone();
        count_query.limit = None;
        let total = self
            .db
            .read(|conn| items::count_all(conn, &count_query))?;

        let more_remaining = total > limit as i64 || plan.truncated;

        let cursor_token = match (more_remaining, items.last()) {
            (true, Some(last)) => Some(tokens::encode(last.updated_at_timestamp)),
            _ => None,
        };

        let sync_token = match items.iter().map(|i| i.updated_at_timestamp).max() {
            Some(max_updated_at) => tokens::encode_sync_token(max_updated_at),
            None => tokens::encode(last_sync_time.unwrap_or(0)),
        };

        // Initial syncs front-load the items keys so the client can
        // decrypt everything else in the stream immediately.
        if last_sync_time.is_none() {
            self.front_load_items_keys(&request.user_uuid, &mut items)?;
        }

        debug!(
            user = %request.user_uuid,
            returned = items.len(),
            total,
            truncated = plan.truncated,
            "get_items"
        );

        Ok(GetItemsResult {
            items,
            sync_token,
            cursor_token,
        })
    }

    fn front_load_items_keys(
        &self,
        user_uuid: &str,
        items: &mut Vec<Item>,
    ) -> Result<(), SyncError> {
        let mut keys_query = ItemQuery::for_user(user_uuid);
        keys_query.content_type = Some(CONTENT_TYPE_ITEMS_KEY.to_string());
        keys_query.deleted = Some(false);

        let key_items = self.db.read(|conn| items::find_all(conn, &keys_query))?;

        let mut missing: Vec<Item> = key_items
            .into_iter()
            .filter(|key| !items.iter().any(|i| i.uuid == key.uuid))
            .collect();

        if !missing.is_empty() {
            missing.extend(items.drain(..));
            *items = missing;
        }

        Ok(())
    }

    /// Intersect the vaults the client asked for with the vaults the user
    /// actually belongs to.
    fn effective_vault_uuids(
        &self,
        user_uuid: &str,
        requested: Option<&[String]>,
    ) -> Result<Option<Vec<String>>, SyncError> {
        let memberships = self
            .db
            .read(|conn| shared_vault_users::find_all_for_user(conn, user_uuid))?;

        if memberships.is_empty() {
            return Ok(None);
        }

        let member_vaults: Vec<String> = memberships
            .into_iter()
            .map(|m| m.shared_vault_uuid)
            .collect();

        let effective: Vec<String> = match requested {
            Some(requested) => member_vaults
                .into_iter()
                .filter(|v| requested.contains(v))
                .collect(),
            None => member_vaults,
        };

        if effective.is_empty() {
            Ok(None)
        } else {
            Ok(Some(effective))
        }
    }

    // =========================================================================
    // Write sync
    // =========================================================================

    /// Apply a batch of item hashes in request order.
    ///
    /// Each save is its own atomic unit: a failing item becomes a conflict
    /// entry and the batch continues. On cancellation the loop stops
    /// between items and already-persisted writes remain.
    pub fn save_items(
        &self,
        request: &SaveItemsRequest,
        cancel: &CancelFlag,
    ) -> Result<SaveItemsResult, SyncError> {
        let request_started_at = self.timer.now_micros();

        let vault_permissions = self.vault_permissions(&request.user_uuid)?;

        let mut saved_items: Vec<Item> = Vec::new();
        let mut conflicts: Vec<ItemConflict> = Vec::new();

        for hash in &request.item_hashes {
            if cancel.is_cancelled() {
                warn!(
                    user = %request.user_uuid,
                    remaining = request.item_hashes.len() - saved_items.len() - conflicts.len(),
                    "save_items cancelled mid-batch"
                );
                break;
            }

            if request.read_only_access {
                conflicts.push(ItemConflict {
                    unsaved_item: hash.clone(),
                    server_item: None,
                    kind: ConflictKind::ReadOnlyError,
                });
                continue;
            }

            let existing = self
                .db
                .read(|conn| items::find_by_uuid(conn, &request.user_uuid, &hash.uuid))?;

            // A uuid owned by another user can never be written to
            if existing.is_none() {
                let foreign = self
                    .db
                    .read(|conn| items::find_any_by_uuid(conn, &hash.uuid))?;
                if foreign.is_some() {
                    conflicts.push(ItemConflict {
                        unsaved_item: hash.clone(),
                        server_item: None,
                        kind: ConflictKind::UuidConflict,
                    });
                    continue;
                }
            }

            let ctx = SaveContext {
                user_uuid: &request.user_uuid,
                item_hash: hash,
                existing: existing.as_ref(),
                vault_permissions: &vault_permissions,
            };

            match self.validator.validate(&ctx) {
                RuleOutcome::Conflict { kind, server_item } => {
                    conflicts.push(ItemConflict {
                        unsaved_item: hash.clone(),
                        server_item,
                        kind,
                    });
                }
                RuleOutcome::Skip(item) => {
                    saved_items.push(item);
                }
                // A failing item never aborts the batch; the client sees
                // it as a conflict and the remaining hashes proceed
                RuleOutcome::Pass => match self.apply_hash(request, hash, existing) {
                    Ok(saved) => saved_items.push(saved),
                    Err(e) => {
                        warn!(item = %hash.uuid, "Save failed: {}", e);
                        conflicts.push(ItemConflict {
                            unsaved_item: hash.clone(),
                            server_item: None,
                            kind: ConflictKind::UuidConflict,
                        });
                    }
                },
            }
        }

        let max_saved = saved_items
            .iter()
            .map(|i| i.updated_at_timestamp)
            .max()
            .unwrap_or(request_started_at);
        let sync_token = tokens::encode_sync_token(max_saved.max(request_started_at));

        Ok(SaveItemsResult {
            saved_items,
            conflicts,
            sync_token,
        })
    }

    fn vault_permissions(
        &self,
        user_uuid: &str,
    ) -> Result<HashMap<String, SharedVaultPermission>, SyncError> {
        let memberships = self
            .db
            .read(|conn| shared_vault_users::find_all_for_user(conn, user_uuid))?;

        Ok(memberships
            .into_iter()
            .map(|m| (m.shared_vault_uuid, m.permission))
            .collect())
    }

    /// Persist one validated hash and emit the warranted side effects
    fn apply_hash(
        &self,
        request: &SaveItemsRequest,
        hash: &ItemHash,
        existing: Option<Item>,
    ) -> Result<Item, SyncError> {
        let operation = classify_operation(existing.as_ref(), hash);

        let (saved, previous_updated_at, was_marked_as_duplicate) = match existing {
            Some(existing) => {
                let previous_updated_at = existing.updated_at_timestamp;
                let was_duplicate_before = existing.duplicate_of.is_some();

                let mut item = existing;
                apply_hash_fields(&mut item, hash);

                if item.shared_vault_uuid.is_some() {
                    item.last_edited_by_uuid = Some(request.user_uuid.clone());
                }
                item.updated_with_session = request.session_uuid.clone();
                item.updated_at_timestamp = self.timer.now_micros();

                if item.deleted {
                    item.clear_for_tombstone();
                } else {
                    item.content_size = item.canonical_size();
                }

                let was_marked_as_duplicate =
                    !was_duplicate_before && item.duplicate_of.is_some();

                self.db.write(|conn| items::update_item(conn, &item))?;

                (item, Some(previous_updated_at), was_marked_as_duplicate)
            }
            None => {
                let now = self.timer.now_micros();
                let created_at = hash.created_at_timestamp.unwrap_or(now);
                // On create, an omitted vault key and an explicit null
                // both mean the item starts outside any vault
                let vault = hash.shared_vault_uuid.clone().flatten();

                let mut item = Item {
                    uuid: hash.uuid.clone(),
                    user_uuid: request.user_uuid.clone(),
                    shared_vault_uuid: vault.clone(),
                    key_system_identifier: hash.key_system_identifier.clone(),
                    content: hash.content.clone(),
                    content_type: hash.content_type.clone(),
                    content_size: 0,
                    enc_item_key: hash.enc_item_key.clone(),
                    auth_hash: hash.auth_hash.clone(),
                    items_key_id: hash.items_key_id.clone(),
                    deleted: hash.deleted.unwrap_or(false),
                    duplicate_of: hash.duplicate_of.clone(),
                    last_edited_by_uuid: vault.as_ref().map(|_| request.user_uuid.clone()),
                    updated_with_session: request.session_uuid.clone(),
                    created_at_timestamp: created_at,
                    updated_at_timestamp: now.max(created_at),
                };

                if item.deleted {
                    item.clear_for_tombstone();
                } else {
                    item.content_size = item.canonical_size();
                }

                self.db.write(|conn| items::insert_item(conn, &item))?;

                (item, None, false)
            }
        };

        self.emit_save_events(
            &request.user_uuid,
            &operation,
            &saved,
            previous_updated_at,
            was_marked_as_duplicate,
        );

        Ok(saved)
    }

    /// Side effects of one successful save. None of these may fail the
    /// save itself; collaborator errors are logged and swallowed.
    fn emit_save_events(
        &self,
        user_uuid: &str,
        operation: &SaveOperation,
        saved: &Item,
        previous_updated_at: Option<i64>,
        was_marked_as_duplicate: bool,
    ) {
        let tracks_revisions = matches!(
            saved.content_type.as_deref(),
            Some(CONTENT_TYPE_NOTE) | Some(CONTENT_TYPE_FILE)
        );

        let revision_due = match (operation, previous_updated_at) {
            (SaveOperation::Create, _) => true,
            (_, Some(previous)) => {
                saved.updated_at_timestamp - previous >= self.config.revision_frequency_micros
            }
            _ => false,
        };

        if tracks_revisions && revision_due {
            self.events.emit(DomainEvent::ItemRevisionCreationRequested {
                item_uuid: saved.uuid.clone(),
                user_uuid: user_uuid.to_string(),
            });
        }

        let newly_duplicate = was_marked_as_duplicate
            || (*operation == SaveOperation::Create && saved.duplicate_of.is_some());
        if newly_duplicate {
            self.events.emit(DomainEvent::DuplicateItemSynced {
                item_uuid: saved.uuid.clone(),
                user_uuid: user_uuid.to_string(),
            });
        }

        match operation {
            SaveOperation::AddToSharedVault => {
                let vault = saved.shared_vault_uuid.as_deref().unwrap_or_default();
                if let Err(e) = self
                    .user_events
                    .remove_user_events_after_item_is_added_to_shared_vault(
                        user_uuid,
                        &saved.uuid,
                        vault,
                    )
                {
                    error!(item = %saved.uuid, "Failed to clear stale user events: {}", e);
                }
            }
            SaveOperation::RemoveFromSharedVault { previous_vault } => {
                if let Err(e) = self
                    .user_events
                    .create_item_removed_from_shared_vault_user_event(
                        user_uuid,
                        &saved.uuid,
                        previous_vault,
                    )
                {
                    error!(item = %saved.uuid, "Failed to record vault removal: {}", e);
                }
                self.events.emit(DomainEvent::ItemRemovedFromSharedVault {
                    item_uuid: saved.uuid.clone(),
                    user_uuid: user_uuid.to_string(),
                    shared_vault_uuid: previous_vault.clone(),
                });
            }
            _ => {}
        }
    }
}

/// Classify what a validated hash does to the item's vault membership.
/// A hash that does not mention the vault field leaves membership alone.
fn classify_operation(existing: Option<&Item>, hash: &ItemHash) -> SaveOperation {
    let existing = match existing {
        Some(existing) => existing,
        None => return SaveOperation::Create,
    };

    let signal = match &hash.shared_vault_uuid {
        Some(signal) => signal,
        None => {
            return if existing.shared_vault_uuid.is_some() {
                SaveOperation::NoopInVault
            } else {
                SaveOperation::Update
            }
        }
    };

    match (&existing.shared_vault_uuid, signal) {
        (None, Some(_)) => SaveOperation::AddToSharedVault,
        (Some(previous), None) => SaveOperation::RemoveFromSharedVault {
            previous_vault: previous.clone(),
        },
        (Some(previous), Some(next)) if previous != next => {
            SaveOperation::RemoveFromSharedVault {
                previous_vault: previous.clone(),
            }
        }
        (Some(_), Some(_)) => SaveOperation::NoopInVault,
        (None, None) => SaveOperation::Update,
    }
}

/// Copy the fields present on the hash onto the item; omitted fields are
/// left untouched. For the vault field "present" includes an explicit
/// null, which takes the item out of its vault.
fn apply_hash_fields(item: &mut Item, hash: &ItemHash) {
    if let Some(content) = &hash.content {
        item.content = Some(content.clone());
    }
    if let Some(content_type) = &hash.content_type {
        item.content_type = Some(content_type.clone());
    }
    if let Some(enc_item_key) = &hash.enc_item_key {
        item.enc_item_key = Some(enc_item_key.clone());
    }
    if let Some(auth_hash) = &hash.auth_hash {
        item.auth_hash = Some(auth_hash.clone());
    }
    if let Some(items_key_id) = &hash.items_key_id {
        item.items_key_id = Some(items_key_id.clone());
    }
    if let Some(duplicate_of) = &hash.duplicate_of {
        item.duplicate_of = Some(duplicate_of.clone());
    }
    if let Some(key_system_identifier) = &hash.key_system_identifier {
        item.key_system_identifier = Some(key_system_identifier.clone());
    }
    if let Some(deleted) = hash.deleted {
        item.deleted = deleted;
    }
    if let Some(vault) = &hash.shared_vault_uuid {
        item.shared_vault_uuid = vault.clone();
    }
}

fn non_empty(token: &Option<String>) -> Option<&str> {
    token.as_deref().map(str::trim).filter(|t| !t.is_empty())
}
