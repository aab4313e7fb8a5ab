//! Dual-store transition runner
//!
//! Streams one user's items from a source store to a target store,
//! verifies the copy, then removes the user's private items from the
//! source. Every phase checkpoints its progress so an interrupted run
//! resumes where it stopped instead of starting over.
//!
//! ## Phases
//!
//! ```text
//! precondition  target already populated and no run underway → Verified
//! copy          paged by created_at ASC, newer-target and identical skips
//! settle        fixed delay so asynchronous target indexing catches up
//! verify        paged identity check of target against source
//! cleanup       delete the user's private items from the source
//! finalize      emit Verified
//! ```
//!
//! At most one run per user at a time; shared-vault items are never
//! deleted from the source.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Timer;
use crate::config::Config;
use crate::db::items::{self, ItemQuery, SortKey, SortOrder};
use crate::db::transitions::{self, TransitionStatusRow};
use crate::db::ItemDb;
use crate::error::SyncError;
use crate::services::events::{DomainEvent, EventBus};

/// Transition type covered by this runner
pub const TRANSITION_TYPE_ITEMS: &str = "items";

/// Lifecycle state of a per-user transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionState {
    NotStarted,
    InProgress,
    Verified,
    Failed,
}

impl TransitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionState::NotStarted => "not_started",
            TransitionState::InProgress => "in_progress",
            TransitionState::Verified => "verified",
            TransitionState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "in_progress" => TransitionState::InProgress,
            "verified" => TransitionState::Verified,
            "failed" => TransitionState::Failed,
            _ => TransitionState::NotStarted,
        }
    }
}

/// Outcome of one runner invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The target already held the user's items
    AlreadyMigrated,
    Verified,
    Failed,
}

/// Configuration for the transition runner
#[derive(Debug, Clone)]
pub struct TransitionConfig {
    /// Items per page during copy and verify
    pub page_size: u32,
    /// Delay between the copy and verify phases (ms)
    pub settle_delay_ms: u64,
    /// Delay before overwriting a diverged target item (ms)
    pub overwrite_settle_delay_ms: u64,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            settle_delay_ms: 1000,
            overwrite_settle_delay_ms: 100,
        }
    }
}

impl TransitionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.transition_page_size,
            settle_delay_ms: config.settle_delay_ms,
            overwrite_settle_delay_ms: config.overwrite_settle_delay_ms,
        }
    }
}

/// Moves one user's items between two stores, resumably
pub struct TransitionRunner {
    source: Arc<ItemDb>,
    target: Arc<ItemDb>,
    events: Arc<EventBus>,
    timer: Arc<Timer>,
    config: TransitionConfig,
    /// Users with a run underway in this process
    active_users: Mutex<HashSet<String>>,
}

impl TransitionRunner {
    pub fn new(
        source: Arc<ItemDb>,
        target: Arc<ItemDb>,
        events: Arc<EventBus>,
        timer: Arc<Timer>,
        config: TransitionConfig,
    ) -> Self {
        Self {
            source,
            target,
            events,
            timer,
            config,
            active_users: Mutex::new(HashSet::new()),
        }
    }

    /// Run (or resume) the transition for one user.
    ///
    /// Mid-run storage errors never surface to the caller: they are
    /// recorded on the status row and reported as a `Failed` outcome.
    pub async fn run(&self, user_uuid: &str) -> Result<TransitionOutcome, SyncError> {
        let _guard = self.lock_user(user_uuid)?;

        match self.execute(user_uuid).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(user = %user_uuid, "Transition failed: {}", e);
                if let Err(save_err) = self.record_failure(user_uuid, &e.to_string()) {
                    error!(user = %user_uuid, "Could not record failure: {}", save_err);
                }
                self.emit_status(user_uuid, TransitionState::Failed);
                Ok(TransitionOutcome::Failed)
            }
        }
    }

    async fn execute(&self, user_uuid: &str) -> Result<TransitionOutcome, SyncError> {
        let mut status = self
            .target
            .read(|conn| transitions::find_status(conn, user_uuid, TRANSITION_TYPE_ITEMS))?
            .unwrap_or_else(|| TransitionStatusRow::not_started(user_uuid, TRANSITION_TYPE_ITEMS));

        if status.status == TransitionState::Verified {
            return Ok(TransitionOutcome::AlreadyMigrated);
        }

        // Precondition: a populated target with no run underway means the
        // user was migrated before progress tracking existed
        if status.status == TransitionState::NotStarted {
            let target_count = self
                .target
                .read(|conn| items::count_all(conn, &ItemQuery::for_user(user_uuid)))?;
            if target_count > 0 {
                info!(user = %user_uuid, target_count, "Target already populated, marking verified");
                status.status = TransitionState::Verified;
                self.save_status(&mut status)?;
                self.emit_status(user_uuid, TransitionState::Verified);
                return Ok(TransitionOutcome::AlreadyMigrated);
            }
        }

        status.status = TransitionState::InProgress;
        self.save_status(&mut status)?;
        self.emit_status(user_uuid, TransitionState::InProgress);

        self.copy_phase(user_uuid, &mut status).await?;

        // Settle so asynchronous target indexing catches up before the
        // identity check. Never skipped.
        self.timer
            .sleep(Duration::from_millis(self.config.settle_delay_ms))
            .await;

        if !self.verify_phase(user_uuid, &mut status).await? {
            status.status = TransitionState::Failed;
            // Force a full recheck on the next attempt
            status.paging_progress = 1;
            status.integrity_progress = 1;
            self.save_status(&mut status)?;
            self.emit_status(user_uuid, TransitionState::Failed);
            return Ok(TransitionOutcome::Failed);
        }

        self.cleanup_phase(user_uuid)?;

        status.status = TransitionState::Verified;
        status.last_error = None;
        self.save_status(&mut status)?;
        self.emit_status(user_uuid, TransitionState::Verified);
        info!(user = %user_uuid, "Transition verified");

        Ok(TransitionOutcome::Verified)
    }

    /// Copy the source items into the target, page by page
    async fn copy_phase(
        &self,
        user_uuid: &str,
        status: &mut TransitionStatusRow,
    ) -> Result<(), SyncError> {
        let page_size = self.config.page_size.max(1);
        let total = self
            .source
            .read(|conn| items::count_all(conn, &ItemQuery::for_user(user_uuid)))?;
        let total_pages = ((total as u32) + page_size - 1) / page_size;
        let progress_interval = (total_pages / 10).max(1);

        let mut page = status.paging_progress.max(1);

        loop {
            let batch = self.fetch_page(&self.source, user_uuid, page)?;
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len();
            for item in batch {
                self.copy_item(user_uuid, item).await?;
            }

            status.paging_progress = page;
            self.save_status(status)?;

            if total_pages >= 10 && page % progress_interval == 0 {
                debug!(user = %user_uuid, page, total_pages, "Copy progress");
                self.emit_status(user_uuid, TransitionState::InProgress);
            }

            if (batch_len as u32) < page_size {
                break;
            }
            page += 1;
        }

        Ok(())
    }

    async fn copy_item(&self, user_uuid: &str, item: items::Item) -> Result<(), SyncError> {
        let existing = self
            .target
            .read(|conn| items::find_by_uuid(conn, user_uuid, &item.uuid))?;

        match existing {
            Some(target_item) => {
                if target_item.updated_at_timestamp > item.updated_at_timestamp {
                    debug!(item = %item.uuid, "Target has newer version, skipping");
                    return Ok(());
                }
                if target_item.is_identical_to(&item) {
                    return Ok(());
                }

                // Let target replication settle before replacing
                self.timer
                    .sleep(Duration::from_millis(self.config.overwrite_settle_delay_ms))
                    .await;

                self.target.write(|conn| {
                    items::remove_by_uuid(conn, &item.uuid)?;
                    items::insert_item(conn, &item)
                })?;
            }
            None => {
                self.target
                    .write(|conn| items::insert_item(conn, &item))?;
            }
        }

        Ok(())
    }

    /// Confirm every target item exists identically in the source
    async fn verify_phase(
        &self,
        user_uuid: &str,
        status: &mut TransitionStatusRow,
    ) -> Result<bool, SyncError> {
        let page_size = self.config.page_size;
        let mut page = status.integrity_progress.max(1);

        loop {
            let batch = self.fetch_page(&self.target, user_uuid, page)?;
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len();
            for target_item in &batch {
                let source_item = self
                    .source
                    .read(|conn| items::find_by_uuid(conn, user_uuid, &target_item.uuid))?;

                let diverged = match source_item {
                    None => true,
                    Some(ref s) if s.updated_at_timestamp > target_item.updated_at_timestamp => {
                        true
                    }
                    Some(ref s) => !s.is_identical_to(target_item),
                };

                if diverged {
                    warn!(
                        user = %user_uuid,
                        item = %target_item.uuid,
                        "Integrity check failed"
                    );
                    status.last_error = Some(format!(
                        "integrity check failed for item {}",
                        target_item.uuid
                    ));
                    return Ok(false);
                }
            }

            status.integrity_progress = page;
            self.save_status(status)?;

            if (batch_len as u32) < page_size {
                break;
            }
            page += 1;
        }

        Ok(true)
    }

    /// Remove the user's now-redundant private items from the source.
    /// Shared-vault items are intentionally left in place.
    fn cleanup_phase(&self, user_uuid: &str) -> Result<(), SyncError> {
        let removed = self.source.write(|conn| {
            items::delete_by_user_uuid_and_not_in_shared_vault(conn, user_uuid)
        })?;
        info!(user = %user_uuid, removed, "Cleaned up source store");
        Ok(())
    }

    fn fetch_page(
        &self,
        store: &Arc<ItemDb>,
        user_uuid: &str,
        page: u32,
    ) -> Result<Vec<items::Item>, SyncError> {
        let query = ItemQuery {
            user_uuid: user_uuid.to_string(),
            sort_by: SortKey::CreatedAt,
            sort_order: SortOrder::Asc,
            limit: Some(self.config.page_size),
            offset: Some((page - 1) * self.config.page_size),
            ..Default::default()
        };
        store.read(|conn| items::find_all(conn, &query))
    }

    fn save_status(&self, status: &mut TransitionStatusRow) -> Result<(), SyncError> {
        status.updated_at_timestamp = self.timer.now_micros();
        self.target
            .write(|conn| transitions::save_status(conn, status))
    }

    fn record_failure(&self, user_uuid: &str, message: &str) -> Result<(), SyncError> {
        let mut status = self
            .target
            .read(|conn| transitions::find_status(conn, user_uuid, TRANSITION_TYPE_ITEMS))?
            .unwrap_or_else(|| TransitionStatusRow::not_started(user_uuid, TRANSITION_TYPE_ITEMS));
        status.status = TransitionState::Failed;
        status.last_error = Some(message.to_string());
        self.save_status(&mut status)
    }

    fn emit_status(&self, user_uuid: &str, state: TransitionState) {
        self.events.emit(DomainEvent::TransitionStatusUpdated {
            user_uuid: user_uuid.to_string(),
            status: state,
            transition_type: TRANSITION_TYPE_ITEMS.to_string(),
            transition_timestamp: self.timer.now_micros(),
        });
    }

    fn lock_user(&self, user_uuid: &str) -> Result<UserLockGuard<'_>, SyncError> {
        let mut active = self
            .active_users
            .lock()
            .map_err(|e| SyncError::Internal(format!("Lock poisoned: {}", e)))?;

        if !active.insert(user_uuid.to_string()) {
            return Err(SyncError::BadRequest(format!(
                "transition already running for user {}",
                user_uuid
            )));
        }

        Ok(UserLockGuard {
            active_users: &self.active_users,
            user_uuid: user_uuid.to_string(),
        })
    }
}

/// Releases the per-user slot when a run ends, on every exit path
struct UserLockGuard<'a> {
    active_users: &'a Mutex<HashSet<String>>,
    user_uuid: String,
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active_users.lock() {
            active.remove(&self.user_uuid);
        }
    }
}
