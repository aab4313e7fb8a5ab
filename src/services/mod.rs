//! Service layer for vellum-sync
//!
//! Services encapsulate business logic between the HTTP surface and the
//! repositories. Each service wraps database operations with:
//! - Validation (the save rule chain)
//! - Cross-entity orchestration
//! - Event emission for downstream consumers
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! Service Layer (business logic)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod item_service;
pub mod save_rules;
pub mod transfer;
pub mod user_events;

// Re-exports
pub use events::{DomainEvent, EventBus, EventListener};
pub use item_service::ItemService;
pub use save_rules::{ConflictKind, ItemConflict, SaveValidator};
pub use user_events::UserEventService;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::Timer;
use crate::config::Config;
use crate::db::ItemDb;
use item_service::ItemServiceConfig;

/// Per-request cancellation signal, checked between items so a cancelled
/// batch never leaves a partially written item behind.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Service container for dependency injection
///
/// Holds all services with a shared database handle. Pass this to
/// HttpServer for handler access.
pub struct Services {
    pub items: Arc<ItemService>,
    pub user_events: Arc<UserEventService>,
    pub events: Arc<EventBus>,
    pub timer: Arc<Timer>,
    pub db: Arc<ItemDb>,
}

impl Services {
    /// Create all services with a shared database
    pub fn new(db: Arc<ItemDb>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());
        let timer = Arc::new(Timer::new());
        let user_events = Arc::new(UserEventService::new(db.clone(), timer.clone()));

        Self {
            items: Arc::new(ItemService::new(
                db.clone(),
                events.clone(),
                user_events.clone(),
                timer.clone(),
                ItemServiceConfig::from_config(config),
            )),
            user_events,
            events,
            timer,
            db,
        }
    }
}
