//! Vellum Sync - item sync backend for the Vellum notes platform
//!
//! Clients hold opaque encrypted item blobs and call a single sync endpoint
//! that delivers server-side changes since their last sync point and applies
//! client-side changes, reporting conflicts per item.
//!
//! ## Architecture
//!
//! ```text
//! HTTP surface (http.rs, thin)
//!     ↓
//! Service layer (services/*, business logic)
//!     ↓
//! Repository layer (db/*.rs)
//!     ↓
//! SQLite database
//! ```
//!
//! ## Sync model
//!
//! - Reads are ordered by `updated_at_timestamp` and paginated with opaque
//!   tokens: a *sync token* means "everything up to here, strictly", a
//!   *cursor token* means "continue from here, inclusively".
//! - Responses are byte-budgeted: a page never exceeds the configured
//!   transfer budget unless it contains a single oversized item.
//! - Writes are validated per item by a rule chain; a failing item becomes
//!   a conflict entry and never aborts the batch.
//! - Items may live in a shared vault; membership and write permission are
//!   checked against the `shared_vault_users` store.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.vellum-sync/
//! ├── items.db          # Primary item store (SQLite, WAL)
//! ├── items-next.db     # Secondary store (dual-store transitions)
//! └── config.toml       # Configuration
//! ```

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod services;
pub mod tokens;
pub mod transition;

// Re-exports
pub use clock::Timer;
pub use config::Config;
pub use db::items::{Item, ItemHash, ItemQuery};
pub use db::ItemDb;
pub use error::SyncError;
pub use http::HttpServer;
pub use services::events::{DomainEvent, EventBus};
pub use services::item_service::{
    GetItemsRequest, GetItemsResult, ItemService, SaveItemsRequest, SaveItemsResult,
};
pub use services::Services;
pub use transition::{TransitionConfig, TransitionRunner, TransitionState};
