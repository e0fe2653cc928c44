//! Storage module: SQLite pool setup and the key/value repository.
//!
//! All persisted state lives in a single `kv` table holding whole serialized
//! values (the quote collection, the outbox, the selected category). Callers
//! read and write complete values; there is no partial update.
//!
//! External modules should import from `quote_sync::db`; the repository API is
//! re-exported here.

pub mod repo;

pub use repo::*;

/// Serialized local quote collection.
pub const KEY_QUOTES: &str = "quotes";
/// Last category filter chosen by the user (`all` or a lowercased name).
pub const KEY_LAST_SELECTED_CATEGORY: &str = "lastSelectedCategory";
/// Serialized outbox of quotes awaiting delivery.
pub const KEY_OUTBOX: &str = "quoteOutbox";
