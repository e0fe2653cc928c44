//! A local quote collection with an outbox and a periodic sync cycle against a
//! mock JSON posts API.
//!
//! - `store`: the quote collection, category filter and import/export.
//! - `outbox`: quotes waiting for confirmed remote delivery.
//! - `sync`: the flush/fetch/diff/merge cycle and manual resolution.
//! - `remote`: the `RemoteService` seam and its HTTP implementation.
//! - `db`: SQLite key/value persistence.
//! - `config`: YAML configuration.

pub mod config;
pub mod db;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod store;
pub mod sync;
