//! Lorekeeper - search and cache core for a tabletop rules reference browser
//!
//! Builds per-category and global Tantivy indexes from rules record summaries,
//! runs fuzzy, field-boosted queries, collapses entries published in several
//! source books, and keeps loaded data in a versioned two-tier cache
//! (in-memory LRU over SQLite).

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod database;
pub mod dedup;
pub mod indexer;
pub mod interface;
pub mod loader;
pub mod models;
pub mod registry;
pub mod search;
mod store;

pub use config::Config;
pub use interface::*;
pub use loader::{FileLoader, HttpLoader, LoadError, OriginLoader};
pub use models::RecordPayload;
pub use store::RulesStore;
