//! Durable storage for the reading companion.
//!
//! A single SQLite database holds books, their text chunks (with cached
//! embeddings), conversation sessions, extracted notes, and metadata for
//! the vector index files persisted alongside it. Vector data itself
//! lives in flat files managed by [`crate::index`]; this module only
//! tracks which versions exist and where.

mod schema;
mod sqlite;

pub use schema::CURRENT_SCHEMA_VERSION;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use std::path::PathBuf;

/// Number of persisted index versions retained per book. Older versions
/// are pruned when a new one is recorded.
pub const KEPT_INDEX_VERSIONS: usize = 2;

/// Metadata for one persisted vector index file.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub book_id: String,
    /// Monotonically increasing per book, starting at 1.
    pub version: u32,
    /// Absolute path of the vector file; the JSON sidecar sits next to it.
    pub path: PathBuf,
    pub dimension: usize,
    pub entry_count: usize,
    pub created_at: DateTime<Utc>,
}
