// src/storage/mod.rs

//! Storage abstractions for record persistence.
//!
//! Records live in a single SQLite table keyed by `composite_key`, with
//! search tags in a sidecar table:
//!
//! ```text
//! records       composite_key (PK) | platform | native_id | ... | extra (JSON) | content_hash
//! record_tags   composite_key | tag          (PK on both)
//! ```
//!
//! Re-ingesting a key updates the row in place, unions its tags, and moves
//! `fetched_at` forward; `created_at` is written once.

pub mod export;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{ContentKind, Platform, UnifiedRecord, UpsertReport};

// Re-export for convenience
pub use export::export_csv;
pub use sqlite::SqliteStore;

/// Anything that accepts batches of records for idempotent persistence.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert or merge `records`; `source` names the collector that produced them.
    async fn upsert(&self, records: &[UnifiedRecord], source: &str) -> Result<UpsertReport>;
}

/// Result ordering for record queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Most recently fetched first
    #[default]
    FetchedDesc,
    CreatedDesc,
    CreatedAsc,
}

/// Filters for browsing stored records.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub platform: Option<Platform>,
    pub content_kind: Option<ContentKind>,
    /// Substring matched against title and body
    pub keyword: Option<String>,
    /// Records tagged with this search term
    pub tag: Option<String>,
    pub author: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn kind(mut self, kind: ContentKind) -> Self {
        self.content_kind = Some(kind);
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }
}

/// Bucket for grouped counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Platform,
    ContentKind,
    Day,
    Week,
    Month,
}

/// One bucket of a grouped count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub key: String,
    pub count: usize,
}

/// Activity summary for one author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorStat {
    pub author: String,
    pub platform: Platform,
    pub records: usize,
    pub last_created_at: DateTime<Utc>,
}

/// A post or discussion with its stored reply statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadStat {
    pub record: UnifiedRecord,
    pub reply_count: usize,
    pub latest_reply_at: Option<DateTime<Utc>>,
}

/// Outcome of duplicate cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeReport {
    /// Logical records that had more than one row or a non-canonical key
    pub groups: usize,
    /// Rows deleted
    pub removed: usize,
    /// Surviving rows whose key was rewritten to the canonical form
    pub rekeyed: usize,
}
