// src/models/mod.rs

//! Domain models for the discussion fetcher.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod record;
mod report;

// Re-export all public types
pub use config::{
    BrowserConfig, Config, CsvConfig, HttpConfig, HuggingFaceConfig, RedditConfig, RetryConfig,
    RunConfig, SearchMode, StorageConfig,
};
pub use record::{
    AttrValue, Attributes, ContentKind, Platform, UnifiedRecord, composite_key, normalize_author,
};
pub use report::{
    CollectionReport, RunState, RunStatus, SourceOutcome, SourceStatus, UpsertReport,
};
