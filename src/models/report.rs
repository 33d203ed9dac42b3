// src/models/report.rs

//! Reports produced by collectors, the store, and the orchestrator.

use std::collections::BTreeMap;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::Platform;

/// Outcome of a batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    /// Keys that did not exist before
    pub inserted: usize,
    /// Keys that already existed (every re-ingest counts, even if nothing changed)
    pub updated: usize,
    /// Subset of `updated` whose stored content actually differed
    pub changed: usize,
    /// Records rejected before reaching the table (blank native id)
    pub skipped: usize,
}

impl UpsertReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

impl AddAssign for UpsertReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.changed += other.changed;
        self.skipped += other.skipped;
    }
}

/// Per-collector summary of one `collect` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionReport {
    /// Collector name (`reddit-api`, `reddit-browser`, ...)
    pub source: String,
    pub platform: Platform,
    pub partitions_attempted: usize,
    pub partitions_succeeded: usize,
    /// Partition name to one-line error summary
    pub partition_errors: BTreeMap<String, String>,
    /// Non-fatal problems (failed expansions, skipped pages)
    pub warnings: Vec<String>,
    pub records_collected: usize,
    /// Items dropped as malformed (bad timestamps, missing ids)
    pub skipped_records: usize,
    /// Running totals when the collector persisted incrementally
    pub persisted: Option<UpsertReport>,
}

impl CollectionReport {
    pub fn new(source: impl Into<String>, platform: Platform) -> Self {
        Self {
            source: source.into(),
            platform,
            partitions_attempted: 0,
            partitions_succeeded: 0,
            partition_errors: BTreeMap::new(),
            warnings: Vec::new(),
            records_collected: 0,
            skipped_records: 0,
            persisted: None,
        }
    }

    pub fn partition_ok(&mut self, records: usize) {
        self.partitions_attempted += 1;
        self.partitions_succeeded += 1;
        self.records_collected += records;
    }

    pub fn partition_failed(&mut self, partition: &str, error: &AppError) {
        self.partitions_attempted += 1;
        self.partition_errors
            .insert(partition.to_string(), error.summary());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn add_persisted(&mut self, upsert: UpsertReport) {
        *self.persisted.get_or_insert_with(UpsertReport::default) += upsert;
    }

    /// Every attempted partition failed.
    pub fn all_partitions_failed(&self) -> bool {
        self.partitions_attempted > 0 && self.partitions_succeeded == 0
    }

    pub fn status(&self) -> SourceStatus {
        if self.all_partitions_failed() {
            SourceStatus::Failed
        } else if !self.partition_errors.is_empty() {
            SourceStatus::Degraded
        } else {
            SourceStatus::Ok
        }
    }
}

/// Health of one source after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    /// Every partition succeeded (zero records means nothing matched)
    Ok,
    /// Some partitions failed
    Degraded,
    /// The source produced nothing because it failed
    Failed,
}

/// Result of one collector within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source: String,
    pub platform: Platform,
    pub status: SourceStatus,
    pub report: Option<CollectionReport>,
    /// Set when the collector failed as a whole (config, auth)
    pub error: Option<String>,
    /// What the orchestrator persisted for this source
    pub persisted: UpsertReport,
}

impl SourceOutcome {
    pub fn from_report(report: CollectionReport, persisted: UpsertReport) -> Self {
        Self {
            source: report.source.clone(),
            platform: report.platform,
            status: report.status(),
            report: Some(report),
            error: None,
            persisted,
        }
    }

    pub fn failed(source: &str, platform: Platform, error: &AppError) -> Self {
        Self {
            source: source.to_string(),
            platform,
            status: SourceStatus::Failed,
            report: None,
            error: Some(error.summary()),
            persisted: UpsertReport::default(),
        }
    }

    pub fn records_collected(&self) -> usize {
        self.report.as_ref().map_or(0, |r| r.records_collected)
    }
}

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Snapshot of the current (or last) collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub query: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Human-readable milestones in order
    pub progress: Vec<String>,
    pub sources: Vec<SourceOutcome>,
    pub error: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            query: None,
            started_at: None,
            finished_at: None,
            progress: Vec::new(),
            sources: Vec::new(),
            error: None,
        }
    }
}

impl RunStatus {
    pub fn persisted(&self) -> UpsertReport {
        let mut total = UpsertReport::default();
        for source in &self.sources {
            total += source.persisted;
        }
        total
    }
}
