// src/pipeline/import.rs

//! CSV import entry point.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;
use crate::models::Config;
use crate::services::{Collector, Constraints, CsvImportCollector};
use crate::storage::RecordSink;

/// Totals of one import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub files: usize,
    /// File path to error summary
    pub failed_files: BTreeMap<String, String>,
    /// Data rows read, including skipped ones
    pub rows: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub changed: usize,
}

/// Import export files into `store`, tagging every row with `tag`.
///
/// Each file is persisted as soon as it is parsed; a file that cannot be
/// read is reported without stopping the others.
pub async fn import_csv(
    paths: Vec<PathBuf>,
    store: &dyn RecordSink,
    config: &Config,
    tag: &str,
) -> Result<ImportReport> {
    let files = paths.len();
    let collector = CsvImportCollector::from_config(config, paths);
    let collection = collector
        .collect(tag, &Constraints::default(), Some(store))
        .await?;

    let report = collection.report;
    let persisted = report.persisted.unwrap_or_default();
    let summary = ImportReport {
        files,
        failed_files: report.partition_errors,
        rows: report.records_collected + report.skipped_records,
        skipped: report.skipped_records,
        inserted: persisted.inserted,
        updated: persisted.updated,
        changed: persisted.changed,
    };

    log::info!(
        "Imported {} rows from {} files: {} inserted, {} updated, {} skipped",
        summary.rows,
        summary.files,
        summary.inserted,
        summary.updated,
        summary.skipped
    );
    for (file, error) in &summary.failed_files {
        log::warn!("Import of {} failed: {}", file, error);
    }
    Ok(summary)
}
