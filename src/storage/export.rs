// src/storage/export.rs

//! Flat CSV projection of stored records.

use std::io::Write;

use crate::error::Result;
use crate::models::UnifiedRecord;
use crate::storage::{RecordQuery, SqliteStore};
use crate::utils::strip_control_chars;
use crate::utils::time::to_storage;

const HEADER: &[&str] = &[
    "composite_key",
    "platform",
    "native_id",
    "content_kind",
    "title",
    "body",
    "author",
    "url",
    "created_at",
    "created_at_approximate",
    "fetched_at",
    "parent_native_id",
    "search_tags",
    "extra",
];

/// Write every record matching `query` as CSV; returns the number of rows written.
pub fn export_csv<W: Write>(store: &SqliteStore, query: &RecordQuery, writer: W) -> Result<usize> {
    let records = store.query(query)?;
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(HEADER)?;

    for record in &records {
        csv.write_record(project(record)?)?;
    }
    csv.flush()?;

    log::info!("Exported {} records", records.len());
    Ok(records.len())
}

fn project(record: &UnifiedRecord) -> Result<Vec<String>> {
    let tags = record
        .search_tags
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");

    Ok(vec![
        record.composite_key(),
        record.platform.as_str().to_string(),
        record.native_id.clone(),
        record.content_kind.as_str().to_string(),
        clean(record.title.as_deref()),
        clean(Some(&record.body)),
        clean(record.author.as_deref()),
        record.url.clone(),
        to_storage(&record.created_at),
        record.created_at_approximate.to_string(),
        record.fetched_at.as_ref().map(to_storage).unwrap_or_default(),
        record.parent_native_id.clone().unwrap_or_default(),
        clean(Some(&tags)),
        serde_json::to_string(&record.extra)?,
    ])
}

fn clean(value: Option<&str>) -> String {
    value.map(strip_control_chars).unwrap_or_default()
}
