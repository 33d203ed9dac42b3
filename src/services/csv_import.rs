// src/services/csv_import.rs

//! Import of exported post CSV files.
//!
//! The column schema is the one produced by the tweet export tool, with
//! either localized headers or plain English ones. Each file is
//! one partition. Rows that cannot become a record are counted as skipped.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::models::{Config, ContentKind, Platform, UnifiedRecord};
use crate::services::{Collection, Collector, Constraints, Harvest, PartitionYield};
use crate::storage::RecordSink;
use crate::utils::time::parse_timestamp;

const SOURCE: &str = "csv-import";

/// Columns a file must carry, by field name and accepted headers.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    ("id", &["id", "ID", "native_id"]),
    ("url", &["url", "链接", "link"]),
    ("content", &["content", "内容", "text", "body"]),
    ("date", &["date", "发布日期", "created_at", "timestamp"]),
    ("username", &["username", "用户名", "author"]),
];

/// One row of an export file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CsvRow {
    #[serde(default, rename = "id", alias = "ID", alias = "native_id")]
    pub id: Option<String>,
    #[serde(default, rename = "url", alias = "链接", alias = "link")]
    pub url: Option<String>,
    #[serde(default, rename = "content", alias = "内容", alias = "text", alias = "body")]
    pub content: Option<String>,
    #[serde(default, rename = "date", alias = "发布日期", alias = "created_at", alias = "timestamp")]
    pub date: Option<String>,
    #[serde(default, rename = "username", alias = "用户名", alias = "author")]
    pub username: Option<String>,

    #[serde(default, rename = "likes", alias = "喜欢数")]
    pub likes: Option<String>,
    #[serde(default, rename = "retweets", alias = "转发数")]
    pub retweets: Option<String>,
    #[serde(default, rename = "replies", alias = "回复数")]
    pub replies: Option<String>,
    #[serde(default, rename = "views", alias = "浏览量")]
    pub views: Option<String>,
    #[serde(default, rename = "bookmarks", alias = "书签数")]
    pub bookmarks: Option<String>,
    #[serde(default, rename = "language", alias = "语言")]
    pub language: Option<String>,
    #[serde(default, rename = "hashtags", alias = "标签")]
    pub hashtags: Option<String>,
    #[serde(default, rename = "display_name", alias = "用户昵称")]
    pub display_name: Option<String>,
    #[serde(default, rename = "verified", alias = "用户是否认证账号")]
    pub verified: Option<String>,
    #[serde(default, rename = "followers", alias = "用户粉丝数")]
    pub followers: Option<String>,

    /// Set when the row is a reply to another post
    #[serde(default, rename = "reply_to_id", alias = "回复推文 ID")]
    pub reply_to_id: Option<String>,
    #[serde(default, rename = "reply_to_username", alias = "回复推文用户名")]
    pub reply_to_username: Option<String>,
}

fn text(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn count(value: &Option<String>) -> Option<i64> {
    text(value).and_then(|v| v.replace(',', "").parse::<i64>().ok())
}

fn flag(value: &Option<String>) -> Option<bool> {
    text(value).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "y" | "是"))
}

impl CsvRow {
    /// Convert to a record; `None` when a required value is missing or the
    /// timestamp cannot be parsed.
    pub fn into_record(self, platform: Platform) -> Option<UnifiedRecord> {
        let id = text(&self.id)?;
        let body = text(&self.content)?;
        let url = text(&self.url)?;
        let created = text(&self.date).and_then(parse_timestamp)?;

        let parent = text(&self.reply_to_id);
        let kind = if parent.is_some() {
            ContentKind::Reply
        } else {
            ContentKind::Post
        };

        Some(
            UnifiedRecord::new(platform, id, kind, body, url, created.instant)
                .approximate(created.approximate)
                .with_author(text(&self.username))
                .with_parent(parent)
                .with_attr("score", count(&self.likes))
                .with_attr("likes", count(&self.likes))
                .with_attr("retweets", count(&self.retweets))
                .with_attr("replies", count(&self.replies))
                .with_attr("views", count(&self.views))
                .with_attr("bookmarks", count(&self.bookmarks))
                .with_attr("language", text(&self.language))
                .with_attr("hashtags", text(&self.hashtags))
                .with_attr("user_display_name", text(&self.display_name))
                .with_attr("user_verified", flag(&self.verified))
                .with_attr("user_followers", count(&self.followers))
                .with_attr("reply_to_username", text(&self.reply_to_username)),
        )
    }
}

/// Parse every row of one export.
fn read_rows<R: Read>(reader: R, platform: Platform) -> Result<PartitionYield> {
    let mut csv = csv::ReaderBuilder::new().flexible(true).from_reader(reader);

    let headers = csv.headers()?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .filter(|(_, accepted)| !headers.iter().any(|h| accepted.contains(&h.trim())))
        .map(|(field, _)| *field)
        .collect();
    if !missing.is_empty() {
        return Err(AppError::validation(format!(
            "missing required columns: {}",
            missing.join(", ")
        )));
    }

    let mut output = PartitionYield::default();
    for (line, row) in csv.deserialize::<CsvRow>().enumerate() {
        let record = match row {
            Ok(row) => row.into_record(platform),
            Err(e) => {
                log::debug!("Row {} unreadable: {}", line + 2, e);
                None
            }
        };
        match record {
            Some(record) => output.records.push(record),
            None => output.skipped += 1,
        }
    }
    Ok(output)
}

fn read_file(path: &Path, platform: Platform) -> Result<PartitionYield> {
    let file = File::open(path)?;
    read_rows(file, platform)
}

/// Imports rows from exported CSV files.
pub struct CsvImportCollector {
    paths: Vec<PathBuf>,
    platform: Platform,
}

impl CsvImportCollector {
    pub fn new(paths: Vec<PathBuf>, platform: Platform) -> Self {
        Self { paths, platform }
    }

    pub fn from_config(config: &Config, paths: Vec<PathBuf>) -> Self {
        Self::new(paths, config.csv.platform)
    }

    async fn load(&self, path: &Path) -> Result<PartitionYield> {
        let path = path.to_path_buf();
        let platform = self.platform;
        tokio::task::spawn_blocking(move || read_file(&path, platform))
            .await
            .map_err(|e| AppError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Collector for CsvImportCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn collect(
        &self,
        query: &str,
        constraints: &Constraints,
        sink: Option<&dyn RecordSink>,
    ) -> Result<Collection> {
        let mut harvest = Harvest::new(SOURCE, self.platform, query, sink).keep_duplicates();

        for path in &self.paths {
            let partition = path.display().to_string();
            match self.load(path).await {
                Ok(mut output) => {
                    output.records.retain(|r| constraints.admits(&r.created_at));
                    if output.skipped > 0 {
                        output
                            .warnings
                            .push(format!("skipped {} unusable rows", output.skipped));
                    }
                    harvest.partition_done(&partition, output).await
                }
                Err(e) => harvest.partition_failed(&partition, &e),
            }
        }
        Ok(harvest.finish())
    }
}
