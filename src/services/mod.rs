// src/services/mod.rs

//! Source collectors.
//!
//! Each collector turns one upstream into a sequence of `UnifiedRecord`s:
//! - Reddit OAuth API (`RedditApiCollector`)
//! - Reddit search pages through a browser session (`RedditBrowserCollector`)
//! - HuggingFace model discussions (`HuggingFaceCollector`)
//! - Exported CSV files (`CsvImportCollector`)
//!
//! Collectors walk their partitions (subreddits, models, files) one at a
//! time. A failing partition is recorded in the `CollectionReport` and the
//! collector moves on; only configuration or authentication problems fail
//! the collector as a whole.

mod csv_import;
mod huggingface;
mod reddit_api;
mod reddit_browser;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{CollectionReport, Config, Platform, RunConfig, UnifiedRecord};
use crate::pipeline::retry::{RetryEvent, RetryPolicy};
use crate::pipeline::throttle::RateLimiter;
use crate::storage::RecordSink;

pub use csv_import::{CsvImportCollector, CsvRow};
pub use huggingface::{
    DiscussionDetail, DiscussionEvent, DiscussionPage, DiscussionSummary, HttpHubApi,
    HubApi, HubAuthor, HuggingFaceCollector, ModelSummary,
};
pub use reddit_api::{
    CommentData, CommentThing, HttpRedditApi, Listing, ListingData, PostData, RedditApi,
    RedditApiCollector, Replies, Thing,
};
pub use reddit_browser::{
    BrowserSession, CookieBundle, HttpSnapshotSession, PageState, RedditBrowserCollector,
    SearchItem, SearchPage, parse_search_items,
};

/// Collectors a fetch run can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    RedditApi,
    RedditBrowser,
    HuggingFace,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::RedditApi => "reddit-api",
            SourceKind::RedditBrowser => "reddit-browser",
            SourceKind::HuggingFace => "huggingface",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reddit-api" | "reddit" => Some(SourceKind::RedditApi),
            "reddit-browser" | "browser" => Some(SourceKind::RedditBrowser),
            "huggingface" | "hf" => Some(SourceKind::HuggingFace),
            _ => None,
        }
    }

    pub fn all() -> &'static [SourceKind] {
        &[
            SourceKind::RedditApi,
            SourceKind::RedditBrowser,
            SourceKind::HuggingFace,
        ]
    }

    pub fn platform(&self) -> Platform {
        match self {
            SourceKind::RedditApi | SourceKind::RedditBrowser => Platform::Reddit,
            SourceKind::HuggingFace => Platform::HuggingFace,
        }
    }

    /// Build the collector for this source from configuration.
    pub fn build(self, config: &Config) -> Result<Arc<dyn Collector>> {
        Ok(match self {
            SourceKind::RedditApi => Arc::new(RedditApiCollector::from_config(config)?),
            SourceKind::RedditBrowser => Arc::new(RedditBrowserCollector::from_config(config)?),
            SourceKind::HuggingFace => Arc::new(HuggingFaceCollector::from_config(config)?),
        })
    }

    /// Like `build`, but a setup failure becomes an `Unavailable` source
    /// so the run still reports it.
    pub fn setup(self, config: &Config) -> Source {
        match self.build(config) {
            Ok(collector) => Source::Ready(collector),
            Err(error) => Source::Unavailable {
                name: self.as_str().to_string(),
                platform: self.platform(),
                error,
            },
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A source enabled for a run.
pub enum Source {
    Ready(Arc<dyn Collector>),
    /// The collector could not be built; the run records it as failed.
    Unavailable {
        name: String,
        platform: Platform,
        error: AppError,
    },
}

impl Source {
    pub fn name(&self) -> &str {
        match self {
            Source::Ready(collector) => collector.name(),
            Source::Unavailable { name, .. } => name,
        }
    }
}

impl From<Arc<dyn Collector>> for Source {
    fn from(collector: Arc<dyn Collector>) -> Self {
        Source::Ready(collector)
    }
}

/// Limits applied to one `collect` call.
#[derive(Debug, Clone)]
pub struct Constraints {
    /// Drop items created before this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Cap on top-level hits per partition
    pub max_items_per_partition: Option<usize>,
    /// Fetch comments / discussion events under each hit
    pub expand_replies: bool,
    /// Max reply-thread expansions per hit; 0 means unlimited
    pub expansion_budget: usize,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            created_after: None,
            max_items_per_partition: None,
            expand_replies: true,
            expansion_budget: 0,
        }
    }
}

impl Constraints {
    /// Constraints for a run configured by `run`, evaluated at `now`.
    pub fn from_run(run: &RunConfig, expansion_budget: usize, now: DateTime<Utc>) -> Self {
        Self {
            created_after: run.created_after(now),
            max_items_per_partition: run.max_items_per_partition,
            expand_replies: run.expand_replies,
            expansion_budget,
        }
    }

    /// Whether an item created at `created_at` falls inside the time window.
    pub fn admits(&self, created_at: &DateTime<Utc>) -> bool {
        self.created_after.is_none_or(|after| *created_at >= after)
    }

    /// Whether `used` expansions leave room for another.
    pub fn may_expand(&self, used: usize) -> bool {
        self.expansion_budget == 0 || used < self.expansion_budget
    }
}

/// Records and report produced by one `collect` call.
#[derive(Debug, Clone)]
pub struct Collection {
    pub records: Vec<UnifiedRecord>,
    pub report: CollectionReport,
}

/// A platform-specific producer of unified records.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable name used in reports and the `source` column.
    fn name(&self) -> &str;

    fn platform(&self) -> Platform;

    /// Collect records matching `query`.
    ///
    /// With a `sink`, each partition is upserted as soon as it completes.
    /// An `Err` means the collector could not run at all; partition-level
    /// failures are reported in the returned `CollectionReport`.
    async fn collect(
        &self,
        query: &str,
        constraints: &Constraints,
        sink: Option<&dyn RecordSink>,
    ) -> Result<Collection>;
}

/// What one partition produced before it finished.
#[derive(Debug, Default)]
pub(crate) struct PartitionYield {
    pub records: Vec<UnifiedRecord>,
    pub warnings: Vec<String>,
    pub skipped: usize,
}

/// Accumulates partition results into a `Collection`.
pub(crate) struct Harvest<'a> {
    query: &'a str,
    sink: Option<&'a dyn RecordSink>,
    dedupe: bool,
    seen: HashSet<String>,
    records: Vec<UnifiedRecord>,
    report: CollectionReport,
}

impl<'a> Harvest<'a> {
    pub fn new(
        source: &str,
        platform: Platform,
        query: &'a str,
        sink: Option<&'a dyn RecordSink>,
    ) -> Self {
        Self {
            query,
            sink,
            dedupe: true,
            seen: HashSet::new(),
            records: Vec::new(),
            report: CollectionReport::new(source, platform),
        }
    }

    /// Keep records that repeat a key already seen in this run.
    pub fn keep_duplicates(mut self) -> Self {
        self.dedupe = false;
        self
    }

    /// Tag, deduplicate and (in auto-persist mode) store a finished partition.
    pub async fn partition_done(&mut self, partition: &str, output: PartitionYield) {
        let mut fresh = Vec::with_capacity(output.records.len());
        for record in output.records {
            if !self.dedupe || self.seen.insert(record.composite_key()) {
                fresh.push(record.with_tag(self.query));
            }
        }

        self.report.skipped_records += output.skipped;
        for warning in output.warnings {
            log::warn!("[{}] {}: {}", self.report.source, partition, warning);
            self.report.warn(format!("{partition}: {warning}"));
        }

        if let Some(sink) = self.sink.filter(|_| !fresh.is_empty()) {
            let persisted = sink.upsert(&fresh, &self.report.source).await;
            match persisted {
                Ok(upsert) => self.report.add_persisted(upsert),
                Err(e) => {
                    let error = AppError::Task(format!("persisting partition failed: {e}"));
                    self.partition_failed(partition, &error);
                    self.records.extend(fresh);
                    return;
                }
            }
        }

        log::info!(
            "[{}] {}: {} records",
            self.report.source,
            partition,
            fresh.len()
        );
        self.report.partition_ok(fresh.len());
        self.records.extend(fresh);
    }

    pub fn partition_failed(&mut self, partition: &str, error: &AppError) {
        log::warn!(
            "[{}] partition {} failed: {}",
            self.report.source,
            partition,
            error
        );
        self.report.partition_failed(partition, error);
    }

    pub fn finish(self) -> Collection {
        log::info!(
            "[{}] collected {} records from {}/{} partitions",
            self.report.source,
            self.records.len(),
            self.report.partitions_succeeded,
            self.report.partitions_attempted
        );
        Collection {
            records: self.records,
            report: self.report,
        }
    }
}

/// Log a retry event on behalf of a collector.
pub(crate) fn log_retry(context: &str, event: RetryEvent<'_>) {
    match event {
        RetryEvent::Retrying {
            attempt,
            delay,
            error,
        } => log::warn!(
            "{context}: attempt {attempt} failed ({error}), retrying in {}ms",
            delay.as_millis()
        ),
        RetryEvent::CoolingDown { cooldown, error } => log::warn!(
            "{context}: rate limited ({error}), cooling down for {}s",
            cooldown.as_secs()
        ),
        RetryEvent::Recovered { attempts } => {
            log::info!("{context}: succeeded after {attempts} attempts")
        }
        RetryEvent::GaveUp {
            attempts,
            retryable: true,
            error,
        } => log::error!("{context}: giving up after {attempts} attempts: {error}"),
        RetryEvent::GaveUp { error, .. } => log::debug!("{context}: not retrying: {error}"),
    }
}

/// Run `op` under the platform's rate limiter and retry policy.
pub(crate) async fn throttled<T, F, Fut>(
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    context: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy
        .retry(
            || {
                let call = op();
                async move {
                    limiter.acquire().await;
                    call.await
                }
            },
            |event| log_retry(context, event),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentKind, UpsertReport};
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct MemorySink {
        batches: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn upsert(&self, records: &[UnifiedRecord], _source: &str) -> Result<UpsertReport> {
            if self.fail {
                return Err(AppError::Task("disk full".into()));
            }
            self.batches.lock().unwrap().push(records.len());
            Ok(UpsertReport {
                inserted: records.len(),
                ..UpsertReport::default()
            })
        }
    }

    fn record(id: &str) -> UnifiedRecord {
        UnifiedRecord::new(
            Platform::Reddit,
            id,
            ContentKind::Post,
            "body",
            "https://reddit.com",
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn output(ids: &[&str]) -> PartitionYield {
        PartitionYield {
            records: ids.iter().map(|id| record(id)).collect(),
            ..PartitionYield::default()
        }
    }

    #[test]
    fn test_source_kind_names() {
        for kind in SourceKind::all() {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(*kind));
        }
        assert_eq!(SourceKind::parse("HF"), Some(SourceKind::HuggingFace));
        assert_eq!(SourceKind::parse("twitter"), None);
        assert_eq!(SourceKind::RedditBrowser.platform(), Platform::Reddit);
    }

    #[test]
    fn test_setup_builds_ready_source() {
        let source = SourceKind::HuggingFace.setup(&Config::default());
        assert!(matches!(source, Source::Ready(_)));
        assert_eq!(source.name(), "huggingface");
    }

    #[test]
    fn test_constraints_window_and_budget() {
        let constraints = Constraints {
            created_after: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            expansion_budget: 2,
            ..Constraints::default()
        };
        assert!(constraints.admits(&Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        assert!(!constraints.admits(&Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()));
        assert!(constraints.may_expand(1));
        assert!(!constraints.may_expand(2));
        assert!(Constraints::default().may_expand(1_000));
    }

    #[tokio::test]
    async fn test_harvest_tags_and_deduplicates() {
        let mut harvest = Harvest::new("reddit-api", Platform::Reddit, "ERNIE", None);
        harvest.partition_done("LocalLLM", output(&["a", "b"])).await;
        harvest.partition_done("ChatGPT", output(&["b", "c"])).await;
        let collection = harvest.finish();

        assert_eq!(collection.records.len(), 3);
        assert!(collection.records.iter().all(|r| r.search_tags.contains("ERNIE")));
        assert_eq!(collection.report.partitions_succeeded, 2);
    }

    #[tokio::test]
    async fn test_harvest_persists_each_partition() {
        let sink = MemorySink {
            batches: Mutex::new(Vec::new()),
            fail: false,
        };
        let mut harvest = Harvest::new("reddit-api", Platform::Reddit, "ERNIE", Some(&sink));
        harvest.partition_done("one", output(&["a", "b"])).await;
        harvest.partition_done("two", output(&["c"])).await;
        let collection = harvest.finish();

        assert_eq!(*sink.batches.lock().unwrap(), vec![2, 1]);
        assert_eq!(collection.report.persisted.map(|p| p.inserted), Some(3));
    }

    #[tokio::test]
    async fn test_harvest_records_persist_failure_as_partition_error() {
        let sink = MemorySink {
            batches: Mutex::new(Vec::new()),
            fail: true,
        };
        let mut harvest = Harvest::new("reddit-api", Platform::Reddit, "ERNIE", Some(&sink));
        harvest.partition_done("one", output(&["a"])).await;
        let collection = harvest.finish();

        assert!(collection.report.partition_errors.contains_key("one"));
        assert_eq!(collection.records.len(), 1);
    }
}
