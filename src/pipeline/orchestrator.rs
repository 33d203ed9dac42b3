// src/pipeline/orchestrator.rs

//! Collection run orchestration.
//!
//! A run walks the enabled collectors one after another on a background
//! task and persists what they produce. Progress is exposed as a
//! `RunStatus` snapshot that can be polled while the run is in flight.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::models::{RunState, RunStatus, SourceOutcome, SourceStatus, UpsertReport};
use crate::services::{Collector, Constraints, Source};
use crate::storage::RecordSink;

/// Runs collectors and tracks the state of the current run.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn RecordSink>,
    auto_persist: bool,
    status: Arc<Mutex<RunStatus>>,
}

impl Orchestrator {
    /// With `auto_persist` collectors upsert each partition as it completes;
    /// otherwise the orchestrator upserts each collector's records at the end.
    pub fn new(store: Arc<dyn RecordSink>, auto_persist: bool) -> Self {
        Self {
            store,
            auto_persist,
            status: Arc::new(Mutex::new(RunStatus::default())),
        }
    }

    /// Snapshot of the current (or last finished) run.
    pub fn status(&self) -> RunStatus {
        lock(&self.status).clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.status).state == RunState::Running
    }

    /// Start a run in the background.
    ///
    /// Fails with `RunInProgress` while another run is `Running`; runs are
    /// never queued. `Unavailable` sources are reported as failed outcomes.
    pub fn start<S: Into<Source>>(
        &self,
        query: &str,
        constraints: Constraints,
        sources: Vec<S>,
    ) -> Result<JoinHandle<RunStatus>> {
        if sources.is_empty() {
            return Err(AppError::config("no sources enabled for this run"));
        }

        {
            let mut status = lock(&self.status);
            if status.state == RunState::Running {
                return Err(AppError::RunInProgress);
            }
            *status = RunStatus {
                state: RunState::Running,
                query: Some(query.to_string()),
                started_at: Some(Utc::now()),
                ..RunStatus::default()
            };
        }

        let run = Run {
            store: Arc::clone(&self.store),
            auto_persist: self.auto_persist,
            status: Arc::clone(&self.status),
            query: query.to_string(),
            constraints,
            sources: sources.into_iter().map(Into::into).collect(),
        };
        let status = Arc::clone(&self.status);

        Ok(tokio::spawn(async move {
            match AssertUnwindSafe(run.execute()).catch_unwind().await {
                Ok(final_status) => final_status,
                Err(_) => {
                    log::error!("Collection run panicked");
                    let mut status = lock(&status);
                    status.state = RunState::Failed;
                    status.finished_at = Some(Utc::now());
                    status.error = Some("collection run panicked".to_string());
                    status.clone()
                }
            }
        }))
    }

    /// Start a run and wait for it to finish.
    pub async fn run<S: Into<Source>>(
        &self,
        query: &str,
        constraints: Constraints,
        sources: Vec<S>,
    ) -> Result<RunStatus> {
        let handle = self.start(query, constraints, sources)?;
        handle.await.map_err(|e| AppError::Task(e.to_string()))
    }
}

fn lock(status: &Mutex<RunStatus>) -> MutexGuard<'_, RunStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one background run owns.
struct Run {
    store: Arc<dyn RecordSink>,
    auto_persist: bool,
    status: Arc<Mutex<RunStatus>>,
    query: String,
    constraints: Constraints,
    sources: Vec<Source>,
}

impl Run {
    fn milestone(&self, message: String) {
        log::info!("{}", message);
        lock(&self.status).progress.push(message);
    }

    async fn execute(mut self) -> RunStatus {
        let sources = std::mem::take(&mut self.sources);
        let total = sources.len();
        self.milestone(format!(
            "Run started for '{}' with {} sources",
            self.query, total
        ));

        for (index, source) in sources.into_iter().enumerate() {
            self.milestone(format!(
                "[{}/{}] Collecting from {}",
                index + 1,
                total,
                source.name()
            ));
            let outcome = match source {
                Source::Ready(collector) => self.collect_one(collector.as_ref()).await,
                Source::Unavailable {
                    name,
                    platform,
                    error,
                } => {
                    log::error!("{} could not be set up: {}", name, error);
                    SourceOutcome::failed(&name, platform, &error)
                }
            };
            self.milestone(describe(&outcome));
            lock(&self.status).sources.push(outcome);
        }

        let mut status = lock(&self.status);
        let failed = status
            .sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
            .count();
        let persisted = status.persisted();

        status.finished_at = Some(Utc::now());
        let summary = if failed == total {
            status.state = RunState::Failed;
            status.error = Some(format!("all {total} sources failed"));
            format!("Run failed: all {total} sources failed")
        } else {
            status.state = RunState::Completed;
            format!(
                "Run completed: {} inserted, {} updated ({} changed), {}/{} sources failed",
                persisted.inserted, persisted.updated, persisted.changed, failed, total
            )
        };
        log::info!("{}", summary);
        status.progress.push(summary);
        status.clone()
    }

    async fn collect_one(&self, collector: &dyn Collector) -> SourceOutcome {
        let sink = if self.auto_persist {
            Some(self.store.as_ref())
        } else {
            None
        };

        let collection = match collector.collect(&self.query, &self.constraints, sink).await {
            Ok(collection) => collection,
            Err(e) => {
                log::error!("{} failed: {}", collector.name(), e);
                return SourceOutcome::failed(collector.name(), collector.platform(), &e);
            }
        };

        if self.auto_persist {
            let persisted = collection.report.persisted.unwrap_or_default();
            return SourceOutcome::from_report(collection.report, persisted);
        }

        if collection.records.is_empty() {
            return SourceOutcome::from_report(collection.report, UpsertReport::default());
        }
        match self.store.upsert(&collection.records, collector.name()).await {
            Ok(persisted) => SourceOutcome::from_report(collection.report, persisted),
            Err(e) => {
                log::error!("Persisting {} records failed: {}", collector.name(), e);
                let mut outcome =
                    SourceOutcome::from_report(collection.report, UpsertReport::default());
                outcome.status = SourceStatus::Failed;
                outcome.error = Some(e.summary());
                outcome
            }
        }
    }
}

fn describe(outcome: &SourceOutcome) -> String {
    match (&outcome.status, &outcome.error) {
        (SourceStatus::Failed, Some(error)) => format!("{} failed: {}", outcome.source, error),
        (status, _) => {
            let partitions = outcome.report.as_ref().map_or(String::new(), |r| {
                format!(
                    ", {}/{} partitions ok",
                    r.partitions_succeeded, r.partitions_attempted
                )
            });
            format!(
                "{} {:?}: {} records, {} inserted, {} updated{}",
                outcome.source,
                status,
                outcome.records_collected(),
                outcome.persisted.inserted,
                outcome.persisted.updated,
                partitions
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionReport, ContentKind, Platform, UnifiedRecord};
    use crate::services::Collection;
    use crate::storage::{RecordQuery, SqliteStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    enum Behavior {
        Records(Vec<&'static str>),
        Fail,
        Panic,
    }

    struct FakeCollector {
        name: &'static str,
        behavior: Behavior,
        gate: Option<Arc<Notify>>,
    }

    impl FakeCollector {
        fn records(name: &'static str, ids: Vec<&'static str>) -> Arc<dyn Collector> {
            Arc::new(Self {
                name,
                behavior: Behavior::Records(ids),
                gate: None,
            })
        }

        fn failing(name: &'static str) -> Arc<dyn Collector> {
            Arc::new(Self {
                name,
                behavior: Behavior::Fail,
                gate: None,
            })
        }
    }

    fn record(id: &str) -> UnifiedRecord {
        UnifiedRecord::new(
            Platform::Reddit,
            id,
            ContentKind::Post,
            "body",
            "https://www.reddit.com",
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[async_trait]
    impl Collector for FakeCollector {
        fn name(&self) -> &str {
            self.name
        }

        fn platform(&self) -> Platform {
            Platform::Reddit
        }

        async fn collect(
            &self,
            query: &str,
            _constraints: &Constraints,
            sink: Option<&dyn RecordSink>,
        ) -> Result<Collection> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let ids = match &self.behavior {
                Behavior::Records(ids) => ids,
                Behavior::Fail => return Err(AppError::auth("reddit", "invalid_grant")),
                Behavior::Panic => panic!("collector bug"),
            };

            let records: Vec<UnifiedRecord> =
                ids.iter().map(|id| record(id).with_tag(query)).collect();
            let mut report = CollectionReport::new(self.name, Platform::Reddit);
            report.partition_ok(records.len());
            if let Some(sink) = sink {
                report.add_persisted(sink.upsert(&records, self.name).await?);
            }
            Ok(Collection { records, report })
        }
    }

    fn store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(dir.path().join("runs.db")).unwrap()
    }

    #[tokio::test]
    async fn test_run_persists_and_completes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), false);

        let status = orchestrator
            .run(
                "ERNIE",
                Constraints::default(),
                vec![
                    FakeCollector::records("reddit-api", vec!["a", "b"]),
                    FakeCollector::records("reddit-browser", vec!["b", "c"]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.sources.len(), 2);
        assert_eq!(status.persisted().inserted, 3);
        assert_eq!(status.persisted().updated, 1);
        assert_eq!(store.count(&RecordQuery::all()).unwrap(), 3);
        assert!(status.progress[0].starts_with("Run started for 'ERNIE'"));
        assert!(status.finished_at.is_some());
        assert_eq!(orchestrator.status().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);
        let collectors = || vec![FakeCollector::records("reddit-api", vec!["a", "b", "c"])];

        let first = orchestrator
            .run("ERNIE", Constraints::default(), collectors())
            .await
            .unwrap();
        let second = orchestrator
            .run("ERNIE", Constraints::default(), collectors())
            .await
            .unwrap();

        assert_eq!(first.persisted().inserted, 3);
        assert_eq!(second.persisted().inserted, 0);
        assert_eq!(second.persisted().updated, 3);
        assert_eq!(second.persisted().changed, 0);
    }

    #[tokio::test]
    async fn test_auto_persist_uses_collector_totals() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let orchestrator = Orchestrator::new(Arc::new(store.clone()), true);

        let status = orchestrator
            .run(
                "ERNIE",
                Constraints::default(),
                vec![FakeCollector::records("reddit-api", vec!["a", "b"])],
            )
            .await
            .unwrap();

        assert_eq!(status.persisted().inserted, 2);
        assert_eq!(store.count(&RecordQuery::all()).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_single_source_failure_degrades_only_that_source() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);

        let status = orchestrator
            .run(
                "ERNIE",
                Constraints::default(),
                vec![
                    FakeCollector::failing("reddit-api"),
                    FakeCollector::records("huggingface", vec!["x"]),
                ],
            )
            .await
            .unwrap();

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.sources[0].status, SourceStatus::Failed);
        assert!(status.sources[0].error.as_deref().unwrap().contains("invalid_grant"));
        assert_eq!(status.sources[1].status, SourceStatus::Ok);
    }

    #[tokio::test]
    async fn test_all_sources_failing_fails_run() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);

        let status = orchestrator
            .run(
                "ERNIE",
                Constraints::default(),
                vec![
                    FakeCollector::failing("reddit-api"),
                    FakeCollector::failing("huggingface"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error.as_deref(), Some("all 2 sources failed"));
    }

    fn unavailable(name: &str, platform: Platform) -> Source {
        Source::Unavailable {
            name: name.to_string(),
            platform,
            error: AppError::config("client could not be built"),
        }
    }

    #[tokio::test]
    async fn test_unavailable_source_is_reported() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);

        let status = orchestrator
            .run(
                "ERNIE",
                Constraints::default(),
                vec![
                    unavailable("reddit-browser", Platform::Reddit),
                    Source::from(FakeCollector::records("huggingface", vec!["x"])),
                ],
            )
            .await
            .unwrap();

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.sources.len(), 2);
        assert_eq!(status.sources[0].source, "reddit-browser");
        assert_eq!(status.sources[0].status, SourceStatus::Failed);
        assert!(status.sources[0].error.as_deref().unwrap().contains("could not be built"));
        assert_eq!(status.sources[0].records_collected(), 0);
        assert_eq!(status.sources[1].status, SourceStatus::Ok);
    }

    #[tokio::test]
    async fn test_all_sources_unavailable_fails_run() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);

        let status = orchestrator
            .run(
                "ERNIE",
                Constraints::default(),
                vec![
                    unavailable("reddit-api", Platform::Reddit),
                    unavailable("huggingface", Platform::HuggingFace),
                ],
            )
            .await
            .unwrap();

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.sources.len(), 2);
        assert_eq!(status.error.as_deref(), Some("all 2 sources failed"));
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);
        let gate = Arc::new(Notify::new());
        let blocked: Arc<dyn Collector> = Arc::new(FakeCollector {
            name: "reddit-api",
            behavior: Behavior::Records(vec!["a"]),
            gate: Some(Arc::clone(&gate)),
        });

        let handle = orchestrator
            .start("ERNIE", Constraints::default(), vec![blocked])
            .unwrap();
        assert!(orchestrator.is_running());

        let second = orchestrator.start(
            "GPT",
            Constraints::default(),
            vec![FakeCollector::records("huggingface", vec!["b"])],
        );
        assert!(matches!(second, Err(AppError::RunInProgress)));

        gate.notify_one();
        let status = handle.await.unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.query.as_deref(), Some("ERNIE"));

        let third = orchestrator
            .run(
                "GPT",
                Constraints::default(),
                vec![FakeCollector::records("huggingface", vec!["b"])],
            )
            .await
            .unwrap();
        assert_eq!(third.query.as_deref(), Some("GPT"));
    }

    #[tokio::test]
    async fn test_empty_source_list_is_rejected() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);
        let result = orchestrator.start("ERNIE", Constraints::default(), Vec::<Source>::new());
        assert!(matches!(result, Err(AppError::Config(_))));
        assert_eq!(orchestrator.status().state, RunState::Idle);
    }

    #[tokio::test]
    async fn test_panicking_collector_leaves_run_failed() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(Arc::new(store(&dir)), false);
        let panicking: Arc<dyn Collector> = Arc::new(FakeCollector {
            name: "reddit-api",
            behavior: Behavior::Panic,
            gate: None,
        });

        let status = orchestrator
            .run("ERNIE", Constraints::default(), vec![panicking])
            .await
            .unwrap();
        assert_eq!(status.state, RunState::Failed);
        assert!(!orchestrator.is_running());
    }
}
