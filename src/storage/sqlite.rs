// src/storage/sqlite.rs

//! SQLite-backed record store.
//!
//! A single writer connection sits behind a mutex and applies one
//! `BEGIN IMMEDIATE` transaction per record. Readers open their own
//! connections; WAL mode keeps them off the writer's lock.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params, params_from_iter,
};

use crate::error::{AppError, Result};
use crate::models::{
    ContentKind, Platform, UnifiedRecord, UpsertReport, composite_key as make_key,
};
use crate::storage::{
    AuthorStat, DedupeReport, GroupBy, GroupCount, RecordQuery, RecordSink, SortOrder, ThreadStat,
};
use crate::utils::time::{from_storage, to_storage};

const SCHEMA: &str = r#"
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;

    CREATE TABLE IF NOT EXISTS records (
        composite_key          TEXT PRIMARY KEY,
        platform               TEXT NOT NULL,
        native_id              TEXT NOT NULL,
        content_kind           TEXT NOT NULL,
        title                  TEXT,
        body                   TEXT NOT NULL,
        author                 TEXT,
        url                    TEXT NOT NULL,
        created_at             TEXT NOT NULL,
        created_at_approximate INTEGER NOT NULL DEFAULT 0,
        fetched_at             TEXT NOT NULL,
        parent_native_id       TEXT,
        extra                  TEXT NOT NULL DEFAULT '{}',
        content_hash           TEXT NOT NULL,
        source                 TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_records_platform   ON records (platform, content_kind);
    CREATE INDEX IF NOT EXISTS idx_records_fetched    ON records (fetched_at DESC);
    CREATE INDEX IF NOT EXISTS idx_records_created    ON records (created_at);
    CREATE INDEX IF NOT EXISTS idx_records_author     ON records (author);
    CREATE INDEX IF NOT EXISTS idx_records_parent     ON records (platform, parent_native_id);

    CREATE TABLE IF NOT EXISTS record_tags (
        composite_key TEXT NOT NULL,
        tag           TEXT NOT NULL,
        PRIMARY KEY (composite_key, tag)
    );
    CREATE INDEX IF NOT EXISTS idx_record_tags_tag ON record_tags (tag);
"#;

const RECORD_COLUMNS: &str = "r.platform, r.native_id, r.content_kind, r.title, r.body, \
     r.author, r.url, r.created_at, r.created_at_approximate, r.fetched_at, \
     r.parent_native_id, r.extra, \
     (SELECT group_concat(t.tag, char(31)) FROM record_tags t \
      WHERE t.composite_key = r.composite_key) AS tags";

const TAG_SEPARATOR: char = '\u{1f}';
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single-record upsert.
enum Outcome {
    Inserted,
    Updated { changed: bool },
}

/// One stored row inside a dedupe group.
struct DedupeMember {
    key: String,
    native_id: String,
    /// Platform column as stored, possibly not canonical
    platform: String,
}

/// Handle to the record database; cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        log::debug!("Opened record store at {}", path.display());

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(conn),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .writer
            .lock()
            .map_err(|_| AppError::Task("record store writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<Connection> {
        let conn = Connection::open(&self.inner.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    // --- Writes ---

    /// Insert or merge each record in its own transaction.
    pub fn upsert_many(&self, records: &[UnifiedRecord], source: &str) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        let mut conn = self.writer()?;

        for record in records {
            if record.native_id.trim().is_empty() {
                log::warn!("Skipping {} record with blank native id", record.platform);
                report.skipped += 1;
                continue;
            }

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = upsert_one(&tx, record, source, Utc::now())?;
            tx.commit()?;

            match outcome {
                Outcome::Inserted => report.inserted += 1,
                Outcome::Updated { changed } => {
                    report.updated += 1;
                    if changed {
                        report.changed += 1;
                    }
                }
            }
        }

        log::debug!(
            "Upserted {} records from {}: {} inserted, {} updated ({} changed)",
            records.len(),
            source,
            report.inserted,
            report.updated,
            report.changed
        );
        Ok(report)
    }

    /// Collapse rows that name the same platform + native id under different keys.
    ///
    /// The row with the latest `fetched_at` survives, inherits every tag of the
    /// group, and is rewritten to the canonical key.
    pub fn dedupe(&self) -> Result<DedupeReport> {
        let mut conn = self.writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut report = DedupeReport::default();

        let rows: Vec<(String, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT composite_key, platform, native_id FROM records
                 ORDER BY fetched_at DESC, composite_key",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        // Members stay in fetched_at order, so the first one is the keeper.
        let mut groups: BTreeMap<(Platform, String), Vec<DedupeMember>> = BTreeMap::new();
        let mut unknown = BTreeSet::new();
        for (key, platform, native_id) in rows {
            let Some(parsed) = Platform::parse(&platform) else {
                unknown.insert(platform);
                continue;
            };
            groups
                .entry((parsed, native_id.trim().to_string()))
                .or_default()
                .push(DedupeMember {
                    key,
                    native_id,
                    platform,
                });
        }
        for platform in unknown {
            log::warn!("Dedupe skipped rows with unknown platform '{platform}'");
        }

        for ((platform, native_id), members) in groups {
            let canonical = make_key(platform, &native_id);
            let Some((keeper, others)) = members.split_first() else {
                continue;
            };
            let keeper_is_canonical = keeper.key == canonical
                && keeper.native_id == native_id
                && keeper.platform == platform.as_str();
            if others.is_empty() && keeper_is_canonical {
                continue;
            }
            report.groups += 1;

            let mut tags = BTreeSet::new();
            for member in &members {
                tags.extend(tags_for(&tx, &member.key)?);
            }

            for member in others {
                tx.execute(
                    "DELETE FROM record_tags WHERE composite_key = ?1",
                    [&member.key],
                )?;
                tx.execute("DELETE FROM records WHERE composite_key = ?1", [&member.key])?;
                report.removed += 1;
            }

            if !keeper_is_canonical {
                tx.execute(
                    "DELETE FROM record_tags WHERE composite_key = ?1",
                    [&keeper.key],
                )?;
                tx.execute(
                    "UPDATE records SET composite_key = ?1, native_id = ?2, platform = ?3
                     WHERE composite_key = ?4",
                    params![canonical, native_id, platform.as_str(), keeper.key],
                )?;
                report.rekeyed += 1;
            }

            insert_tags(&tx, &canonical, &tags)?;
        }

        tx.commit()?;
        if report.groups > 0 {
            log::info!(
                "Dedupe collapsed {} groups ({} rows removed, {} rekeyed)",
                report.groups,
                report.removed,
                report.rekeyed
            );
        }
        Ok(report)
    }

    // --- Reads ---

    /// Fetch a single record by composite key.
    pub fn get(&self, key: &str) -> Result<Option<UnifiedRecord>> {
        let conn = self.reader()?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM records r WHERE r.composite_key = ?1");
        let record = conn.query_row(&sql, [key], row_to_record).optional()?;
        Ok(record)
    }

    /// Browse records matching `query`.
    pub fn query(&self, query: &RecordQuery) -> Result<Vec<UnifiedRecord>> {
        let conn = self.reader()?;
        let mut filter = Filter::from_query(query);
        let where_sql = filter.where_sql();
        let page_sql = filter.page_sql(query);
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM records r{where_sql} ORDER BY {} {page_sql}",
            order_sql(query.order)
        );

        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(filter.args.iter()), row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Count records matching `query` (paging is ignored).
    pub fn count(&self, query: &RecordQuery) -> Result<usize> {
        let conn = self.reader()?;
        let filter = Filter::from_query(query);
        let sql = format!("SELECT COUNT(*) FROM records r{}", filter.where_sql());
        let count: i64 = conn.query_row(&sql, params_from_iter(filter.args.iter()), |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    /// Count records matching `query`, grouped into buckets.
    pub fn count_by(&self, query: &RecordQuery, group: GroupBy) -> Result<Vec<GroupCount>> {
        let conn = self.reader()?;
        let filter = Filter::from_query(query);
        let (bucket, order) = match group {
            GroupBy::Platform => ("r.platform", "COUNT(*) DESC, bucket"),
            GroupBy::ContentKind => ("r.content_kind", "COUNT(*) DESC, bucket"),
            GroupBy::Day => ("substr(r.created_at, 1, 10)", "bucket"),
            GroupBy::Week => ("strftime('%Y-W%W', r.created_at)", "bucket"),
            GroupBy::Month => ("substr(r.created_at, 1, 7)", "bucket"),
        };
        let sql = format!(
            "SELECT {bucket} AS bucket, COUNT(*) FROM records r{} GROUP BY bucket ORDER BY {order}",
            filter.where_sql()
        );

        let mut stmt = conn.prepare(&sql)?;
        let counts = stmt
            .query_map(params_from_iter(filter.args.iter()), |row| {
                Ok(GroupCount {
                    key: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    count: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Most active authors, skipping anonymous rows and `excluded` handles.
    pub fn top_authors(
        &self,
        limit: usize,
        excluded: &[String],
        platform: Option<Platform>,
    ) -> Result<Vec<AuthorStat>> {
        let conn = self.reader()?;
        let mut clauses = vec!["author IS NOT NULL".to_string()];
        let mut args: Vec<Value> = Vec::new();

        if !excluded.is_empty() {
            let marks = vec!["?"; excluded.len()].join(", ");
            clauses.push(format!("author NOT IN ({marks})"));
            args.extend(excluded.iter().map(|a| Value::Text(a.clone())));
        }
        if let Some(platform) = platform {
            clauses.push("platform = ?".to_string());
            args.push(Value::Text(platform.as_str().to_string()));
        }
        args.push(Value::Integer(limit as i64));

        let sql = format!(
            "SELECT author, platform, COUNT(*) AS n, MAX(created_at) FROM records
             WHERE {} GROUP BY author, platform ORDER BY n DESC, author LIMIT ?",
            clauses.join(" AND ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let stats = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(AuthorStat {
                    author: row.get(0)?,
                    platform: platform_column(row, 1)?,
                    records: row.get::<_, i64>(2)? as usize,
                    last_created_at: time_column(row, 3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Every tag with the number of records carrying it.
    pub fn distinct_tags(&self) -> Result<Vec<GroupCount>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT tag, COUNT(*) FROM record_tags GROUP BY tag ORDER BY COUNT(*) DESC, tag",
        )?;
        let tags = stmt
            .query_map([], |row| {
                Ok(GroupCount {
                    key: row.get(0)?,
                    count: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    /// Posts and discussions matching `query`, with stored reply counts.
    pub fn thread_stats(&self, query: &RecordQuery) -> Result<Vec<ThreadStat>> {
        if query.content_kind.is_some_and(|kind| !kind.is_thread_root()) {
            return Ok(Vec::new());
        }
        let conn = self.reader()?;
        let mut filter = Filter::from_query(query);
        if query.content_kind.is_none() {
            let roots: Vec<String> = ContentKind::all()
                .iter()
                .filter(|kind| kind.is_thread_root())
                .map(|kind| format!("'{}'", kind.as_str()))
                .collect();
            filter.push_clause(format!("r.content_kind IN ({})", roots.join(", ")));
        }

        let where_sql = filter.where_sql();
        let page_sql = filter.page_sql(query);
        let sql = format!(
            "SELECT {RECORD_COLUMNS},
                (SELECT COUNT(*) FROM records c
                 WHERE c.platform = r.platform AND c.parent_native_id = r.native_id),
                (SELECT MAX(c.created_at) FROM records c
                 WHERE c.platform = r.platform AND c.parent_native_id = r.native_id)
             FROM records r{where_sql} ORDER BY {} {page_sql}",
            order_sql(query.order)
        );

        let mut stmt = conn.prepare(&sql)?;
        let stats = stmt
            .query_map(params_from_iter(filter.args.iter()), |row| {
                let latest: Option<String> = row.get(14)?;
                Ok(ThreadStat {
                    record: row_to_record(row)?,
                    reply_count: row.get::<_, i64>(13)? as usize,
                    latest_reply_at: latest.as_deref().and_then(from_storage),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(stats)
    }
}

#[async_trait]
impl RecordSink for SqliteStore {
    async fn upsert(&self, records: &[UnifiedRecord], source: &str) -> Result<UpsertReport> {
        let store = self.clone();
        let records = records.to_vec();
        let source = source.to_string();
        tokio::task::spawn_blocking(move || store.upsert_many(&records, &source))
            .await
            .map_err(|e| AppError::Task(format!("upsert task failed: {e}")))?
    }
}

fn upsert_one(
    tx: &Transaction<'_>,
    record: &UnifiedRecord,
    source: &str,
    now: DateTime<Utc>,
) -> Result<Outcome> {
    let key = record.composite_key();
    let hash = record.content_hash();
    let extra = serde_json::to_string(&record.extra)?;
    let fetched_at = to_storage(&now);

    let previous_hash: Option<String> = tx
        .query_row(
            "SELECT content_hash FROM records WHERE composite_key = ?1",
            [&key],
            |row| row.get(0),
        )
        .optional()?;

    let outcome = match previous_hash {
        None => {
            tx.execute(
                "INSERT INTO records (
                    composite_key, platform, native_id, content_kind, title, body, author,
                    url, created_at, created_at_approximate, fetched_at, parent_native_id,
                    extra, content_hash, source
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    key,
                    record.platform.as_str(),
                    record.native_id.trim(),
                    record.content_kind.as_str(),
                    record.title,
                    record.body,
                    record.author,
                    record.url,
                    to_storage(&record.created_at),
                    record.created_at_approximate,
                    fetched_at,
                    record.parent_native_id,
                    extra,
                    hash,
                    source,
                ],
            )?;
            Outcome::Inserted
        }
        Some(previous) => {
            // created_at is deliberately absent: it is written once on insert.
            tx.execute(
                "UPDATE records SET
                    content_kind = ?2, title = ?3, body = ?4, author = ?5, url = ?6,
                    fetched_at = MAX(fetched_at, ?7), parent_native_id = ?8,
                    extra = ?9, content_hash = ?10, source = ?11
                 WHERE composite_key = ?1",
                params![
                    key,
                    record.content_kind.as_str(),
                    record.title,
                    record.body,
                    record.author,
                    record.url,
                    fetched_at,
                    record.parent_native_id,
                    extra,
                    hash,
                    source,
                ],
            )?;
            Outcome::Updated {
                changed: previous != hash,
            }
        }
    };

    insert_tags(tx, &key, &record.search_tags)?;
    Ok(outcome)
}

fn insert_tags(tx: &Transaction<'_>, key: &str, tags: &BTreeSet<String>) -> Result<()> {
    let mut stmt =
        tx.prepare_cached("INSERT OR IGNORE INTO record_tags (composite_key, tag) VALUES (?1, ?2)")?;
    for tag in tags {
        stmt.execute(params![key, tag])?;
    }
    Ok(())
}

fn tags_for(tx: &Transaction<'_>, key: &str) -> Result<Vec<String>> {
    let mut stmt = tx.prepare_cached("SELECT tag FROM record_tags WHERE composite_key = ?1")?;
    let tags = stmt
        .query_map([key], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(tags)
}

/// WHERE clause and positional arguments built from a `RecordQuery`.
struct Filter {
    clauses: Vec<String>,
    args: Vec<Value>,
}

impl Filter {
    fn from_query(query: &RecordQuery) -> Self {
        let mut filter = Self {
            clauses: Vec::new(),
            args: Vec::new(),
        };

        if let Some(platform) = query.platform {
            filter.push("r.platform = ?", [text(platform.as_str())]);
        }
        if let Some(kind) = query.content_kind {
            filter.push("r.content_kind = ?", [text(kind.as_str())]);
        }
        if let Some(keyword) = query.keyword.as_deref().filter(|k| !k.trim().is_empty()) {
            let pattern = format!("%{}%", escape_like(keyword.trim()));
            filter.push(
                "(r.title LIKE ? ESCAPE '\\' OR r.body LIKE ? ESCAPE '\\')",
                [text(&pattern), text(&pattern)],
            );
        }
        if let Some(tag) = query.tag.as_deref() {
            filter.push(
                "EXISTS (SELECT 1 FROM record_tags t WHERE t.composite_key = r.composite_key AND t.tag = ?)",
                [text(tag)],
            );
        }
        if let Some(author) = query.author.as_deref() {
            filter.push("r.author = ?", [text(author)]);
        }
        if let Some(after) = query.created_after {
            filter.push("r.created_at >= ?", [text(&to_storage(&after))]);
        }
        if let Some(before) = query.created_before {
            filter.push("r.created_at < ?", [text(&to_storage(&before))]);
        }
        filter
    }

    fn push<const N: usize>(&mut self, clause: &str, args: [Value; N]) {
        self.clauses.push(clause.to_string());
        self.args.extend(args);
    }

    fn push_clause(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    /// Appends LIMIT/OFFSET arguments; call after `where_sql`.
    fn page_sql(&mut self, query: &RecordQuery) -> String {
        let limit = query.limit.map_or(-1, |l| l as i64);
        self.args.push(Value::Integer(limit));
        self.args.push(Value::Integer(query.offset as i64));
        "LIMIT ? OFFSET ?".to_string()
    }
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn order_sql(order: SortOrder) -> &'static str {
    match order {
        SortOrder::FetchedDesc => "r.fetched_at DESC, r.composite_key",
        SortOrder::CreatedDesc => "r.created_at DESC, r.composite_key",
        SortOrder::CreatedAsc => "r.created_at ASC, r.composite_key",
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn platform_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Platform> {
    let raw: String = row.get(idx)?;
    Platform::parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown platform '{raw}'")))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_storage(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{raw}'")))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<UnifiedRecord> {
    let kind: String = row.get(2)?;
    let content_kind = ContentKind::parse(&kind)
        .ok_or_else(|| conversion_error(2, format!("unknown content kind '{kind}'")))?;
    let extra: String = row.get(11)?;
    let extra = serde_json::from_str(&extra)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;
    let tags: Option<String> = row.get(12)?;

    Ok(UnifiedRecord {
        platform: platform_column(row, 0)?,
        native_id: row.get(1)?,
        content_kind,
        title: row.get(3)?,
        body: row.get(4)?,
        author: row.get(5)?,
        url: row.get(6)?,
        created_at: time_column(row, 7)?,
        created_at_approximate: row.get(8)?,
        fetched_at: Some(time_column(row, 9)?),
        parent_native_id: row.get(10)?,
        extra,
        search_tags: tags
            .map(|t| t.split(TAG_SEPARATOR).map(String::from).collect())
            .unwrap_or_default(),
    })
}
