//! Discussion fetcher CLI
//!
//! Runs collections, imports exports, and browses the local store.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use discussion_fetcher::{
    error::{AppError, Result},
    models::{Config, ContentKind, Platform, RunState},
    pipeline::{self, Orchestrator},
    services::{Constraints, Source, SourceKind},
    storage::{self, GroupBy, RecordQuery, SortOrder, SqliteStore},
    utils::{normalize_whitespace, time::parse_timestamp, truncate_graphemes},
};

/// Discussion fetcher - multi-source discussion collector
#[derive(Parser, Debug)]
#[command(
    name = "discussion-fetcher",
    version,
    about = "Collects Reddit and HuggingFace discussions into a deduplicated store"
)]
struct Cli {
    /// Path to storage directory containing config.toml
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect discussions from upstream sources
    Fetch {
        /// Search term (default: run.default_query)
        #[arg(short, long)]
        query: Option<String>,

        /// Sources to enable: reddit-api, reddit-browser, huggingface
        #[arg(long, value_delimiter = ',', value_parser = parse_source)]
        sources: Vec<SourceKind>,

        /// Only keep items created in the last N days
        #[arg(long)]
        days: Option<u32>,

        /// Cap on top-level hits per partition
        #[arg(long)]
        max_items: Option<usize>,

        /// Skip comment / discussion event expansion
        #[arg(long)]
        no_replies: bool,

        /// Persist once per source instead of after every partition
        #[arg(long)]
        collect_then_persist: bool,
    },

    /// Import exported CSV files
    Import {
        /// CSV files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Search tag attached to imported rows (default: run.default_query)
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Browse stored records
    Query {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, value_enum, default_value_t = Order::Fetched)]
        order: Order,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Count stored records by group
    Stats {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long, value_enum, default_value_t = Group::Platform)]
        by: Group,
    },

    /// Posts and discussions with their reply counts
    Threads {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Most active authors
    Authors {
        #[arg(long, value_parser = parse_platform)]
        platform: Option<Platform>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Export stored records as CSV
    Export {
        #[command(flatten)]
        filter: FilterArgs,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Collapse duplicate rows left by malformed keys
    Dedupe,

    /// Validate configuration
    Validate,

    /// Show storage and configuration info
    Info,
}

#[derive(Args, Debug, Clone)]
struct FilterArgs {
    #[arg(long, value_parser = parse_platform)]
    platform: Option<Platform>,

    #[arg(long, value_parser = parse_kind)]
    kind: Option<ContentKind>,

    /// Substring of title or body
    #[arg(long)]
    keyword: Option<String>,

    /// Search tag
    #[arg(long)]
    tag: Option<String>,

    #[arg(long)]
    author: Option<String>,

    /// Created at or after (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_instant)]
    since: Option<chrono::DateTime<Utc>>,

    /// Created before (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_instant)]
    until: Option<chrono::DateTime<Utc>>,
}

impl FilterArgs {
    fn to_query(&self) -> RecordQuery {
        RecordQuery {
            platform: self.platform,
            content_kind: self.kind,
            keyword: self.keyword.clone(),
            tag: self.tag.clone(),
            author: self.author.clone(),
            created_after: self.since,
            created_before: self.until,
            ..RecordQuery::default()
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Order {
    Fetched,
    Newest,
    Oldest,
}

impl From<Order> for SortOrder {
    fn from(order: Order) -> Self {
        match order {
            Order::Fetched => SortOrder::FetchedDesc,
            Order::Newest => SortOrder::CreatedDesc,
            Order::Oldest => SortOrder::CreatedAsc,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Group {
    Platform,
    Kind,
    Day,
    Week,
    Month,
    Tag,
}

fn parse_source(s: &str) -> std::result::Result<SourceKind, String> {
    SourceKind::parse(s).ok_or_else(|| format!("unknown source '{s}'"))
}

fn parse_platform(s: &str) -> std::result::Result<Platform, String> {
    Platform::parse(s).ok_or_else(|| format!("unknown platform '{s}'"))
}

fn parse_kind(s: &str) -> std::result::Result<ContentKind, String> {
    ContentKind::parse(s).ok_or_else(|| format!("unknown content kind '{s}'"))
}

fn parse_instant(s: &str) -> std::result::Result<chrono::DateTime<Utc>, String> {
    parse_timestamp(s)
        .map(|p| p.instant)
        .ok_or_else(|| format!("unrecognized timestamp '{s}'"))
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.storage_dir.join("config.toml");
    let config = Config::load_or_default(&config_path).with_env_overrides();
    log::debug!("Loaded configuration from {}", config_path.display());

    match cli.command {
        Command::Fetch {
            query,
            sources,
            days,
            max_items,
            no_replies,
            collect_then_persist,
        } => {
            config.validate()?;
            let query = query.unwrap_or_else(|| config.run.default_query.clone());
            let sources = if sources.is_empty() {
                vec![SourceKind::RedditApi, SourceKind::HuggingFace]
            } else {
                sources
            };

            let mut run = config.run.clone();
            if days.is_some() {
                run.days = days;
            }
            if max_items.is_some() {
                run.max_items_per_partition = max_items;
            }
            if no_replies {
                run.expand_replies = false;
            }
            let constraints =
                Constraints::from_run(&run, config.reddit.expansion_budget, Utc::now());

            let sources: Vec<Source> = sources
                .into_iter()
                .map(|kind| kind.setup(&config))
                .collect();

            let store = SqliteStore::open(&config.storage.database_path)?;
            let orchestrator =
                Orchestrator::new(Arc::new(store), run.auto_persist && !collect_then_persist);
            let mut handle = orchestrator.start(&query, constraints, sources)?;

            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            ticker.tick().await;
            let status = loop {
                tokio::select! {
                    finished = &mut handle => {
                        break finished.map_err(|e| AppError::Task(e.to_string()))?;
                    }
                    _ = ticker.tick() => {
                        if let Some(last) = orchestrator.status().progress.last() {
                            log::info!("Still running: {}", last);
                        }
                    }
                }
            };

            for source in &status.sources {
                log::info!(
                    "  {:<16} {:?}: {} collected, {} inserted, {} updated",
                    source.source,
                    source.status,
                    source.records_collected(),
                    source.persisted.inserted,
                    source.persisted.updated
                );
                if let Some(report) = &source.report {
                    for (partition, error) in &report.partition_errors {
                        log::warn!("    {}: {}", partition, error);
                    }
                }
            }

            if status.state == RunState::Failed {
                return Err(AppError::Task(
                    status.error.unwrap_or_else(|| "run failed".to_string()),
                ));
            }
        }

        Command::Import { files, tag } => {
            let tag = tag.unwrap_or_else(|| config.run.default_query.clone());
            let store = SqliteStore::open(&config.storage.database_path)?;
            let report = pipeline::import_csv(files, &store, &config, &tag).await?;
            log::info!(
                "Rows: {}, inserted: {}, updated: {}, skipped: {}, failed files: {}",
                report.rows,
                report.inserted,
                report.updated,
                report.skipped,
                report.failed_files.len()
            );
        }

        Command::Query {
            filter,
            limit,
            offset,
            order,
            json,
        } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let query = RecordQuery {
                order: order.into(),
                ..filter.to_query()
            }
            .page(limit, offset);

            for record in store.query(&query)? {
                if json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!(
                        "{}  {}  {:<10} {:<16} {}",
                        record.created_at.format("%Y-%m-%d %H:%M"),
                        record.composite_key(),
                        record.content_kind,
                        record.author.as_deref().unwrap_or("-"),
                        truncate_graphemes(
                            &normalize_whitespace(record.title.as_deref().unwrap_or(&record.body)),
                            80
                        )
                    );
                }
            }
            log::info!("{} matching records", store.count(&filter.to_query())?);
        }

        Command::Stats { filter, by } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let counts = match by {
                Group::Tag => store.distinct_tags()?,
                Group::Platform => store.count_by(&filter.to_query(), GroupBy::Platform)?,
                Group::Kind => store.count_by(&filter.to_query(), GroupBy::ContentKind)?,
                Group::Day => store.count_by(&filter.to_query(), GroupBy::Day)?,
                Group::Week => store.count_by(&filter.to_query(), GroupBy::Week)?,
                Group::Month => store.count_by(&filter.to_query(), GroupBy::Month)?,
            };
            for group in counts {
                println!("{:<24} {}", group.key, group.count);
            }
        }

        Command::Threads { filter, limit } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let query = RecordQuery {
                order: SortOrder::CreatedDesc,
                ..filter.to_query()
            }
            .page(limit, 0);

            for stat in store.thread_stats(&query)? {
                let record = &stat.record;
                println!(
                    "{}  {:>4} replies  {}  {}",
                    record.created_at.format("%Y-%m-%d"),
                    stat.reply_count,
                    stat.latest_reply_at
                        .map(|at| at.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    truncate_graphemes(
                        &normalize_whitespace(record.title.as_deref().unwrap_or(&record.body)),
                        80
                    )
                );
            }
        }

        Command::Authors { platform, limit } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let authors = store.top_authors(limit, &config.storage.excluded_authors, platform)?;
            for stat in authors {
                println!(
                    "{:<24} {:<12} {:>6}  last {}",
                    stat.author,
                    stat.platform,
                    stat.records,
                    stat.last_created_at.format("%Y-%m-%d")
                );
            }
        }

        Command::Export { filter, output } => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let query = RecordQuery {
                order: SortOrder::CreatedDesc,
                ..filter.to_query()
            };
            let written = match &output {
                Some(path) => {
                    storage::export_csv(&store, &query, BufWriter::new(File::create(path)?))?
                }
                None => storage::export_csv(&store, &query, io::stdout().lock())?,
            };
            if let Some(path) = output {
                log::info!("Wrote {} records to {}", written, path.display());
            }
        }

        Command::Dedupe => {
            let store = SqliteStore::open(&config.storage.database_path)?;
            let report = store.dedupe()?;
            log::info!(
                "Dedupe: {} groups, {} rows removed, {} rows rekeyed",
                report.groups,
                report.removed,
                report.rekeyed
            );
        }

        Command::Validate => {
            log::info!("Validating configuration...");

            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            if config.reddit.credentials().is_none() {
                log::warn!("Reddit API credentials are not set; the reddit-api source will fail");
            }
            if !config.browser.cookie_path.exists() {
                log::warn!(
                    "Cookie bundle {} not found; the reddit-browser source runs without a session",
                    config.browser.cookie_path.display()
                );
            }
            log::info!("Config OK");
        }

        Command::Info => {
            log::info!("Storage directory: {}", cli.storage_dir.display());
            log::info!(
                "Config: {}",
                if config_path.exists() {
                    "found"
                } else {
                    "not found, using defaults"
                }
            );
            if config.storage.database_path.exists() {
                let store = SqliteStore::open(&config.storage.database_path)?;
                log::info!("Database: {}", store.path().display());
                log::info!("Records: {}", store.count(&RecordQuery::all())?);
                for group in store.count_by(&RecordQuery::all(), GroupBy::Platform)? {
                    log::info!("  {}: {}", group.key, group.count);
                }
                let tags = store.distinct_tags()?;
                if !tags.is_empty() {
                    log::info!(
                        "Search tags: {}",
                        tags.iter()
                            .map(|t| format!("{} ({})", t.key, t.count))
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
            } else {
                log::info!(
                    "Database: {} (not created yet)",
                    config.storage.database_path.display()
                );
            }
        }
    }

    Ok(())
}
