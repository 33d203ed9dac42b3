// src/services/reddit_browser.rs

//! Reddit comment search through a logged-in browser session.
//!
//! The comment search page renders results as `search-telemetry-tracker`
//! elements and loads more of them as the page is scrolled. Each partition
//! opens one search page, re-parses the rendered HTML after every scroll and
//! keeps the items it has not seen yet.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::COOKIE;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{
    BrowserConfig, Config, ContentKind, HttpConfig, Platform, SearchMode, UnifiedRecord,
};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::throttle::RateLimiter;
use crate::services::{Collection, Collector, Constraints, Harvest, PartitionYield, throttled};
use crate::storage::RecordSink;
use crate::utils::contains_ignore_case;
use crate::utils::http::{check_status, create_async_client};
use crate::utils::time::{ParsedTime, parse_timestamp};

const SOURCE: &str = "reddit-browser";
const SORT: &str = "new";

// --- Session cookies ---

/// Session cookies exported from a logged-in browser.
#[derive(Debug, Clone, Default)]
pub struct CookieBundle {
    cookies: Vec<(String, String)>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBundle {
    List(Vec<RawCookie>),
    Map(BTreeMap<String, serde_json::Value>),
}

#[derive(Deserialize)]
struct RawCookie {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    domain: Option<String>,
}

impl CookieBundle {
    /// Parse a cookie export: a list of `{name, value, domain, ...}` objects
    /// or a flat `{name: value}` map.
    pub fn parse(json: &str) -> Result<Self> {
        let raw: RawBundle = serde_json::from_str(json)
            .map_err(|e| AppError::config(format!("Unrecognized cookie bundle: {e}")))?;

        let cookies = match raw {
            RawBundle::List(list) => list
                .into_iter()
                .filter(|c| {
                    c.domain
                        .as_deref()
                        .is_none_or(|d| d.is_empty() || d.contains("reddit.com"))
                })
                .map(|c| (c.name, c.value))
                .collect(),
            RawBundle::Map(map) => map
                .into_iter()
                .map(|(name, value)| match value {
                    serde_json::Value::String(s) => (name, s),
                    other => (name, other.to_string()),
                })
                .collect(),
        };
        Ok(Self { cookies })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load the bundle at `path`, or an empty bundle when the file does not exist.
    pub fn load_if_present(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!(
                "Cookie bundle {} not found, browsing without a session",
                path.display()
            );
            return Ok(Self::default());
        }
        let bundle = Self::load(path)?;
        log::info!("Loaded {} cookies from {}", bundle.len(), path.display());
        Ok(bundle)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Value for a `Cookie` request header.
    pub fn header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

// --- Browser session ---

/// Rendered page after a navigation or scroll.
#[derive(Debug, Clone, Default)]
pub struct PageState {
    pub html: String,
    /// The session cannot load anything further on this page
    pub at_bottom: bool,
}

/// A browser tab the collector can navigate and scroll.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn open(&self, url: &str) -> Result<PageState>;

    /// Scroll to the bottom and return the page as rendered afterwards.
    async fn scroll(&self) -> Result<PageState>;
}

/// `BrowserSession` backed by plain HTTP requests.
///
/// Only sees the server-rendered first batch of results; `scroll` reports
/// the page as already at the bottom.
pub struct HttpSnapshotSession {
    client: Client,
    cookie_header: Option<String>,
    current: Mutex<Option<String>>,
}

impl HttpSnapshotSession {
    pub fn new(http: &HttpConfig, cookies: &CookieBundle) -> Result<Self> {
        Ok(Self {
            client: create_async_client(http)?,
            cookie_header: cookies.header(),
            current: Mutex::new(None),
        })
    }
}

#[async_trait]
impl BrowserSession for HttpSnapshotSession {
    async fn open(&self, url: &str) -> Result<PageState> {
        let mut request = self.client.get(url);
        if let Some(cookies) = &self.cookie_header {
            request = request.header(COOKIE, cookies);
        }
        let response = check_status(request.send().await?, "reddit search page")?;
        let html = response.text().await?;
        *self.current.lock().await = Some(html.clone());
        Ok(PageState {
            html,
            at_bottom: true,
        })
    }

    async fn scroll(&self) -> Result<PageState> {
        let html = self
            .current
            .lock()
            .await
            .clone()
            .ok_or_else(|| AppError::Task("scroll before any page was opened".into()))?;
        Ok(PageState {
            html,
            at_bottom: true,
        })
    }
}

// --- Page parsing ---

/// One comment hit parsed from the search page.
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub comment_id: String,
    pub post_id: Option<String>,
    pub post_title: Option<String>,
    pub subreddit: Option<String>,
    pub author: Option<String>,
    pub body: String,
    pub score: Option<i64>,
    pub created_at: ParsedTime,
    pub permalink: Option<String>,
}

/// Parsed items of one rendered page.
#[derive(Debug, Default)]
pub struct SearchPage {
    pub items: Vec<SearchItem>,
    /// Result elements missing an id, body or timestamp
    pub malformed: usize,
}

#[derive(Debug, Default, Deserialize)]
struct TrackingContext {
    #[serde(default)]
    comment: TrackedComment,
    #[serde(default)]
    post: TrackedPost,
    #[serde(default)]
    subreddit: TrackedSubreddit,
}

#[derive(Debug, Default, Deserialize)]
struct TrackedComment {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    post_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackedPost {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackedSubreddit {
    #[serde(default)]
    name: Option<String>,
}

struct ItemSelectors {
    item: Selector,
    author: Selector,
    content: Selector,
    span: Selector,
    timeago: Selector,
    link: Selector,
    votes: Regex,
}

impl ItemSelectors {
    fn new() -> Result<Self> {
        Ok(Self {
            item: selector(r#"search-telemetry-tracker[view-events="search/view/comment"]"#)?,
            author: selector(r#"a[href*="/user/"]"#)?,
            content: selector(r#"div[id^="search-comment-t1_"]"#)?,
            span: selector("span")?,
            timeago: selector("faceplate-timeago[ts]")?,
            link: selector(r#"a[href*="/comments/"]"#)?,
            votes: Regex::new(r"(\d+)\s+votes?").map_err(AppError::parse)?,
        })
    }
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::parse(format!("invalid selector {s}: {e:?}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse every comment hit rendered on a Reddit comment search page.
pub fn parse_search_items(html: &str) -> Result<SearchPage> {
    let selectors = ItemSelectors::new()?;
    let document = Html::parse_document(html);
    let mut page = SearchPage::default();

    for element in document.select(&selectors.item) {
        match parse_item(&element, &selectors) {
            Some(item) => page.items.push(item),
            None => page.malformed += 1,
        }
    }
    Ok(page)
}

fn parse_item(element: &ElementRef, selectors: &ItemSelectors) -> Option<SearchItem> {
    let tracking: TrackingContext = element
        .value()
        .attr("data-faceplate-tracking-context")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();

    let content = element.select(&selectors.content).next();
    let comment_id = non_empty(tracking.comment.id)
        .or_else(|| {
            content
                .and_then(|c| c.value().id())
                .and_then(|id| id.trim_start_matches("search-comment-").split('-').next())
                .map(str::to_string)
        })
        .map(|id| id.trim_start_matches("t1_").to_string())
        .filter(|id| !id.is_empty())?;

    let body = content
        .map(|c| {
            c.text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|b| !b.is_empty())?;

    let created_at = element
        .select(&selectors.timeago)
        .next()
        .and_then(|t| t.value().attr("ts"))
        .and_then(parse_timestamp)?;

    let author = element
        .select(&selectors.author)
        .next()
        .map(|a| a.text().collect::<String>().trim().to_string());

    let score = element.select(&selectors.span).find_map(|span| {
        let text = span.text().collect::<String>();
        selectors
            .votes
            .captures(&text)
            .and_then(|c| c[1].parse::<i64>().ok())
    });

    let permalink = element
        .select(&selectors.link)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string);

    Some(SearchItem {
        comment_id,
        post_id: non_empty(tracking.comment.post_id)
            .map(|id| id.trim_start_matches("t3_").to_string()),
        post_title: non_empty(tracking.post.title),
        subreddit: non_empty(tracking.subreddit.name),
        author,
        body,
        score,
        created_at,
        permalink,
    })
}

// --- Collector ---

/// Collects Reddit comments by scrolling the comment search page.
pub struct RedditBrowserCollector {
    session: Arc<dyn BrowserSession>,
    config: BrowserConfig,
    subreddits: Vec<String>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl RedditBrowserCollector {
    /// Build a collector over an HTTP snapshot session using the configured cookie bundle.
    pub fn from_config(config: &Config) -> Result<Self> {
        let cookies = CookieBundle::load_if_present(&config.browser.cookie_path)?;
        let session = HttpSnapshotSession::new(&config.http, &cookies)?;
        Ok(Self::with_session(
            Arc::new(session),
            config.browser.clone(),
            config.reddit.subreddits.clone(),
            RetryPolicy::from_config(&config.retry),
        ))
    }

    pub fn with_session(
        session: Arc<dyn BrowserSession>,
        config: BrowserConfig,
        subreddits: Vec<String>,
        retry: RetryPolicy,
    ) -> Self {
        let limiter = RateLimiter::per_second(config.requests_per_second);
        Self {
            session,
            config,
            subreddits,
            limiter,
            retry,
        }
    }

    fn partitions(&self) -> Vec<String> {
        match self.config.search_mode {
            SearchMode::Global => vec!["all".to_string()],
            SearchMode::Subreddits => self.subreddits.clone(),
        }
    }

    fn search_url(&self, partition: &str, query: &str) -> Result<Url> {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = if partition == "all" {
            Url::parse(&format!("{base}/search/"))?
        } else {
            Url::parse(&format!("{base}/r/{partition}/search/"))?
        };
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("type", "comment")
            .append_pair("sort", SORT);
        Ok(url)
    }

    /// Reject pages that are a challenge or a throttle notice instead of results.
    fn screen(&self, page: PageState, partition: &str) -> Result<PageState> {
        if let Some(marker) = self.find_marker(&page.html, &self.config.bot_markers) {
            return Err(AppError::BotChallenge(format!("r/{partition} ({marker})")));
        }
        if let Some(marker) = self.find_marker(&page.html, &self.config.rate_limit_markers) {
            return Err(AppError::RateLimited(format!(
                "reddit search r/{partition} ({marker})"
            )));
        }
        Ok(page)
    }

    fn find_marker<'m>(&self, html: &str, markers: &'m [String]) -> Option<&'m str> {
        markers
            .iter()
            .map(String::as_str)
            .find(|marker| contains_ignore_case(html, marker))
    }

    async fn open(&self, url: &str, partition: &str) -> Result<PageState> {
        let page = self.session.open(url).await?;
        self.screen(page, partition)
    }

    async fn scroll(&self, partition: &str) -> Result<PageState> {
        let page = self.session.scroll().await?;
        self.screen(page, partition)
    }

    async fn collect_partition(
        &self,
        partition: &str,
        query: &str,
        constraints: &Constraints,
    ) -> Result<PartitionYield> {
        let url = self.search_url(partition, query)?;
        let context = format!("reddit search page r/{partition}");
        let mut page = throttled(&self.limiter, &self.retry, &context, || {
            self.open(url.as_str(), partition)
        })
        .await?;

        let mut output = PartitionYield::default();
        let mut seen = HashSet::new();
        let mut stale = 0;
        let mut scrolls = 0;
        let limit = constraints.max_items_per_partition;

        loop {
            let parsed = parse_search_items(&page.html)?;
            output.skipped = output.skipped.max(parsed.malformed);

            let mut fresh = 0;
            for item in parsed.items {
                if !seen.insert(item.comment_id.clone()) {
                    continue;
                }
                fresh += 1;
                if constraints.admits(&item.created_at.instant) {
                    output.records.push(self.record(item));
                }
            }

            if self.find_marker(&page.html, &self.config.end_markers).is_some() {
                log::debug!("r/{partition}: end of results after {scrolls} scrolls");
                break;
            }
            if limit.is_some_and(|max| output.records.len() >= max) {
                break;
            }
            if fresh == 0 {
                stale += 1;
                if stale >= self.config.stale_scroll_limit.max(1) {
                    log::debug!("r/{partition}: no new items after {stale} scrolls");
                    break;
                }
            } else {
                stale = 0;
            }
            if page.at_bottom || scrolls >= self.config.max_scrolls {
                break;
            }

            scrolls += 1;
            page = match throttled(&self.limiter, &self.retry, &context, || {
                self.scroll(partition)
            })
            .await
            {
                Ok(page) => page,
                Err(e @ AppError::BotChallenge(_)) => return Err(e),
                Err(e) => {
                    output
                        .warnings
                        .push(format!("scroll {scrolls} failed: {}", e.summary()));
                    break;
                }
            };
        }

        if let Some(max) = limit {
            output.records.truncate(max);
        }
        Ok(output)
    }

    fn record(&self, item: SearchItem) -> UnifiedRecord {
        let site = self.config.base_url.trim_end_matches('/');
        let url = match item.permalink.as_deref() {
            Some(link) if link.starts_with('/') => format!("{site}{link}"),
            Some(link) if !link.is_empty() => link.to_string(),
            _ => format!(
                "{site}/comments/{}/_/{}",
                item.post_id.as_deref().unwrap_or("_"),
                item.comment_id
            ),
        };

        UnifiedRecord::new(
            Platform::Reddit,
            &item.comment_id,
            ContentKind::Comment,
            item.body,
            url,
            item.created_at.instant,
        )
        .approximate(item.created_at.approximate)
        .with_title(item.post_title)
        .with_author(item.author.as_deref())
        .with_parent(item.post_id)
        .with_attr("score", item.score)
        .with_attr("subreddit", item.subreddit)
        .with_attr("permalink", item.permalink)
    }
}

#[async_trait]
impl Collector for RedditBrowserCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn platform(&self) -> Platform {
        Platform::Reddit
    }

    async fn collect(
        &self,
        query: &str,
        constraints: &Constraints,
        sink: Option<&dyn RecordSink>,
    ) -> Result<Collection> {
        let mut harvest = Harvest::new(SOURCE, Platform::Reddit, query, sink);
        for partition in self.partitions() {
            match self.collect_partition(&partition, query, constraints).await {
                Ok(output) => harvest.partition_done(&partition, output).await,
                Err(e) => harvest.partition_failed(&partition, &e),
            }
        }
        Ok(harvest.finish())
    }
}
