// src/services/reddit_api.rs

//! Reddit OAuth API collector.
//!
//! Authenticates once per run with application-only credentials, searches
//! each configured subreddit, and optionally walks the comment tree of every
//! hit, expanding "load more comments" stubs within the expansion budget.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::IgnoredAny;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::{Config, ContentKind, HttpConfig, Platform, RedditConfig, UnifiedRecord};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::throttle::RateLimiter;
use crate::services::{Collection, Collector, Constraints, Harvest, PartitionYield, throttled};
use crate::storage::RecordSink;
use crate::utils::http::{check_status, create_client_with_agent, send_json};
use crate::utils::time::from_epoch;

const SOURCE: &str = "reddit-api";
const SITE: &str = "https://www.reddit.com";
const PAGE_SIZE: usize = 100;
const MAX_SEARCH_PAGES: usize = 10;
const MORE_CHILDREN_CHUNK: usize = 100;
const REMOVED_BODIES: &[&str] = &["[deleted]", "[removed]"];

// --- Wire types ---

/// A Reddit listing envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Listing<T> {
    pub data: ListingData<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingData<T> {
    #[serde(default = "Vec::new")]
    pub children: Vec<Thing<T>>,
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Thing<T> {
    pub kind: String,
    pub data: T,
}

/// A search hit (`t3`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostData {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub selftext: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_utc: Option<f64>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub upvote_ratio: Option<f64>,
    #[serde(default)]
    pub num_comments: Option<i64>,
    #[serde(default)]
    pub subreddit: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub link_flair_text: Option<String>,
    #[serde(default)]
    pub over_18: Option<bool>,
}

/// A node of a comment tree: a comment (`t1`) or a "more" stub.
pub type CommentThing = Thing<CommentData>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommentData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub created_utc: Option<f64>,
    #[serde(default)]
    pub score: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub depth: Option<i64>,
    #[serde(default)]
    pub subreddit: Option<String>,
    #[serde(default)]
    pub replies: Replies,
    /// Ids hidden behind a "more" stub
    #[serde(default)]
    pub children: Vec<String>,
}

/// Nested replies: a listing, or `""` when there are none.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Replies {
    Thread(Box<Listing<CommentData>>),
    Empty(IgnoredAny),
}

impl Default for Replies {
    fn default() -> Self {
        Replies::Empty(IgnoredAny)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MoreChildrenResponse {
    #[serde(default)]
    json: MoreChildrenJson,
}

#[derive(Debug, Default, Deserialize)]
struct MoreChildrenJson {
    #[serde(default)]
    data: MoreChildrenData,
}

#[derive(Debug, Default, Deserialize)]
struct MoreChildrenData {
    #[serde(default)]
    things: Vec<CommentThing>,
}

// --- Upstream client ---

/// Operations the collector needs from Reddit.
#[async_trait]
pub trait RedditApi: Send + Sync {
    /// Obtain an access token; credential problems must be `Config` or `Auth` errors.
    async fn authenticate(&self) -> Result<()>;

    /// One page of search hits within `partition` (`all` searches the whole site).
    async fn search(
        &self,
        partition: &str,
        query: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Listing<PostData>>;

    /// Top-level comment tree of a post.
    async fn comments(&self, post_id: &str) -> Result<Vec<CommentThing>>;

    /// Expand the comments hidden behind a "more" stub.
    async fn more_children(&self, post_id: &str, children: &[String]) -> Result<Vec<CommentThing>>;
}

/// `RedditApi` over the public OAuth endpoints.
pub struct HttpRedditApi {
    config: RedditConfig,
    client: Client,
    token: RwLock<Option<String>>,
}

impl HttpRedditApi {
    pub fn new(config: RedditConfig, http: &HttpConfig) -> Result<Self> {
        let client = create_client_with_agent(http, &config.user_agent)?;
        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    async fn bearer(&self) -> Result<String> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::auth("reddit", "not authenticated"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let request = self
            .client
            .get(&url)
            .bearer_auth(self.bearer().await?)
            .query(query);
        send_json(request, context).await
    }
}

#[async_trait]
impl RedditApi for HttpRedditApi {
    async fn authenticate(&self) -> Result<()> {
        let Some((id, secret)) = self.config.credentials() else {
            return Err(AppError::config(
                "reddit.client_id and reddit.client_secret must be set (or REDDIT_CLIENT_ID / REDDIT_CLIENT_SECRET)",
            ));
        };

        let response = self
            .client
            .post(&self.config.auth_url)
            .basic_auth(id, Some(secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(AppError::auth(
                "reddit",
                format!("token request rejected with HTTP {}", response.status()),
            ));
        }
        let token: TokenResponse = check_status(response, "reddit token")?.json().await?;

        match (token.access_token, token.error) {
            (Some(access), _) if !access.is_empty() => {
                *self.token.write().await = Some(access);
                log::info!("Authenticated with Reddit API");
                Ok(())
            }
            (_, error) => Err(AppError::auth(
                "reddit",
                error.unwrap_or_else(|| "no access token in response".into()),
            )),
        }
    }

    async fn search(
        &self,
        partition: &str,
        query: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Listing<PostData>> {
        let mut params = vec![
            ("q", query.to_string()),
            ("sort", self.config.sort.clone()),
            ("t", self.config.time_filter.clone()),
            ("limit", limit.to_string()),
            ("raw_json", "1".to_string()),
            ("type", "link".to_string()),
        ];
        if let Some(after) = after {
            params.push(("after", after.to_string()));
        }

        let path = if partition == "all" {
            "/search".to_string()
        } else {
            params.push(("restrict_sr", "1".to_string()));
            format!("/r/{partition}/search")
        };
        self.get_json(&path, &params, &format!("reddit search r/{partition}"))
            .await
    }

    async fn comments(&self, post_id: &str) -> Result<Vec<CommentThing>> {
        let (_post, comments): (IgnoredAny, Listing<CommentData>) = self
            .get_json(
                &format!("/comments/{post_id}"),
                &[("raw_json", "1".to_string()), ("limit", "500".to_string())],
                &format!("reddit comments {post_id}"),
            )
            .await?;
        Ok(comments.data.children)
    }

    async fn more_children(&self, post_id: &str, children: &[String]) -> Result<Vec<CommentThing>> {
        let response: MoreChildrenResponse = self
            .get_json(
                "/api/morechildren",
                &[
                    ("api_type", "json".to_string()),
                    ("link_id", format!("t3_{post_id}")),
                    ("children", children.join(",")),
                    ("raw_json", "1".to_string()),
                ],
                &format!("reddit morechildren {post_id}"),
            )
            .await?;
        Ok(response.json.data.things)
    }
}

// --- Collector ---

/// Collects posts and comments through the Reddit API.
pub struct RedditApiCollector {
    api: Arc<dyn RedditApi>,
    config: RedditConfig,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl RedditApiCollector {
    /// Build a collector backed by the HTTP API.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api = HttpRedditApi::new(config.reddit.clone(), &config.http)?;
        Ok(Self::with_api(
            Arc::new(api),
            config.reddit.clone(),
            RetryPolicy::from_config(&config.retry),
        ))
    }

    pub fn with_api(api: Arc<dyn RedditApi>, config: RedditConfig, retry: RetryPolicy) -> Self {
        let limiter = RateLimiter::per_second(config.requests_per_second);
        Self {
            api,
            config,
            limiter,
            retry,
        }
    }

    async fn collect_partition(
        &self,
        partition: &str,
        query: &str,
        constraints: &Constraints,
    ) -> Result<PartitionYield> {
        let mut output = PartitionYield::default();
        let wanted = constraints.max_items_per_partition;
        let mut hits: Vec<PostData> = Vec::new();
        let mut after: Option<String> = None;

        for _ in 0..MAX_SEARCH_PAGES {
            let remaining = wanted.map_or(PAGE_SIZE, |w| w.saturating_sub(hits.len()));
            if remaining == 0 {
                break;
            }
            let context = format!("reddit search r/{partition}");
            let listing = throttled(&self.limiter, &self.retry, &context, || {
                self.api
                    .search(partition, query, after.as_deref(), remaining.min(PAGE_SIZE))
            })
            .await?;

            let page_len = listing.data.children.len();
            hits.extend(
                listing
                    .data
                    .children
                    .into_iter()
                    .filter(|t| t.kind == "t3")
                    .map(|t| t.data)
                    .take(remaining),
            );
            after = listing.data.after;
            if after.is_none() || page_len == 0 {
                break;
            }
        }

        for post in hits {
            let Some(record) = post_record(&post) else {
                output.skipped += 1;
                continue;
            };
            if !constraints.admits(&record.created_at) {
                continue;
            }
            output.records.push(record);

            if constraints.expand_replies {
                match self.expand_comments(&post, constraints).await {
                    Ok(expanded) => {
                        output.skipped += expanded.skipped;
                        output.records.extend(
                            expanded
                                .records
                                .into_iter()
                                .filter(|c| constraints.admits(&c.created_at)),
                        );
                        output.warnings.extend(expanded.warning);
                    }
                    Err(e) => output
                        .warnings
                        .push(format!("comments for {} unavailable: {}", post.id, e.summary())),
                }
            }
        }

        Ok(output)
    }

    /// Walk a post's comment tree, expanding "more" stubs within the budget.
    ///
    /// Only a failure to load the tree itself is an error. A failed "more"
    /// expansion stops expanding and keeps the comments gathered so far.
    async fn expand_comments(
        &self,
        post: &PostData,
        constraints: &Constraints,
    ) -> Result<ExpandedComments> {
        let context = format!("reddit comments {}", post.id);
        let tree = throttled(&self.limiter, &self.retry, &context, || {
            self.api.comments(&post.id)
        })
        .await?;

        let mut comments = Vec::new();
        let mut pending: VecDeque<Vec<String>> = VecDeque::new();
        flatten(tree, &mut comments, &mut pending);

        let mut expansions = 0;
        let mut warning = None;
        'expand: while let Some(children) = pending.pop_front() {
            for chunk in children.chunks(MORE_CHILDREN_CHUNK) {
                if !constraints.may_expand(expansions) {
                    log::debug!(
                        "Expansion budget reached for {} ({} expansions)",
                        post.id,
                        expansions
                    );
                    pending.clear();
                    break;
                }
                expansions += 1;
                let context = format!("reddit morechildren {}", post.id);
                let things = match throttled(&self.limiter, &self.retry, &context, || {
                    self.api.more_children(&post.id, chunk)
                })
                .await
                {
                    Ok(things) => things,
                    Err(e) => {
                        warning = Some(format!(
                            "comment expansion for {} stopped: {}",
                            post.id,
                            e.summary()
                        ));
                        break 'expand;
                    }
                };
                flatten(things, &mut comments, &mut pending);
            }
        }

        let mut skipped = 0;
        let mut records = Vec::with_capacity(comments.len());
        for comment in comments {
            match comment_record(&comment, post) {
                CommentOutcome::Record(record) => records.push(*record),
                CommentOutcome::Removed => {}
                CommentOutcome::Malformed => skipped += 1,
            }
        }
        Ok(ExpandedComments {
            records,
            skipped,
            warning,
        })
    }
}

/// Comments gathered for one post.
struct ExpandedComments {
    records: Vec<UnifiedRecord>,
    skipped: usize,
    /// Set when a "more" expansion failed part way
    warning: Option<String>,
}

#[async_trait]
impl Collector for RedditApiCollector {
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
        throttled(&self.limiter, &self.retry, "reddit auth", || {
            self.api.authenticate()
        })
        .await?;

        let mut harvest = Harvest::new(SOURCE, Platform::Reddit, query, sink);
        for partition in self.config.partitions() {
            match self.collect_partition(&partition, query, constraints).await {
                Ok(output) => harvest.partition_done(&partition, output).await,
                Err(e) => harvest.partition_failed(&partition, &e),
            }
        }
        Ok(harvest.finish())
    }
}

/// Depth-first flatten of a comment tree; "more" stubs are queued.
fn flatten(
    things: Vec<CommentThing>,
    comments: &mut Vec<CommentData>,
    pending: &mut VecDeque<Vec<String>>,
) {
    for thing in things {
        match thing.kind.as_str() {
            "t1" => {
                let mut data = thing.data;
                let replies = std::mem::take(&mut data.replies);
                comments.push(data);
                if let Replies::Thread(listing) = replies {
                    flatten(listing.data.children, comments, pending);
                }
            }
            "more" if !thing.data.children.is_empty() => pending.push_back(thing.data.children),
            _ => {}
        }
    }
}

fn permalink_url(permalink: Option<&str>, fallback: &str) -> String {
    match permalink {
        Some(p) if p.starts_with("http") => p.to_string(),
        Some(p) if !p.is_empty() => format!("{SITE}{p}"),
        _ => fallback.to_string(),
    }
}

fn post_record(post: &PostData) -> Option<UnifiedRecord> {
    if post.id.is_empty() {
        return None;
    }
    let created_at = post.created_utc.and_then(from_epoch)?;
    let body = match post.selftext.as_deref() {
        Some(text) if !text.trim().is_empty() => text.to_string(),
        _ => post.url.clone().unwrap_or_default(),
    };
    let url = permalink_url(
        post.permalink.as_deref(),
        &format!("{SITE}/comments/{}", post.id),
    );

    Some(
        UnifiedRecord::new(
            Platform::Reddit,
            &post.id,
            ContentKind::Post,
            body,
            url,
            created_at,
        )
        .with_title(Some(post.title.clone()))
        .with_author(post.author.as_deref())
        .with_attr("score", post.score)
        .with_attr("upvote_ratio", post.upvote_ratio)
        .with_attr("num_comments", post.num_comments)
        .with_attr("subreddit", post.subreddit.clone())
        .with_attr("link_flair_text", post.link_flair_text.clone())
        .with_attr("over_18", post.over_18)
        .with_attr("link_url", post.url.clone()),
    )
}

enum CommentOutcome {
    Record(Box<UnifiedRecord>),
    Removed,
    Malformed,
}

fn comment_record(comment: &CommentData, post: &PostData) -> CommentOutcome {
    let Some(body) = comment.body.as_deref() else {
        return CommentOutcome::Malformed;
    };
    if REMOVED_BODIES.contains(&body.trim()) {
        return CommentOutcome::Removed;
    }
    let Some(created_at) = comment.created_utc.and_then(from_epoch) else {
        return CommentOutcome::Malformed;
    };
    if comment.id.is_empty() {
        return CommentOutcome::Malformed;
    }

    let url = permalink_url(
        comment.permalink.as_deref(),
        &format!("{SITE}/comments/{}/_/{}", post.id, comment.id),
    );
    let record = UnifiedRecord::new(
        Platform::Reddit,
        &comment.id,
        ContentKind::Comment,
        body,
        url,
        created_at,
    )
    .with_author(comment.author.as_deref())
    .with_parent(Some(post.id.clone()))
    .with_attr("score", comment.score)
    .with_attr("depth", comment.depth)
    .with_attr("reply_to", comment.parent_id.clone())
    .with_attr("post_title", Some(post.title.clone()))
    .with_attr(
        "subreddit",
        comment.subreddit.clone().or_else(|| post.subreddit.clone()),
    );
    CommentOutcome::Record(Box::new(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchMode;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const JAN_1_2025: f64 = 1_735_689_600.0;

    #[derive(Default)]
    struct FakeReddit {
        auth_error: Option<fn() -> AppError>,
        posts: HashMap<String, Vec<serde_json::Value>>,
        failing_partitions: Vec<String>,
        comments: HashMap<String, serde_json::Value>,
        more: HashMap<String, serde_json::Value>,
        failing_comments: bool,
        failing_more: bool,
        search_calls: AtomicUsize,
        more_calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl RedditApi for FakeReddit {
        async fn authenticate(&self) -> Result<()> {
            match self.auth_error {
                Some(make) => Err(make()),
                None => Ok(()),
            }
        }

        async fn search(
            &self,
            partition: &str,
            _query: &str,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Listing<PostData>> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_partitions.iter().any(|p| p == partition) {
                return Err(AppError::upstream("reddit search", 503));
            }
            let posts = self.posts.get(partition).cloned().unwrap_or_default();
            let start: usize = after.map_or(0, |a| a.parse().unwrap());
            let end = (start + limit).min(posts.len());
            let children: Vec<_> = posts[start..end]
                .iter()
                .map(|p| json!({"kind": "t3", "data": p}))
                .collect();
            let after = (end < posts.len()).then(|| end.to_string());
            Ok(serde_json::from_value(json!({"data": {"children": children, "after": after}}))
                .unwrap())
        }

        async fn comments(&self, post_id: &str) -> Result<Vec<CommentThing>> {
            if self.failing_comments {
                return Err(AppError::upstream("reddit comments", 404));
            }
            let tree = self.comments.get(post_id).cloned().unwrap_or(json!([]));
            Ok(serde_json::from_value(tree).unwrap())
        }

        async fn more_children(
            &self,
            _post_id: &str,
            children: &[String],
        ) -> Result<Vec<CommentThing>> {
            self.more_calls.lock().unwrap().push(children.to_vec());
            if self.failing_more {
                return Err(AppError::upstream("reddit morechildren", 403));
            }
            let key = children.join(",");
            let things = self.more.get(&key).cloned().unwrap_or(json!([]));
            Ok(serde_json::from_value(things).unwrap())
        }
    }

    fn post(id: &str, created: f64) -> serde_json::Value {
        json!({
            "id": id,
            "title": format!("Post {id}"),
            "selftext": "ERNIE benchmarks",
            "author": "alice",
            "created_utc": created,
            "score": 10,
            "num_comments": 2,
            "subreddit": "LocalLLM",
            "permalink": format!("/r/LocalLLM/comments/{id}/post/")
        })
    }

    fn comment(id: &str, author: &str, body: &str, replies: serde_json::Value) -> serde_json::Value {
        json!({
            "kind": "t1",
            "data": {
                "id": id,
                "author": author,
                "body": body,
                "created_utc": JAN_1_2025 + 60.0,
                "score": 1,
                "parent_id": "t3_p1",
                "replies": replies
            }
        })
    }

    fn config(subreddits: &[&str]) -> RedditConfig {
        RedditConfig {
            subreddits: subreddits.iter().map(|s| s.to_string()).collect(),
            requests_per_second: 1000.0,
            ..RedditConfig::default()
        }
    }

    fn collector(fake: FakeReddit, subreddits: &[&str]) -> RedditApiCollector {
        RedditApiCollector::with_api(Arc::new(fake), config(subreddits), RetryPolicy::default())
    }

    fn no_replies() -> Constraints {
        Constraints {
            expand_replies: false,
            ..Constraints::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_partition_is_isolated() {
        let mut fake = FakeReddit::default();
        fake.posts.insert("one".into(), vec![post("a", JAN_1_2025)]);
        fake.posts.insert("three".into(), vec![post("c", JAN_1_2025)]);
        fake.failing_partitions.push("two".into());

        let collection = collector(fake, &["one", "two", "three"])
            .collect("ERNIE", &no_replies(), None)
            .await
            .unwrap();

        let ids: Vec<_> = collection.records.iter().map(|r| r.native_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(collection.report.partition_errors.len(), 1);
        assert!(collection.report.partition_errors.contains_key("two"));
        assert_eq!(collection.report.partitions_succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_partition_is_retried_to_budget() {
        let mut fake = FakeReddit::default();
        fake.failing_partitions.push("two".into());
        let fake = Arc::new(fake);

        let collector = RedditApiCollector::with_api(
            fake.clone(),
            config(&["two"]),
            RetryPolicy::default(),
        );
        let collection = collector.collect("ERNIE", &no_replies(), None).await.unwrap();

        assert_eq!(fake.search_calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            collection.report.status(),
            crate::models::SourceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_the_collector() {
        let fake = FakeReddit {
            auth_error: Some(|| AppError::config("reddit.client_id missing")),
            ..FakeReddit::default()
        };
        let result = collector(fake, &["one"])
            .collect("ERNIE", &no_replies(), None)
            .await;
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_http_api_without_credentials_is_a_config_error() {
        let api = HttpRedditApi::new(RedditConfig::default(), &HttpConfig::default()).unwrap();
        assert!(matches!(api.authenticate().await, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn test_post_fields_and_deleted_author() {
        let mut deleted = post("d", JAN_1_2025);
        deleted["author"] = json!("[deleted]");
        let mut fake = FakeReddit::default();
        fake.posts
            .insert("LocalLLM".into(), vec![post("a", JAN_1_2025), deleted]);

        let collection = collector(fake, &["LocalLLM"])
            .collect("ERNIE", &no_replies(), None)
            .await
            .unwrap();

        let first = &collection.records[0];
        assert_eq!(first.composite_key(), "reddit:a");
        assert_eq!(first.title.as_deref(), Some("Post a"));
        assert_eq!(first.author.as_deref(), Some("alice"));
        assert_eq!(first.url, "https://www.reddit.com/r/LocalLLM/comments/a/post/");
        assert_eq!(first.score(), Some(10));
        assert!(first.search_tags.contains("ERNIE"));
        assert_eq!(first.created_at.timestamp(), JAN_1_2025 as i64);
        assert_eq!(collection.records[1].author, None);
    }

    #[tokio::test]
    async fn test_pagination_respects_partition_limit() {
        let mut fake = FakeReddit::default();
        let posts = (0..250).map(|i| post(&format!("p{i}"), JAN_1_2025)).collect();
        fake.posts.insert("big".into(), posts);

        let constraints = Constraints {
            max_items_per_partition: Some(150),
            ..no_replies()
        };
        let collection = collector(fake, &["big"])
            .collect("ERNIE", &constraints, None)
            .await
            .unwrap();
        assert_eq!(collection.records.len(), 150);
    }

    #[tokio::test]
    async fn test_time_window_filters_old_posts() {
        let mut fake = FakeReddit::default();
        fake.posts.insert(
            "one".into(),
            vec![post("old", JAN_1_2025 - 86_400.0 * 30.0), post("new", JAN_1_2025)],
        );
        let constraints = Constraints {
            created_after: from_epoch(JAN_1_2025 - 86_400.0),
            ..no_replies()
        };

        let collection = collector(fake, &["one"])
            .collect("ERNIE", &constraints, None)
            .await
            .unwrap();
        let ids: Vec<_> = collection.records.iter().map(|r| r.native_id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test]
    async fn test_comment_tree_is_flattened_and_removed_bodies_skipped() {
        let mut fake = FakeReddit::default();
        fake.posts.insert("one".into(), vec![post("p1", JAN_1_2025)]);
        fake.comments.insert(
            "p1".into(),
            json!([
                comment("c1", "bob", "nice", json!({"kind": "Listing", "data": {"children": [
                    comment("c2", "[deleted]", "reply", json!(""))
                ]}})),
                comment("c3", "carol", "[removed]", json!("")),
                {"kind": "more", "data": {"id": "m1", "children": ["c4", "c5"]}}
            ]),
        );
        fake.more.insert("c4,c5".into(), json!([comment("c4", "dan", "more!", json!(""))]));

        let collection = collector(fake, &["one"])
            .collect("ERNIE", &Constraints::default(), None)
            .await
            .unwrap();

        let ids: Vec<_> = collection.records.iter().map(|r| r.native_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "c1", "c2", "c4"]);

        let c2 = &collection.records[2];
        assert_eq!(c2.content_kind, ContentKind::Comment);
        assert_eq!(c2.author, None);
        assert_eq!(c2.parent_native_id.as_deref(), Some("p1"));
        assert_eq!(c2.url, "https://www.reddit.com/comments/p1/_/c2");
    }

    #[tokio::test]
    async fn test_expansion_budget_limits_more_calls() {
        let mut fake = FakeReddit::default();
        fake.posts.insert("one".into(), vec![post("p1", JAN_1_2025)]);
        fake.comments.insert(
            "p1".into(),
            json!([
                {"kind": "more", "data": {"children": ["x1"]}},
                {"kind": "more", "data": {"children": ["x2"]}},
                {"kind": "more", "data": {"children": ["x3"]}}
            ]),
        );
        let fake = Arc::new(fake);
        let collector =
            RedditApiCollector::with_api(fake.clone(), config(&["one"]), RetryPolicy::default());

        let constraints = Constraints {
            expansion_budget: 2,
            ..Constraints::default()
        };
        collector.collect("ERNIE", &constraints, None).await.unwrap();

        assert_eq!(fake.more_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_comment_failure_is_a_warning() {
        let mut fake = FakeReddit::default();
        fake.posts.insert("one".into(), vec![post("p1", JAN_1_2025)]);
        fake.failing_comments = true;

        let collection = collector(fake, &["one"])
            .collect("ERNIE", &Constraints::default(), None)
            .await
            .unwrap();

        assert_eq!(collection.records.len(), 1);
        assert!(collection.report.partition_errors.is_empty());
        assert_eq!(collection.report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_more_expansion_keeps_fetched_comments() {
        let mut fake = FakeReddit::default();
        fake.posts.insert("one".into(), vec![post("p1", JAN_1_2025)]);
        fake.comments.insert(
            "p1".into(),
            json!([
                comment("c1", "bob", "first!", json!("")),
                {"kind": "more", "data": {"children": ["x1"]}}
            ]),
        );
        fake.failing_more = true;

        let collection = collector(fake, &["one"])
            .collect("ERNIE", &Constraints::default(), None)
            .await
            .unwrap();

        let ids: Vec<&str> = collection
            .records
            .iter()
            .map(|r| r.native_id.as_str())
            .collect();
        assert_eq!(ids, vec!["p1", "c1"]);
        assert!(collection.report.partition_errors.is_empty());
        assert_eq!(collection.report.warnings.len(), 1);
        assert!(collection.report.warnings[0].contains("p1"));
    }

    #[test]
    fn test_global_mode_uses_single_partition() {
        let config = RedditConfig {
            search_mode: SearchMode::Global,
            ..RedditConfig::default()
        };
        assert_eq!(config.partitions(), vec!["all"]);
    }

    #[test]
    fn test_replies_accepts_empty_string_and_listing() {
        let empty: CommentData =
            serde_json::from_value(json!({"id": "x", "replies": ""})).unwrap();
        assert!(matches!(empty.replies, Replies::Empty(_)));

        let nested: CommentData = serde_json::from_value(json!({
            "id": "x",
            "replies": {"kind": "Listing", "data": {"children": [], "after": null}}
        }))
        .unwrap();
        assert!(matches!(nested.replies, Replies::Thread(_)));
    }
}
