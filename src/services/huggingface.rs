// src/services/huggingface.rs

//! HuggingFace model discussion collector.
//!
//! Models whose id matches the query are the partitions. Each model's
//! discussions are paged through, and with reply expansion enabled every
//! discussion's event log is fetched so the opening post and its replies
//! become separate records.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::Result;
use crate::models::{Config, ContentKind, HttpConfig, HuggingFaceConfig, Platform, UnifiedRecord};
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::throttle::RateLimiter;
use crate::services::{Collection, Collector, Constraints, Harvest, PartitionYield, throttled};
use crate::storage::RecordSink;
use crate::utils::contains_ignore_case;
use crate::utils::http::{create_async_client, send_json};
use crate::utils::time::parse_timestamp;

const SOURCE: &str = "huggingface";
const MAX_DISCUSSION_PAGES: u32 = 100;

// --- Wire types ---

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSummary {
    pub id: String,
    #[serde(default)]
    pub downloads: Option<u64>,
    #[serde(default)]
    pub likes: Option<u64>,
}

/// Author as the Hub reports it: a bare handle or a user object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HubAuthor {
    Handle(String),
    Profile {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        fullname: Option<String>,
    },
}

impl HubAuthor {
    pub fn handle(&self) -> Option<&str> {
        match self {
            HubAuthor::Handle(handle) => Some(handle),
            HubAuthor::Profile { name, fullname } => name.as_deref().or(fullname.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionSummary {
    pub num: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub author: Option<HubAuthor>,
    #[serde(default)]
    pub is_pull_request: Option<bool>,
    #[serde(default)]
    pub num_comments: Option<u64>,
}

/// One page of a model's discussion list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscussionPage {
    #[serde(default)]
    pub discussions: Vec<DiscussionSummary>,
    /// Total discussions on the model
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub start: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscussionDetail {
    #[serde(default)]
    pub events: Vec<DiscussionEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionEvent {
    pub id: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub author: Option<HubAuthor>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub data: Option<EventData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub latest: Option<EventRevision>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRevision {
    #[serde(default)]
    pub raw: Option<String>,
}

impl DiscussionEvent {
    /// Text of the event; status changes and title edits have none.
    pub fn text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .or_else(|| {
                self.data
                    .as_ref()
                    .and_then(|d| d.latest.as_ref())
                    .and_then(|l| l.raw.as_deref())
            })
            .filter(|text| !text.trim().is_empty())
    }
}

// --- Upstream client ---

/// Operations the collector needs from the Hub.
#[async_trait]
pub trait HubApi: Send + Sync {
    async fn search_models(&self, query: &str, limit: usize) -> Result<Vec<ModelSummary>>;

    /// Page `page` (0-based) of a model's discussions.
    async fn discussions(&self, model: &str, page: u32) -> Result<DiscussionPage>;

    async fn discussion(&self, model: &str, num: u64) -> Result<DiscussionDetail>;
}

/// `HubApi` over the public Hub REST endpoints.
pub struct HttpHubApi {
    config: HuggingFaceConfig,
    client: Client,
}

impl HttpHubApi {
    pub fn new(config: HuggingFaceConfig, http: &HttpConfig) -> Result<Self> {
        let client = create_async_client(http)?;
        Ok(Self { config, client })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let mut request = self.client.get(&url).query(query);
        if let Some(token) = self.config.token.as_deref() {
            request = request.bearer_auth(token);
        }
        send_json(request, context).await
    }
}

#[async_trait]
impl HubApi for HttpHubApi {
    async fn search_models(&self, query: &str, limit: usize) -> Result<Vec<ModelSummary>> {
        self.get_json(
            "/api/models",
            &[("search", query.to_string()), ("limit", limit.to_string())],
            "huggingface model search",
        )
        .await
    }

    async fn discussions(&self, model: &str, page: u32) -> Result<DiscussionPage> {
        self.get_json(
            &format!("/api/models/{model}/discussions"),
            &[("p", page.to_string())],
            &format!("huggingface discussions {model}"),
        )
        .await
    }

    async fn discussion(&self, model: &str, num: u64) -> Result<DiscussionDetail> {
        self.get_json(
            &format!("/api/models/{model}/discussions/{num}"),
            &[],
            &format!("huggingface discussion {model}#{num}"),
        )
        .await
    }
}

// --- Collector ---

/// Collects model discussions from the HuggingFace Hub.
pub struct HuggingFaceCollector {
    api: Arc<dyn HubApi>,
    config: HuggingFaceConfig,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl HuggingFaceCollector {
    pub fn from_config(config: &Config) -> Result<Self> {
        let api = HttpHubApi::new(config.huggingface.clone(), &config.http)?;
        Ok(Self::with_api(
            Arc::new(api),
            config.huggingface.clone(),
            RetryPolicy::from_config(&config.retry),
        ))
    }

    pub fn with_api(api: Arc<dyn HubApi>, config: HuggingFaceConfig, retry: RetryPolicy) -> Self {
        let limiter = RateLimiter::per_second(config.requests_per_second);
        Self {
            api,
            config,
            limiter,
            retry,
        }
    }

    /// Model ids to walk for `query`.
    async fn resolve_models(&self, query: &str) -> Result<Vec<String>> {
        let models = throttled(&self.limiter, &self.retry, "huggingface model search", || {
            self.api.search_models(query, self.config.model_limit)
        })
        .await?;

        let found = models.len();
        let ids: Vec<String> = models
            .into_iter()
            .map(|m| m.id)
            .filter(|id| !self.config.exact_match || contains_ignore_case(id, query))
            .collect();

        if ids.len() < found {
            log::info!(
                "Exact match dropped {} of {} models not containing '{}'",
                found - ids.len(),
                found,
                query
            );
        }
        Ok(ids)
    }

    async fn list_discussions(
        &self,
        model: &str,
        constraints: &Constraints,
    ) -> Result<Vec<DiscussionSummary>> {
        let mut discussions: Vec<DiscussionSummary> = Vec::new();
        let context = format!("huggingface discussions {model}");

        for page in 0..MAX_DISCUSSION_PAGES {
            let listing = throttled(&self.limiter, &self.retry, &context, || {
                self.api.discussions(model, page)
            })
            .await?;

            if listing.discussions.is_empty() {
                break;
            }
            discussions.extend(listing.discussions);

            let capped = constraints
                .max_items_per_partition
                .is_some_and(|max| discussions.len() >= max);
            if capped || discussions.len() >= listing.count {
                break;
            }
        }

        if let Some(max) = constraints.max_items_per_partition {
            discussions.truncate(max);
        }
        Ok(discussions)
    }

    async fn collect_partition(
        &self,
        model: &str,
        constraints: &Constraints,
    ) -> Result<PartitionYield> {
        let mut output = PartitionYield::default();

        for summary in self.list_discussions(model, constraints).await? {
            let Some(created) = summary.created_at.as_deref().and_then(parse_timestamp) else {
                output.skipped += 1;
                continue;
            };
            if !constraints.admits(&created.instant) {
                continue;
            }

            let thread = Thread {
                api_base: &self.config.api_base,
                model,
                summary: &summary,
            };

            if !constraints.expand_replies {
                output.records.push(
                    thread
                        .root(summary.title.clone())
                        .approximate(created.approximate),
                );
                continue;
            }

            let context = format!("huggingface discussion {model}#{}", summary.num);
            let detail = match throttled(&self.limiter, &self.retry, &context, || {
                self.api.discussion(model, summary.num)
            })
            .await
            {
                Ok(detail) => detail,
                Err(e) => {
                    output.warnings.push(format!(
                        "discussion #{} events unavailable: {}",
                        summary.num,
                        e.summary()
                    ));
                    output.records.push(
                        thread
                            .root(summary.title.clone())
                            .approximate(created.approximate),
                    );
                    continue;
                }
            };

            let mut events = detail.events.iter().filter(|e| e.text().is_some());
            let opening = events.next();
            let body = opening
                .and_then(DiscussionEvent::text)
                .unwrap_or(summary.title.as_str())
                .to_string();
            output
                .records
                .push(thread.root(body).approximate(created.approximate));

            for event in events {
                match thread.reply(event) {
                    Some(record) if constraints.admits(&record.created_at) => {
                        output.records.push(record)
                    }
                    Some(_) => {}
                    None => output.skipped += 1,
                }
            }
        }

        Ok(output)
    }
}

#[async_trait]
impl Collector for HuggingFaceCollector {
    fn name(&self) -> &str {
        SOURCE
    }

    fn platform(&self) -> Platform {
        Platform::HuggingFace
    }

    async fn collect(
        &self,
        query: &str,
        constraints: &Constraints,
        sink: Option<&dyn RecordSink>,
    ) -> Result<Collection> {
        let models = self.resolve_models(query).await?;
        if models.is_empty() {
            log::warn!("No HuggingFace models match '{}'", query);
        }

        let mut harvest = Harvest::new(SOURCE, Platform::HuggingFace, query, sink);
        for model in &models {
            match self.collect_partition(model, constraints).await {
                Ok(output) => harvest.partition_done(model, output).await,
                Err(e) => harvest.partition_failed(model, &e),
            }
        }
        Ok(harvest.finish())
    }
}

/// Record builder for one discussion thread.
struct Thread<'a> {
    api_base: &'a str,
    model: &'a str,
    summary: &'a DiscussionSummary,
}

impl Thread<'_> {
    fn native_id(&self) -> String {
        format!("{}_{}", self.model, self.summary.num)
    }

    fn url(&self) -> String {
        format!(
            "{}/{}/discussions/{}",
            self.api_base.trim_end_matches('/'),
            self.model,
            self.summary.num
        )
    }

    fn with_common(&self, record: UnifiedRecord) -> UnifiedRecord {
        record
            .with_title(Some(self.summary.title.clone()))
            .with_attr("model_id", Some(self.model))
            .with_attr("discussion_num", Some(self.summary.num))
            .with_attr("status", self.summary.status.clone())
            .with_attr("is_pull_request", self.summary.is_pull_request)
    }

    /// The discussion itself; callers have already validated `created_at`.
    fn root(&self, body: String) -> UnifiedRecord {
        let created = self
            .summary
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .map(|p| p.instant)
            .unwrap_or_default();

        self.with_common(UnifiedRecord::new(
            Platform::HuggingFace,
            self.native_id(),
            ContentKind::Discussion,
            body,
            self.url(),
            created,
        ))
        .with_author(self.summary.author.as_ref().and_then(HubAuthor::handle))
        .with_attr("num_comments", self.summary.num_comments)
    }

    fn reply(&self, event: &DiscussionEvent) -> Option<UnifiedRecord> {
        let text = event.text()?;
        let created = event.created_at.as_deref().and_then(parse_timestamp)?;
        if event.id.is_empty() {
            return None;
        }

        Some(
            self.with_common(UnifiedRecord::new(
                Platform::HuggingFace,
                format!("{}_{}", self.native_id(), event.id),
                ContentKind::Reply,
                text,
                self.url(),
                created.instant,
            ))
            .approximate(created.approximate)
            .with_author(event.author.as_ref().and_then(HubAuthor::handle))
            .with_parent(Some(self.native_id()))
            .with_attr("event_type", Some(event.event_type.clone())),
        )
    }
}
