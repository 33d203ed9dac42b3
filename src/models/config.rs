// src/models/config.rs

//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Platform;

/// Slowest per-platform rate accepted: one request per hour.
const MIN_REQUESTS_PER_SECOND: f64 = 1.0 / 3600.0;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP client settings shared by the API collectors
    #[serde(default)]
    pub http: HttpConfig,

    /// Retry and backoff policy for upstream calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Database location and reporting settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Defaults for a collection run
    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub reddit: RedditConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub huggingface: HuggingFaceConfig,

    #[serde(default)]
    pub csv: CsvConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Apply credential overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    /// Apply credential overrides from an arbitrary key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(id) = non_empty("REDDIT_CLIENT_ID") {
            self.reddit.client_id = Some(id);
        }
        if let Some(secret) = non_empty("REDDIT_CLIENT_SECRET") {
            self.reddit.client_secret = Some(secret);
        }
        if let Some(agent) = non_empty("REDDIT_USER_AGENT") {
            self.reddit.user_agent = agent;
        }
        if let Some(token) = non_empty("HUGGINGFACE_TOKEN") {
            self.huggingface.token = Some(token);
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::validation(
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.storage.database_path.as_os_str().is_empty() {
            return Err(AppError::validation("storage.database_path is empty"));
        }
        if self.run.default_query.trim().is_empty() {
            return Err(AppError::validation("run.default_query is empty"));
        }
        for (name, rps) in [
            ("reddit", self.reddit.requests_per_second),
            ("browser", self.browser.requests_per_second),
            ("huggingface", self.huggingface.requests_per_second),
        ] {
            if !(rps >= MIN_REQUESTS_PER_SECOND) {
                return Err(AppError::validation(format!(
                    "{name}.requests_per_second must be at least one request per hour"
                )));
            }
        }
        if self.reddit.search_mode == SearchMode::Subreddits && self.reddit.subreddits.is_empty()
        {
            return Err(AppError::validation(
                "reddit.subreddits is empty in subreddits mode",
            ));
        }
        if self.browser.max_scrolls == 0 {
            return Err(AppError::validation("browser.max_scrolls must be > 0"));
        }
        if self.browser.stale_scroll_limit == 0 {
            return Err(AppError::validation(
                "browser.stale_scroll_limit must be > 0",
            ));
        }
        Ok(())
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "defaults::max_delay")]
    pub max_delay_ms: u64,

    /// Fixed pause after an explicit rate-limit signal
    #[serde(default = "defaults::rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay(),
            max_delay_ms: defaults::max_delay(),
            rate_limit_cooldown_secs: defaults::rate_limit_cooldown(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file, relative to the working directory
    #[serde(default = "defaults::database_path")]
    pub database_path: PathBuf,

    /// Authors left out of top-author reports
    #[serde(default = "defaults::excluded_authors")]
    pub excluded_authors: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: defaults::database_path(),
            excluded_authors: defaults::excluded_authors(),
        }
    }
}

/// Defaults for a collection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Collectors upsert each partition as it completes
    #[serde(default = "defaults::auto_persist")]
    pub auto_persist: bool,

    #[serde(default = "defaults::default_query")]
    pub default_query: String,

    /// Only keep items created within the last N days
    #[serde(default)]
    pub days: Option<u32>,

    /// Cap on items per partition (subreddit, model)
    #[serde(default)]
    pub max_items_per_partition: Option<usize>,

    /// Fetch comments/discussion events under each hit
    #[serde(default = "defaults::expand_replies")]
    pub expand_replies: bool,
}

impl RunConfig {
    /// Lower bound on `created_at` derived from `days`.
    pub fn created_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.days.map(|d| now - Duration::days(i64::from(d)))
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            auto_persist: defaults::auto_persist(),
            default_query: defaults::default_query(),
            days: None,
            max_items_per_partition: None,
            expand_replies: defaults::expand_replies(),
        }
    }
}

/// Whether to search a fixed list of partitions or the whole site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Subreddits,
    Global,
}

/// Reddit API collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedditConfig {
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub client_secret: Option<String>,

    #[serde(default = "defaults::reddit_user_agent")]
    pub user_agent: String,

    #[serde(default = "defaults::reddit_rps")]
    pub requests_per_second: f64,

    #[serde(default = "defaults::subreddits")]
    pub subreddits: Vec<String>,

    #[serde(default = "defaults::search_mode")]
    pub search_mode: SearchMode,

    /// relevance, hot, top, new, comments
    #[serde(default = "defaults::sort")]
    pub sort: String,

    /// hour, day, week, month, year, all
    #[serde(default = "defaults::time_filter")]
    pub time_filter: String,

    /// Max "more comments" expansions per post; 0 means unlimited
    #[serde(default)]
    pub expansion_budget: usize,

    #[serde(default = "defaults::reddit_auth_url")]
    pub auth_url: String,

    #[serde(default = "defaults::reddit_api_base")]
    pub api_base: String,
}

impl RedditConfig {
    /// Client id and secret, if both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }

    /// Partitions to search: each subreddit, or the single `all` partition.
    pub fn partitions(&self) -> Vec<String> {
        match self.search_mode {
            SearchMode::Global => vec!["all".to_string()],
            SearchMode::Subreddits => self.subreddits.clone(),
        }
    }
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            user_agent: defaults::reddit_user_agent(),
            requests_per_second: defaults::reddit_rps(),
            subreddits: defaults::subreddits(),
            search_mode: defaults::search_mode(),
            sort: defaults::sort(),
            time_filter: defaults::time_filter(),
            expansion_budget: 0,
            auth_url: defaults::reddit_auth_url(),
            api_base: defaults::reddit_api_base(),
        }
    }
}

/// Reddit browser collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Exported session cookies (JSON list or map)
    #[serde(default = "defaults::cookie_path")]
    pub cookie_path: PathBuf,

    #[serde(default = "defaults::browser_rps")]
    pub requests_per_second: f64,

    #[serde(default = "defaults::browser_base_url")]
    pub base_url: String,

    #[serde(default = "defaults::max_scrolls")]
    pub max_scrolls: usize,

    /// Scrolls in a row without new items before giving up
    #[serde(default = "defaults::stale_scroll_limit")]
    pub stale_scroll_limit: usize,

    #[serde(default = "defaults::search_mode")]
    pub search_mode: SearchMode,

    #[serde(default = "defaults::end_markers")]
    pub end_markers: Vec<String>,

    #[serde(default = "defaults::bot_markers")]
    pub bot_markers: Vec<String>,

    #[serde(default = "defaults::rate_limit_markers")]
    pub rate_limit_markers: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            cookie_path: defaults::cookie_path(),
            requests_per_second: defaults::browser_rps(),
            base_url: defaults::browser_base_url(),
            max_scrolls: defaults::max_scrolls(),
            stale_scroll_limit: defaults::stale_scroll_limit(),
            search_mode: defaults::search_mode(),
            end_markers: defaults::end_markers(),
            bot_markers: defaults::bot_markers(),
            rate_limit_markers: defaults::rate_limit_markers(),
        }
    }
}

/// HuggingFace collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuggingFaceConfig {
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "defaults::hf_rps")]
    pub requests_per_second: f64,

    #[serde(default = "defaults::hf_api_base")]
    pub api_base: String,

    /// Max models resolved per query
    #[serde(default = "defaults::model_limit")]
    pub model_limit: usize,

    /// Keep only models whose id contains the query
    #[serde(default = "defaults::exact_match")]
    pub exact_match: bool,
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            token: None,
            requests_per_second: defaults::hf_rps(),
            api_base: defaults::hf_api_base(),
            model_limit: defaults::model_limit(),
            exact_match: defaults::exact_match(),
        }
    }
}

/// CSV import settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvConfig {
    /// Platform assigned to imported rows
    #[serde(default = "defaults::csv_platform")]
    pub platform: Platform,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            platform: defaults::csv_platform(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    use super::SearchMode;
    use crate::models::Platform;

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; discussion-fetcher/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }

    // Retry defaults
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn base_delay() -> u64 {
        2_000
    }
    pub fn max_delay() -> u64 {
        10_000
    }
    pub fn rate_limit_cooldown() -> u64 {
        30
    }

    // Storage defaults
    pub fn database_path() -> PathBuf {
        PathBuf::from("data/discussions.db")
    }
    pub fn excluded_authors() -> Vec<String> {
        vec!["[deleted]".into()]
    }

    // Run defaults
    pub fn auto_persist() -> bool {
        true
    }
    pub fn default_query() -> String {
        "ERNIE".into()
    }
    pub fn expand_replies() -> bool {
        true
    }

    // Reddit defaults
    pub fn reddit_user_agent() -> String {
        "discussion-fetcher/0.1 (by /u/discussion-fetcher)".into()
    }
    pub fn reddit_rps() -> f64 {
        1.0
    }
    pub fn subreddits() -> Vec<String> {
        [
            "LocalLLM",
            "LocalLlaMa",
            "ChatGPT",
            "ArtificialIntelligence",
            "OpenSourceeAI",
            "singularity",
            "machinelearningnews",
            "SillyTavernAI",
            "StableDiffusion",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub fn search_mode() -> SearchMode {
        SearchMode::Subreddits
    }
    pub fn sort() -> String {
        "relevance".into()
    }
    pub fn time_filter() -> String {
        "all".into()
    }
    pub fn reddit_auth_url() -> String {
        "https://www.reddit.com/api/v1/access_token".into()
    }
    pub fn reddit_api_base() -> String {
        "https://oauth.reddit.com".into()
    }

    // Browser defaults
    pub fn cookie_path() -> PathBuf {
        PathBuf::from("storage/reddit_cookies.json")
    }
    pub fn browser_rps() -> f64 {
        0.5
    }
    pub fn browser_base_url() -> String {
        "https://www.reddit.com".into()
    }
    pub fn max_scrolls() -> usize {
        50
    }
    pub fn stale_scroll_limit() -> usize {
        3
    }
    pub fn end_markers() -> Vec<String> {
        vec!["No results found".into(), "no more results".into()]
    }
    pub fn bot_markers() -> Vec<String> {
        vec![
            "prove your humanity".into(),
            "g-recaptcha".into(),
            "verify you are human".into(),
        ]
    }
    pub fn rate_limit_markers() -> Vec<String> {
        vec!["whoa there, pardner".into(), "too many requests".into()]
    }

    // HuggingFace defaults
    pub fn hf_rps() -> f64 {
        2.0
    }
    pub fn hf_api_base() -> String {
        "https://huggingface.co".into()
    }
    pub fn model_limit() -> usize {
        20
    }
    pub fn exact_match() -> bool {
        true
    }

    // CSV defaults
    pub fn csv_platform() -> Platform {
        Platform::Twitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reddit.subreddits.len(), 9);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.storage.excluded_authors, vec!["[deleted]"]);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [reddit]
            subreddits = ["rust"]
            search_mode = "global"

            [run]
            days = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.reddit.partitions(), vec!["all".to_string()]);
        assert_eq!(config.reddit.requests_per_second, 1.0);
        assert_eq!(config.run.days, Some(7));
        assert!(config.run.auto_persist);
        assert_eq!(config.huggingface.requests_per_second, 2.0);
    }

    #[test]
    fn test_env_overrides_replace_credentials() {
        let env: HashMap<&str, &str> = [
            ("REDDIT_CLIENT_ID", "id"),
            ("REDDIT_CLIENT_SECRET", "secret"),
            ("HUGGINGFACE_TOKEN", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.reddit.credentials(), Some(("id", "secret")));
        assert_eq!(config.huggingface.token, None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.huggingface.requests_per_second = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reddit.requests_per_second = 1e-20;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reddit.subreddits.clear();
        assert!(config.validate().is_err());
        config.reddit.search_mode = SearchMode::Global;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_created_after_from_days() {
        let now = Utc::now();
        let run = RunConfig {
            days: Some(3),
            ..RunConfig::default()
        };
        assert_eq!(run.created_after(now), Some(now - Duration::days(3)));
        assert_eq!(RunConfig::default().created_after(now), None);
    }
}
