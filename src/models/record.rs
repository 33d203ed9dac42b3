// src/models/record.rs

//! Unified discussion record shared by every collector.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Platforms a record can originate from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Reddit,
    HuggingFace,
    Twitter,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Reddit => "reddit",
            Platform::HuggingFace => "huggingface",
            Platform::Twitter => "twitter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "reddit" => Some(Platform::Reddit),
            "huggingface" | "hf" => Some(Platform::HuggingFace),
            "twitter" | "x" => Some(Platform::Twitter),
            _ => None,
        }
    }

    pub fn all() -> &'static [Platform] {
        &[Platform::Reddit, Platform::HuggingFace, Platform::Twitter]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of content a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Post,
    Comment,
    Discussion,
    Reply,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Post => "post",
            ContentKind::Comment => "comment",
            ContentKind::Discussion => "discussion",
            ContentKind::Reply => "reply",
        }
    }

    pub fn all() -> &'static [ContentKind] {
        &[
            ContentKind::Post,
            ContentKind::Comment,
            ContentKind::Discussion,
            ContentKind::Reply,
        ]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "post" => Some(ContentKind::Post),
            "comment" => Some(ContentKind::Comment),
            "discussion" => Some(ContentKind::Discussion),
            "reply" => Some(ContentKind::Reply),
            _ => None,
        }
    }

    /// Top-level content that can own replies.
    pub fn is_thread_root(&self) -> bool {
        matches!(self, ContentKind::Post | ContentKind::Discussion)
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value of a platform-specific attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            AttrValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

/// Open mapping of platform-specific fields, ordered for stable hashing.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Build the deduplication key for a platform-native identifier.
pub fn composite_key(platform: Platform, native_id: &str) -> String {
    format!("{}:{}", platform.as_str(), native_id.trim())
}

/// Placeholders upstreams use in place of a real author handle.
const AUTHOR_PLACEHOLDERS: &[&str] = &["[deleted]", "[removed]", "unknown"];

/// Normalize a raw author handle: blank or placeholder handles become `None`.
pub fn normalize_author(raw: Option<&str>) -> Option<String> {
    let handle = raw?.trim();
    if handle.is_empty()
        || AUTHOR_PLACEHOLDERS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(handle))
    {
        return None;
    }
    Some(handle.to_string())
}

/// A discussion item from any platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub platform: Platform,

    /// Platform-assigned identifier, unique within the platform
    pub native_id: String,

    pub content_kind: ContentKind,

    #[serde(default)]
    pub title: Option<String>,

    pub body: String,

    /// `None` when the upstream omitted or obscured the author
    #[serde(default)]
    pub author: Option<String>,

    pub url: String,

    pub created_at: DateTime<Utc>,

    /// True when the source timestamp had no offset and was read as UTC
    #[serde(default)]
    pub created_at_approximate: bool,

    /// Assigned by the store on write; collectors leave this empty
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,

    /// Native id of the post/discussion this item replies to
    #[serde(default)]
    pub parent_native_id: Option<String>,

    #[serde(default)]
    pub extra: Attributes,

    #[serde(default)]
    pub search_tags: BTreeSet<String>,
}

impl UnifiedRecord {
    pub fn new(
        platform: Platform,
        native_id: impl Into<String>,
        content_kind: ContentKind,
        body: impl Into<String>,
        url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            platform,
            native_id: native_id.into(),
            content_kind,
            title: None,
            body: body.into(),
            author: None,
            url: url.into(),
            created_at,
            created_at_approximate: false,
            fetched_at: None,
            parent_native_id: None,
            extra: Attributes::new(),
            search_tags: BTreeSet::new(),
        }
    }

    pub fn with_title(mut self, title: Option<impl Into<String>>) -> Self {
        self.title = title.map(Into::into).filter(|t: &String| !t.trim().is_empty());
        self
    }

    /// Set the author, normalizing placeholders to `None`.
    pub fn with_author(mut self, author: Option<&str>) -> Self {
        self.author = normalize_author(author);
        self
    }

    pub fn with_parent(mut self, parent: Option<impl Into<String>>) -> Self {
        self.parent_native_id = parent.map(Into::into).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn approximate(mut self, approximate: bool) -> Self {
        self.created_at_approximate = approximate;
        self
    }

    /// Insert an attribute; `None` values are left out.
    pub fn with_attr(mut self, key: &str, value: Option<impl Into<AttrValue>>) -> Self {
        if let Some(value) = value {
            self.extra.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        let tag = tag.trim();
        if !tag.is_empty() {
            self.search_tags.insert(tag.to_string());
        }
        self
    }

    pub fn composite_key(&self) -> String {
        composite_key(self.platform, &self.native_id)
    }

    /// Fingerprint of the mutable content, used to tell real edits from refetches.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.title.as_deref().unwrap_or(""),
            &self.body,
            self.author.as_deref().unwrap_or(""),
            &self.url,
            self.parent_native_id.as_deref().unwrap_or(""),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update(self.content_kind.as_str().as_bytes());
        if let Ok(extra) = serde_json::to_vec(&self.extra) {
            hasher.update(&extra);
        }
        hex::encode(hasher.finalize())
    }

    /// Convenience accessor for the common `score` attribute.
    pub fn score(&self) -> Option<i64> {
        self.extra.get("score").and_then(AttrValue::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> UnifiedRecord {
        UnifiedRecord::new(
            Platform::Reddit,
            "abc123",
            ContentKind::Post,
            "hello",
            "https://reddit.com/r/LocalLLM/comments/abc123",
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_composite_key_joins_platform_and_native_id() {
        assert_eq!(sample().composite_key(), "reddit:abc123");
        assert_eq!(
            composite_key(Platform::HuggingFace, " baidu/ERNIE_7 "),
            "huggingface:baidu/ERNIE_7"
        );
    }

    #[test]
    fn test_placeholder_authors_normalize_to_none() {
        assert_eq!(normalize_author(Some("[deleted]")), None);
        assert_eq!(normalize_author(Some("  ")), None);
        assert_eq!(normalize_author(None), None);
        assert_eq!(normalize_author(Some(" alice ")), Some("alice".to_string()));
    }

    #[test]
    fn test_tags_are_trimmed_and_deduplicated() {
        let record = sample().with_tag("ERNIE").with_tag(" ERNIE ").with_tag("");
        assert_eq!(record.search_tags.len(), 1);
        assert!(record.search_tags.contains("ERNIE"));
    }

    #[test]
    fn test_content_hash_ignores_tags_but_tracks_body() {
        let base = sample();
        let tagged = sample().with_tag("GPT");
        let mut edited = sample();
        edited.body = "hello edited".into();

        assert_eq!(base.content_hash(), tagged.content_hash());
        assert_ne!(base.content_hash(), edited.content_hash());
    }

    #[test]
    fn test_attributes_skip_missing_values() {
        let record = sample()
            .with_attr("score", Some(42i64))
            .with_attr("link_flair_text", None::<String>);
        assert_eq!(record.score(), Some(42));
        assert!(!record.extra.contains_key("link_flair_text"));
    }

    #[test]
    fn test_platform_round_trips_through_str() {
        for platform in Platform::all() {
            assert_eq!(Platform::parse(platform.as_str()), Some(*platform));
        }
        assert_eq!(Platform::parse("zhihu"), None);
    }
}
