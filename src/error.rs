// src/error.rs

//! Unified error handling for the discussion fetcher.

use std::fmt;

use thiserror::Error;

/// Result type alias for fetcher operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// How the retry policy should treat a failed upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, connection resets, 5xx responses: back off and try again.
    Transient,
    /// The upstream explicitly asked us to slow down.
    RateLimited,
    /// Auth failures, malformed queries, bad data: never retried.
    Fatal,
}

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// SQLite operation failed
    #[error("Storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// CSV reading or writing failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error (missing credentials, invalid values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream rejected our credentials
    #[error("Authentication failed for {platform}: {message}")]
    Auth { platform: String, message: String },

    /// Upstream answered with a non-success status
    #[error("Upstream {context} returned HTTP {status}")]
    Upstream { context: String, status: u16 },

    /// Upstream signalled that we are sending too many requests
    #[error("Rate limited by {0}")]
    RateLimited(String),

    /// Upstream served a bot/CAPTCHA challenge instead of content
    #[error("Bot challenge served for {0}")]
    BotChallenge(String),

    /// Data could not be parsed into a record
    #[error("Parse error: {0}")]
    Parse(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// A collection run is already in progress
    #[error("A collection run is already in progress")]
    RunInProgress,

    /// Background task failed to complete
    #[error("Task error: {0}")]
    Task(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an authentication error.
    pub fn auth(platform: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Auth {
            platform: platform.into(),
            message: message.to_string(),
        }
    }

    /// Create an upstream status error.
    pub fn upstream(context: impl Into<String>, status: u16) -> Self {
        Self::Upstream {
            context: context.into(),
            status,
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl fmt::Display) -> Self {
        Self::Parse(message.to_string())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Default classification used by the retry policy.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Http(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                FailureClass::Transient
            }
            Self::Http(e) => match e.status() {
                Some(status) if status.as_u16() == 429 => FailureClass::RateLimited,
                Some(status) if status.is_server_error() => FailureClass::Transient,
                Some(_) => FailureClass::Fatal,
                // Body decode errors on a truncated response are worth another try.
                None if e.is_body() || e.is_decode() => FailureClass::Transient,
                None => FailureClass::Fatal,
            },
            Self::Upstream { status: 429, .. } | Self::RateLimited(_) => FailureClass::RateLimited,
            Self::Upstream { status, .. } if *status >= 500 => FailureClass::Transient,
            Self::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => FailureClass::Transient,
            _ => FailureClass::Fatal,
        }
    }

    /// One-line summary suitable for a report entry.
    pub fn summary(&self) -> String {
        let text = self.to_string();
        match text.lines().next() {
            Some(line) => line.to_string(),
            None => text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_transient() {
        assert_eq!(
            AppError::upstream("reddit search", 503).failure_class(),
            FailureClass::Transient
        );
        assert_eq!(
            AppError::upstream("reddit search", 500).failure_class(),
            FailureClass::Transient
        );
    }

    #[test]
    fn test_too_many_requests_is_rate_limited() {
        assert_eq!(
            AppError::upstream("hub", 429).failure_class(),
            FailureClass::RateLimited
        );
        assert_eq!(
            AppError::RateLimited("reddit".into()).failure_class(),
            FailureClass::RateLimited
        );
    }

    #[test]
    fn test_client_and_config_errors_are_fatal() {
        assert_eq!(
            AppError::upstream("hub", 404).failure_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            AppError::auth("reddit", "bad secret").failure_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            AppError::config("missing token").failure_class(),
            FailureClass::Fatal
        );
        assert_eq!(
            AppError::BotChallenge("r/rust".into()).failure_class(),
            FailureClass::Fatal
        );
    }
}
