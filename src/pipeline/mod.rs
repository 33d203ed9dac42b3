// src/pipeline/mod.rs

//! Run-level building blocks.
//!
//! - `throttle`: per-platform minimum interval between upstream calls
//! - `retry`: backoff and rate-limit cooldown around a single call
//! - `orchestrator`: sequences collectors and persists their output
//! - `import`: CSV import entry point

pub mod import;
pub mod orchestrator;
pub mod retry;
pub mod throttle;

pub use import::{ImportReport, import_csv};
pub use orchestrator::Orchestrator;
pub use retry::{RetryEvent, RetryPolicy};
pub use throttle::RateLimiter;
