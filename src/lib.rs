// src/lib.rs

//! Discussion fetcher library.
//!
//! Collects discussion posts and comments about a search topic from Reddit,
//! HuggingFace and exported CSV files into one deduplicated SQLite store.

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
