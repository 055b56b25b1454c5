//! Rate-limited manga catalog ingestion.
//!
//! Crawl runs are split into stage commands (list → manga → chapter → page)
//! that travel through a durable queue and are executed by a worker pool.
//! Every request to a source passes through its rate limiter.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod runtime;
pub mod schema;
pub mod scrapers;
pub mod services;

pub use error::{CrawlError, Result};
