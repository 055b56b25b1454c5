//! Error taxonomy for the ingestion pipeline.

use thiserror::Error;

/// Errors raised while crawling, persisting or dispatching commands.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Connection failures, timeouts and resets.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// The page did not have the expected layout.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid command payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("crawl job not found: {0}")]
    JobNotFound(String),

    #[error("source {source_id} already has active crawl job {job_id}")]
    ActiveJob { source_id: String, job_id: String },

    /// No registered crawler accepts the source (wrong type, inactive, or no base URL).
    #[error("no crawler can handle source {0}")]
    NoCrawler(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl CrawlError {
    /// Whether the queue should re-deliver the command that raised this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CrawlError::Network { .. } => true,
            CrawlError::HttpStatus { status, .. } => {
                matches!(status, 408 | 425 | 429) || *status >= 500
            }
            CrawlError::Storage(_) | CrawlError::Io(_) => true,
            _ => false,
        }
    }

    /// Build a parse error from anything displayable.
    pub fn parse(msg: impl Into<String>) -> Self {
        CrawlError::Parse(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CrawlError>;
