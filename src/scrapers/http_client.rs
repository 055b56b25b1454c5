//! Rate-limited HTTP transport.
//!
//! Clients are built per source so each one carries its own headers, proxy
//! and user agent. Every request first takes a slot from the shared
//! [`RateLimiter`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::rate_limiter::RateLimiter;
use crate::error::{CrawlError, Result};
use crate::models::Source;

const USER_AGENT: &str = "mangacrawl/0.1 (+https://github.com/mangacrawl/mangacrawl)";

/// Real browser user agents for impersonate mode.
const IMPERSONATE_USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Chrome on Android
    "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
];

/// Get a random user agent for impersonate mode.
fn random_user_agent() -> &'static str {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as usize)
        .unwrap_or(0);
    IMPERSONATE_USER_AGENTS[nanos % IMPERSONATE_USER_AGENTS.len()]
}

/// Resolve user agent from config value.
/// - None => default mangacrawl user agent
/// - "impersonate" => random real browser user agent
/// - other => custom user agent string
pub fn resolve_user_agent(config: Option<&str>) -> String {
    match config {
        None => USER_AGENT.to_string(),
        Some("impersonate") => random_user_agent().to_string(),
        Some(custom) => custom.to_string(),
    }
}

/// Produces HTTP clients configured for a source.
pub trait HttpClientFactory: Send + Sync {
    fn create(&self, source: &Source) -> Result<Client>;
}

/// Builds a fresh reqwest client from the source's headers, proxy and user
/// agent.
#[derive(Debug, Clone)]
pub struct DefaultClientFactory {
    timeout: Duration,
    /// Used when the source has no user agent of its own.
    user_agent: Option<String>,
}

impl DefaultClientFactory {
    pub fn new(timeout: Duration, user_agent: Option<String>) -> Self {
        Self {
            timeout,
            user_agent,
        }
    }
}

impl Default for DefaultClientFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), None)
    }
}

impl HttpClientFactory for DefaultClientFactory {
    fn create(&self, source: &Source) -> Result<Client> {
        let agent_config = source.user_agent.as_deref().or(self.user_agent.as_deref());
        let user_agent = resolve_user_agent(agent_config);

        let mut headers = HeaderMap::new();
        for (name, value) in &source.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CrawlError::Client(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| CrawlError::Client(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .user_agent(&user_agent)
            .default_headers(headers)
            .timeout(self.timeout)
            .cookie_store(true)
            .gzip(true)
            .brotli(true);

        if let Some(proxy) = &source.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| CrawlError::Client(format!("invalid proxy for {}: {e}", source.id)))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| CrawlError::Client(e.to_string()))
    }
}

/// Rate-limited GET requests against a source.
#[derive(Clone)]
pub struct SourceFetcher {
    factory: Arc<dyn HttpClientFactory>,
    limiter: RateLimiter,
}

impl SourceFetcher {
    pub fn new(factory: Arc<dyn HttpClientFactory>, limiter: RateLimiter) -> Self {
        Self { factory, limiter }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Fetch a page as text.
    pub async fn get_text(
        &self,
        source: &Source,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let response = self.send(source, url, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(CrawlError::Cancelled),
            body = response.text() => body.map_err(|e| network(url, e)),
        }
    }

    /// Fetch a binary resource.
    pub async fn get_bytes(
        &self,
        source: &Source,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let response = self.send(source, url, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(CrawlError::Cancelled),
            body = response.bytes() => body.map(|b| b.to_vec()).map_err(|e| network(url, e)),
        }
    }

    /// Best-effort reachability check of the source's base URL.
    pub async fn probe(&self, source: &Source) -> bool {
        let cancel = CancellationToken::new();
        match self.send(source, &source.base_url, &cancel).await {
            Ok(_) => true,
            Err(e) => {
                warn!(source = %source.id, error = %e, "connection test failed");
                false
            }
        }
    }

    async fn send(&self, source: &Source, url: &str, cancel: &CancellationToken) -> Result<Response> {
        self.limiter.wait_if_needed(source, cancel).await?;
        let client = self.factory.create(source)?;

        debug!(source = %source.id, url, "GET");
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
            response = client.get(url).send() => response.map_err(|e| network(url, e))?,
        };
        self.limiter.register_request(&source.id);

        let status = response.status();
        if !status.is_success() {
            debug!(source = %source.id, url, status = status.as_u16(), "non-success status");
            return Err(CrawlError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

fn network(url: &str, source: reqwest::Error) -> CrawlError {
    CrawlError::Network {
        url: url.to_string(),
        source,
    }
}
