//! DID → handle resolution.
//!
//! Used only when handle resolution is enabled. A lookup that fails or
//! times out yields `None`; the caller then falls back to the raw DID.

use crate::{Error, Result};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Resolves an account DID to its current handle.
#[async_trait]
pub trait HandleResolver: Send + Sync {
    /// Handle for `did`, or `None` if it cannot be resolved right now.
    async fn resolve(&self, did: &str) -> Option<String>;
}

/// Default AppView used for profile lookups.
pub const DEFAULT_HANDLE_SERVICE: &str = "https://public.api.bsky.app";

const GET_PROFILE: &str = "xrpc/app.bsky.actor.getProfile";

/// Configuration for [`XrpcHandleResolver`].
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Base URL of the service answering `app.bsky.actor.getProfile`.
    pub service_url: String,

    /// Upper bound for one lookup, including waiting for a permit.
    /// Default: 2s
    pub timeout: Duration,

    /// Cached handles.
    /// Default: 100,000
    pub cache_capacity: u64,

    /// How long a cached handle stays valid.
    /// Default: 6h
    pub cache_ttl: Duration,

    /// Lookups in flight at once.
    /// Default: 10
    pub max_concurrent: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_HANDLE_SERVICE.to_string(),
            timeout: Duration::from_secs(2),
            cache_capacity: 100_000,
            cache_ttl: Duration::from_secs(6 * 3600),
            max_concurrent: 10,
        }
    }
}

#[derive(Deserialize)]
struct Profile {
    handle: String,
}

/// Resolver backed by the XRPC `getProfile` endpoint, with a TTL cache.
pub struct XrpcHandleResolver {
    client: reqwest::Client,
    endpoint: Url,
    cache: Cache<String, String>,
    permits: Semaphore,
    timeout: Duration,
}

impl XrpcHandleResolver {
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        let endpoint = Url::parse(&format!(
            "{}/{}",
            config.service_url.trim_end_matches('/'),
            GET_PROFILE
        ))
        .map_err(|e| Error::Config(format!("invalid handle service '{}': {e}", config.service_url)))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("jetarchive/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();

        tracing::info!(
            endpoint = %endpoint,
            cache_capacity = config.cache_capacity,
            cache_ttl_secs = config.cache_ttl.as_secs(),
            "handle resolver initialized"
        );

        Ok(Self {
            client,
            endpoint,
            cache,
            permits: Semaphore::new(config.max_concurrent.max(1)),
            timeout: config.timeout,
        })
    }

    async fn fetch(&self, did: &str) -> Result<String> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::Task(e.to_string()))?;

        let profile: Profile = self
            .client
            .get(self.endpoint.clone())
            .query(&[("actor", did)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(profile.handle)
    }
}

fn record_lookup(result: &'static str) {
    metrics::counter!("archive_handle_lookups_total", "result" => result).increment(1);
}

#[async_trait]
impl HandleResolver for XrpcHandleResolver {
    async fn resolve(&self, did: &str) -> Option<String> {
        if let Some(handle) = self.cache.get(did).await {
            record_lookup("cached");
            return Some(handle);
        }

        match tokio::time::timeout(self.timeout, self.fetch(did)).await {
            Ok(Ok(handle)) => {
                record_lookup("resolved");
                self.cache.insert(did.to_string(), handle.clone()).await;
                Some(handle)
            }
            Ok(Err(e)) => {
                record_lookup("error");
                debug!(did, "Handle lookup failed: {}", e);
                None
            }
            Err(_) => {
                record_lookup("timeout");
                debug!(did, "Handle lookup timed out");
                None
            }
        }
    }
}
