//! HTTP data source client.
//!
//! One client serves every configured platform; platforms differ only by
//! base URL, path templates and where the item array sits in the payload.
//! Successful responses are cached for the configured TTL and requests to a
//! platform are spaced by its `min_interval_ms`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clubsync_core::config::{ClubSyncConfig, SourceConfig};
use clubsync_core::error::{ClubSyncError, Result};
use clubsync_core::traits::{DataSource, EntityDescriptor};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cache::ResponseCache;

/// Data source backed by the platforms' HTTP APIs.
pub struct HttpDataSource {
    sources: BTreeMap<String, SourceConfig>,
    client: reqwest::Client,
    cache: ResponseCache,
    /// Last request instant per platform.
    throttles: HashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl HttpDataSource {
    pub fn new(sources: BTreeMap<String, SourceConfig>, cache_ttl: Duration) -> Self {
        let throttles = sources
            .keys()
            .map(|platform| (platform.clone(), Arc::new(Mutex::new(None))))
            .collect();
        Self {
            sources,
            client: reqwest::Client::new(),
            cache: ResponseCache::new(cache_ttl),
            throttles,
        }
    }

    /// Build from the root config (`[sources.*]` + `[cache]`).
    pub fn from_config(config: &ClubSyncConfig) -> Self {
        Self::new(
            config.sources.clone(),
            Duration::from_secs(config.cache.ttl_secs),
        )
    }

    /// Configured platform names.
    pub fn platforms(&self) -> Vec<&str> {
        self.sources.keys().map(String::as_str).collect()
    }

    fn source(&self, platform: &str) -> Result<&SourceConfig> {
        self.sources.get(platform).ok_or_else(|| {
            ClubSyncError::Configuration(format!("No data source configured for '{platform}'"))
        })
    }

    /// Wait until this platform's minimum request spacing has elapsed.
    async fn throttle(&self, platform: &str, source: &SourceConfig) {
        let Some(slot) = self.throttles.get(platform) else {
            return;
        };
        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            let min_gap = Duration::from_millis(source.min_interval_ms);
            let elapsed = prev.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_json(
        &self,
        platform: &str,
        source: &SourceConfig,
        url: &str,
    ) -> Result<Option<Value>> {
        self.throttle(platform, source).await;

        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(source.timeout_secs));
        if let Some(agent) = &source.user_agent {
            req = req.header("User-Agent", agent.as_str());
        }

        let resp = req.send().await.map_err(|e| ClubSyncError::ExternalFetch {
            platform: platform.to_string(),
            message: format!("Request to {url} failed: {e}"),
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClubSyncError::ExternalFetch {
                platform: platform.to_string(),
                message: format!("HTTP {status} from {url}: {}", truncate(&body, 200)),
            });
        }

        let json = resp
            .json::<Value>()
            .await
            .map_err(|e| ClubSyncError::ExternalFetch {
                platform: platform.to_string(),
                message: format!("Invalid JSON from {url}: {e}"),
            })?;
        Ok(Some(json))
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn lookup(&self, name: &str, platform: &str) -> Result<Option<EntityDescriptor>> {
        if let Some(hit) = self.cache.lookup(name, platform).await {
            tracing::debug!("🗃️ Lookup cache hit: {platform}/{name}");
            return Ok(hit);
        }

        let source = self.source(platform)?;
        let url = source.lookup_url(name);
        let descriptor = self
            .get_json(platform, source, &url)
            .await?
            .map(|raw| EntityDescriptor {
                key: name.to_string(),
                name: raw
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(name)
                    .to_string(),
                platform: platform.to_string(),
                raw,
            });

        self.cache
            .insert_lookup(name, platform, descriptor.clone())
            .await;
        Ok(descriptor)
    }

    async fn fetch_items(
        &self,
        entity_key: &str,
        platform: &str,
        task_type: &str,
    ) -> Result<Vec<Value>> {
        if let Some(hit) = self.cache.items(entity_key, platform, task_type).await {
            tracing::debug!("🗃️ Items cache hit: {platform}/{entity_key}/{task_type}");
            return Ok(hit);
        }

        let source = self.source(platform)?;
        let url = source.items_url(entity_key, task_type);
        let Some(body) = self.get_json(platform, source, &url).await? else {
            return Err(ClubSyncError::ExternalFetch {
                platform: platform.to_string(),
                message: format!("{url} returned 404"),
            });
        };

        let items = extract_items(&body, source.items_pointer(task_type)).ok_or_else(|| {
            ClubSyncError::ExternalFetch {
                platform: platform.to_string(),
                message: format!(
                    "Expected an array at '{}' in response from {url}",
                    source.items_pointer(task_type)
                ),
            }
        })?;

        tracing::debug!(
            "📦 Fetched {} items: {platform}/{entity_key}/{task_type}",
            items.len()
        );
        self.cache
            .insert_items(entity_key, platform, task_type, items.clone())
            .await;
        Ok(items)
    }
}

/// Pull the item array out of a vendor payload.
fn extract_items(body: &Value, pointer: &str) -> Option<Vec<Value>> {
    let node = if pointer.is_empty() {
        Some(body)
    } else {
        body.pointer(pointer)
    };
    node.and_then(Value::as_array).cloned()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
