//! Time-bounded response cache.
//!
//! Lookups and item lists are cached separately, keyed by
//! (key, platform[, task type]). Entries expire by age only; there is no
//! capacity bound. Uses [`moka`] so expired entries are evicted without a
//! manual sweep.

use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;

use clubsync_core::traits::EntityDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    name: String,
    platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ItemsKey {
    entity_key: String,
    platform: String,
    task_type: String,
}

/// Per-client cache of upstream responses.
pub struct ResponseCache {
    lookups: Cache<LookupKey, Option<EntityDescriptor>>,
    items: Cache<ItemsKey, Vec<Value>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            lookups: Cache::builder().time_to_live(ttl).build(),
            items: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// `Some(None)` is a cached "not found".
    pub async fn lookup(&self, name: &str, platform: &str) -> Option<Option<EntityDescriptor>> {
        self.lookups.get(&lookup_key(name, platform)).await
    }

    pub async fn insert_lookup(
        &self,
        name: &str,
        platform: &str,
        descriptor: Option<EntityDescriptor>,
    ) {
        self.lookups
            .insert(lookup_key(name, platform), descriptor)
            .await;
    }

    pub async fn items(
        &self,
        entity_key: &str,
        platform: &str,
        task_type: &str,
    ) -> Option<Vec<Value>> {
        self.items
            .get(&items_key(entity_key, platform, task_type))
            .await
    }

    pub async fn insert_items(
        &self,
        entity_key: &str,
        platform: &str,
        task_type: &str,
        items: Vec<Value>,
    ) {
        self.items
            .insert(items_key(entity_key, platform, task_type), items)
            .await;
    }
}

fn lookup_key(name: &str, platform: &str) -> LookupKey {
    LookupKey {
        name: name.to_string(),
        platform: platform.to_string(),
    }
}

fn items_key(entity_key: &str, platform: &str, task_type: &str) -> ItemsKey {
    ItemsKey {
        entity_key: entity_key.to_string(),
        platform: platform.to_string(),
        task_type: task_type.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(key: &str) -> EntityDescriptor {
        EntityDescriptor {
            key: key.to_string(),
            name: key.to_uppercase(),
            platform: "chesscom".into(),
            raw: json!({ "name": key }),
        }
    }

    #[tokio::test]
    async fn test_items_are_keyed_by_task_type_and_platform() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache
            .insert_items("team-a", "chesscom", "members", vec![json!(1), json!(2)])
            .await;

        assert_eq!(
            cache.items("team-a", "chesscom", "members").await.map(|v| v.len()),
            Some(2)
        );
        assert!(cache.items("team-a", "chesscom", "matches").await.is_none());
        assert!(cache.items("team-a", "lichess", "members").await.is_none());
    }

    #[tokio::test]
    async fn test_negative_lookup_is_cached() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        assert!(cache.lookup("ghost", "chesscom").await.is_none());

        cache.insert_lookup("ghost", "chesscom", None).await;
        cache
            .insert_lookup("team-a", "chesscom", Some(descriptor("team-a")))
            .await;

        assert_eq!(cache.lookup("ghost", "chesscom").await, Some(None));
        let hit = cache.lookup("team-a", "chesscom").await.unwrap().unwrap();
        assert_eq!(hit.name, "TEAM-A");
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_millis(100));
        cache
            .insert_items("team-a", "chesscom", "members", vec![json!(1)])
            .await;
        assert!(cache.items("team-a", "chesscom", "members").await.is_some());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(cache.items("team-a", "chesscom", "members").await.is_none());
    }
}
