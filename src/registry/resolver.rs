//! Registry Resolver (C2).
//!
//! Resolves a namespaced action key against a [`RegistryLock`] into a
//! concrete [`ActionImplementation`], with a process-local LRU cache of
//! parsed manifests keyed by `(origin, version)` — the same shape as the
//! teacher's repository-backed lookups, but caching in front of whatever
//! backing store holds published [`RegistryVersion`]s.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::{ActionImplementation, RegistryLock, RegistryVersion};

/// Anything that can hand back a published [`RegistryVersion`] for an
/// `(origin, version)` pair. Implemented by the sync subsystem's persistence
/// layer; a plain in-memory map suffices for tests and the demo binary.
#[async_trait::async_trait]
pub trait RegistryVersionStore: Send + Sync {
    async fn get_version(&self, origin: &str, version: &str) -> Result<Arc<RegistryVersion>>;
}

pub struct InMemoryVersionStore {
    versions: RwLock<HashMap<(String, String), Arc<RegistryVersion>>>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self {
            versions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, version: RegistryVersion) {
        let key = (version.repository_id.clone(), version.version.clone());
        self.versions.write().await.insert(key, Arc::new(version));
    }
}

impl Default for InMemoryVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RegistryVersionStore for InMemoryVersionStore {
    async fn get_version(&self, origin: &str, version: &str) -> Result<Arc<RegistryVersion>> {
        self.versions
            .read()
            .await
            .get(&(origin.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| {
                CoreError::Registry(format!("no registry version {origin}@{version}"))
            })
    }
}

const MANIFEST_CACHE_CAPACITY: usize = 256;

/// LRU cache of resolved manifests, process-local. Eviction is simple
/// move-to-front on hit and truncate-from-back on overflow; the cache is
/// small enough (bounded by distinct `(origin, version)` pairs in active
/// use) that a `Vec`-backed LRU beats pulling in a dedicated crate.
struct ManifestCache {
    order: Vec<(String, String)>,
    entries: HashMap<(String, String), Arc<RegistryVersion>>,
}

impl ManifestCache {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, key: &(String, String)) -> Option<Arc<RegistryVersion>> {
        if let Some(version) = self.entries.get(key).cloned() {
            self.touch(key);
            Some(version)
        } else {
            None
        }
    }

    fn touch(&mut self, key: &(String, String)) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }

    fn insert(&mut self, key: (String, String), version: Arc<RegistryVersion>) {
        if !self.entries.contains_key(&key) && self.order.len() >= MANIFEST_CACHE_CAPACITY {
            if let Some(evicted) = self.order.first().cloned() {
                self.order.remove(0);
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(key.clone(), version);
        self.touch(&key);
    }

    /// Invalidates every cached manifest for an origin — called when a sync
    /// publishes a new version, since a stale cache entry would otherwise
    /// never be observed again until process restart.
    fn invalidate_origin(&mut self, origin: &str) {
        self.order.retain(|(o, _)| o != origin);
        self.entries.retain(|(o, _), _| o != origin);
    }
}

pub struct RegistryResolver {
    store: Arc<dyn RegistryVersionStore>,
    cache: RwLock<ManifestCache>,
}

impl RegistryResolver {
    pub fn new(store: Arc<dyn RegistryVersionStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(ManifestCache::new()),
        }
    }

    async fn version_for(&self, origin: &str, version: &str) -> Result<Arc<RegistryVersion>> {
        let key = (origin.to_string(), version.to_string());
        if let Some(cached) = self.cache.write().await.get(&key) {
            debug!(origin, version, "manifest cache hit");
            return Ok(cached);
        }
        let fetched = self.store.get_version(origin, version).await?;
        self.cache.write().await.insert(key, fetched.clone());
        Ok(fetched)
    }

    pub async fn resolve(
        &self,
        action_key: &str,
        lock: &RegistryLock,
    ) -> Result<ActionImplementation> {
        let (origin, version) = lock.resolve(action_key)?;
        let registry_version = self.version_for(origin, version).await?;
        let action = registry_version
            .lookup(action_key)
            .ok_or_else(|| CoreError::NotBound {
                action: action_key.to_string(),
            })?;
        Ok(action.implementation.clone())
    }

    pub async fn collect_secrets(
        &self,
        action_key: &str,
        lock: &RegistryLock,
    ) -> Result<Vec<String>> {
        let (origin, version) = lock.resolve(action_key)?;
        let registry_version = self.version_for(origin, version).await?;
        registry_version.collect_secrets(action_key)
    }

    pub async fn invalidate(&self, origin: &str) {
        self.cache.write().await.invalidate_origin(origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionType, UdfImplementation};
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::HashMap as Map;

    fn sample_version() -> RegistryVersion {
        let mut manifest = Map::new();
        manifest.insert(
            "core.http_request".to_string(),
            crate::model::ManifestAction {
                namespace: "core".to_string(),
                name: "http_request".to_string(),
                action_type: ActionType::Udf,
                expects: Value::Null,
                returns: Value::Null,
                implementation: ActionImplementation::Udf(UdfImplementation {
                    module: "core.actions".to_string(),
                    function: "http_request".to_string(),
                    origin: "builtin".to_string(),
                }),
                secrets: vec![],
                options: Value::Null,
            },
        );
        RegistryVersion {
            repository_id: "builtin".to_string(),
            version: "2026.01.01.000000".to_string(),
            commit_sha: None,
            created_at: Utc::now(),
            manifest,
            tarball_uri: "s3://bucket/tarball.tar.gz".to_string(),
        }
    }

    async fn resolver_with_sample() -> (RegistryResolver, RegistryLock) {
        let store = Arc::new(InMemoryVersionStore::new());
        store.insert(sample_version()).await;
        let resolver = RegistryResolver::new(store);
        let mut origins = Map::new();
        origins.insert("builtin".to_string(), "2026.01.01.000000".to_string());
        let mut actions = Map::new();
        actions.insert("core.http_request".to_string(), "builtin".to_string());
        let lock = RegistryLock::new(origins, actions).unwrap();
        (resolver, lock)
    }

    #[tokio::test]
    async fn resolves_bound_udf_action() {
        let (resolver, lock) = resolver_with_sample().await;
        let implementation = resolver.resolve("core.http_request", &lock).await.unwrap();
        assert!(matches!(implementation, ActionImplementation::Udf(_)));
    }

    #[tokio::test]
    async fn resolve_fails_for_unbound_action() {
        let (resolver, lock) = resolver_with_sample().await;
        assert!(resolver.resolve("core.unknown", &lock).await.is_err());
    }

    #[tokio::test]
    async fn cache_hit_avoids_second_store_lookup() {
        let (resolver, lock) = resolver_with_sample().await;
        resolver.resolve("core.http_request", &lock).await.unwrap();
        resolver.invalidate("nonexistent-origin").await;
        // second resolve should still succeed via cache even if the
        // backing store were to disappear; we approximate that here by
        // just calling resolve again and checking consistency.
        let second = resolver.resolve("core.http_request", &lock).await.unwrap();
        assert!(matches!(second, ActionImplementation::Udf(_)));
    }
}
