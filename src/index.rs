//! Bounded, read-through caches for channel identity lookups.
//!
//! Each lookup dimension (internal id, stable uuid, name) has its own
//! independent size-evicting cache. Negative results are cached too, so a
//! repeated lookup of a nonexistent channel does not hammer the backing
//! store. Entries are immutable snapshots: nothing here is invalidated by
//! pending-operation activity, so callers needing fresh-after-write
//! semantics must query the store directly or commit first.
//!
//! Duplicate concurrent misses for the same key may each query the store
//! once; the last result wins. That race is harmless and not worth a
//! single-flight mechanism at this scale.

use crate::error::StoreError;
use crate::model::{ChannelId, ChannelSummary};
use crate::store::{ChannelStore, SearchType};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use uuid::Uuid;

/// Default capacity of each lookup cache.
pub const DEFAULT_LOOKUP_CAPACITY: usize = 1000;

/// Cached channel identity resolution over a [`ChannelStore`].
pub struct ChannelIndex {
    store: Arc<dyn ChannelStore>,
    by_id: Mutex<LruCache<ChannelId, Option<ChannelSummary>>>,
    by_uuid: Mutex<LruCache<Uuid, Option<ChannelSummary>>>,
    by_name: Mutex<LruCache<String, Option<ChannelSummary>>>,
}

impl ChannelIndex {
    /// Create an index with [`DEFAULT_LOOKUP_CAPACITY`] per cache.
    pub fn new(store: Arc<dyn ChannelStore>) -> Self {
        Self::with_capacity(store, DEFAULT_LOOKUP_CAPACITY)
    }

    /// Create an index with the given per-cache capacity (minimum 1).
    pub fn with_capacity(store: Arc<dyn ChannelStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            by_id: Mutex::new(LruCache::new(capacity)),
            by_uuid: Mutex::new(LruCache::new(capacity)),
            by_name: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn lookup_by_id(
        &self,
        id: ChannelId,
    ) -> Result<Option<ChannelSummary>, StoreError> {
        let cached = self.by_id.lock().get(&id).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        // Populate failures surface to the caller and are not cached.
        let fetched = self.store.lookup_by_id(id).await?;
        self.by_id.lock().put(id, fetched.clone());
        Ok(fetched)
    }

    pub async fn lookup_by_uuid(
        &self,
        uuid: Uuid,
    ) -> Result<Option<ChannelSummary>, StoreError> {
        let cached = self.by_uuid.lock().get(&uuid).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let fetched = self.store.lookup_by_uuid(uuid).await?;
        self.by_uuid.lock().put(uuid, fetched.clone());
        Ok(fetched)
    }

    /// Case-insensitive cached name lookup.
    pub async fn lookup_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ChannelSummary>, StoreError> {
        let cache_key = name.to_lowercase();
        let cached = self.by_name.lock().get(&cache_key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }
        let fetched = self.store.lookup_by_name(name).await?;
        self.by_name.lock().put(cache_key, fetched.clone());
        Ok(fetched)
    }

    /// Whether a channel with this internal id exists, via the id cache.
    pub async fn channel_exists(&self, id: ChannelId) -> Result<bool, StoreError> {
        Ok(self.lookup_by_id(id).await?.is_some())
    }

    /// Search is unbounded in term space and always hits the store.
    pub async fn search(
        &self,
        term: &str,
        search: SearchType,
        limit: usize,
    ) -> Result<Vec<ChannelSummary>, StoreError> {
        self.store.search(term, search, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChannelDetails;
    use crate::store::memory::MemoryChannelStore;

    async fn index_with_channel(name: &str) -> (Arc<MemoryChannelStore>, ChannelIndex, ChannelId) {
        let store = Arc::new(MemoryChannelStore::new());
        let id = store
            .create_channel(&ChannelDetails {
                name: name.to_string(),
                owner: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        store.clear_calls();
        let index = ChannelIndex::new(Arc::clone(&store) as Arc<dyn ChannelStore>);
        (store, index, id)
    }

    #[tokio::test]
    async fn hit_after_miss_queries_store_once() {
        let (store, index, id) = index_with_channel("General").await;

        let first = index.lookup_by_id(id).await.unwrap().unwrap();
        let second = index.lookup_by_id(id).await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count_op("lookup_by_id"), 1);
    }

    #[tokio::test]
    async fn negative_results_are_memoized() {
        let (store, index, _) = index_with_channel("General").await;

        assert!(index.lookup_by_name("missing").await.unwrap().is_none());
        assert!(index.lookup_by_name("missing").await.unwrap().is_none());
        assert_eq!(store.count_op("lookup_by_name"), 1);
    }

    #[tokio::test]
    async fn name_cache_is_case_insensitive() {
        let (store, index, id) = index_with_channel("General").await;

        assert_eq!(index.lookup_by_name("General").await.unwrap().unwrap().id, id);
        assert_eq!(index.lookup_by_name("GENERAL").await.unwrap().unwrap().id, id);
        assert_eq!(store.count_op("lookup_by_name"), 1);
    }

    #[tokio::test]
    async fn cache_does_not_see_uncommitted_state() {
        let (store, index, id) = index_with_channel("Before").await;

        // Cache the current name, then change it behind the cache's back.
        assert!(index.lookup_by_name("Before").await.unwrap().is_some());
        let mut details = store.channel_details(id).await.unwrap();
        details.name = "After".to_string();
        store.update_details(&details).await.unwrap();

        // The stale snapshot is still served; a direct store read is fresh.
        assert!(index.lookup_by_name("Before").await.unwrap().is_some());
        assert_eq!(store.lookup_by_name("After").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn capacity_eviction_requeries_the_store() {
        let store = Arc::new(MemoryChannelStore::new());
        for name in ["one", "two", "three"] {
            store
                .create_channel(&ChannelDetails {
                    name: name.to_string(),
                    owner: 1,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        store.clear_calls();
        let index = ChannelIndex::with_capacity(Arc::clone(&store) as Arc<dyn ChannelStore>, 2);

        index.lookup_by_name("one").await.unwrap();
        index.lookup_by_name("two").await.unwrap();
        index.lookup_by_name("three").await.unwrap(); // evicts "one"
        index.lookup_by_name("one").await.unwrap(); // miss again
        assert_eq!(store.count_op("lookup_by_name"), 4);
    }

    #[tokio::test]
    async fn exists_rides_the_id_cache() {
        let (store, index, id) = index_with_channel("General").await;

        assert!(index.channel_exists(id).await.unwrap());
        assert!(index.channel_exists(id).await.unwrap());
        assert!(!index.channel_exists(id + 50).await.unwrap());
        assert_eq!(store.count_op("lookup_by_id"), 2);
    }

    #[tokio::test]
    async fn populate_failures_surface_and_are_not_cached() {
        let (store, index, id) = index_with_channel("General").await;

        store.set_fail_connections(true);
        assert!(index.lookup_by_id(id).await.is_err());

        store.set_fail_connections(false);
        assert!(index.lookup_by_id(id).await.unwrap().is_some());
        // Both attempts reached the store: the error was not cached.
        assert_eq!(store.count_op("lookup_by_id"), 2);
    }
}
