//! Cache wrapper (§9/§11): per-key coalescing lock preventing stampede,
//! dual-read (cache then inner, populating on miss), write-through on
//! `set`. Tracks `(key, type-tag)` pairs in a side index so `delete`
//! invalidates every cached representation of a key — the recorded
//! decision for the "what does the cache know it has cached" open question.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::base::{open_transaction, DataStore, Transaction};
use crate::error::Result;

const RAW_TAG: &str = "__raw__";

fn cache_key(key: &str, type_tag: &str) -> String {
    format!("{key}\u{0}{type_tag}")
}

pub struct CachingStore {
    inner: Arc<dyn DataStore>,
    cache: DashMap<String, Vec<u8>>,
    /// key -> every cache-key currently populated for it, across type tags.
    type_index: DashMap<String, DashSet<String>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CachingStore {
    pub fn new(inner: Arc<dyn DataStore>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            type_index: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn key_lock(&self, cache_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(cache_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn index(&self, key: &str, cache_key: &str) {
        self.type_index
            .entry(key.to_string())
            .or_insert_with(DashSet::new)
            .insert(cache_key.to_string());
    }

    fn invalidate(&self, key: &str) {
        if let Some((_, tags)) = self.type_index.remove(key) {
            for tag in tags.iter() {
                self.cache.remove(tag.key());
            }
        }
    }

    /// Typed read through the cache, tagged separately from the raw-bytes
    /// entry so a `get` and a `get_typed::<T>` on the same key can coexist
    /// without clobbering each other.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str, type_tag: &str) -> Result<Option<T>> {
        let ck = cache_key(key, type_tag);
        if let Some(bytes) = self.cache.get(&ck) {
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        let lock = self.key_lock(&ck);
        let _guard = lock.lock().await;
        if let Some(bytes) = self.cache.get(&ck) {
            return Ok(Some(serde_json::from_slice(&bytes)?));
        }

        match self.inner.get(key).await? {
            Some(bytes) => {
                let value: T = serde_json::from_slice(&bytes)?;
                self.cache.insert(ck.clone(), bytes);
                self.index(key, &ck);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_typed<T: Serialize + Sync>(&self, key: &str, type_tag: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.set(key, bytes.clone()).await?;
        let ck = cache_key(key, type_tag);
        self.cache.insert(ck.clone(), bytes);
        self.index(key, &ck);
        Ok(())
    }
}

#[async_trait]
impl DataStore for CachingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let ck = cache_key(key, RAW_TAG);
        if let Some(bytes) = self.cache.get(&ck) {
            return Ok(Some(bytes.clone()));
        }

        let lock = self.key_lock(&ck);
        let _guard = lock.lock().await;
        if let Some(bytes) = self.cache.get(&ck) {
            return Ok(Some(bytes.clone()));
        }

        let value = self.inner.get(key).await?;
        if let Some(ref bytes) = value {
            self.cache.insert(ck.clone(), bytes.clone());
            self.index(key, &ck);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set(key, value.clone()).await?;
        let ck = cache_key(key, RAW_TAG);
        self.cache.insert(ck.clone(), value);
        self.index(key, &ck);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await?;
        self.invalidate(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if self.cache.contains_key(&cache_key(key, RAW_TAG)) {
            return Ok(true);
        }
        self.inner.exists(key).await
    }

    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> Result<Vec<serde_json::Value>> {
        self.inner.query(statement, params).await
    }

    async fn execute(&self, statement: &str, params: &[serde_json::Value]) -> Result<u64> {
        self.inner.execute(statement, params).await
    }

    async fn begin_transaction(self: Arc<Self>) -> Result<Transaction> {
        Ok(open_transaction(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::InMemoryStore;
    use serde::Deserialize;

    #[tokio::test]
    async fn get_populates_cache_on_miss() {
        let inner = Arc::new(InMemoryStore::new());
        inner.set("k1", b"v1".to_vec()).await.unwrap();
        let cache = CachingStore::new(inner.clone());

        assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        inner.delete("k1").await.unwrap();
        // still served from cache even though the inner store forgot it
        assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn delete_invalidates_every_tagged_representation() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Widget {
            name: String,
        }

        let inner: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
        let cache = CachingStore::new(inner);
        cache
            .set_typed("k1", "widget", &Widget { name: "a".into() })
            .await
            .unwrap();
        cache.set("k1", b"raw".to_vec()).await.unwrap();

        cache.delete("k1").await.unwrap();

        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert_eq!(cache.get_typed::<Widget>("k1", "widget").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_miss_falls_through_to_inner() {
        let inner = Arc::new(InMemoryStore::new());
        let cache = CachingStore::new(inner.clone());
        assert_eq!(cache.get("missing").await.unwrap(), None);
        inner.set("missing", b"now present".to_vec()).await.unwrap();
        assert_eq!(cache.get("missing").await.unwrap(), Some(b"now present".to_vec()));
    }
}
