//! In-memory key-value store
//!
//! Buckets are `BTreeMap`s so range scans come out sorted. Used by tests and
//! by deployments that do not need durability.

use crate::error::Result;
use crate::traits::KvStore;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

#[derive(Default)]
pub struct MemoryKvStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a bucket
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) {
        self.buckets.write().clear();
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn save_raw(&self, bucket: &str, key: &str, value: Bytes) -> Result<()> {
        self.buckets
            .write()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_raw(&self, bucket: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .and_then(|b| b.get(key).cloned()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .buckets
            .write()
            .get_mut(bucket)
            .is_some_and(|b| b.remove(key).is_some()))
    }

    async fn load_all(&self, bucket: &str) -> Result<Vec<(String, Bytes)>> {
        Ok(self
            .buckets
            .read()
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn load_range(
        &self,
        bucket: &str,
        min_key: &str,
        max_key: &str,
    ) -> Result<Vec<(String, Bytes)>> {
        // BTreeMap::range panics on inverted bounds
        if min_key > max_key {
            return Ok(Vec::new());
        }

        let buckets = self.buckets.read();
        let Some(b) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        Ok(b
            .range::<str, _>((Bound::Included(min_key), Bound::Included(max_key)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
