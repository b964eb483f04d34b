//! Trait definitions for the key-value store abstraction

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Bucketed key-value storage
///
/// Values are opaque bytes (JSON in practice). Keys inside a bucket are
/// ordered lexicographically, which is what makes `load_range` useful for
/// time-suffixed keys such as `rule_2024-01-01 10:00`.
///
/// Implementations:
/// - `MemoryKvStore`: In-memory backend for testing and embedded use
/// - `SqliteKvStore`: Durable SQLite backend
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Insert or replace a value
    async fn save_raw(&self, bucket: &str, key: &str, value: Bytes) -> Result<()>;

    /// Get value by key
    async fn get_raw(&self, bucket: &str, key: &str) -> Result<Option<Bytes>>;

    /// Delete key, returns whether it existed
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

    /// All entries of a bucket, sorted by key
    async fn load_all(&self, bucket: &str) -> Result<Vec<(String, Bytes)>>;

    /// Entries with `min_key <= key <= max_key`, sorted by key
    async fn load_range(
        &self,
        bucket: &str,
        min_key: &str,
        max_key: &str,
    ) -> Result<Vec<(String, Bytes)>>;
}

/// JSON helpers on top of [`KvStore`]
///
/// Bulk loads skip entries that fail to deserialize, so one corrupt record
/// never aborts a scan.
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn save<T>(&self, bucket: &str, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let data = serde_json::to_vec(value)?;
        self.save_raw(bucket, key, Bytes::from(data)).await
    }

    async fn get<T>(&self, bucket: &str, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_raw(bucket, key).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn load_all_as<T>(&self, bucket: &str) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned + Send,
    {
        let entries = self.load_all(bucket).await?;
        Ok(decode_entries(bucket, entries))
    }

    async fn load_range_as<T>(
        &self,
        bucket: &str,
        min_key: &str,
        max_key: &str,
    ) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned + Send,
    {
        let entries = self.load_range(bucket, min_key, max_key).await?;
        Ok(decode_entries(bucket, entries))
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

fn decode_entries<T: DeserializeOwned>(
    bucket: &str,
    entries: Vec<(String, Bytes)>,
) -> Vec<(String, T)> {
    entries
        .into_iter()
        .filter_map(|(key, data)| match serde_json::from_slice::<T>(&data) {
            Ok(value) => Some((key, value)),
            Err(e) => {
                debug!(bucket, key = %key, error = %e, "Skipping corrupt entry");
                None
            },
        })
        .collect()
}
