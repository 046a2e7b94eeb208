use super::cache::DeviceIdentityCache;
use crate::storage::{StorageResult, StorageTx};
use serde_json::Value as JsonValue;

/// Maps a device's stable uid to its persistent id, creating the row on first use.
#[derive(Debug)]
pub struct DeviceIdentityResolver {
    cache: DeviceIdentityCache,
}

impl DeviceIdentityResolver {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache: DeviceIdentityCache::new(cache_size),
        }
    }

    pub fn cache(&self) -> &DeviceIdentityCache {
        &self.cache
    }

    /// Returns the cached id, or upserts through `tx` and caches the result.
    ///
    /// The upsert is keyed on the unique `device_uid`, so concurrent first-time
    /// callers converge on the same id.
    pub async fn resolve(
        &self,
        tx: &mut dyn StorageTx,
        device_uid: &str,
        metadata: Option<&JsonValue>,
    ) -> StorageResult<i64> {
        if let Some(device_id) = self.cache.get(device_uid) {
            return Ok(device_id);
        }

        self.fetch_and_cache(tx, device_uid, metadata).await
    }

    /// Like [`resolve`](Self::resolve) but also reports whether storage was hit.
    pub(crate) async fn resolve_tracked(
        &self,
        tx: &mut dyn StorageTx,
        device_uid: &str,
    ) -> StorageResult<(i64, bool)> {
        if let Some(device_id) = self.cache.get(device_uid) {
            return Ok((device_id, false));
        }
        let device_id = self.fetch_and_cache(tx, device_uid, None).await?;
        Ok((device_id, true))
    }

    async fn fetch_and_cache(
        &self,
        tx: &mut dyn StorageTx,
        device_uid: &str,
        metadata: Option<&JsonValue>,
    ) -> StorageResult<i64> {
        let device_id = tx.upsert_device(device_uid, metadata).await?;
        self.cache.set(device_uid, device_id);
        tracing::info!(
            device_uid,
            device_id,
            cache_size = self.cache.len(),
            "device id resolved"
        );
        Ok(device_id)
    }

    /// Drops cached ids that were learned inside a transaction that did not commit.
    pub fn forget<'a, I>(&self, device_uids: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for device_uid in device_uids {
            self.cache.remove(device_uid);
        }
    }
}
