//! Shared parameter-metadata cache (spec §4.C/§4.F).
//!
//! The set-parameter step handler and the Continuous Parameter Logger both
//! need `Parameter` rows (ranges, Modbus addresses, data types) on every
//! tick/step, but the rows themselves change rarely. A per-entry TTL plus a
//! background bulk refresh keeps both callers off the hot path of a
//! datastore round trip per lookup. Grounded on
//! `original_source/.agent-workspace/TASK-20250921-142600-0a0a12c0/optimized_parameter_step.py`'s
//! `ParameterCache` (entry TTL 300s, bulk refresh interval 60s).

use crate::datastore::Datastore;
use crate::error::CoreResult;
use crate::model::Parameter;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_BULK_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry {
    parameter: Parameter,
    cached_at: Instant,
}

pub struct ParameterCache {
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
    ttl: Duration,
    bulk_refresh_interval: Duration,
}

impl Default for ParameterCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_BULK_REFRESH_INTERVAL)
    }
}

impl ParameterCache {
    pub fn new(ttl: Duration, bulk_refresh_interval: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl, bulk_refresh_interval }
    }

    /// Returns a cached row if still within TTL, else fetches and caches one.
    /// Never triggers a bulk refresh itself — that is the background task's
    /// job (see [`Self::bulk_refresh`]) — so a hit never pays for a scan of
    /// every parameter.
    pub async fn get(&self, datastore: &dyn Datastore, parameter_id: Uuid) -> CoreResult<Parameter> {
        if let Some(parameter) = self.fresh_entry(parameter_id) {
            return Ok(parameter);
        }
        let parameter = datastore.get_parameter(parameter_id).await?;
        self.put(parameter.clone());
        Ok(parameter)
    }

    /// Overwrites the cached row, used after a successful parameter write so
    /// the next read sees the value that was just persisted instead of
    /// waiting out the TTL.
    pub fn put(&self, parameter: Parameter) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(parameter.parameter_id, CacheEntry { parameter, cached_at: Instant::now() });
    }

    fn fresh_entry(&self, parameter_id: Uuid) -> Option<Parameter> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&parameter_id)
            .filter(|entry| entry.cached_at.elapsed() < self.ttl)
            .map(|entry| entry.parameter.clone())
    }

    /// Replaces every cached entry with a fresh read of every parameter.
    /// Called on a 60-second background cadence by the continuous logger;
    /// exposed here so tests (and the logger itself) can drive it directly.
    pub async fn bulk_refresh(&self, datastore: &dyn Datastore) -> CoreResult<()> {
        let parameters = datastore.get_all_parameters().await?;
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        for parameter in parameters {
            entries.insert(parameter.parameter_id, CacheEntry { parameter, cached_at: now });
        }
        Ok(())
    }

    /// Snapshot of every currently cached parameter, refreshing first if the
    /// cache has never been populated. Used by the logger's bulk-read pass
    /// and by the executor's "record once" hook, which both need the full
    /// address table rather than one parameter at a time.
    pub async fn snapshot_all(&self, datastore: &dyn Datastore) -> CoreResult<Vec<Parameter>> {
        let is_empty = self.entries.lock().unwrap_or_else(|e| e.into_inner()).is_empty();
        if is_empty {
            self.bulk_refresh(datastore).await?;
        }
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.parameter.clone())
            .collect())
    }

    /// Runs forever, refreshing the whole cache every `bulk_refresh_interval`.
    /// Intended to be spawned once alongside the logger; failures are logged
    /// and the loop keeps going rather than giving up on the cache entirely.
    pub async fn run_background_refresh(&self, datastore: &dyn Datastore) {
        loop {
            tokio::time::sleep(self.bulk_refresh_interval).await;
            if let Err(e) = self.bulk_refresh(datastore).await {
                warn!(error = %e, "parameter cache background refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDatastore;
    use crate::model::DataType;

    fn parameter(id: Uuid) -> Parameter {
        Parameter {
            parameter_id: id,
            name: "chamber_temp".into(),
            min_value: 0.0,
            max_value: 500.0,
            current_value: None,
            set_value: None,
            read_modbus_address: Some(10),
            write_modbus_address: Some(20),
            data_type: DataType::Float,
        }
    }

    #[tokio::test]
    async fn miss_fetches_and_caches() {
        let ds = MemoryDatastore::new();
        let id = Uuid::new_v4();
        ds.seed_parameter(parameter(id));
        let cache = ParameterCache::new(Duration::from_secs(300), Duration::from_secs(60));

        let got = cache.get(&ds, id).await.unwrap();
        assert_eq!(got.parameter_id, id);
        assert!(cache.fresh_entry(id).is_some());
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let ds = MemoryDatastore::new();
        let id = Uuid::new_v4();
        ds.seed_parameter(parameter(id));
        let cache = ParameterCache::new(Duration::from_millis(1), Duration::from_secs(60));

        cache.get(&ds, id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.fresh_entry(id).is_none());
        assert!(cache.get(&ds, id).await.is_ok());
    }

    #[tokio::test]
    async fn put_overwrites_cached_entry_after_a_write() {
        let ds = MemoryDatastore::new();
        let id = Uuid::new_v4();
        let mut p = parameter(id);
        ds.seed_parameter(p.clone());
        let cache = ParameterCache::new(Duration::from_secs(300), Duration::from_secs(60));
        cache.get(&ds, id).await.unwrap();

        p.set_value = Some(123.0);
        cache.put(p);
        let got = cache.fresh_entry(id).unwrap();
        assert_eq!(got.set_value, Some(123.0));
    }

    #[tokio::test]
    async fn bulk_refresh_populates_every_parameter() {
        let ds = MemoryDatastore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ds.seed_parameter(parameter(a));
        ds.seed_parameter(parameter(b));
        let cache = ParameterCache::new(Duration::from_secs(300), Duration::from_secs(60));

        cache.bulk_refresh(&ds).await.unwrap();
        assert!(cache.fresh_entry(a).is_some());
        assert!(cache.fresh_entry(b).is_some());
    }

    #[tokio::test]
    async fn snapshot_all_refreshes_when_empty() {
        let ds = MemoryDatastore::new();
        ds.seed_parameter(parameter(Uuid::new_v4()));
        let cache = ParameterCache::new(Duration::from_secs(300), Duration::from_secs(60));

        let snapshot = cache.snapshot_all(&ds).await.unwrap();
        assert_eq!(snapshot.len(), 1);
    }
}
