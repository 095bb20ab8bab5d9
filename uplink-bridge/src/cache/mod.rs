//! # Registration Cache
//!
//! Process-lifetime store of resolved device identities. Provisioning is
//! slow and rate limited, so a device is provisioned once and its
//! identity reused until a downstream call reports the device unknown.
//!
//! Entries have no TTL. The cache is bounded by `max_identities`; past
//! that bound moka evicts entries for size, and an evicted device simply
//! re-provisions on its next message. Concurrent misses for the same
//! device id are coalesced: exactly one provisioning future runs, the
//! other callers wait for its result. A failed provisioning is never
//! cached.

use moka::future::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use shared::{
    config::CacheConfig,
    error::HubError,
    types::DeviceIdentity,
};

/// Cache of resolved identities keyed by device id
pub struct RegistrationCache {
    /// Resolved identities
    identities: Cache<String, Arc<DeviceIdentity>>,

    /// Lookups answered from the cache
    hits: AtomicU64,

    /// Lookups that had to provision (or wait on a provisioning)
    misses: AtomicU64,

    /// Provisioning futures actually run
    provisions: AtomicU64,
}

impl RegistrationCache {
    /// Create a new RegistrationCache with the given configuration
    pub fn new(config: &CacheConfig) -> Self {
        info!(
            max_identities = config.max_identities,
            "Initializing registration cache"
        );

        let identities = Cache::builder()
            .max_capacity(config.max_identities)
            .build();

        Self {
            identities,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            provisions: AtomicU64::new(0),
        }
    }

    /// Get a resolved identity
    pub async fn get(&self, device_id: &str) -> Option<Arc<DeviceIdentity>> {
        self.identities.get(device_id).await
    }

    /// Store a resolved identity, replacing any previous entry
    pub async fn put(&self, identity: DeviceIdentity) -> Arc<DeviceIdentity> {
        let identity = Arc::new(identity);
        debug!(device_id = %identity.device_id, "Caching device identity");
        self.identities
            .insert(identity.device_id.clone(), Arc::clone(&identity))
            .await;
        identity
    }

    /// Remove a device so its next resolution re-provisions
    pub async fn invalidate(&self, device_id: &str) {
        info!(device_id = %device_id, "Invalidating cached device identity");
        self.identities.invalidate(device_id).await;
    }

    /// Remove `stale` only if it is still the cached entry for its device.
    ///
    /// An identity re-provisioned by a concurrent request is left alone.
    pub async fn invalidate_identity(&self, stale: &Arc<DeviceIdentity>) -> bool {
        match self.identities.get(&stale.device_id).await {
            Some(current) if Arc::ptr_eq(&current, stale) => {
                self.invalidate(&stale.device_id).await;
                true
            }
            _ => {
                debug!(device_id = %stale.device_id, "Cached identity already replaced");
                false
            }
        }
    }

    /// Check if a device is cached
    pub fn contains(&self, device_id: &str) -> bool {
        self.identities.contains_key(device_id)
    }

    /// Return the cached identity or run `provision` to create it.
    ///
    /// At most one `provision` future runs per device id at a time.
    pub async fn get_or_provision<F>(
        &self,
        device_id: &str,
        provision: F,
    ) -> Result<Arc<DeviceIdentity>, HubError>
    where
        F: Future<Output = Result<DeviceIdentity, HubError>>,
    {
        if let Some(identity) = self.identities.get(device_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(device_id = %device_id, "Device identity cache hit");
            return Ok(identity);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(device_id = %device_id, "Device identity cache miss");

        let provisions = &self.provisions;
        self.identities
            .try_get_with(device_id.to_string(), async move {
                provisions.fetch_add(1, Ordering::Relaxed);
                provision.await.map(Arc::new)
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            identities: self.identities.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            provisions: self.provisions.load(Ordering::Relaxed),
        }
    }

    /// Drop every cached identity
    pub async fn clear_all(&self) {
        info!("Clearing registration cache");
        self.identities.invalidate_all();
        self.identities.run_pending_tasks().await;
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cached identities (approximate until maintenance runs)
    pub identities: u64,
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
    /// Provisioning futures run
    pub provisions: u64,
}

impl CacheStats {
    /// Share of lookups answered from the cache
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
