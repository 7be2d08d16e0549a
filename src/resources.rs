//! Bounded runtime caches and tracked-resource cleanup
//!
//! Two responsibilities: a generic TTL cache for execution-scoped values,
//! and a registry of handles that need explicit async teardown (agent
//! sessions, watchers). A periodic sweep, never a request, evicts expired
//! cache entries, trims the cache to its entry ceiling, and forces cleanup
//! of resources above the tracked-resource ceiling.
//!
//! Memory pressure: when the summed entry-size estimate crosses the
//! configured watermark, each sweep additionally evicts the least recently
//! used quarter of the cache instead of failing requests.
//!
//! Cleanup callbacks may fail; failures are logged and swallowed so they
//! never surface into a user-facing request.

use crate::config::ResourcesConfig;
use crate::error::BrainResult;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Fraction of the cache evicted per sweep while over the byte watermark
const PRESSURE_EVICTION_DIVISOR: usize = 4;

pub type CleanupFuture = BoxFuture<'static, BrainResult<()>>;
pub type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

struct CacheSlot {
    value: Arc<dyn Any + Send + Sync>,
    created_at_secs: u64,
    ttl_seconds: u64,
    last_access_seq: u64,
    estimated_size_bytes: usize,
}

impl CacheSlot {
    fn expired(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.created_at_secs) >= self.ttl_seconds
    }
}

struct TrackedResource {
    name: String,
    registered_seq: u64,
    cleanup: CleanupFn,
}

/// What one sweep pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_removed: usize,
    pub lru_evicted: usize,
    pub pressure_evicted: usize,
    pub resources_cleaned: usize,
    pub cache_bytes: usize,
}

pub struct ResourceManager {
    max_cache_entries: usize,
    default_ttl_seconds: u64,
    max_tracked_resources: usize,
    memory_watermark_bytes: usize,
    cache: Mutex<HashMap<String, CacheSlot>>,
    resources: Mutex<HashMap<Uuid, TrackedResource>>,
    seq: AtomicU64,
}

impl ResourceManager {
    pub fn new(config: &ResourcesConfig) -> Self {
        Self {
            max_cache_entries: config.max_cache_entries.max(1),
            default_ttl_seconds: config.default_ttl_seconds,
            max_tracked_resources: config.max_tracked_resources.max(1),
            memory_watermark_bytes: config.memory_watermark_bytes,
            cache: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, CacheSlot>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_resources(&self) -> MutexGuard<'_, HashMap<Uuid, TrackedResource>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch a typed value. Expired entries are dropped on access and a
    /// type mismatch behaves like a miss.
    pub fn cache_get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.cache_get_at(epoch_secs(), key)
    }

    pub(crate) fn cache_get_at<T: Send + Sync + 'static>(
        &self,
        now_secs: u64,
        key: &str,
    ) -> Option<Arc<T>> {
        let mut cache = self.lock_cache();
        match cache.get_mut(key) {
            Some(slot) if slot.expired(now_secs) => {
                cache.remove(key);
                None
            }
            Some(slot) => {
                slot.last_access_seq = self.seq.fetch_add(1, Ordering::Relaxed);
                Arc::clone(&slot.value).downcast::<T>().ok()
            }
            None => None,
        }
    }

    /// Store a value under `key`. `ttl_seconds` of `None` takes the
    /// configured default.
    pub fn cache_set<T: Send + Sync + 'static>(
        &self,
        key: impl Into<String>,
        value: T,
        ttl_seconds: Option<u64>,
        estimated_size_bytes: usize,
    ) {
        self.cache_set_at(epoch_secs(), key, value, ttl_seconds, estimated_size_bytes);
    }

    pub(crate) fn cache_set_at<T: Send + Sync + 'static>(
        &self,
        now_secs: u64,
        key: impl Into<String>,
        value: T,
        ttl_seconds: Option<u64>,
        estimated_size_bytes: usize,
    ) {
        let key = key.into();
        let mut cache = self.lock_cache();
        if !cache.contains_key(&key) && cache.len() >= self.max_cache_entries {
            evict_lru(&mut cache, 1);
        }
        cache.insert(
            key,
            CacheSlot {
                value: Arc::new(value),
                created_at_secs: now_secs,
                ttl_seconds: ttl_seconds.unwrap_or(self.default_ttl_seconds),
                last_access_seq: self.next_seq(),
                estimated_size_bytes,
            },
        );
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn cache_bytes(&self) -> usize {
        self.lock_cache()
            .values()
            .map(|s| s.estimated_size_bytes)
            .sum()
    }

    /// Track a handle that needs explicit teardown. The returned id is the
    /// ticket for `unregister_resource`.
    pub fn register_resource(&self, name: impl Into<String>, cleanup: CleanupFn) -> Uuid {
        let id = Uuid::new_v4();
        let name = name.into();
        self.lock_resources().insert(
            id,
            TrackedResource {
                name: name.clone(),
                registered_seq: self.next_seq(),
                cleanup,
            },
        );
        tracing::trace!(resource_id = %id, name = %name, "Resource registered");
        id
    }

    /// Run a resource's cleanup and forget it. Returns whether the id was
    /// known. Cleanup failures are logged, never propagated.
    pub async fn unregister_resource(&self, id: Uuid) -> bool {
        let resource = self.lock_resources().remove(&id);
        let Some(resource) = resource else {
            return false;
        };
        run_cleanup(id, resource).await;
        true
    }

    pub fn tracked_count(&self) -> usize {
        self.lock_resources().len()
    }

    /// One maintenance pass: expired entries out, cache trimmed to its
    /// ceiling, pressure eviction when over the watermark, and forced
    /// cleanup of resources above the tracked ceiling (oldest first).
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(epoch_secs()).await
    }

    pub(crate) async fn sweep_at(&self, now_secs: u64) -> SweepReport {
        let mut report = SweepReport::default();

        {
            let mut cache = self.lock_cache();
            let before = cache.len();
            cache.retain(|_, slot| !slot.expired(now_secs));
            report.expired_removed = before - cache.len();

            if cache.len() > self.max_cache_entries {
                let over = cache.len() - self.max_cache_entries;
                report.lru_evicted = evict_lru(&mut cache, over);
            }

            let bytes: usize = cache.values().map(|s| s.estimated_size_bytes).sum();
            if bytes > self.memory_watermark_bytes && !cache.is_empty() {
                let fraction = (cache.len() / PRESSURE_EVICTION_DIVISOR).max(1);
                report.pressure_evicted = evict_lru(&mut cache, fraction);
                tracing::warn!(
                    bytes,
                    watermark = self.memory_watermark_bytes,
                    evicted = report.pressure_evicted,
                    "Cache over memory watermark; evicting aggressively"
                );
            }
            report.cache_bytes = cache.values().map(|s| s.estimated_size_bytes).sum();
        }

        let excess: Vec<(Uuid, TrackedResource)> = {
            let mut resources = self.lock_resources();
            if resources.len() <= self.max_tracked_resources {
                Vec::new()
            } else {
                let overflow = resources.len() - self.max_tracked_resources;
                let mut ids: Vec<(Uuid, u64)> = resources
                    .iter()
                    .map(|(id, r)| (*id, r.registered_seq))
                    .collect();
                ids.sort_by_key(|(_, seq)| *seq);
                ids.truncate(overflow);
                ids.into_iter()
                    .filter_map(|(id, _)| resources.remove(&id).map(|r| (id, r)))
                    .collect()
            }
        };
        for (id, resource) in excess {
            tracing::warn!(resource_id = %id, name = %resource.name, "Forcing cleanup of excess resource");
            run_cleanup(id, resource).await;
            report.resources_cleaned += 1;
        }

        report
    }
}

async fn run_cleanup(id: Uuid, resource: TrackedResource) {
    if let Err(e) = (resource.cleanup)().await {
        tracing::warn!(
            resource_id = %id,
            name = %resource.name,
            error = %e,
            "Resource cleanup failed"
        );
    }
}

/// Remove up to `count` entries, least recently used first. Returns how
/// many were removed.
fn evict_lru(cache: &mut HashMap<String, CacheSlot>, count: usize) -> usize {
    let mut order: Vec<(String, u64)> = cache
        .iter()
        .map(|(k, s)| (k.clone(), s.last_access_seq))
        .collect();
    order.sort_by_key(|(_, seq)| *seq);
    let victims: Vec<String> = order.into_iter().take(count).map(|(k, _)| k).collect();
    let removed = victims.len();
    for key in victims {
        cache.remove(&key);
    }
    removed
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
