//! Cache promoter: the background task that keeps the memory tier hot.
//!
//! Each cycle evaluates the cache backend's utilization against its
//! watermarks. Above high-water it evicts the coldest cached objects to
//! the default backend; below low-water it walks the persistent tiers and
//! promotes objects whose hotness clears the threshold. Hotness is
//! evaluated fresh against the monotonic clock at every scan so objects
//! that cool down are demoted.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::backend::manager::BackendManager;
use crate::clock;
use crate::error::{MapperError, Result};
use crate::index::FLAG_PINNED as OBJ_PINNED;

/// Promoter tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct PromoterConfig {
    /// Polling interval between cycles.
    pub interval: Duration,
    /// Minimum hotness for promotion into the cache.
    pub threshold: f64,
    /// Bound on migrations per cycle, each direction.
    pub max_moves_per_cycle: usize,
}

impl Default for PromoterConfig {
    fn default() -> Self {
        PromoterConfig {
            interval: Duration::from_secs(1),
            threshold: 0.7,
            max_moves_per_cycle: 32,
        }
    }
}

impl BackendManager {
    /// Start the promoter task. Idempotent: a second call while running
    /// is a no-op.
    pub fn start_caching(self: &Arc<Self>, config: PromoterConfig) -> Result<()> {
        if self.cache_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let manager = Arc::clone(self);
        let running = Arc::clone(&self.cache_running);
        let thread = std::thread::Builder::new()
            .name("objmapper-promoter".into())
            .spawn(move || {
                debug!(
                    "promoter running: interval={:?} threshold={}",
                    config.interval, config.threshold
                );
                while running.load(Ordering::Acquire) {
                    manager.promoter_cycle(&config);
                    sleep_while_running(&running, config.interval);
                }
            })
            .map_err(|err| MapperError::Storage(format!("failed to spawn promoter: {err}")))?;

        *self.cache_thread.lock() = Some(thread);
        Ok(())
    }

    /// Signal the promoter to stop and join it.
    pub fn stop_caching(&self) {
        if !self.cache_running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(thread) = self.cache_thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// One promoter cycle. Public so tests (and manual tooling) can drive
    /// it without the background thread.
    pub fn promoter_cycle(&self, config: &PromoterConfig) {
        let Some(cache_id) = self.cache_backend_id() else {
            return;
        };
        let Some(cache) = self.backend(cache_id) else {
            return;
        };

        let marks = cache.watermarks();
        let utilization = cache.utilization();

        if utilization > marks.high {
            self.evict_coldest(cache_id, marks.low, config.max_moves_per_cycle);
        } else if utilization < marks.low {
            self.promote_hottest(cache_id, marks.low, config.threshold, config.max_moves_per_cycle);
        }
    }

    /// Over high-water: push the coldest cached objects (lowest hotness,
    /// ties to the oldest access) out to the default backend until the
    /// estimated utilization reaches low-water.
    fn evict_coldest(&self, cache_id: u32, low_water: f64, max_moves: usize) {
        let Some(default_id) = self.default_backend_id() else {
            return;
        };
        let Some(cache) = self.backend(cache_id) else {
            return;
        };

        let now = clock::monotonic_us();
        let halflife = cache.hotness_halflife_secs();

        let mut candidates: Vec<(String, f64, u64, u64)> = Vec::new();
        cache.index.for_each(|entry| {
            if entry.flags() & OBJ_PINNED != 0 {
                return;
            }
            candidates.push((
                entry.uri().to_owned(),
                entry.hotness(now, halflife),
                entry.last_access(),
                entry.size_bytes(),
            ));
        });
        candidates.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });

        let capacity = cache.capacity_bytes().max(1) as f64;
        let mut projected_used = cache.used_bytes();
        let mut moved = 0usize;

        for (uri, hotness, _, size) in candidates {
            if moved >= max_moves || (projected_used as f64 / capacity) <= low_water {
                break;
            }
            match self.migrate_object(&uri, default_id) {
                Ok(()) => {
                    projected_used = projected_used.saturating_sub(size);
                    moved += 1;
                    debug!("evicted {uri} (hotness {hotness:.3}) from cache");
                }
                Err(MapperError::NotFound) => {}
                Err(err) => warn!("eviction of {uri} failed: {err}"),
            }
        }
    }

    /// Under low-water: pull hot objects from the persistent tiers into
    /// the cache while room remains.
    fn promote_hottest(&self, cache_id: u32, low_water: f64, threshold: f64, max_moves: usize) {
        let Some(cache) = self.backend(cache_id) else {
            return;
        };

        let capacity = cache.capacity_bytes().max(1) as f64;
        let mut projected_used = cache.used_bytes();
        let mut moved = 0usize;

        for backend in self.backends() {
            if backend.id() == cache_id
                || !backend.is_enabled()
                || backend.is_ephemeral_only()
                || !backend.can_migrate_out()
            {
                continue;
            }

            let now = clock::monotonic_us();
            let halflife = backend.hotness_halflife_secs();

            let mut candidates: Vec<(String, f64, u64, u32)> = Vec::new();
            backend.index.for_each(|entry| {
                if entry.flags() & OBJ_PINNED != 0 {
                    return;
                }
                let hotness = entry.hotness(now, halflife);
                if hotness >= threshold {
                    candidates.push((
                        entry.uri().to_owned(),
                        hotness,
                        entry.size_bytes(),
                        entry.flags(),
                    ));
                }
            });
            // Hottest first.
            candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            });

            for (uri, hotness, size, flags) in candidates {
                if moved >= max_moves || (projected_used as f64 / capacity) >= low_water {
                    return;
                }
                // A persistent object cannot enter an ephemeral-only
                // cache; skip rather than churn on failed migrations.
                if cache.is_ephemeral_only() && flags & crate::index::FLAG_EPHEMERAL == 0 {
                    continue;
                }
                match self.migrate_object(&uri, cache_id) {
                    Ok(()) => {
                        projected_used += size;
                        moved += 1;
                        debug!("promoted {uri} (hotness {hotness:.3}) into cache");
                    }
                    Err(MapperError::NotFound) => {}
                    Err(err) => warn!("promotion of {uri} failed: {err}"),
                }
            }
        }
    }
}

fn sleep_while_running(running: &std::sync::atomic::AtomicBool, interval: Duration) {
    // Sleep in short slices so shutdown does not wait a full interval.
    let slice = Duration::from_millis(50);
    let mut remaining = interval;
    while running.load(Ordering::Acquire) && !remaining.is_zero() {
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
