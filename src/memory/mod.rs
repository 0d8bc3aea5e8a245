//! Smart memory manager: device-aware byte budget, LRU+priority eviction,
//! and protect/register race-free atlas lifecycle (§4.6).

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::photo::{AtlasPriority, LodLevel};

/// Identifies a resident atlas: its LOD, its pixel size, and a deterministic
/// hash of the sorted set of photos packed into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtlasKey {
    pub lod_level: LodLevel,
    pub atlas_size: u32,
    pub photos_hash: u64,
}

impl AtlasKey {
    pub fn new(lod_level: LodLevel, atlas_size: u32, photos_hash: u64) -> Self {
        AtlasKey {
            lod_level,
            atlas_size,
            photos_hash,
        }
    }
}

/// Coarse memory-utilization level driving strategy selection and eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Pressure {
    Normal,
    Low,
    Medium,
    High,
    Critical,
}

impl Pressure {
    fn from_ratio(ratio: f64) -> Pressure {
        if ratio >= 0.99 {
            Pressure::Critical
        } else if ratio >= 0.98 {
            Pressure::High
        } else if ratio >= 0.90 {
            Pressure::Medium
        } else if ratio >= 0.80 {
            Pressure::Low
        } else {
            Pressure::Normal
        }
    }
}

/// A snapshot of the memory manager's state, suitable for publishing to
/// observers (the bitmap pool watches this to decide when to drain).
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStatus {
    pub budget_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub pressure: Pressure,
    pub registered_atlases: usize,
}

/// Bookkeeping for a single registered (or pre-protected) atlas.
struct AtlasEntry {
    priority: AtlasPriority,
    byte_size: u64,
    last_access: Instant,
    registered: bool,
}

/// Outcome of [`MemoryManager::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub ok: bool,
    pub recommended_lod: Option<LodLevel>,
}

struct Registry {
    entries: HashMap<AtlasKey, AtlasEntry>,
    protected: HashSet<AtlasKey>,
    used_bytes: u64,
}

impl Registry {
    fn new() -> Self {
        Registry {
            entries: HashMap::new(),
            protected: HashSet::new(),
            used_bytes: 0,
        }
    }
}

/// Enforces a device-aware byte budget over all live atlases.
///
/// The registry mutex is never held across I/O or decode work; all of its
/// critical sections are O(1) amortized over the resident atlas count.
pub struct MemoryManager {
    budget_bytes: u64,
    registry: Mutex<Registry>,
    status_tx: watch::Sender<MemoryStatus>,
    status_rx: watch::Receiver<MemoryStatus>,
}

impl MemoryManager {
    /// `budget = device.memory_budget_bytes * 0.9` (10% safety margin), per §4.6.
    pub fn new(device_memory_budget_bytes: u64) -> Self {
        let budget_bytes = (device_memory_budget_bytes as f64 * 0.9) as u64;

        let initial = MemoryStatus {
            budget_bytes,
            used_bytes: 0,
            available_bytes: budget_bytes,
            pressure: Pressure::Normal,
            registered_atlases: 0,
        };

        let (status_tx, status_rx) = watch::channel(initial);

        MemoryManager {
            budget_bytes,
            registry: Mutex::new(Registry::new()),
            status_tx,
            status_rx,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Subscribe to pressure/usage changes, published on every
    /// registration, unregistration, and touch.
    pub fn subscribe(&self) -> watch::Receiver<MemoryStatus> {
        self.status_rx.clone()
    }

    pub fn status(&self) -> MemoryStatus {
        self.status_rx.borrow().clone()
    }

    /// Requests room for `required_bytes`. If the current budget can't
    /// accommodate it, evicts lower-priority atlases in `(priority asc,
    /// last_access asc)` order until there's enough room or nothing left to
    /// evict; on failure proposes the highest LOD whose per-photo estimate
    /// would fit instead.
    pub fn request(
        &self,
        required_bytes: u64,
        lod: LodLevel,
        priority: AtlasPriority,
    ) -> RequestOutcome {
        let mut registry = self.registry.lock();
        let available = self.budget_bytes.saturating_sub(registry.used_bytes);

        if available >= required_bytes {
            return RequestOutcome {
                ok: true,
                recommended_lod: None,
            };
        }

        let mut candidates: Vec<AtlasKey> = registry
            .entries
            .iter()
            .filter(|(key, entry)| entry.registered && entry.priority <= priority && !registry.protected.contains(key))
            .map(|(key, _)| *key)
            .collect();

        candidates.sort_by(|a, b| {
            let ea = &registry.entries[a];
            let eb = &registry.entries[b];
            ea.priority
                .cmp(&eb.priority)
                .then_with(|| ea.last_access.cmp(&eb.last_access))
        });

        for key in candidates {
            if self.budget_bytes.saturating_sub(registry.used_bytes) >= required_bytes {
                break;
            }

            if let Some(entry) = registry.entries.remove(&key) {
                registry.used_bytes = registry.used_bytes.saturating_sub(entry.byte_size);
                registry.protected.remove(&key);
                debug!("evicted atlas {:?} ({} bytes) to satisfy request", key, entry.byte_size);
            }
        }

        let available = self.budget_bytes.saturating_sub(registry.used_bytes);
        self.publish_status(&registry);

        if available >= required_bytes {
            RequestOutcome {
                ok: true,
                recommended_lod: None,
            }
        } else {
            warn!("request for {required_bytes} bytes at {lod:?} could not be satisfied even after eviction");
            RequestOutcome {
                ok: false,
                recommended_lod: Self::recommend_lod(available, lod),
            }
        }
    }

    fn recommend_lod(available: u64, requested: LodLevel) -> Option<LodLevel> {
        let mut candidate = requested;

        loop {
            let edge = candidate.resolution() as u64;
            let estimate = edge * edge * 4;

            if estimate <= available {
                return Some(candidate);
            }

            if candidate == LodLevel::L0 {
                return None;
            }

            candidate = LodLevel::from_level(candidate.level() - 1).unwrap_or(LodLevel::L0);
        }
    }

    /// Marks `keys` immune to [`Self::emergency_cleanup`]. MUST be called
    /// before [`Self::register`] for the same key to foreclose the
    /// eviction race between allocation and registration.
    pub fn add_protected(&self, keys: impl IntoIterator<Item = AtlasKey>) {
        let mut registry = self.registry.lock();

        for key in keys {
            registry.protected.insert(key);
            registry.entries.entry(key).or_insert_with(|| AtlasEntry {
                priority: AtlasPriority::PersistentCache,
                byte_size: 0,
                last_access: Instant::now(),
                registered: false,
            });
        }
    }

    pub fn unprotect(&self, key: &AtlasKey) {
        self.registry.lock().protected.remove(key);
    }

    /// Registers a fully-built atlas. The key must already be protected
    /// (see [`Self::add_protected`]).
    pub fn register(&self, key: AtlasKey, byte_size: u64, priority: AtlasPriority) {
        let mut registry = self.registry.lock();

        let previous_size = registry
            .entries
            .get(&key)
            .map(|e| if e.registered { e.byte_size } else { 0 })
            .unwrap_or(0);

        registry.entries.insert(
            key,
            AtlasEntry {
                priority,
                byte_size,
                last_access: Instant::now(),
                registered: true,
            },
        );

        registry.used_bytes = registry.used_bytes - previous_size + byte_size;
        self.publish_status(&registry);

        if self.status().pressure == Pressure::Critical {
            drop(registry);
            self.emergency_cleanup();
        }
    }

    /// Removes `key` from the registry. Returns `true` if it was present.
    /// Pixel recycling is the caller's responsibility (the atlas's `Drop`
    /// returns its buffer to the bitmap pool).
    pub fn unregister(&self, key: &AtlasKey) -> bool {
        let mut registry = self.registry.lock();

        if let Some(entry) = registry.entries.remove(key) {
            registry.used_bytes = registry.used_bytes.saturating_sub(entry.byte_size);
            registry.protected.remove(key);
            self.publish_status(&registry);
            true
        } else {
            false
        }
    }

    pub fn touch(&self, key: &AtlasKey) {
        let mut registry = self.registry.lock();

        if let Some(entry) = registry.entries.get_mut(key) {
            entry.last_access = Instant::now();
        }
    }

    /// Evicts half of the unprotected, registered atlases, lowest priority
    /// first. Not an error condition; triggered automatically when
    /// crossing into `Critical` pressure.
    pub fn emergency_cleanup(&self) {
        let mut registry = self.registry.lock();

        let mut candidates: Vec<AtlasKey> = registry
            .entries
            .iter()
            .filter(|(key, entry)| entry.registered && !registry.protected.contains(key))
            .map(|(key, _)| *key)
            .collect();

        candidates.sort_by(|a, b| {
            let ea = &registry.entries[a];
            let eb = &registry.entries[b];
            ea.priority
                .cmp(&eb.priority)
                .then_with(|| ea.last_access.cmp(&eb.last_access))
        });

        let evict_count = candidates.len() / 2;
        warn!("emergency cleanup: evicting {evict_count} of {} unprotected atlases", candidates.len());

        for key in candidates.into_iter().take(evict_count) {
            if let Some(entry) = registry.entries.remove(&key) {
                registry.used_bytes = registry.used_bytes.saturating_sub(entry.byte_size);
            }
        }

        self.publish_status(&registry);
    }

    fn publish_status(&self, registry: &Registry) {
        let used_bytes = registry.used_bytes;
        let available_bytes = self.budget_bytes.saturating_sub(used_bytes);
        let ratio = if self.budget_bytes == 0 {
            1.0
        } else {
            used_bytes as f64 / self.budget_bytes as f64
        };

        let status = MemoryStatus {
            budget_bytes: self.budget_bytes,
            used_bytes,
            available_bytes,
            pressure: Pressure::from_ratio(ratio),
            registered_atlases: registry.entries.values().filter(|e| e.registered).count(),
        };

        let _ = self.status_tx.send(status);
    }
}
