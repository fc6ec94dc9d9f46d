//! The zone collaborator, modeled just far enough for the engine: name,
//! element size, the zone lock, the counters the engine maintains, and the
//! guard extension (the free-VA cache) populated for tracked zones.

use crate::cache::FreeCache;
use crate::sync::{Mutex, MutexGuard};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters and the guard extension, all under the zone lock.
pub struct ZoneInner {
    pub elems_free: i64,
    pub wired_cur: i64,
    pub va_cur: i64,
    pub cache: FreeCache,
}

/// Snapshot of the locked counters, for callers and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneCounters {
    pub elems_free: i64,
    pub wired_cur: i64,
    pub va_cur: i64,
}

pub struct Zone {
    name: &'static str,
    elem_size: usize,
    /// Set once by the engine's zone-init hook; read lock-free on the
    /// allocation path.
    tracked: AtomicBool,
    inner: Mutex<ZoneInner>,
}

impl Zone {
    pub fn new(name: &'static str, elem_size: usize) -> Zone {
        Zone {
            name,
            elem_size,
            tracked: AtomicBool::new(false),
            inner: Mutex::new(ZoneInner {
                elems_free: 0,
                wired_cur: 0,
                va_cur: 0,
                cache: FreeCache::unattached(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::Acquire)
    }

    pub(crate) fn set_tracked(&self, tracked: bool) {
        self.tracked.store(tracked, Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ZoneInner> {
        self.inner.lock()
    }

    pub fn counters(&self) -> ZoneCounters {
        let inner = self.inner.lock();
        ZoneCounters {
            elems_free: inner.elems_free,
            wired_cur: inner.wired_cur,
            va_cur: inner.va_cur,
        }
    }

    /// Occupied slots in the free-VA cache.
    pub fn cached_frees(&self) -> usize {
        self.inner.lock().cache.occupied()
    }
}

/// Allocation statistics the zone layer keeps per zone. The original keeps
/// these per CPU and sums on demand; shared atomics model that here.
pub struct ZoneStats {
    mem_allocated: AtomicU64,
    mem_freed: AtomicU64,
}

impl ZoneStats {
    pub const fn new() -> ZoneStats {
        ZoneStats {
            mem_allocated: AtomicU64::new(0),
            mem_freed: AtomicU64::new(0),
        }
    }

    pub fn add_allocated(&self, bytes: u64) {
        self.mem_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_freed(&self, bytes: u64) {
        self.mem_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn mem_allocated(&self) -> u64 {
        self.mem_allocated.load(Ordering::Relaxed)
    }

    pub fn mem_freed(&self) -> u64 {
        self.mem_freed.load(Ordering::Relaxed)
    }
}

impl Default for ZoneStats {
    fn default() -> Self {
        ZoneStats::new()
    }
}
