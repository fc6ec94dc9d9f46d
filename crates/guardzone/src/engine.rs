//! The guard engine: converts a zone element request into an isolated
//! page-aligned range with an adjoining guard page, validates and
//! decommissions it at free time, and answers reverse lookups from any
//! in-arena address.

use crate::arena::{GuardPlacement, VaArena};
use crate::config::{Config, LayoutMode};
use crate::header::{self, GuardHeader, FILL_PATTERN, SIGNATURE};
use crate::platform;
use crate::preempt;
use crate::reserve::Reserve;
use crate::sync::Mutex;
use crate::util::{round_page, PAGE_SIZE};
use crate::zone::{Zone, ZoneStats};
use core::ptr;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Allocation behavior flags, a subset of what the zone layer passes down.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Fail with null rather than block. Required when the caller has
    /// preemption disabled.
    pub const NOWAIT: AllocFlags = AllocFlags(1 << 0);

    pub fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

struct Counters {
    allocated: AtomicU64,
    freed: AtomicU64,
    early_alloc: AtomicU64,
    early_free: AtomicU64,
    wasted: AtomicI64,
    preempt_disabled_allocs: AtomicU32,
    preempt_disabled_frees: AtomicU32,
}

impl Counters {
    const fn new() -> Counters {
        Counters {
            allocated: AtomicU64::new(0),
            freed: AtomicU64::new(0),
            early_alloc: AtomicU64::new(0),
            early_free: AtomicU64::new(0),
            wasted: AtomicI64::new(0),
            preempt_disabled_allocs: AtomicU32::new(0),
            preempt_disabled_frees: AtomicU32::new(0),
        }
    }
}

/// Point-in-time copy of the engine's global accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Bytes handed out through the arena (page-rounded).
    pub allocated: u64,
    /// Bytes released back to the arena.
    pub freed: u64,
    /// Bytes handed out from the reserve before the arena existed.
    pub early_alloc: u64,
    /// Bytes leaked by frees of pre-VM allocations.
    pub early_free: u64,
    /// Live page-rounding overhead (residue bytes).
    pub wasted: i64,
    /// Allocations performed with preemption disabled (and no NOWAIT).
    pub preempt_disabled_allocs: u32,
    /// Frees performed with preemption disabled.
    pub preempt_disabled_frees: u32,
}

pub struct GuardAllocator {
    config: Config,
    reserve: Mutex<Reserve>,
    arena: VaArena,
    counters: Counters,
}

impl GuardAllocator {
    /// Build an engine from a frozen configuration. When enabled this
    /// steals the bootstrap reserve immediately, so pre-VM callers can be
    /// served before [`init_vm`](Self::init_vm).
    pub fn new(config: Config) -> GuardAllocator {
        let reserve = if config.enabled {
            Reserve::steal(config.reserve_size)
        } else {
            Reserve::empty()
        };
        GuardAllocator {
            config,
            reserve: Mutex::new(reserve),
            arena: VaArena::unmapped(),
            counters: Counters::new(),
        }
    }

    pub fn from_boot_args(args: &str) -> GuardAllocator {
        GuardAllocator::new(Config::from_boot_args(args))
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Bring up the VA arena, sized from the parent zone map, and leave the
    /// early-boot phase. Until this is called, allocations come from the
    /// reserve and carry no live guard page.
    pub fn init_vm(&self, zone_map_size: usize) {
        if !self.enabled() {
            return;
        }
        let size = zone_map_size.saturating_mul(self.config.zonemap_scale as usize);
        self.arena.init(size);
    }

    /// The engine's phase indicator, derived from arena readiness: early
    /// boot until `init_vm` has run.
    fn vm_ready(&self) -> bool {
        self.arena.is_ready()
    }

    fn guard_placement(&self) -> GuardPlacement {
        match self.config.layout_mode {
            LayoutMode::Overflow => GuardPlacement::Last,
            LayoutMode::Underflow => GuardPlacement::First,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            allocated: self.counters.allocated.load(Ordering::Relaxed),
            freed: self.counters.freed.load(Ordering::Relaxed),
            early_alloc: self.counters.early_alloc.load(Ordering::Relaxed),
            early_free: self.counters.early_free.load(Ordering::Relaxed),
            wasted: self.counters.wasted.load(Ordering::Relaxed),
            preempt_disabled_allocs: self.counters.preempt_disabled_allocs.load(Ordering::Relaxed),
            preempt_disabled_frees: self.counters.preempt_disabled_frees.load(Ordering::Relaxed),
        }
    }

    /// Decide whether `zone` is tracked and, if so, attach its free-VA
    /// cache. Called once per zone at construction; pre-VM the cache
    /// storage is carved from the reserve.
    ///
    /// Invariant relied on by `free`: a tracked zone with a nonzero
    /// `fc_size` always leaves here with an attached cache.
    pub fn zone_init(&self, zone: &Zone) {
        if !self.enabled() {
            return;
        }
        let tracked = self.config.tracks_zone(zone.name(), zone.elem_size());
        zone.set_tracked(tracked);

        let capacity = self.config.free_cache_size as usize;
        if !tracked || capacity == 0 {
            return;
        }
        let ring_bytes = round_page(capacity * core::mem::size_of::<usize>());
        let storage = if !self.vm_ready() {
            self.reserve.lock().carve(ring_bytes) as *mut u8
        } else {
            let mapped = unsafe { platform::map_anonymous(ring_bytes) };
            if mapped.is_null() {
                panic!(
                    "guardzone: free cache allocation of {:#x} bytes failed for zone {}",
                    ring_bytes,
                    zone.name()
                );
            }
            mapped
        };
        unsafe {
            ptr::write_bytes(storage, 0, ring_bytes);
            zone.lock().cache.attach(storage, capacity);
        }
    }

    /// Allocate one element from a tracked zone. Returns null only when the
    /// caller has preemption disabled and passed [`AllocFlags::NOWAIT`].
    ///
    /// The returned pointer is the element, not the range base; the range
    /// base, header and residue sit at mode-dependent offsets around it.
    pub fn alloc(&self, zone: &Zone, stats: &ZoneStats, flags: AllocFlags) -> *mut u8 {
        if !self.enabled() {
            return ptr::null_mut();
        }
        assert!(
            zone.is_tracked(),
            "guardzone: allocation from untracked zone {}",
            zone.name()
        );

        if preempt::preemption_level() != 0 {
            if flags.contains(AllocFlags::NOWAIT) {
                return ptr::null_mut();
            }
            self.counters
                .preempt_disabled_allocs
                .fetch_add(1, Ordering::Relaxed);
        }

        let elem_size = zone.elem_size();
        let mode = self.config.layout_mode;
        let rounded = header::rounded_size(elem_size);
        let residue = rounded - elem_size;
        let vm_ready = self.vm_ready();

        let (base, new_va) = if !vm_ready {
            // Early allocations come straight off the reserve: no live
            // guard page, just a wasted page in its place.
            let base = self.reserve.lock().carve(rounded + PAGE_SIZE);
            self.counters
                .early_alloc
                .fetch_add(rounded as u64, Ordering::Relaxed);
            (base, false)
        } else {
            let elem_offset = header::layout_for(0, elem_size, mode).elem;
            let base = self
                .arena
                .alloc_guarded(rounded, self.guard_placement(), elem_offset);
            (base, true)
        };

        let layout = header::layout_for(base, elem_size, mode);
        let owner = if vm_ready {
            zone as *const Zone
        } else {
            GuardHeader::early_owner()
        };
        unsafe {
            header::write(&layout, mode, owner, elem_size);
        }

        {
            let mut z = zone.lock();
            z.elems_free -= 1;
            z.wired_cur += 1;
            if new_va {
                z.va_cur += 1;
            }
            stats.add_allocated(rounded as u64);
        }
        self.counters
            .allocated
            .fetch_add(rounded as u64, Ordering::Relaxed);
        self.counters
            .wasted
            .fetch_add(residue as i64, Ordering::Relaxed);

        layout.elem as *mut u8
    }

    /// Validate and decommission one element: double-free scan, header and
    /// fill-pattern consistency, then protect-and-park in the free-VA cache
    /// (releasing whatever the insertion evicts) or release outright when
    /// the cache is disabled. Protection changes and releases happen
    /// outside the zone lock.
    ///
    /// # Safety
    /// `addr` must have been returned by [`alloc`](Self::alloc) for `zone`
    /// and not freed since. Violations are the engine's reason to exist:
    /// they end in a diagnostic panic or a fault, not undefined silence,
    /// but the caller must accept that outcome.
    pub unsafe fn free(&self, zone: &Zone, stats: &ZoneStats, addr: *mut u8) {
        if !self.enabled() {
            return;
        }
        assert!(
            zone.is_tracked(),
            "guardzone: free into untracked zone {}",
            zone.name()
        );

        let elem_size = zone.elem_size();
        let mode = self.config.layout_mode;
        let layout = header::layout_from_element(addr as usize, elem_size, mode);
        let rounded = layout.rounded_size;
        let residue = rounded - elem_size;
        let base = layout.base;

        if base & (PAGE_SIZE - 1) != 0 {
            panic!(
                "guardzone: invalid free address {:p} (adjusted: {:#x}) for zone with element size {:#x}",
                addr, base, elem_size
            );
        }

        let cache_enabled = self.config.free_cache_size > 0;
        if cache_enabled && self.config.double_free_check {
            let z = zone.lock();
            if let Some(freed_index) = z.cache.position_of(base) {
                panic!(
                    "guardzone: double free detected, freed address: {:#x}, current free cache index: {}, freed index: {}",
                    base,
                    z.cache.index(),
                    freed_index
                );
            }
        }

        // Read regardless of the consistency setting: the early-owner
        // sentinel decides the leak path below.
        let hdr = header::read_header(layout.header);

        if self.config.consistency_checks {
            if hdr.signature != SIGNATURE {
                panic!(
                    "guardzone: signature mismatch for element {:p}, expected {:#x}, found {:#x}",
                    addr, SIGNATURE, hdr.signature
                );
            }
            if !ptr::eq(hdr.owner, zone) && !GuardHeader::is_early_owner(hdr.owner) {
                panic!(
                    "guardzone: mismatched zone or under/overflow, current zone: {} ({:p}), recorded zone: {:p}, address: {:p}",
                    zone.name(),
                    zone as *const Zone,
                    hdr.owner,
                    addr
                );
            }
            // Partially redundant given the zone check, but flags header
            // corruption.
            if hdr.elem_size as usize != elem_size {
                panic!(
                    "guardzone: mismatched free or under/overflow for zone {}, recorded size: {:#x}, element size: {:#x}, address: {:p}",
                    zone.name(),
                    hdr.elem_size,
                    elem_size,
                    addr
                );
            }
            if let Some((at, contents)) = header::residue_deviation(&layout, mode) {
                panic!(
                    "guardzone: detected over/underflow, byte at {:#x}, element {:p}, contents {:#x} from {:#x} byte sized zone ({}) doesn't match fill pattern ({:#x})",
                    at,
                    addr,
                    contents,
                    elem_size,
                    zone.name(),
                    FILL_PATTERN
                );
            }
        }

        if !self.vm_ready() || GuardHeader::is_early_owner(hdr.owner) {
            // Frees of pre-VM allocations leak by design; the range never
            // entered the arena.
            self.counters
                .early_free
                .fetch_add(rounded as u64, Ordering::Relaxed);
            return;
        }

        if preempt::preemption_level() != 0 {
            self.counters
                .preempt_disabled_frees
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut release_addr = 0usize;
        if cache_enabled {
            let (commit, commit_len) = header::committed_range(&layout, mode);
            self.arena
                .protect(commit, commit_len, self.config.prot_on_free);
        } else {
            release_addr = base;
        }

        {
            let mut z = zone.lock();
            if cache_enabled {
                release_addr = z.cache.insert(base);
            }
            if release_addr != 0 {
                z.elems_free += 1;
                z.wired_cur -= 1;
            }
            stats.add_freed(rounded as u64);
        }

        if release_addr != 0 {
            self.arena.free_range(release_addr, rounded + PAGE_SIZE);
            self.counters
                .freed
                .fetch_add(rounded as u64, Ordering::Relaxed);
            self.counters
                .wasted
                .fetch_sub(residue as i64, Ordering::Relaxed);
        }
    }

    /// Dump a zone's free-VA cache so its element count can drop to zero
    /// (zone teardown). The ring is snapshotted and reset under the zone
    /// lock; releases happen outside it.
    pub fn empty_free_cache(&self, zone: &Zone) {
        if !self.enabled() {
            return;
        }
        assert!(
            zone.is_tracked(),
            "guardzone: cache drain on untracked zone {}",
            zone.name()
        );
        let capacity = self.config.free_cache_size as usize;
        if capacity == 0 {
            return;
        }

        let elem_size = zone.elem_size();
        let rounded = header::rounded_size(elem_size);
        let residue = rounded - elem_size;
        let ring_bytes = round_page(capacity * core::mem::size_of::<usize>());

        let scratch = unsafe { platform::map_anonymous(ring_bytes) };
        if scratch.is_null() {
            panic!("guardzone: cache snapshot allocation of {:#x} bytes failed", ring_bytes);
        }

        {
            let mut z = zone.lock();
            unsafe {
                z.cache.drain_into(scratch as *mut usize);
            }
        }

        let mut freed_elements: i64 = 0;
        for i in 0..capacity {
            let addr = unsafe { *(scratch as *const usize).add(i) };
            if addr != 0 && self.arena.contains(addr) {
                self.arena.free_range(addr, rounded + PAGE_SIZE);
                self.counters
                    .freed
                    .fetch_add(rounded as u64, Ordering::Relaxed);
                self.counters
                    .wasted
                    .fetch_sub(residue as i64, Ordering::Relaxed);
                freed_elements += 1;
            }
        }

        {
            let mut z = zone.lock();
            z.elems_free += freed_elements;
            z.wired_cur -= freed_elements;
        }

        unsafe {
            platform::unmap(scratch, ring_bytes);
        }
    }

    /// Reverse lookup: the owning zone and its element size for any address
    /// within a tracked allocation, or `None` for addresses the engine does
    /// not own (outside the arena, or a released range).
    ///
    /// # Safety
    /// If `addr` falls within a live or cached allocation, its header and
    /// the recorded zone are dereferenced; tracked zones must therefore
    /// outlive their allocations. Under the default free protection a
    /// cached range's header is intentionally unreadable and this faults --
    /// use `wp` when freed allocations must stay inspectable.
    pub unsafe fn element_size(&self, addr: *const u8) -> Option<(*const Zone, usize)> {
        let a = addr as usize;
        if !self.enabled() || !self.arena.contains(a) {
            return None;
        }
        let entry = self.arena.lookup_entry(a)?;
        assert!(
            entry.atomic,
            "guardzone: map entry inconsistency, entry {:#x}..{:#x} for {:#x} is not atomic",
            entry.start, entry.end, a
        );

        let hdr = header::read_from_entry(&entry, self.config.layout_mode);
        if hdr.signature != SIGNATURE {
            panic!(
                "guardzone: signature mismatch for element {:#x}, expected {:#x}, found {:#x}",
                a, SIGNATURE, hdr.signature
            );
        }

        let zone = &*hdr.owner;
        if !zone.is_tracked() {
            panic!(
                "guardzone: zone mismatch, recorded zone {:p} for {:#x} is not tracked",
                hdr.owner, a
            );
        }
        Some((hdr.owner, zone.elem_size()))
    }
}
