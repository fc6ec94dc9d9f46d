use crate::config::FreeProtection;
use crate::platform;
use crate::sync::Mutex;
use crate::util::{round_page, PAGE_SIZE};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Which end of a guarded range holds the inaccessible page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GuardPlacement {
    /// Trailing guard page (overflow mode).
    Last,
    /// Leading guard page (underflow mode).
    First,
}

/// A map entry covering one guarded allocation, guard page included.
#[derive(Clone, Copy, Debug)]
pub struct ArenaEntry {
    pub start: usize,
    pub end: usize,
    /// Offset of the element from `start`; 0 means unrecorded, forcing
    /// reverse lookup onto the signature scan.
    pub elem_offset: usize,
    /// Entries are created atomic (one allocation, never clipped or
    /// coalesced); anything else indicates map corruption.
    pub atomic: bool,
}

const SLOT_ATOMIC: u8 = 0x01;

#[derive(Clone, Copy)]
struct EntrySlot {
    npages: u32,
    elem_offset: u32,
    flags: u8,
}

impl EntrySlot {
    const EMPTY: EntrySlot = EntrySlot {
        npages: 0,
        elem_offset: 0,
        flags: 0,
    };
}

struct ArenaInner {
    /// Per page: owning entry's start page index + 1; 0 = free.
    owner: Vec<u32>,
    /// Entry record, valid at the entry's start page index.
    entries: Vec<EntrySlot>,
    /// Rotating first-fit hint.
    scan_hint: usize,
}

/// Sub-map dedicated to guarded allocations: one access-less address-space
/// reservation, committed range by range. Bounds are published once at init
/// so `contains` needs no lock.
pub struct VaArena {
    base: AtomicUsize,
    size: AtomicUsize,
    inner: Mutex<ArenaInner>,
}

impl VaArena {
    pub const fn unmapped() -> Self {
        VaArena {
            base: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            inner: Mutex::new(ArenaInner {
                owner: Vec::new(),
                entries: Vec::new(),
                scan_hint: 0,
            }),
        }
    }

    /// Reserve the arena's address space. Called once, after the VM (here:
    /// the process heap for the bookkeeping tables) is usable.
    pub fn init(&self, size: usize) {
        let size = round_page(size);
        let base = unsafe { platform::map_noaccess(size) };
        if base.is_null() {
            panic!("guardzone: unable to reserve a {:#x} byte arena", size);
        }
        let pages = size / PAGE_SIZE;
        {
            let mut inner = self.inner.lock();
            inner.owner = vec![0u32; pages];
            inner.entries = vec![EntrySlot::EMPTY; pages];
            inner.scan_hint = 0;
        }
        self.base.store(base as usize, Ordering::Release);
        self.size.store(size, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.size.load(Ordering::Acquire) != 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.load(Ordering::Acquire);
        let size = self.size.load(Ordering::Acquire);
        size != 0 && addr >= base && addr < base + size
    }

    /// Allocate `bytes` (a page multiple) plus one guard page. The non-guard
    /// subrange is committed read-write and reads as zeroes; the guard page
    /// stays inaccessible for the life of the entry. `elem_offset` is
    /// recorded in the entry for reverse lookup. Panics on exhaustion.
    pub fn alloc_guarded(
        &self,
        bytes: usize,
        placement: GuardPlacement,
        elem_offset: usize,
    ) -> usize {
        debug_assert_eq!(bytes, round_page(bytes));
        let need = bytes / PAGE_SIZE + 1;
        let base = self.base.load(Ordering::Acquire);

        let start_page = {
            let mut inner = self.inner.lock();
            let pages = inner.owner.len();
            let hint = inner.scan_hint;
            let start = find_run(&inner.owner, hint, pages, need)
                .or_else(|| find_run(&inner.owner, 0, pages, need))
                .unwrap_or_else(|| {
                    panic!(
                        "guardzone: arena exhausted allocating {:#x} bytes plus guard",
                        bytes
                    )
                });
            for page in &mut inner.owner[start..start + need] {
                *page = start as u32 + 1;
            }
            inner.entries[start] = EntrySlot {
                npages: need as u32,
                elem_offset: elem_offset as u32,
                flags: SLOT_ATOMIC,
            };
            inner.scan_hint = start + need;
            start
        };

        let range = base + start_page * PAGE_SIZE;
        let (commit, commit_len) = match placement {
            GuardPlacement::Last => (range, bytes),
            GuardPlacement::First => (range + PAGE_SIZE, bytes),
        };
        let ret = unsafe { platform::protect_read_write(commit as *mut u8, commit_len) };
        if ret != 0 {
            panic!(
                "guardzone: commit of {:#x}..{:#x} failed: {}",
                commit,
                commit + commit_len,
                std::io::Error::last_os_error()
            );
        }
        range
    }

    /// Change the protection of a committed subrange, as frees do before
    /// parking a range in the cache. Panics if the syscall fails.
    pub fn protect(&self, addr: usize, len: usize, prot: FreeProtection) {
        let ret = unsafe {
            match prot {
                FreeProtection::None => platform::protect_none(addr as *mut u8, len),
                FreeProtection::ReadOnly => platform::protect_read(addr as *mut u8, len),
            }
        };
        if ret != 0 {
            panic!(
                "guardzone: protection change of {:#x}..{:#x} failed: {}",
                addr,
                addr + len,
                std::io::Error::last_os_error()
            );
        }
    }

    /// Release a whole guarded range (guard page included): physical pages
    /// dropped, address space back to inaccessible, entry removed. `base`
    /// must be an entry start of exactly `len` bytes.
    ///
    /// The syscalls run under the map lock: the pages must not become
    /// claimable until they are inaccessible again, or a concurrent
    /// allocation could have its fresh commit flipped back to no-access.
    pub fn free_range(&self, base: usize, len: usize) {
        let arena_base = self.base.load(Ordering::Acquire);
        assert!(
            self.contains(base),
            "guardzone: release of {:#x}, outside the arena",
            base
        );
        let start = (base - arena_base) / PAGE_SIZE;
        let npages = len / PAGE_SIZE;

        let mut inner = self.inner.lock();
        let slot = inner.entries[start];
        if inner.owner[start] != start as u32 + 1 || slot.npages as usize != npages {
            panic!(
                "guardzone: release of {:#x} (+{:#x}) does not match a map entry",
                base, len
            );
        }
        unsafe {
            platform::advise_free(base as *mut u8, len);
            let ret = platform::protect_none(base as *mut u8, len);
            debug_assert_eq!(ret, 0);
        }
        for page in &mut inner.owner[start..start + npages] {
            *page = 0;
        }
        inner.entries[start] = EntrySlot::EMPTY;
    }

    /// The map entry covering `addr`, if any.
    pub fn lookup_entry(&self, addr: usize) -> Option<ArenaEntry> {
        if !self.contains(addr) {
            return None;
        }
        let base = self.base.load(Ordering::Acquire);
        let page = (addr - base) / PAGE_SIZE;
        let inner = self.inner.lock();
        let owner = inner.owner[page];
        if owner == 0 {
            return None;
        }
        let start = owner as usize - 1;
        let slot = inner.entries[start];
        Some(ArenaEntry {
            start: base + start * PAGE_SIZE,
            end: base + (start + slot.npages as usize) * PAGE_SIZE,
            elem_offset: slot.elem_offset as usize,
            atomic: slot.flags & SLOT_ATOMIC != 0,
        })
    }
}

/// First run of `need` free pages in `owner[from..to)`, skipping past the
/// first occupied page of any window that fails.
fn find_run(owner: &[u32], from: usize, to: usize, need: usize) -> Option<usize> {
    let mut start = from;
    while start + need <= to {
        match owner[start..start + need].iter().position(|&o| o != 0) {
            None => return Some(start),
            Some(occupied) => start += occupied + 1,
        }
    }
    None
}
