//! Per-allocation metadata: layout math plus the one unsafe layer that
//! overlays the header record on computed addresses. Everything above this
//! module works with [`GuardLayout`] values and header copies.

use crate::arena::ArenaEntry;
use crate::config::LayoutMode;
use crate::util::{round_page, trunc_page, PAGE_SIZE};
use crate::zone::Zone;
use core::ptr;

/// Proof that a header is genuine. Fixed for compatibility with dumps.
pub const SIGNATURE: u32 = 0xABAD_CAFE;

/// Byte stamped over the residue at allocation and verified at free.
pub const FILL_PATTERN: u8 = 0x67; // 'g'

/// Owner recorded for allocations made before the VA arena exists.
const EARLY_OWNER_ADDR: usize = 0xDEAD_201E;

/// Engine-owned record adjoining every guarded element.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct GuardHeader {
    pub owner: *const Zone,
    pub elem_size: u32,
    pub signature: u32,
}

pub const HEADER_SIZE: usize = core::mem::size_of::<GuardHeader>();

impl GuardHeader {
    pub fn early_owner() -> *const Zone {
        EARLY_OWNER_ADDR as *const Zone
    }

    pub fn is_early_owner(owner: *const Zone) -> bool {
        owner as usize == EARLY_OWNER_ADDR
    }
}

/// Computed addresses of one guarded allocation.
#[derive(Clone, Copy, Debug)]
pub struct GuardLayout {
    /// Start of the mapped range, guard page included.
    pub base: usize,
    pub elem: usize,
    pub header: usize,
    /// Underflow mode duplicates the header at the trailing edge so
    /// reverse lookup can find it at a fixed offset from the entry end.
    pub header_copy: Option<usize>,
    /// `round_page(elem_size + HEADER_SIZE)`.
    pub rounded_size: usize,
}

/// Page-rounded size of the element-plus-header portion of a range.
pub fn rounded_size(elem_size: usize) -> usize {
    round_page(elem_size + HEADER_SIZE)
}

/// Lay out an allocation whose mapped range starts at `base`.
pub fn layout_for(base: usize, elem_size: usize, mode: LayoutMode) -> GuardLayout {
    let rounded = rounded_size(elem_size);
    let residue = rounded - elem_size;
    match mode {
        LayoutMode::Overflow => GuardLayout {
            base,
            elem: base + residue,
            header: base + residue - HEADER_SIZE,
            header_copy: None,
            rounded_size: rounded,
        },
        LayoutMode::Underflow => {
            let start = base + PAGE_SIZE;
            GuardLayout {
                base,
                elem: start,
                header: start + elem_size,
                header_copy: Some(start + rounded - HEADER_SIZE),
                rounded_size: rounded,
            }
        }
    }
}

/// Recover the layout from the pointer handed back to the caller, as free
/// must. The base this computes is page-aligned for any pointer actually
/// produced by [`layout_for`]; free treats a misaligned result as a bad
/// pointer.
pub fn layout_from_element(elem: usize, elem_size: usize, mode: LayoutMode) -> GuardLayout {
    let rounded = rounded_size(elem_size);
    let residue = rounded - elem_size;
    let base = match mode {
        LayoutMode::Overflow => elem.wrapping_sub(residue),
        LayoutMode::Underflow => elem.wrapping_sub(PAGE_SIZE),
    };
    layout_for(base, elem_size, mode)
}

/// The committed (non-guard) subrange of the allocation.
pub fn committed_range(layout: &GuardLayout, mode: LayoutMode) -> (usize, usize) {
    match mode {
        LayoutMode::Overflow => (layout.base, layout.rounded_size),
        LayoutMode::Underflow => (layout.base + PAGE_SIZE, layout.rounded_size),
    }
}

/// Residue stamped at allocation time: everything committed that is neither
/// element nor header.
fn fill_bounds(layout: &GuardLayout, mode: LayoutMode) -> (usize, usize) {
    match mode {
        LayoutMode::Overflow => (layout.base, layout.header),
        LayoutMode::Underflow => scan_bounds(layout, mode),
    }
}

/// Residue verified at free time. Overflow mode checks the tail of the
/// element's page below the header (underruns land there); underflow mode
/// checks between the trailing header and the trailing header copy
/// (overruns land there).
fn scan_bounds(layout: &GuardLayout, mode: LayoutMode) -> (usize, usize) {
    match mode {
        LayoutMode::Overflow => (trunc_page(layout.elem), layout.header),
        LayoutMode::Underflow => {
            // Empty when the element packs the page so tightly that the
            // trailing header and its copy meet.
            let start = layout.header + HEADER_SIZE;
            let end = layout.base + PAGE_SIZE + layout.rounded_size - HEADER_SIZE;
            (start, end.max(start))
        }
    }
}

/// Zero the element, stamp the residue, write the header (and its trailing
/// copy in underflow mode).
///
/// # Safety
/// The committed subrange of `layout` must be mapped read-write.
pub unsafe fn write(layout: &GuardLayout, mode: LayoutMode, owner: *const Zone, elem_size: usize) {
    let (commit, commit_len) = committed_range(layout, mode);
    ptr::write_bytes(commit as *mut u8, 0, commit_len);

    let (fill_start, fill_end) = fill_bounds(layout, mode);
    ptr::write_bytes(fill_start as *mut u8, FILL_PATTERN, fill_end - fill_start);

    let header = GuardHeader {
        owner,
        elem_size: elem_size as u32,
        signature: SIGNATURE,
    };
    write_header(layout.header, header);
    if let Some(copy) = layout.header_copy {
        write_header(copy, header);
    }
}

/// # Safety
/// `addr` must be mapped and writable for `HEADER_SIZE` bytes.
pub unsafe fn write_header(addr: usize, header: GuardHeader) {
    (addr as *mut GuardHeader).write_unaligned(header);
}

/// # Safety
/// `addr` must be mapped and readable for `HEADER_SIZE` bytes.
pub unsafe fn read_header(addr: usize) -> GuardHeader {
    (addr as *const GuardHeader).read_unaligned()
}

/// First residue byte deviating from the fill pattern, with its contents.
///
/// # Safety
/// The scan bounds of `layout` must be mapped and readable.
pub unsafe fn residue_deviation(layout: &GuardLayout, mode: LayoutMode) -> Option<(usize, u8)> {
    let (start, end) = scan_bounds(layout, mode);
    (start..end).find_map(|addr| {
        let contents = *(addr as *const u8);
        (contents != FILL_PATTERN).then_some((addr, contents))
    })
}

/// Recover the header given only a map entry, as reverse lookup must.
///
/// Underflow mode reads the trailing copy at a fixed offset from the entry
/// end. Overflow mode uses the element offset recorded in the entry when
/// present; otherwise it scans the committed range one 32-bit word at a
/// time for the signature (the header then ends one word past the match)
/// and panics if the signature never appears.
///
/// # Safety
/// The entry's committed subrange must be mapped and readable.
pub unsafe fn read_from_entry(entry: &ArenaEntry, mode: LayoutMode) -> GuardHeader {
    match mode {
        LayoutMode::Underflow => read_header(entry.end - HEADER_SIZE),
        LayoutMode::Overflow => {
            if entry.elem_offset != 0 {
                return read_header(entry.start + entry.elem_offset - HEADER_SIZE);
            }
            let committed_end = entry.end - PAGE_SIZE;
            let mut word = entry.start;
            while word + 4 <= committed_end {
                if *(word as *const u32) == SIGNATURE {
                    return read_header(word + 4 - HEADER_SIZE);
                }
                word += 4;
            }
            panic!(
                "guardzone: signature missing in map entry {:#x}..{:#x}",
                entry.start, entry.end
            );
        }
    }
}
