use crate::platform;
use crate::util::round_page;

/// Bootstrap page pool usable before the VA arena exists.
///
/// The backing range is taken from the physical layer once at configure
/// time (modeled here as one anonymous mapping) and handed out strictly
/// bump-pointer. Nothing is ever returned; pre-VM allocations freed later
/// are leaked by design.
pub struct Reserve {
    cursor: usize,
    remaining: usize,
}

impl Reserve {
    pub const fn empty() -> Self {
        Reserve {
            cursor: 0,
            remaining: 0,
        }
    }

    /// Steal `size` bytes for the reserve. Panics if the mapping fails;
    /// a guard engine that cannot bootstrap has nothing to fall back to.
    pub fn steal(size: usize) -> Self {
        let size = round_page(size);
        let base = unsafe { platform::map_anonymous(size) };
        if base.is_null() {
            panic!("guardzone: unable to steal {:#x} bytes for the reserve", size);
        }
        Reserve {
            cursor: base as usize,
            remaining: size,
        }
    }

    /// Carve `bytes` (a page multiple) off the front of the reserve.
    pub fn carve(&mut self, bytes: usize) -> usize {
        debug_assert_eq!(bytes, round_page(bytes));
        if self.remaining < bytes {
            panic!(
                "guardzone: reserve exhausted ({:#x} bytes requested, {:#x} remaining)",
                bytes, self.remaining
            );
        }
        let addr = self.cursor;
        self.cursor += bytes;
        self.remaining -= bytes;
        addr
    }
}
