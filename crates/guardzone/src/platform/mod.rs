#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map anonymous read-write memory. Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Reserve anonymous address space with no access permissions. Nothing is
/// committed until a subrange is re-protected. Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_noaccess(size: usize) -> *mut u8 {
    sys::map_noaccess(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by a `map_*` function with the same `size`.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Make a region inaccessible. Returns 0 on success.
///
/// # Safety
/// Region must be mapped and page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> libc::c_int {
    sys::protect_none(ptr, size)
}

/// Make a region read-only. Returns 0 on success.
///
/// # Safety
/// Region must be mapped and page-aligned.
#[inline]
pub unsafe fn protect_read(ptr: *mut u8, size: usize) -> libc::c_int {
    sys::protect_read(ptr, size)
}

/// Make a region read-write. Returns 0 on success.
///
/// # Safety
/// Region must be mapped and page-aligned.
#[inline]
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> libc::c_int {
    sys::protect_read_write(ptr, size)
}

/// Release the physical pages behind a region while keeping the mapping.
/// The region reads as zeroes when next committed.
///
/// # Safety
/// Region must be mapped and page-aligned.
#[inline]
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    sys::advise_free(ptr, size);
}
