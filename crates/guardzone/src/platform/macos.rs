use core::ptr;

pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

pub unsafe fn map_noaccess(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> libc::c_int {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE)
}

pub unsafe fn protect_read(ptr: *mut u8, size: usize) -> libc::c_int {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ)
}

pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> libc::c_int {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    )
}

/// On macOS MADV_DONTNEED is advisory-only, so atomically replace the
/// mapping with fresh zero-filled anonymous pages instead; callers follow
/// up with `protect_none` where the range must stay inaccessible.
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    let ret = libc::mmap(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
        -1,
        0,
    );
    debug_assert!(
        ret != libc::MAP_FAILED,
        "mmap(MAP_FIXED) failed in advise_free"
    );
}
