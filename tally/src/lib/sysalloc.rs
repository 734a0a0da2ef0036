//! The allocator underneath the interposer.
//!
//! The tracking strategies never call `malloc` by name; they go through the
//! [`UnderlyingAllocator`] capability so production code can wire in the
//! real, `dlsym`-resolved C allocator while tests wire in a fake. Before
//! resolution completes (or if it never does), requests are served by a
//! `brk`-style bootstrap that hands out zeroed, never-reclaimed memory.

use std::ffi::c_void;
use std::ptr;

use libc::{dlerror, dlsym, size_t, RTLD_NEXT};

pub type CMalloc = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type CCalloc = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type CRealloc = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type CMemalign = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type CFree = unsafe extern "C" fn(*mut c_void);

/// What a tracking strategy needs from the allocator it shadows.
///
/// All methods follow the C conventions: null on failure, `release` never
/// fails, `reallocate` of a null pointer is a plain allocation.
pub trait UnderlyingAllocator: Send + Sync {
    unsafe fn allocate(&self, size: usize) -> *mut u8;
    unsafe fn allocate_zeroed(&self, nmemb: usize, size: usize) -> *mut u8;
    unsafe fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8;
    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8;
    unsafe fn release(&self, ptr: *mut u8);
}

/// The real C allocator, looked up past the interposer with
/// `dlsym(RTLD_NEXT, ..)`. Unresolved symbols are not fatal: the affected
/// operations fall back to the bootstrap until a later resolution attempt
/// succeeds.
#[derive(Clone, Copy, Default)]
pub struct SystemAllocator {
    malloc: Option<CMalloc>,
    calloc: Option<CCalloc>,
    realloc: Option<CRealloc>,
    memalign: Option<CMemalign>,
    free: Option<CFree>,
}

impl SystemAllocator {
    /// Resolve all five symbols in one pass.
    ///
    /// # Safety
    /// May only run once the dynamic linker is functional. On a glibc
    /// system `dlsym` allocates internally, so when this is called from an
    /// interposed path the caller must already be routing re-entrant
    /// requests to the bootstrap.
    pub unsafe fn resolve() -> SystemAllocator {
        SystemAllocator {
            malloc: fetch(c"malloc".as_ptr()).map(|s| std::mem::transmute::<*mut c_void, CMalloc>(s)),
            calloc: fetch(c"calloc".as_ptr()).map(|s| std::mem::transmute::<*mut c_void, CCalloc>(s)),
            realloc: fetch(c"realloc".as_ptr())
                .map(|s| std::mem::transmute::<*mut c_void, CRealloc>(s)),
            memalign: fetch(c"memalign".as_ptr())
                .map(|s| std::mem::transmute::<*mut c_void, CMemalign>(s)),
            free: fetch(c"free".as_ptr()).map(|s| std::mem::transmute::<*mut c_void, CFree>(s)),
        }
    }

    pub fn fully_resolved(&self) -> bool {
        self.malloc.is_some()
            && self.calloc.is_some()
            && self.realloc.is_some()
            && self.memalign.is_some()
            && self.free.is_some()
    }

    /// [`crate::errors::TrackError::Resolution`] when any symbol is still
    /// missing. Callers treat this as a warning, not a stop.
    pub fn ensure_resolved(&self) -> Result<(), crate::errors::TrackError> {
        if self.fully_resolved() {
            Ok(())
        } else {
            Err(crate::errors::TrackError::Resolution)
        }
    }
}

unsafe fn fetch(name: *const libc::c_char) -> Option<*mut c_void> {
    // Clear any stale error, then look the symbol up. A symbol that is
    // genuinely absent reports through dlerror rather than by panicking.
    dlerror();
    let sym = dlsym(RTLD_NEXT, name);
    if sym.is_null() || !dlerror().is_null() {
        None
    } else {
        Some(sym)
    }
}

impl UnderlyingAllocator for SystemAllocator {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        match self.malloc {
            Some(f) => f(size).cast(),
            None => bootstrap_alloc(size),
        }
    }

    unsafe fn allocate_zeroed(&self, nmemb: usize, size: usize) -> *mut u8 {
        match self.calloc {
            Some(f) => f(nmemb, size).cast(),
            None => match nmemb.checked_mul(size) {
                // The bootstrap zeroes everything it returns.
                Some(total) => bootstrap_alloc(total),
                None => ptr::null_mut(),
            },
        }
    }

    unsafe fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        match self.memalign {
            Some(f) => f(alignment, size).cast(),
            None => bootstrap_aligned(alignment, size),
        }
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.realloc {
            Some(f) => f(ptr.cast(), size).cast(),
            // The bootstrap knows no block sizes, so nothing is copied.
            None => bootstrap_alloc(size),
        }
    }

    unsafe fn release(&self, ptr: *mut u8) {
        if let Some(f) = self.free {
            f(ptr.cast());
        }
        // Bootstrap memory is never reclaimed.
    }
}

/// Forwarding impl so a shared handle (`Arc<A>`) satisfies the same
/// capability as the allocator it wraps. Only the crate that owns the
/// trait may provide this, so it lives here rather than at the call site.
impl<T: UnderlyingAllocator + ?Sized> UnderlyingAllocator for std::sync::Arc<T> {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        (**self).allocate(size)
    }

    unsafe fn allocate_zeroed(&self, nmemb: usize, size: usize) -> *mut u8 {
        (**self).allocate_zeroed(nmemb, size)
    }

    unsafe fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        (**self).allocate_aligned(alignment, size)
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        (**self).reallocate(ptr, size)
    }

    unsafe fn release(&self, ptr: *mut u8) {
        (**self).release(ptr)
    }
}

/// Extend the program break and hand out the fresh, zeroed range.
pub unsafe fn bootstrap_alloc(size: usize) -> *mut u8 {
    let p = libc::sbrk(size as libc::intptr_t);
    if p as isize == -1 {
        return ptr::null_mut();
    }
    ptr::write_bytes(p.cast::<u8>(), 0, size);
    p.cast()
}

/// Aligned flavor of [`bootstrap_alloc`]: over-extend and round the start
/// up. Wasted slack does not matter, bootstrap memory is never returned.
pub unsafe fn bootstrap_aligned(alignment: usize, size: usize) -> *mut u8 {
    if alignment <= 1 || !alignment.is_power_of_two() {
        return bootstrap_alloc(size);
    }
    let total = match size.checked_add(alignment) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    let raw = bootstrap_alloc(total);
    if raw.is_null() {
        return raw;
    }
    let aligned = (raw as usize + alignment - 1) & !(alignment - 1);
    aligned as *mut u8
}
