use std::sync::atomic::{AtomicBool, Ordering};

use tally::callsite::Trail;

use crate::ffi::*;
use crate::owner;
use crate::state::{self, Route};

/// Runtime toggle, exported so the monitored program, a test harness or an
/// attached debugger can flip it without reloading the shim. Atomic so a
/// concurrent flip is at worst one extra tracked or bypassed call, never a
/// torn read.
#[allow(non_upper_case_globals)]
#[no_mangle]
pub static __packrat_enabled: AtomicBool = AtomicBool::new(true);

#[inline(always)]
fn tracking_on() -> bool {
    __packrat_enabled.load(Ordering::Relaxed)
}

/// Function interposition catches the five dynamic-memory primitives.
///
/// Two kinds of request exist: those made by the application, and those
/// made by this library's own bookkeeping. The first kind goes through the
/// tracker; the second must reach the real allocator untouched, or the
/// single strategy lock would deadlock against itself. The ownership book
/// tells the two apart, and the same logic holds across all five entries.
#[no_mangle]
unsafe extern "C" fn malloc(size: size_t) -> *mut void {
    let tracker = match state::route() {
        Route::Ready(t) => t,
        Route::Bootstrap => return state::sidestep_alloc(size).cast(),
    };
    if !tracking_on() || !owner::app_owned() {
        return state::sidestep_alloc(size).cast();
    }

    let trail = Trail::capture();
    owner::go_native();
    let p = tracker.allocate(size, &trail);
    owner::go_app();
    p.cast()
}

#[no_mangle]
unsafe extern "C" fn calloc(nmemb: size_t, size: size_t) -> *mut void {
    let tracker = match state::route() {
        Route::Ready(t) => t,
        Route::Bootstrap => return state::sidestep_zeroed(nmemb, size).cast(),
    };
    if !tracking_on() || !owner::app_owned() {
        return state::sidestep_zeroed(nmemb, size).cast();
    }

    let trail = Trail::capture();
    owner::go_native();
    let p = tracker.allocate_zeroed(nmemb, size, &trail);
    owner::go_app();
    p.cast()
}

#[no_mangle]
unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut void {
    let tracker = match state::route() {
        Route::Ready(t) => t,
        Route::Bootstrap => return state::sidestep_aligned(alignment, size).cast(),
    };
    if !tracking_on() || !owner::app_owned() {
        return state::sidestep_aligned(alignment, size).cast();
    }

    let trail = Trail::capture();
    owner::go_native();
    let p = tracker.allocate_aligned(alignment, size, &trail);
    owner::go_app();
    p.cast()
}

#[no_mangle]
unsafe extern "C" fn realloc(ptr: *mut void, size: size_t) -> *mut void {
    let tracker = match state::route() {
        Route::Ready(t) => t,
        Route::Bootstrap => return state::sidestep_realloc(ptr.cast(), size).cast(),
    };
    if !tracking_on() || !owner::app_owned() {
        return state::sidestep_realloc(ptr.cast(), size).cast();
    }

    let trail = Trail::capture();
    owner::go_native();
    let p = tracker.reallocate(ptr.cast(), size, &trail);
    owner::go_app();
    p.cast()
}

#[no_mangle]
unsafe extern "C" fn free(ptr: *mut void) {
    let tracker = match state::route() {
        Route::Ready(t) => t,
        Route::Bootstrap => return,
    };
    if !tracking_on() || !owner::app_owned() {
        // Tracking off: the address goes to the real allocator even if it
        // was served by a strategy. Same exposure as the shim's ancestors.
        state::sidestep_free(ptr.cast());
        return;
    }

    let trail = Trail::capture();
    owner::go_native();
    tracker.release(ptr.cast(), &trail);
    owner::go_app();
}

/// Introspection hook: print the live and freed record lists to the
/// diagnostic channel. Callable from a debugger or a deliberate call site
/// in the monitored program; never mutates tracking state.
#[no_mangle]
pub unsafe extern "C" fn __packrat_dump() {
    if let Route::Ready(tracker) = state::route() {
        let owned = owner::app_owned();
        if owned {
            owner::go_native();
        }
        tracker.dump();
        if owned {
            owner::go_app();
        }
    }
}
