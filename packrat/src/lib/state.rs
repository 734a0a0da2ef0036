use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

use tally::config::Settings;
use tally::scribe::Scribe;
use tally::sysalloc::{self, SystemAllocator, UnderlyingAllocator};
use tally::tracker::Tracker;

use crate::ffi::*;

// Initialization phases. Exactly one thread moves the process from COLD to
// READY; its own re-entrant calls (dlsym and the tracker's construction
// both allocate) are recognizable by TID and served outside the tracker.
const COLD: usize = 0;
const WIRING: usize = 1;
const READY: usize = 2;

static PHASE: AtomicUsize = AtomicUsize::new(COLD);
static INIT_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Resolved real allocator, set before the tracker is built so that init's
/// own allocations stop leaning on `sbrk` as early as possible.
static REAL: OnceCell<SystemAllocator> = OnceCell::new();
static TRACKER: OnceCell<Tracker> = OnceCell::new();

pub enum Route {
    /// Tracking is up; serve through the tracker.
    Ready(&'static Tracker),
    /// This is the initializing thread calling back into itself; serve via
    /// [`sidestep_alloc`] and friends.
    Bootstrap,
}

/// Every interposed call starts here. First caller wires the subsystem up,
/// re-entrant calls from that same thread bootstrap, everyone else waits.
pub unsafe fn route() -> Route {
    loop {
        match PHASE.load(Ordering::Acquire) {
            READY => return Route::Ready(TRACKER.get().unwrap_or_else(|| graceful_exit("ready phase without a tracker"))),
            WIRING => {
                if pthread_self() as usize == INIT_THREAD.load(Ordering::Relaxed) {
                    return Route::Bootstrap;
                }
                core::hint::spin_loop();
            }
            _ => {
                if PHASE
                    .compare_exchange(COLD, WIRING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    INIT_THREAD.store(pthread_self() as usize, Ordering::Relaxed);
                    wire();
                    PHASE.store(READY, Ordering::Release);
                }
            }
        }
    }
}

unsafe fn wire() {
    let system = SystemAllocator::resolve();
    let _ = REAL.set(system);
    if let Err(e) = system.ensure_resolved() {
        // Not fatal: unresolved operations ride the sbrk bootstrap.
        Scribe::console().say(format_args!("{}", e));
    }

    let settings = Settings::from_env();
    match Tracker::new(&settings, Box::new(system)) {
        Ok(tracker) => {
            let _ = TRACKER.set(tracker);
        }
        // Only the arena strategy can fail construction, and it has no
        // fallback once selected.
        Err(_) => graceful_exit("failed to reserve the tracking arena"),
    }
}

// The pass-through allocator: the resolved real implementation once it
// exists, the sbrk bootstrap before that. Serves three callers: the
// initializing thread's re-entrant requests, bookkeeping requests flagged
// by the ownership book, and all traffic while tracking is toggled off.

pub unsafe fn sidestep_alloc(size: size_t) -> *mut u8 {
    match REAL.get() {
        Some(real) => real.allocate(size),
        None => sysalloc::bootstrap_alloc(size),
    }
}

pub unsafe fn sidestep_zeroed(nmemb: size_t, size: size_t) -> *mut u8 {
    match REAL.get() {
        Some(real) => real.allocate_zeroed(nmemb, size),
        None => match nmemb.checked_mul(size) {
            Some(total) => sysalloc::bootstrap_alloc(total),
            None => std::ptr::null_mut(),
        },
    }
}

pub unsafe fn sidestep_aligned(alignment: size_t, size: size_t) -> *mut u8 {
    match REAL.get() {
        Some(real) => real.allocate_aligned(alignment, size),
        None => sysalloc::bootstrap_aligned(alignment, size),
    }
}

pub unsafe fn sidestep_realloc(ptr: *mut u8, size: size_t) -> *mut u8 {
    match REAL.get() {
        Some(real) => real.reallocate(ptr, size),
        None => sysalloc::bootstrap_alloc(size),
    }
}

pub unsafe fn sidestep_free(ptr: *mut u8) {
    if let Some(real) = REAL.get() {
        real.release(ptr);
    }
    // Bootstrap memory is never handed back.
}
