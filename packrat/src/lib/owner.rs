use std::hash::BuildHasherDefault;
use std::ptr::{addr_of, addr_of_mut};
use std::sync::{Mutex, TryLockError};

use ahash::AHasher;
use indexmap::IndexMap;
use once_cell::sync::Lazy;

use crate::ffi::*;

type OwnerBook = IndexMap<pthread_t, bool, BuildHasherDefault<AHasher>>;

/// The tracking path must never re-enter itself: a record insertion that
/// grows a `Vec` calls `malloc`, which lands back in this library. Each
/// thread therefore keeps a flag saying whether the next request belongs to
/// the application (track it) or to the shim's own bookkeeping (hand it to
/// the real allocator). A stable-size TID-indexed map holds the flags; each
/// entry is touched only by the thread whose TID indexes it.
pub static mut APP_OWNED: Lazy<OwnerBook> = Lazy::new(OwnerBook::default);
pub const MAX_THREADS_NUM: usize = 256;

pub unsafe fn app_owned() -> bool {
    // The map itself allocates when first reserved, and that allocation
    // re-enters this function. Only one thread initializes; its nested
    // calls report "not app-owned" so they route to the real allocator,
    // and everyone else waits until the map is usable.
    static mut INIT_LOCK: Option<Mutex<()>> = Some(Mutex::new(()));
    static mut INIT_THREAD: pthread_t = 0;

    let tid = pthread_self();
    match &*addr_of!(INIT_LOCK) {
        // Existence of the mutex is a signal that the map
        // has not been initialized.
        Some(mtx) => match mtx.try_lock() {
            Ok(_) => {
                *addr_of_mut!(INIT_THREAD) = tid;
                // This reserve triggers one more allocation...
                (*addr_of_mut!(APP_OWNED)).reserve(MAX_THREADS_NUM);
                *addr_of_mut!(INIT_LOCK) = None;
            }
            Err(e) => match e {
                TryLockError::Poisoned(_) => {
                    graceful_exit("poisoned mutex upon TID map init");
                }
                TryLockError::WouldBlock => {
                    if tid == *addr_of!(INIT_THREAD) {
                        // ...which reaches this block. Bookkeeping context,
                        // so no tracking must be made.
                        return false;
                    }
                    // The rest of the threads wait until
                    // initialization is complete.
                    while (*addr_of!(INIT_LOCK)).is_some() {}
                }
            },
        },
        None => {
            if tid == *addr_of!(INIT_THREAD) {
                // Corner case: the first `insert` allocates too.
                *addr_of_mut!(INIT_THREAD) = 0;
                if (*addr_of!(APP_OWNED)).get(&tid).is_none() {
                    return false;
                }
            }
        }
    };
    // The most frequently run block; everything above deals with init.
    match (*addr_of!(APP_OWNED)).get(&tid) {
        Some(verdict) => *verdict,
        None => {
            if (*addr_of!(APP_OWNED)).len() + 1 > MAX_THREADS_NUM {
                graceful_exit("more threads observed than the book can hold");
            }
            (*addr_of_mut!(APP_OWNED)).insert(tid, true);
            true
        }
    }
}

/// Mark this thread as doing shim bookkeeping; its allocation calls go to
/// the real allocator until [`go_app`].
#[inline(always)]
pub unsafe fn go_native() {
    if let Some(rf) = (*addr_of_mut!(APP_OWNED)).get_mut(&pthread_self()) {
        *rf = false;
    }
}

/// Hand the thread back to the application.
#[inline(always)]
pub unsafe fn go_app() {
    if let Some(rf) = (*addr_of_mut!(APP_OWNED)).get_mut(&pthread_self()) {
        *rf = true;
    }
}
