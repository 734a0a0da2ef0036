use std::alloc::Layout;
use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tally::callsite::Trail;
use tally::config::{Settings, StrategyKind};
use tally::ledger::Ledger;
use tally::scribe::Scribe;
use tally::sysalloc::UnderlyingAllocator;
use tally::tracker::{Strategy, Tracker};

/// Underlying allocator double: serves real memory off the Rust global
/// allocator, counts traffic, and can simulate exhaustion.
struct FakeAllocator {
    layouts: Mutex<HashMap<usize, Layout>>,
    allocs: AtomicUsize,
    frees: AtomicUsize,
    parched: AtomicBool,
}

impl FakeAllocator {
    fn new() -> Arc<FakeAllocator> {
        Arc::new(FakeAllocator {
            layouts: Mutex::new(HashMap::new()),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            parched: AtomicBool::new(false),
        })
    }

    fn grab(&self, size: usize, align: usize, zeroed: bool) -> *mut u8 {
        if self.parched.load(Ordering::Relaxed) {
            return ptr::null_mut();
        }
        let layout = match Layout::from_size_align(size.max(1), align.max(1).next_power_of_two()) {
            Ok(l) => l,
            Err(_) => return ptr::null_mut(),
        };
        let p = unsafe {
            if zeroed {
                std::alloc::alloc_zeroed(layout)
            } else {
                std::alloc::alloc(layout)
            }
        };
        if !p.is_null() {
            self.layouts.lock().unwrap().insert(p as usize, layout);
            self.allocs.fetch_add(1, Ordering::Relaxed);
        }
        p
    }
}

impl UnderlyingAllocator for FakeAllocator {
    unsafe fn allocate(&self, size: usize) -> *mut u8 {
        self.grab(size, 16, false)
    }

    unsafe fn allocate_zeroed(&self, nmemb: usize, size: usize) -> *mut u8 {
        match nmemb.checked_mul(size) {
            Some(total) => self.grab(total, 16, true),
            None => ptr::null_mut(),
        }
    }

    unsafe fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        self.grab(size, alignment, false)
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        let old = self.layouts.lock().unwrap().remove(&(ptr as usize));
        match old {
            Some(layout) => {
                let p = std::alloc::realloc(ptr, layout, size.max(1));
                if !p.is_null() {
                    let fresh = Layout::from_size_align(size.max(1), layout.align()).unwrap();
                    self.layouts.lock().unwrap().insert(p as usize, fresh);
                }
                p
            }
            None => self.allocate(size),
        }
    }

    unsafe fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        if let Some(layout) = self.layouts.lock().unwrap().remove(&(ptr as usize)) {
            std::alloc::dealloc(ptr, layout);
            self.frees.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn scratch_dir(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_TARGET_TMPDIR"))
        .join(format!("packrat-{}-{}", std::process::id(), name))
}

/// Files-strategy tracker whose log lands in `<dir>/log.txt` without the
/// stdout echo, so tests can read it back.
fn files_tracker(name: &str) -> (Tracker, PathBuf, Arc<FakeAllocator>) {
    let dir = scratch_dir(name);
    let ledger = Ledger::new(&dir);
    let scribe = Scribe::file_only(&dir.join("log.txt")).unwrap();
    let fake = FakeAllocator::new();
    let tracker = Tracker::assemble(Strategy::Files(ledger), scribe, Box::new(fake.clone()));
    (tracker, dir, fake)
}

fn arena_tracker() -> Tracker {
    let settings = Settings {
        strategy: StrategyKind::Arena,
        arena_base: None,
        arena_size: 1 << 20,
        ..Settings::default()
    };
    Tracker::new(&settings, Box::new(FakeAllocator::new())).unwrap()
}

fn log_lines(dir: &PathBuf) -> Vec<String> {
    std::fs::read_to_string(dir.join("log.txt"))
        .unwrap_or_default()
        .lines()
        .map(str::to_owned)
        .collect()
}

#[test]
fn live_count_is_allocations_minus_matched_releases() {
    let (tracker, dir, _) = files_tracker("counts");
    let trail = Trail::empty();

    let mut addrs = Vec::new();
    for size in [16usize, 32, 48, 64, 80] {
        let p = tracker.allocate(size, &trail);
        assert!(!p.is_null());
        addrs.push(p);
    }
    tracker.release(addrs[1], &trail);
    tracker.release(addrs[3], &trail);

    let snap = tracker.snapshot();
    assert_eq!(snap.live, 3);
    assert_eq!(snap.freed, 2);

    // On-disk layout: one record file per allocation plus the log.
    assert!(dir.join("a0-s16-l1").is_file());
    assert!(dir.join("a4-s80-l1").is_file());
    assert!(dir.join("log.txt").is_file());
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn allocations_come_back_zeroed() {
    let (tracker, dir, _) = files_tracker("zeroed");
    let trail = Trail::empty();
    for p in [
        tracker.allocate(256, &trail),
        tracker.allocate_zeroed(4, 64, &trail),
        tracker.allocate_aligned(64, 256, &trail),
    ] {
        assert!(!p.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(p, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn realloc_carries_the_old_prefix() {
    let (tracker, dir, _) = files_tracker("reseat");
    let trail = Trail::empty();

    let old = tracker.allocate(32, &trail);
    unsafe { ptr::write_bytes(old, 0x5a, 32) };

    let fresh = tracker.reallocate(old, 96, &trail);
    assert!(!fresh.is_null());
    assert_ne!(fresh, old);

    let bytes = unsafe { std::slice::from_raw_parts(fresh, 96) };
    assert!(bytes[..32].iter().all(|&b| b == 0x5a));
    assert!(bytes[32..].iter().all(|&b| b == 0));

    let snap = tracker.snapshot();
    assert_eq!(snap.live, 1);
    assert_eq!(snap.freed, 1);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn realloc_of_a_stranger_is_a_plain_allocation() {
    let (tracker, dir, _) = files_tracker("stranger");
    let trail = Trail::empty();

    let fresh = tracker.reallocate(0x10 as *mut u8, 24, &trail);
    assert!(!fresh.is_null());

    let snap = tracker.snapshot();
    assert_eq!(snap.live, 1);
    assert_eq!(snap.freed, 0);
    assert!(log_lines(&dir).iter().any(|l| l.contains("untracked")));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn second_release_of_an_address_is_tagged_invalid() {
    let (tracker, dir, _) = files_tracker("invalid");
    let trail = Trail::empty();

    let p = tracker.allocate(16, &trail);
    assert!(!p.is_null());
    tracker.release(p, &trail);
    let snap = tracker.snapshot();

    tracker.release(p, &trail);
    assert_eq!(tracker.snapshot(), snap);

    let invalid: Vec<String> =
        log_lines(&dir).into_iter().filter(|l| l.contains("invalid")).collect();
    assert_eq!(invalid.len(), 1);
    assert!(invalid[0].contains("free("));
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn disabled_tracking_leaves_no_trace() {
    let (tracker, dir, fake) = files_tracker("disabled");
    tracker.set_enabled(false);

    let tracker = Arc::new(tracker);
    let mut workers = Vec::new();
    for _ in 0..4 {
        let tracker = tracker.clone();
        workers.push(std::thread::spawn(move || {
            let trail = Trail::empty();
            for round in 0..250 {
                let p = tracker.allocate(16 + round % 64, &trail);
                assert!(!p.is_null());
                let q = tracker.reallocate(p, 32 + round % 64, &trail);
                assert!(!q.is_null());
                tracker.release(q, &trail);
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let snap = tracker.snapshot();
    assert_eq!((snap.live, snap.freed), (0, 0));
    assert!(log_lines(&dir).is_empty());
    // The traffic really went through the underlying allocator.
    assert_eq!(fake.allocs.load(Ordering::Relaxed), 1000);
    assert_eq!(fake.frees.load(Ordering::Relaxed), 1000);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn bypass_passes_exhaustion_through() {
    let (tracker, dir, fake) = files_tracker("parched");
    tracker.set_enabled(false);
    fake.parched.store(true, Ordering::Relaxed);
    assert!(tracker.allocate(64, &Trail::empty()).is_null());
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn ledger_lookup_follows_liveness() {
    let (tracker, dir, _) = files_tracker("lookup");
    let trail = Trail::empty();
    let p = tracker.allocate(40, &trail);

    let Strategy::Files(ledger) = tracker.strategy() else {
        panic!("files strategy expected");
    };
    let found = ledger.lookup(p as usize).unwrap();
    assert_eq!(found.size, 40);
    assert_eq!(found.alignment, 1);

    tracker.release(p, &trail);
    assert!(ledger.lookup(p as usize).is_none());
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn arena_strategy_serves_the_same_facade() {
    let tracker = arena_tracker();
    let trail = Trail::empty();

    let a = tracker.allocate(600, &trail);
    let b = tracker.allocate_zeroed(2, 300, &trail);
    assert!(!a.is_null() && !b.is_null());
    assert_ne!(a, b);

    let bytes = unsafe { std::slice::from_raw_parts(b, 600) };
    assert!(bytes.iter().all(|&v| v == 0));

    tracker.release(a, &trail);
    let snap = tracker.snapshot();
    assert_eq!((snap.live, snap.freed), (1, 1));

    // Unmatched release: lists stay put.
    tracker.release(0x20 as *mut u8, &trail);
    assert_eq!(tracker.snapshot(), snap);

    // Dump must not mutate either.
    tracker.dump();
    assert_eq!(tracker.snapshot(), snap);
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
#[test]
fn captured_call_sites_land_in_records() {
    let (tracker, dir, _) = files_tracker("callsite");
    let trail = Trail::capture();
    let p = tracker.allocate(8, &trail);
    assert!(!p.is_null());

    let Strategy::Files(ledger) = tracker.strategy() else {
        panic!("files strategy expected");
    };
    let snap = ledger.snapshot();
    assert_ne!(snap.live[0].ret, 0);
    assert_ne!(snap.live[0].frame, 0);
    std::fs::remove_dir_all(&dir).ok();
}
