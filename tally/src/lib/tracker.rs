//! The tracking facade behind the five interposed operations.
//!
//! A [`Tracker`] owns exactly one strategy, the diagnostic scribe, the
//! runtime toggle and the underlying allocator used whenever tracking is
//! bypassed. Strategy errors never escape: each one is reported as a
//! diagnostic line and collapsed into the C convention (null pointer for
//! the allocate family, silence for release). That includes arena
//! exhaustion and length overflow, which return null to the caller here
//! rather than terminating the process; the interposer documents this as a
//! deliberate softening of the shim it replaces.
//!
//! Diagnostic lines are emitted after the strategy lock has been dropped,
//! so under concurrency the log may interleave differently from the list
//! mutations it describes. Acceptable for a diagnostic channel.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arena::Arena;
use crate::callsite::Trail;
use crate::config::{Settings, StrategyKind};
use crate::errors::TrackError;
use crate::ledger::Ledger;
use crate::scribe::Scribe;
use crate::sysalloc::UnderlyingAllocator;

pub enum Strategy {
    Files(Ledger),
    Arena(Arena),
}

pub struct Tracker {
    strategy: Strategy,
    real: Box<dyn UnderlyingAllocator>,
    enabled: AtomicBool,
    scribe: Scribe,
}

/// Record counts for quick inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub live: usize,
    pub freed: usize,
}

impl Tracker {
    /// Build the configured strategy. Files: create the diagnostic
    /// directory and tee the log into `log.txt` there (stdout-only if the
    /// log file cannot be created). Arena: reserve the mapping; a failure
    /// here is returned to the caller, who decides whether it is fatal.
    pub fn new(
        settings: &Settings,
        real: Box<dyn UnderlyingAllocator>,
    ) -> Result<Tracker, TrackError> {
        let (strategy, scribe) = match settings.strategy {
            StrategyKind::Files => {
                let ledger = Ledger::new(&settings.dir);
                let scribe = Scribe::tee(&ledger.root().join("log.txt"))
                    .unwrap_or_else(|_| Scribe::console());
                (Strategy::Files(ledger), scribe)
            }
            StrategyKind::Arena => {
                let arena = Arena::reserve(settings.arena_base, settings.arena_size)?;
                (Strategy::Arena(arena), Scribe::console())
            }
        };
        Ok(Tracker::assemble(strategy, scribe, real))
    }

    /// Wire an already-built strategy and scribe together. This is how
    /// tests inject a fake underlying allocator and a capturable log.
    pub fn assemble(
        strategy: Strategy,
        scribe: Scribe,
        real: Box<dyn UnderlyingAllocator>,
    ) -> Tracker {
        Tracker { strategy, real, enabled: AtomicBool::new(true), scribe }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Flip the toggle. Safe against concurrent traffic; a caller racing
    /// the flip gets one extra tracked or bypassed request, nothing worse.
    pub fn set_enabled(&self, on: bool) {
        self.enabled.store(on, Ordering::Relaxed);
    }

    /// `malloc` shape.
    pub fn allocate(&self, size: usize, trail: &Trail) -> *mut u8 {
        if !self.is_enabled() {
            return unsafe { self.real.allocate(size) };
        }
        self.serve("malloc", 1, 1, size, trail)
    }

    /// `calloc` shape.
    pub fn allocate_zeroed(&self, nmemb: usize, size: usize, trail: &Trail) -> *mut u8 {
        if !self.is_enabled() {
            return unsafe { self.real.allocate_zeroed(nmemb, size) };
        }
        self.serve("calloc", 1, nmemb, size, trail)
    }

    /// `memalign` shape.
    pub fn allocate_aligned(&self, alignment: usize, size: usize, trail: &Trail) -> *mut u8 {
        if !self.is_enabled() {
            return unsafe { self.real.allocate_aligned(alignment, size) };
        }
        self.serve("memalign", alignment, 1, size, trail)
    }

    /// `realloc` shape: always moves. An old address nobody tracked is
    /// served as a plain allocation with nothing copied.
    pub fn reallocate(&self, old: *mut u8, size: usize, trail: &Trail) -> *mut u8 {
        if !self.is_enabled() {
            return unsafe { self.real.reallocate(old, size) };
        }
        let site = trail.head();
        let old_addr = old as usize;

        match &self.strategy {
            Strategy::Files(ledger) => match ledger.reseat(old_addr, site, size) {
                Ok(reseated) => {
                    match reseated.old {
                        Some(prior) => self.scribe.say(format_args!(
                            "realloc(frame={:#x} ret={:#x} old={:#x} oldsize={} new={:#x} newsize={})",
                            site.frame, site.ret, prior.addr, prior.size, reseated.fresh.addr, size
                        )),
                        None => self.scribe.say(format_args!(
                            "realloc(frame={:#x} ret={:#x} new={:#x} newsize={}) untracked old={:#x}",
                            site.frame, site.ret, reseated.fresh.addr, size, old_addr
                        )),
                    }
                    reseated.fresh.addr as *mut u8
                }
                Err(e) => self.turn_away("realloc", size, e),
            },
            Strategy::Arena(arena) => match arena.realloc(old_addr, size, trail) {
                Ok((fresh, Some(prior))) => {
                    self.scribe.say(format_args!(
                        "realloc(frame={:#x} ret={:#x} old={:#x} oldsize={} new={:#x} newsize={})",
                        site.frame, site.ret, prior.addr, prior.size, fresh, size
                    ));
                    fresh as *mut u8
                }
                Ok((fresh, None)) => {
                    self.scribe.say(format_args!(
                        "realloc(frame={:#x} ret={:#x} new={:#x} newsize={}) untracked old={:#x}",
                        site.frame, site.ret, fresh, size, old_addr
                    ));
                    fresh as *mut u8
                }
                Err(e) => self.turn_away("realloc", size, e),
            },
        }
    }

    /// `free` shape. A null pointer is a no-op; an address with no live
    /// record changes nothing and is reported with an `invalid` tag.
    pub fn release(&self, ptr: *mut u8, trail: &Trail) {
        if ptr.is_null() {
            return;
        }
        if !self.is_enabled() {
            unsafe { self.real.release(ptr) };
            return;
        }
        let site = trail.head();
        let addr = ptr as usize;
        let matched = match &self.strategy {
            Strategy::Files(ledger) => ledger.retire(addr).is_some(),
            Strategy::Arena(arena) => arena.release(addr),
        };
        self.scribe.say(format_args!(
            "free(frame={:#x} ret={:#x} addr={:#x}){}",
            site.frame,
            site.ret,
            addr,
            if matched { "" } else { " invalid" }
        ));
    }

    /// Print the live and freed record lists. Read-only.
    pub fn dump(&self) {
        match &self.strategy {
            Strategy::Files(ledger) => {
                let snap = ledger.snapshot();
                self.scribe.say(format_args!("live allocations: {}", snap.live.len()));
                for r in &snap.live {
                    self.scribe.say(format_args!(
                        "a{} frame={:#x} ret={:#x} addr={:#x} size={} alignment={}",
                        r.id, r.frame, r.ret, r.addr, r.size, r.alignment
                    ));
                }
                self.scribe.say(format_args!("retired allocations: {}", snap.retired.len()));
                for r in &snap.retired {
                    self.scribe.say(format_args!(
                        "a{} frame={:#x} ret={:#x} addr={:#x} size={} alignment={}",
                        r.id, r.frame, r.ret, r.addr, r.size, r.alignment
                    ));
                }
            }
            Strategy::Arena(arena) => {
                let snap = arena.snapshot();
                self.scribe.say(format_args!(
                    "allocations: {} (cursor {:#x} of {:#x})",
                    snap.live.len(),
                    snap.cursor,
                    snap.capacity
                ));
                for p in &snap.live {
                    self.scribe.say(format_args!(
                        "frame={:#x} ret={:#x} addr={:#x}-{:#x} size={}",
                        p.frame, p.ret, p.start, p.end, p.size
                    ));
                    for &(start, end, size) in &p.tombs {
                        self.scribe.say(format_args!(
                            "  tomb addr={:#x}-{:#x} size={}",
                            start, end, size
                        ));
                    }
                }
                self.scribe.say(format_args!("frees: {}", snap.free.len()));
                for p in &snap.free {
                    self.scribe.say(format_args!(
                        "frame={:#x} ret={:#x} addr={:#x}-{:#x} size={}",
                        p.frame, p.ret, p.start, p.end, p.size
                    ));
                }
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        match &self.strategy {
            Strategy::Files(ledger) => {
                let snap = ledger.snapshot();
                Snapshot { live: snap.live.len(), freed: snap.retired.len() }
            }
            Strategy::Arena(arena) => {
                let snap = arena.snapshot();
                Snapshot { live: snap.live.len(), freed: snap.free.len() }
            }
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    fn serve(
        &self,
        op: &str,
        alignment: usize,
        nmemb: usize,
        size: usize,
        trail: &Trail,
    ) -> *mut u8 {
        let site = trail.head();
        match &self.strategy {
            Strategy::Files(ledger) => {
                let total = match nmemb.checked_mul(size) {
                    Some(t) => t,
                    None => {
                        return self
                            .turn_away(op, size, TrackError::ArithmeticOverflow { nmemb, size })
                    }
                };
                match ledger.track(site, alignment, total) {
                    Ok(r) => {
                        self.scribe.say(format_args!(
                            "{}(id={} frame={:#x} ret={:#x} addr={:#x} size={} alignment={})",
                            op, r.id, site.frame, site.ret, r.addr, r.size, r.alignment
                        ));
                        r.addr as *mut u8
                    }
                    Err(e) => self.turn_away(op, total, e),
                }
            }
            Strategy::Arena(arena) => match arena.alloc(alignment, nmemb, size, trail) {
                Ok(addr) => {
                    self.scribe.say(format_args!(
                        "{}(frame={:#x} ret={:#x} addr={:#x} size={} alignment={})",
                        op,
                        site.frame,
                        site.ret,
                        addr,
                        nmemb.saturating_mul(size),
                        alignment
                    ));
                    addr as *mut u8
                }
                Err(e) => self.turn_away(op, nmemb.saturating_mul(size), e),
            },
        }
    }

    fn turn_away(&self, op: &str, size: usize, err: TrackError) -> *mut u8 {
        self.scribe.say(format_args!("{} of {} bytes failed: {}", op, size, err));
        ptr::null_mut()
    }
}
