//! Strategy B: the flat tracking arena.
//!
//! One large anonymous mapping, optionally pinned at a fixed base address,
//! is carved with a bump cursor in 64-byte quanta. Nothing is ever handed
//! back: released records move to a free chain and reallocation always
//! moves, threading the superseded record onto the replacement's tombstone
//! chain. The cursor only grows and live ranges never overlap, which makes
//! the whole history of the process dumpable at any moment. Memory reclaim
//! is explicitly not a goal of this strategy.

use std::ptr;
use std::sync::Mutex;

use libc::{
    MAP_ANONYMOUS, MAP_FAILED, MAP_FIXED_NOREPLACE, MAP_NORESERVE, MAP_SHARED, PROT_EXEC,
    PROT_READ, PROT_WRITE,
};

use crate::callsite::Trail;
use crate::errors::TrackError;

/// Every carve length is rounded up to this.
pub const QUANTUM: usize = 64;

struct Plot {
    start: usize,
    /// `start + requested size`; the quantum padding is not part of the
    /// record's advertised range.
    end: usize,
    size: usize,
    alignment: usize,
    trail: Trail,
    next: Option<usize>,
    tombs: Option<usize>,
}

struct Plots {
    cursor: usize,
    slots: Vec<Plot>,
    live_head: Option<usize>,
    free_head: Option<usize>,
}

pub struct Arena {
    base: usize,
    cap: usize,
    inner: Mutex<Plots>,
}

/// The record a reallocation displaced.
#[derive(Clone, Copy, Debug)]
pub struct Superseded {
    pub addr: usize,
    pub size: usize,
}

#[derive(Clone, Debug)]
pub struct PlotView {
    pub start: usize,
    pub end: usize,
    pub size: usize,
    pub alignment: usize,
    pub ret: usize,
    pub frame: usize,
    /// Provenance of every record this one replaced, oldest last.
    pub tombs: Vec<(usize, usize, usize)>,
}

pub struct ArenaSnapshot {
    pub live: Vec<PlotView>,
    pub free: Vec<PlotView>,
    pub cursor: usize,
    pub capacity: usize,
}

impl Arena {
    /// Map the arena once. With a base hint the mapping is pinned there
    /// (and refuses to displace anything already in place); without one the
    /// kernel picks, which is what tests use.
    pub fn reserve(hint: Option<usize>, size: usize) -> Result<Arena, TrackError> {
        let mut flags = MAP_SHARED | MAP_ANONYMOUS | MAP_NORESERVE;
        if hint.is_some() {
            flags |= MAP_FIXED_NOREPLACE;
        }
        let mem = unsafe {
            libc::mmap(
                hint.unwrap_or(0) as *mut libc::c_void,
                size,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                flags,
                -1,
                0,
            )
        };
        if mem == MAP_FAILED {
            return Err(TrackError::BackingResource(std::io::Error::last_os_error()));
        }
        Ok(Arena {
            base: mem as usize,
            cap: size,
            inner: Mutex::new(Plots {
                cursor: 0,
                slots: Vec::new(),
                live_head: None,
                free_head: None,
            }),
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// Current bump cursor; non-decreasing across the arena's lifetime.
    pub fn cursor(&self) -> usize {
        self.inner.lock().unwrap().cursor
    }

    /// Carve a fresh zeroed record of `nmemb * size` bytes.
    pub fn alloc(
        &self,
        alignment: usize,
        nmemb: usize,
        size: usize,
        trail: &Trail,
    ) -> Result<usize, TrackError> {
        let mut plots = self.inner.lock().unwrap();
        self.carve(&mut plots, alignment, nmemb, size, None, trail)
    }

    /// Always allocate-and-copy; the arena never grows a record in place.
    /// A live `old` is unlinked and hung on the replacement's tombstone
    /// chain. An address that was never tracked allocates fresh with no
    /// copy and no tombstone.
    pub fn realloc(
        &self,
        old: usize,
        size: usize,
        trail: &Trail,
    ) -> Result<(usize, Option<Superseded>), TrackError> {
        let mut plots = self.inner.lock().unwrap();
        let old_idx = find_live(&plots, old);
        let src = old_idx.map(|i| (plots.slots[i].start, plots.slots[i].size));

        let fresh = self.carve(&mut plots, 1, 1, size, src, trail)?;

        let superseded = old_idx.map(|i| {
            unlink_live(&mut plots, i);
            let info = Superseded { addr: plots.slots[i].start, size: plots.slots[i].size };
            // carve prepended the replacement, so it is the live head.
            let fresh_idx = plots.live_head.unwrap();
            plots.slots[fresh_idx].tombs = Some(i);
            info
        });

        Ok((fresh, superseded))
    }

    /// Move a live record to the free chain. Its range is never recycled.
    /// `false` when the address has no live record; the caller decides how
    /// loudly to report that.
    pub fn release(&self, addr: usize) -> bool {
        let mut plots = self.inner.lock().unwrap();
        match find_live(&plots, addr) {
            Some(idx) => {
                unlink_live(&mut plots, idx);
                plots.slots[idx].next = plots.free_head;
                plots.free_head = Some(idx);
                true
            }
            None => false,
        }
    }

    /// Non-mutating view of both chains in link order, newest first.
    pub fn snapshot(&self) -> ArenaSnapshot {
        let plots = self.inner.lock().unwrap();
        ArenaSnapshot {
            live: collect(&plots, plots.live_head),
            free: collect(&plots, plots.free_head),
            cursor: plots.cursor,
            capacity: self.cap,
        }
    }

    fn carve(
        &self,
        plots: &mut Plots,
        alignment: usize,
        nmemb: usize,
        size: usize,
        src: Option<(usize, usize)>,
        trail: &Trail,
    ) -> Result<usize, TrackError> {
        let overflow = TrackError::ArithmeticOverflow { nmemb, size };
        let total = nmemb.checked_mul(size).ok_or(overflow)?;
        let rounded = total
            .checked_add(QUANTUM - 1)
            .ok_or(TrackError::ArithmeticOverflow { nmemb, size })?
            & !(QUANTUM - 1);
        // A zero-length record still occupies one quantum so that no two
        // live records ever share an address.
        let rounded = rounded.max(QUANTUM);

        let exhausted = TrackError::ArenaExhausted {
            requested: rounded,
            remaining: self.cap - plots.cursor,
        };
        let after = match plots.cursor.checked_add(rounded) {
            Some(a) if a <= self.cap => a,
            _ => return Err(exhausted),
        };
        if rounded >= self.cap - after {
            return Err(exhausted);
        }

        let start = self.base + plots.cursor;
        unsafe {
            ptr::write_bytes(start as *mut u8, 0, rounded);
            if let Some((src_addr, src_len)) = src {
                ptr::copy_nonoverlapping(src_addr as *const u8, start as *mut u8, src_len.min(size));
            }
        }
        plots.cursor = after;

        let idx = plots.slots.len();
        plots.slots.push(Plot {
            start,
            end: start + size,
            size,
            alignment,
            trail: *trail,
            next: plots.live_head,
            tombs: None,
        });
        plots.live_head = Some(idx);

        Ok(start)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.cap);
        }
    }
}

fn find_live(plots: &Plots, addr: usize) -> Option<usize> {
    let mut cur = plots.live_head;
    while let Some(i) = cur {
        if plots.slots[i].start == addr {
            return Some(i);
        }
        cur = plots.slots[i].next;
    }
    None
}

fn unlink_live(plots: &mut Plots, idx: usize) {
    let mut prev: Option<usize> = None;
    let mut cur = plots.live_head;
    while let Some(i) = cur {
        if i == idx {
            let next = plots.slots[i].next;
            match prev {
                None => plots.live_head = next,
                Some(p) => plots.slots[p].next = next,
            }
            plots.slots[i].next = None;
            return;
        }
        prev = cur;
        cur = plots.slots[i].next;
    }
}

fn collect(plots: &Plots, head: Option<usize>) -> Vec<PlotView> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(i) = cur {
        let p = &plots.slots[i];
        let mut tombs = Vec::new();
        let mut tomb = p.tombs;
        while let Some(t) = tomb {
            let tp = &plots.slots[t];
            tombs.push((tp.start, tp.end, tp.size));
            tomb = tp.tombs;
        }
        out.push(PlotView {
            start: p.start,
            end: p.end,
            size: p.size,
            alignment: p.alignment,
            ret: p.trail.head().ret,
            frame: p.trail.head().frame,
            tombs,
        });
        cur = p.next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callsite::Trail;

    fn tiny() -> Arena {
        Arena::reserve(None, 4096).unwrap()
    }

    #[test]
    fn lengths_round_to_the_quantum_and_headroom_is_kept() {
        let arena = tiny();
        let trail = Trail::empty();
        for _ in 0..5 {
            let addr = arena.alloc(1, 1, 600, &trail).unwrap();
            assert_eq!(addr % QUANTUM, 0);
        }
        assert_eq!(arena.cursor(), 5 * 640);

        match arena.alloc(1, 1, 600, &trail) {
            Err(TrackError::ArenaExhausted { requested, .. }) => assert_eq!(requested, 640),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        // The failed call must not have moved anything.
        assert_eq!(arena.cursor(), 5 * 640);
        assert_eq!(arena.snapshot().live.len(), 5);
    }

    #[test]
    fn cursor_is_monotonic_and_ranges_disjoint() {
        let arena = tiny();
        let trail = Trail::empty();
        let mut last_cursor = 0;
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for size in [1usize, 64, 65, 100, 128] {
            let addr = arena.alloc(1, 1, size, &trail).unwrap();
            let cursor = arena.cursor();
            assert!(cursor >= last_cursor);
            last_cursor = cursor;
            ranges.push((addr, addr + size.max(1)));
        }
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn member_count_overflow_is_rejected() {
        let arena = tiny();
        let err = arena.alloc(1, usize::MAX, 2, &Trail::empty()).unwrap_err();
        assert!(matches!(err, TrackError::ArithmeticOverflow { .. }));
    }

    #[test]
    fn fresh_records_read_back_zero() {
        let arena = tiny();
        let addr = arena.alloc(1, 1, 200, &Trail::empty()).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, 200) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_length_records_do_not_alias() {
        let arena = tiny();
        let trail = Trail::empty();
        let a = arena.alloc(1, 1, 0, &trail).unwrap();
        let b = arena.alloc(1, 1, 0, &trail).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn realloc_moves_and_leaves_a_tombstone() {
        let arena = tiny();
        let trail = Trail::empty();
        let old = arena.alloc(1, 1, 16, &trail).unwrap();
        unsafe { ptr::write_bytes(old as *mut u8, 0xab, 16) };

        let (fresh, superseded) = arena.realloc(old, 48, &trail).unwrap();
        assert_ne!(fresh, old);
        assert_eq!(superseded.unwrap().addr, old);

        let bytes = unsafe { std::slice::from_raw_parts(fresh as *const u8, 48) };
        assert!(bytes[..16].iter().all(|&b| b == 0xab));
        assert!(bytes[16..].iter().all(|&b| b == 0));

        let snap = arena.snapshot();
        assert_eq!(snap.live.len(), 1);
        assert_eq!(snap.live[0].tombs.len(), 1);
        assert_eq!(snap.live[0].tombs[0].0, old);
        assert!(snap.free.is_empty());
    }

    #[test]
    fn realloc_of_unknown_address_allocates_fresh() {
        let arena = tiny();
        let stranger = 0x1usize;
        let (fresh, superseded) = arena.realloc(stranger, 32, &Trail::empty()).unwrap();
        assert_ne!(fresh, 0);
        assert!(superseded.is_none());
        assert!(arena.snapshot().live[0].tombs.is_empty());
    }

    #[test]
    fn release_moves_to_free_list_once() {
        let arena = tiny();
        let addr = arena.alloc(1, 1, 16, &Trail::empty()).unwrap();
        assert!(arena.release(addr));

        let snap = arena.snapshot();
        assert_eq!((snap.live.len(), snap.free.len()), (0, 1));

        // Second release of the same address matches nothing.
        assert!(!arena.release(addr));
        let snap = arena.snapshot();
        assert_eq!((snap.live.len(), snap.free.len()), (0, 1));
    }

    #[test]
    fn snapshot_does_not_mutate() {
        let arena = tiny();
        let trail = Trail::empty();
        arena.alloc(1, 1, 10, &trail).unwrap();
        arena.alloc(1, 1, 20, &trail).unwrap();
        let before = arena.snapshot();
        let _ = arena.snapshot();
        let after = arena.snapshot();
        assert_eq!(before.cursor, after.cursor);
        assert_eq!(before.live.len(), after.live.len());
        assert_eq!(before.free.len(), after.free.len());
    }
}
