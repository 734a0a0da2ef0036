//! Strategy A: the file-backed allocation ledger.
//!
//! Every tracked allocation is served from its own shared, read-write-exec
//! mapping of a freshly created file inside the diagnostic directory, named
//! `a<id>-s<size>-l<alignment>`. Because the mapping is shared, the file
//! always mirrors the live heap bytes of that allocation; after the record
//! is retired the file stays behind as a post-mortem artifact.
//!
//! Records live in a slab (`Vec` with stable indices) and are threaded onto
//! intrusive `next` chains, one for live records and one for retired ones.
//! A record is reachable from exactly one chain at any time. Address lookup
//! is the hot path (every release and every reallocation starts with one),
//! so the live set is additionally indexed by address in a hash map rather
//! than scanned.

use std::fs::OpenOptions;
use std::hash::BuildHasherDefault;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::IntoRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Mutex;

use ahash::AHasher;
use indexmap::IndexMap;
use libc::{c_int, MAP_FAILED, MAP_SHARED, PROT_EXEC, PROT_READ, PROT_WRITE};

use crate::callsite::Callsite;
use crate::dirs;
use crate::errors::TrackError;

type AddrIndex = IndexMap<usize, usize, BuildHasherDefault<AHasher>>;

struct Track {
    id: u32,
    /// Backing file descriptor; -1 once the record is retired.
    fd: c_int,
    addr: usize,
    /// Requested size. Immutable for the record's lifetime.
    size: usize,
    /// Mapped length: `max(size, 1)`, a file of zero bytes cannot be mapped.
    len: usize,
    alignment: usize,
    site: Callsite,
    next: Option<usize>,
}

struct Books {
    tracks: Vec<Track>,
    live_head: Option<usize>,
    retired_head: Option<usize>,
    by_addr: AddrIndex,
    next_id: u32,
}

/// The ledger proper: one mutex around all record state, plus the
/// diagnostic directory the backing files land in.
pub struct Ledger {
    root: PathBuf,
    inner: Mutex<Books>,
}

/// What a successful `track` reports back for logging.
#[derive(Clone, Copy, Debug)]
pub struct Receipt {
    pub id: u32,
    pub addr: usize,
    pub size: usize,
    pub alignment: usize,
}

/// A record taken off the live list.
#[derive(Clone, Copy, Debug)]
pub struct Retired {
    pub id: u32,
    pub addr: usize,
    pub size: usize,
    pub alignment: usize,
}

/// Outcome of a reallocation: the fresh record, plus the record it
/// superseded when the old address was actually tracked.
#[derive(Clone, Copy, Debug)]
pub struct Reseated {
    pub fresh: Receipt,
    pub old: Option<Retired>,
}

#[derive(Clone, Copy, Debug)]
pub struct RecordView {
    pub id: u32,
    pub addr: usize,
    pub size: usize,
    pub alignment: usize,
    pub ret: usize,
    pub frame: usize,
}

pub struct LedgerSnapshot {
    pub live: Vec<RecordView>,
    pub retired: Vec<RecordView>,
}

impl Ledger {
    /// Normalize and create the diagnostic directory. A directory that
    /// cannot be created does not fail construction: every subsequent
    /// `track` will report its own `BackingResource` failure instead, and
    /// the ledger stays usable should the directory appear later.
    pub fn new(root: &Path) -> Ledger {
        let root = dirs::normalize(root);
        dirs::ensure_tree(&root).ok();
        Ledger {
            root,
            inner: Mutex::new(Books {
                tracks: Vec::new(),
                live_head: None,
                retired_head: None,
                by_addr: AddrIndex::default(),
                next_id: 0,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a record plus its backing file and mapping, zero it, and
    /// prepend it to the live list. Any partial resources are released
    /// before a failure is returned, so the ledger stays consistent.
    pub fn track(
        &self,
        site: Callsite,
        alignment: usize,
        size: usize,
    ) -> Result<Receipt, TrackError> {
        let mut books = self.inner.lock().unwrap();
        track_locked(&mut books, &self.root, site, alignment, size)
    }

    /// Hash-indexed lookup of a live record.
    pub fn lookup(&self, addr: usize) -> Option<Receipt> {
        let books = self.inner.lock().unwrap();
        books.by_addr.get(&addr).map(|&idx| {
            let t = &books.tracks[idx];
            Receipt { id: t.id, addr: t.addr, size: t.size, alignment: t.alignment }
        })
    }

    /// Unlink a live record, unmap and close its backing store, and move it
    /// to the retired chain. `None` when the address has no live record;
    /// the caller reports that case with an `invalid` tag.
    pub fn retire(&self, addr: usize) -> Option<Retired> {
        let mut books = self.inner.lock().unwrap();
        retire_locked(&mut books, addr)
    }

    /// Reallocation: always a fresh record of `size` bytes. When `old_addr`
    /// is live, the overlapping prefix is copied over and the old record is
    /// retired; an unknown address degrades to a plain `track` with nothing
    /// copied. One lock hold covers the whole exchange so a concurrent
    /// release cannot unmap the source mid-copy.
    pub fn reseat(
        &self,
        old_addr: usize,
        site: Callsite,
        size: usize,
    ) -> Result<Reseated, TrackError> {
        let mut books = self.inner.lock().unwrap();
        let old = books.by_addr.get(&old_addr).map(|&idx| {
            let t = &books.tracks[idx];
            (t.addr, t.size)
        });

        let fresh = track_locked(&mut books, &self.root, site, 1, size)?;
        let old = old.map(|(src, src_len)| {
            unsafe {
                ptr::copy_nonoverlapping(
                    src as *const u8,
                    fresh.addr as *mut u8,
                    src_len.min(size),
                );
            }
            retire_locked(&mut books, old_addr).unwrap()
        });

        Ok(Reseated { fresh, old })
    }

    /// Non-mutating view of both chains, most recently touched first.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let books = self.inner.lock().unwrap();
        LedgerSnapshot {
            live: collect(&books, books.live_head),
            retired: collect(&books, books.retired_head),
        }
    }
}

fn track_locked(
    books: &mut Books,
    root: &Path,
    site: Callsite,
    alignment: usize,
    size: usize,
) -> Result<Receipt, TrackError> {
    let id = books.next_id;
    let path = root.join(dirs::record_name(id, size, alignment));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(&path)?;

    let len = size.max(1);
    file.set_len(len as u64)?;
    let fd = file.into_raw_fd();

    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE | PROT_EXEC,
            MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == MAP_FAILED {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(TrackError::BackingResource(err));
    }
    unsafe { ptr::write_bytes(addr.cast::<u8>(), 0, len) };

    let idx = books.tracks.len();
    books.tracks.push(Track {
        id,
        fd,
        addr: addr as usize,
        size,
        len,
        alignment,
        site,
        next: books.live_head,
    });
    books.live_head = Some(idx);
    books.by_addr.insert(addr as usize, idx);
    books.next_id += 1;

    Ok(Receipt { id, addr: addr as usize, size, alignment })
}

fn retire_locked(books: &mut Books, addr: usize) -> Option<Retired> {
    let idx = books.by_addr.swap_remove(&addr)?;
    unlink_live(books, idx);

    let track = &mut books.tracks[idx];
    unsafe {
        libc::munmap(track.addr as *mut libc::c_void, track.len);
        libc::close(track.fd);
    }
    track.fd = -1;
    let info =
        Retired { id: track.id, addr: track.addr, size: track.size, alignment: track.alignment };

    books.tracks[idx].next = books.retired_head;
    books.retired_head = Some(idx);
    Some(info)
}

fn unlink_live(books: &mut Books, idx: usize) {
    let mut prev: Option<usize> = None;
    let mut cur = books.live_head;
    while let Some(i) = cur {
        if i == idx {
            let next = books.tracks[i].next;
            match prev {
                None => books.live_head = next,
                Some(p) => books.tracks[p].next = next,
            }
            books.tracks[i].next = None;
            return;
        }
        prev = cur;
        cur = books.tracks[i].next;
    }
}

fn collect(books: &Books, head: Option<usize>) -> Vec<RecordView> {
    let mut out = Vec::new();
    let mut cur = head;
    while let Some(i) = cur {
        let t = &books.tracks[i];
        out.push(RecordView {
            id: t.id,
            addr: t.addr,
            size: t.size,
            alignment: t.alignment,
            ret: t.site.ret,
            frame: t.site.frame,
        });
        cur = t.next;
    }
    out
}
