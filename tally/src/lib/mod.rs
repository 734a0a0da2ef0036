//! Allocation-tracking back-ends for the `packrat` interposer.
//!
//! Two strategies record the provenance of every live allocation:
//!
//! 1. [`ledger::Ledger`] backs each allocation with its own file in a
//!    diagnostic directory and keeps an address-indexed record list.
//! 2. [`arena::Arena`] carves a single large fixed-address mapping with a
//!    bump cursor and never recycles space, trading memory for a complete
//!    history of live, freed and superseded records.
//!
//! [`tracker::Tracker`] wraps whichever strategy is selected behind the five
//! C-shaped allocation operations, a runtime toggle and a dump facility.
//! The interposed `extern "C"` surface itself lives in the `packrat` cdylib;
//! everything here is callable (and testable) as a plain Rust library.

pub mod errors;

/// Structured diagnostic lines, written with raw `write(2)` so that the
/// logger itself never allocates mid-`malloc`.
pub mod scribe;

pub mod dirs;

/// Best-effort call-site capture via the frame-pointer chain.
pub mod callsite;

/// The real (non-interposed) allocator, resolved once, plus the bootstrap
/// used before resolution completes.
pub mod sysalloc;

/// Strategy A: one file-backed mapping per allocation.
pub mod ledger;

/// Strategy B: fixed-address bump arena with tombstone provenance.
pub mod arena;

pub mod config;

pub mod tracker;

pub use config::{Settings, StrategyKind};
pub use errors::TrackError;
pub use tracker::Tracker;
