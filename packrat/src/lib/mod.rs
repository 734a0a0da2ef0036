#[allow(non_camel_case_types)]
/// Crate targets Linux user-space processes that call `malloc` and
/// friends. It is loaded ahead of the C library via
/// [*function interposition*](https://stackoverflow.com/questions/426230/what-is-the-ld-preload-trick)
/// and routes the five allocation primitives through the tracking
/// strategies in `tally`.
///
/// This module holds C type aliases and the fatal-exit helper.
mod ffi;

/// Tells application calls apart from the shim's own bookkeeping.
mod owner;

/// One-time initialization and the bootstrap/real routing around it.
mod state;

/// The interposed entry points and exported control symbols.
mod entry;
