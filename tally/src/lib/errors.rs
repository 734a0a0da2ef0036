use thiserror::Error;

/// Failures local to a single tracking request. None of these may cross the
/// C boundary: the interposer translates every variant into the platform
/// convention (a null pointer for the allocate family, silence for release).
///
/// An unmatched release is deliberately absent here. It is reported as a
/// diagnostic line tagged `invalid` and never surfaces as an error value.
#[derive(Error, Debug)]
pub enum TrackError {
    /// The real allocator symbols could not be resolved. Requests are served
    /// by the bootstrap allocator until resolution succeeds.
    #[error("real allocator unresolved")]
    Resolution,

    /// Directory, file or mapping creation failed while building a record's
    /// backing store. The request fails; the ledger stays usable.
    #[error("backing resource failure: {0}")]
    BackingResource(#[from] std::io::Error),

    /// The rounded request does not fit in what is left of the arena.
    #[error("arena exhausted: {requested} bytes requested, {remaining} left")]
    ArenaExhausted { requested: usize, remaining: usize },

    /// `nmemb * size` overflowed. Treated by callers exactly like
    /// [`TrackError::ArenaExhausted`].
    #[error("allocation length overflow: {nmemb} * {size}")]
    ArithmeticOverflow { nmemb: usize, size: usize },
}
