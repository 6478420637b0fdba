use std::io;

/// Error type returned by the engines in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument violated a stated precondition. Nothing was modified.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    /// A handle, universe, CID or destination is not in the collection it was
    /// looked up in. Also returned for entities whose removal is already in
    /// progress.
    #[error("not found")]
    NotFound,

    /// The entity already exists: a duplicate universe on a source, a second
    /// receiver on a universe, or a duplicate unicast destination.
    #[error("already exists")]
    Exists,

    /// A bounded-memory pool is full, or an allocation failed.
    #[error("out of memory")]
    NoMem,

    /// None of the requested network interfaces were usable.
    #[error("no usable network interfaces")]
    NoNetints,

    /// Reserved functionality (sACN synchronization, custom footprints).
    #[error("not implemented")]
    NotImpl,

    /// An unexpected OS or network error.
    #[error(transparent)]
    Io(#[from] io::Error),
}
