//! Capacity limits for the bounded-memory build.
//!
//! With the `dynamic-memory` feature disabled, every pool in the library is
//! capped at one of these constants and insertion past the cap returns
//! [`Error::NoMem`](crate::Error::NoMem). With `dynamic-memory` enabled (the
//! default) the constants still bound `source_count_max` defaults where a
//! configuration leaves them unset.

/// Maximum number of network interfaces the library will track.
pub const MAX_NETINTS: usize = 4;

/// Maximum number of receivers (one per universe).
pub const RECEIVER_MAX_UNIVERSES: usize = 4;

/// Maximum number of sources tracked per receiver universe.
pub const RECEIVER_MAX_SOURCES_PER_UNIVERSE: usize = 4;

/// Maximum number of sources tracked across all receivers.
pub const RECEIVER_TOTAL_MAX_SOURCES: usize =
    RECEIVER_MAX_UNIVERSES * RECEIVER_MAX_SOURCES_PER_UNIVERSE;

/// Maximum number of receive threads.
pub const RECEIVER_MAX_THREADS: usize = 4;

/// Maximum number of local sources.
pub const SOURCE_MAX_SOURCES: usize = 4;

/// Maximum number of universes per source.
pub const SOURCE_MAX_UNIVERSES_PER_SOURCE: usize = 4;

/// Maximum number of unicast destinations per source universe.
pub const MAX_UNICAST_DESTINATIONS_PER_UNIVERSE: usize = 4;

/// Maximum number of sources per DMX merger instance.
pub const DMX_MERGER_MAX_SOURCES_PER_MERGER: usize = RECEIVER_MAX_SOURCES_PER_UNIVERSE;

/// Maximum number of sources the source detector will track.
pub const SOURCE_DETECTOR_MAX_SOURCES: usize = 5;

/// Maximum number of universes the source detector tracks per source.
pub const SOURCE_DETECTOR_MAX_UNIVERSES_PER_SOURCE: usize = 5;

/// Returns `NoMem` if a bounded pool of `cap` entries has no room for one
/// more. Compiled to a no-op in the dynamic-memory build.
#[cfg(not(feature = "dynamic-memory"))]
pub(crate) fn ensure_room(len: usize, cap: usize) -> Result<(), crate::Error> {
    if len < cap { Ok(()) } else { Err(crate::Error::NoMem) }
}

#[cfg(feature = "dynamic-memory")]
pub(crate) fn ensure_room(_len: usize, _cap: usize) -> Result<(), crate::Error> {
    Ok(())
}
