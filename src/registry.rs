//! Shared registry binding remote CIDs to compact integer handles.
//!
//! The registry is shared between every receiver and the source detector:
//! adding the same CID twice returns the same handle and bumps a reference
//! count, and a handle is only retired once every holder has released it.

use std::collections::BTreeMap;
use std::fmt;

use crate::{ComponentIdentifier, Error, limits};

/// Identifies a remote source seen on the network.
///
/// Handles are stable for as long as at least one receiver or the source
/// detector tracks the source, and are never reused while referenced. The
/// valid range is `0..=0xFFFE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct RemoteSourceHandle(u16);

impl RemoteSourceHandle {
    /// The highest valid handle value.
    pub const MAX: u16 = 0xFFFE;

    /// Creates a handle from a raw value. `0xFFFF` is reserved and rejected.
    pub fn new(value: u16) -> Result<Self, Error> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(Error::Invalid("remote source handle out of range"))
        }
    }

    /// The raw handle value.
    pub fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for RemoteSourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct CidEntry {
    cid: ComponentIdentifier,
    refcount: usize,
}

/// CID ↔ handle mapping with per-CID reference counts.
#[derive(Default)]
pub(crate) struct RemoteSourceRegistry {
    by_cid: BTreeMap<ComponentIdentifier, RemoteSourceHandle>,
    by_handle: BTreeMap<RemoteSourceHandle, CidEntry>,
    next: u16,
}

impl RemoteSourceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a reference to `cid`, allocating a handle on first sight.
    pub(crate) fn add(&mut self, cid: &ComponentIdentifier) -> Result<RemoteSourceHandle, Error> {
        if let Some(&handle) = self.by_cid.get(cid) {
            let entry = self.by_handle.get_mut(&handle).expect("cid maps stay in sync");
            entry.refcount += 1;
            return Ok(handle);
        }

        limits::ensure_room(
            self.by_handle.len(),
            limits::RECEIVER_TOTAL_MAX_SOURCES + limits::SOURCE_DETECTOR_MAX_SOURCES,
        )?;

        let handle = self.next_handle()?;
        self.by_cid.insert(*cid, handle);
        self.by_handle.insert(handle, CidEntry { cid: *cid, refcount: 1 });
        Ok(handle)
    }

    /// The handle for `cid`, if the source is currently registered.
    pub(crate) fn handle(&self, cid: &ComponentIdentifier) -> Option<RemoteSourceHandle> {
        self.by_cid.get(cid).copied()
    }

    /// The CID bound to `handle`, if the handle is live.
    pub(crate) fn cid(&self, handle: RemoteSourceHandle) -> Option<&ComponentIdentifier> {
        self.by_handle.get(&handle).map(|entry| &entry.cid)
    }

    /// Releases one reference to `handle`, removing the mapping when the last
    /// reference is gone.
    pub(crate) fn release(&mut self, handle: RemoteSourceHandle) -> Result<(), Error> {
        let entry = self.by_handle.get_mut(&handle).ok_or(Error::NotFound)?;
        if entry.refcount > 1 {
            entry.refcount -= 1;
        } else {
            let cid = entry.cid;
            self.by_handle.remove(&handle);
            self.by_cid.remove(&cid);
        }
        Ok(())
    }

    fn next_handle(&mut self) -> Result<RemoteSourceHandle, Error> {
        // Wrapping scan; skips handles that are still referenced.
        for _ in 0..=RemoteSourceHandle::MAX as u32 {
            let candidate = RemoteSourceHandle(self.next);
            self.next = if self.next == RemoteSourceHandle::MAX { 0 } else { self.next + 1 };
            if !self.by_handle.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::NoMem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn same_cid_returns_same_handle() {
        let mut registry = RemoteSourceRegistry::new();
        let cid = Uuid::new_v4();
        let first = registry.add(&cid).unwrap();
        let second = registry.add(&cid).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn handle_freed_only_after_all_releases() {
        let mut registry = RemoteSourceRegistry::new();
        let cid = Uuid::new_v4();
        let handle = registry.add(&cid).unwrap();
        registry.add(&cid).unwrap();

        registry.release(handle).unwrap();
        assert_eq!(registry.handle(&cid), Some(handle));

        registry.release(handle).unwrap();
        assert_eq!(registry.handle(&cid), None);
        assert!(registry.cid(handle).is_none());
    }

    #[test]
    fn handles_not_reused_while_referenced() {
        let mut registry = RemoteSourceRegistry::new();
        let first = registry.add(&Uuid::new_v4()).unwrap();
        let second = registry.add(&Uuid::new_v4()).unwrap();
        assert_ne!(first, second);

        registry.release(first).unwrap();
        let third = registry.add(&Uuid::new_v4()).unwrap();
        assert_ne!(third, second);
    }

    #[test]
    fn lookups_work_both_ways() {
        let mut registry = RemoteSourceRegistry::new();
        let cid = Uuid::new_v4();
        let handle = registry.add(&cid).unwrap();
        assert_eq!(registry.handle(&cid), Some(handle));
        assert_eq!(registry.cid(handle), Some(&cid));
    }
}
