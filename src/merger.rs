//! Highest-takes-precedence DMX merging with per-address-priority override.
//!
//! A [`Merger`] tracks the latest levels and priorities of a set of sources
//! and keeps a merged view current: for every slot, the source with the
//! highest effective priority wins, with the higher level breaking ties.

use std::collections::BTreeMap;

use crate::{DMX_ADDRESS_COUNT, Error, MAX_PRIORITY, RemoteSourceHandle, limits};

/// Configuration for a [`Merger`].
#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MergerConfig {
    /// Maximum number of sources this merger will track. `None` means
    /// unlimited in the dynamic-memory build, or the compile-time pool bound
    /// otherwise.
    pub source_count_max: Option<usize>,
}

/// One source feeding a [`Merger`].
#[derive(Debug, Clone)]
struct MergerSource {
    levels: [u8; DMX_ADDRESS_COUNT],
    level_count: usize,
    has_levels: bool,
    pap: [u8; DMX_ADDRESS_COUNT],
    pap_count: usize,
    pap_valid: bool,
    universe_priority: u8,
    universe_priority_uninitialized: bool,
}

impl MergerSource {
    fn new() -> Self {
        Self {
            levels: [0; DMX_ADDRESS_COUNT],
            level_count: 0,
            has_levels: false,
            pap: [0; DMX_ADDRESS_COUNT],
            pap_count: 0,
            pap_valid: false,
            universe_priority: 0,
            universe_priority_uninitialized: true,
        }
    }

    /// Effective priority at `slot`, or `None` if this source does not
    /// participate there.
    ///
    /// A per-address priority of 0 (explicit or implied beyond the PAP
    /// count) means "no participation at this slot"; without valid PAP the
    /// universe priority applies once it has been received.
    fn priority_at(&self, slot: usize) -> Option<u8> {
        if !self.has_levels || slot >= self.level_count {
            return None;
        }
        if self.pap_valid {
            let pap = if slot < self.pap_count { self.pap[slot] } else { 0 };
            if pap == 0 { None } else { Some(pap) }
        } else if self.universe_priority_uninitialized {
            None
        } else {
            Some(self.universe_priority)
        }
    }
}

/// Merges the levels of multiple sources into a single universe view.
///
/// The merger never allocates during merging; all buffers are fixed
/// 512-entry arrays owned by the instance.
pub struct Merger {
    source_count_max: Option<usize>,
    sources: BTreeMap<RemoteSourceHandle, MergerSource>,
    levels: [u8; DMX_ADDRESS_COUNT],
    winning_priorities: [u8; DMX_ADDRESS_COUNT],
    owners: [Option<RemoteSourceHandle>; DMX_ADDRESS_COUNT],
    next_handle: u16,
}

impl Merger {
    pub fn new(config: MergerConfig) -> Self {
        Self {
            source_count_max: config.source_count_max,
            sources: BTreeMap::new(),
            levels: [0; DMX_ADDRESS_COUNT],
            winning_priorities: [0; DMX_ADDRESS_COUNT],
            owners: [None; DMX_ADDRESS_COUNT],
            next_handle: 0,
        }
    }

    /// Registers a new source and returns its handle.
    pub fn add_source(&mut self) -> Result<RemoteSourceHandle, Error> {
        self.check_capacity()?;

        let mut candidate = self.next_handle;
        loop {
            let handle = RemoteSourceHandle::new(candidate)?;
            candidate = if candidate == RemoteSourceHandle::MAX { 0 } else { candidate + 1 };
            if !self.sources.contains_key(&handle) {
                self.next_handle = candidate;
                self.sources.insert(handle, MergerSource::new());
                return Ok(handle);
            }
        }
    }

    /// Registers a new source under a caller-chosen handle, so merger source
    /// ids can mirror remote source handles.
    pub fn add_source_with_handle(&mut self, handle: RemoteSourceHandle) -> Result<(), Error> {
        self.check_capacity()?;
        if self.sources.contains_key(&handle) {
            return Err(Error::Exists);
        }
        self.sources.insert(handle, MergerSource::new());
        Ok(())
    }

    /// Removes a source and gives up every slot it owned.
    pub fn remove_source(&mut self, handle: RemoteSourceHandle) -> Result<(), Error> {
        self.sources.remove(&handle).ok_or(Error::NotFound)?;
        self.merge_slots(0, DMX_ADDRESS_COUNT);
        Ok(())
    }

    /// Replaces a source's level buffer. Slots beyond `levels.len()` become
    /// zero.
    pub fn update_levels(
        &mut self,
        handle: RemoteSourceHandle,
        levels: &[u8],
    ) -> Result<(), Error> {
        if levels.len() > DMX_ADDRESS_COUNT {
            return Err(Error::Invalid("more than 512 levels"));
        }
        let source = self.sources.get_mut(&handle).ok_or(Error::NotFound)?;
        source.levels[..levels.len()].copy_from_slice(levels);
        source.levels[levels.len()..].fill(0);
        source.level_count = levels.len();
        source.has_levels = true;
        self.merge_slots(0, DMX_ADDRESS_COUNT);
        Ok(())
    }

    /// Replaces a source's per-address priorities and marks them valid.
    ///
    /// Note the asymmetry with the send side: a PAP of 0 here means the
    /// source does not participate at that slot, while a source transmits
    /// level 0 wherever its outgoing PAP is 0.
    pub fn update_pap(&mut self, handle: RemoteSourceHandle, pap: &[u8]) -> Result<(), Error> {
        if pap.len() > DMX_ADDRESS_COUNT {
            return Err(Error::Invalid("more than 512 priorities"));
        }
        let source = self.sources.get_mut(&handle).ok_or(Error::NotFound)?;
        source.pap[..pap.len()].copy_from_slice(pap);
        source.pap[pap.len()..].fill(0);
        source.pap_count = pap.len();
        source.pap_valid = true;
        self.merge_slots(0, DMX_ADDRESS_COUNT);
        Ok(())
    }

    /// Clears a source's per-address priorities; it reverts to its universe
    /// priority.
    pub fn remove_pap(&mut self, handle: RemoteSourceHandle) -> Result<(), Error> {
        let source = self.sources.get_mut(&handle).ok_or(Error::NotFound)?;
        source.pap_valid = false;
        source.pap_count = 0;
        self.merge_slots(0, DMX_ADDRESS_COUNT);
        Ok(())
    }

    /// Updates a source's universe priority.
    pub fn update_universe_priority(
        &mut self,
        handle: RemoteSourceHandle,
        priority: u8,
    ) -> Result<(), Error> {
        if priority > MAX_PRIORITY {
            return Err(Error::Invalid("priority above 200"));
        }
        let source = self.sources.get_mut(&handle).ok_or(Error::NotFound)?;
        source.universe_priority = priority;
        source.universe_priority_uninitialized = false;
        self.merge_slots(0, DMX_ADDRESS_COUNT);
        Ok(())
    }

    /// The merged levels, one per slot.
    pub fn levels(&self) -> &[u8; DMX_ADDRESS_COUNT] {
        &self.levels
    }

    /// The winning source per slot, `None` where no source participates.
    pub fn owners(&self) -> &[Option<RemoteSourceHandle>; DMX_ADDRESS_COUNT] {
        &self.owners
    }

    /// The winning effective priority per slot.
    pub fn winning_priorities(&self) -> &[u8; DMX_ADDRESS_COUNT] {
        &self.winning_priorities
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn check_capacity(&self) -> Result<(), Error> {
        if let Some(max) = self.source_count_max {
            if self.sources.len() >= max {
                return Err(Error::NoMem);
            }
        }
        limits::ensure_room(self.sources.len(), limits::DMX_MERGER_MAX_SOURCES_PER_MERGER)
    }

    fn merge_slots(&mut self, start: usize, end: usize) {
        for slot in start..end {
            let mut winner: Option<(RemoteSourceHandle, u8, u8)> = None;
            for (&handle, source) in &self.sources {
                let Some(priority) = source.priority_at(slot) else {
                    continue;
                };
                let level = source.levels[slot];
                let beats = match winner {
                    None => true,
                    Some((_, best_priority, best_level)) => {
                        priority > best_priority
                            || (priority == best_priority && level > best_level)
                    }
                };
                if beats {
                    winner = Some((handle, priority, level));
                }
            }

            match winner {
                Some((handle, priority, level)) => {
                    self.owners[slot] = Some(handle);
                    self.levels[slot] = level;
                    self.winning_priorities[slot] = priority;
                }
                None => {
                    self.owners[slot] = None;
                    self.levels[slot] = 0;
                    self.winning_priorities[slot] = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merger() -> Merger {
        Merger::new(MergerConfig::default())
    }

    #[test]
    fn htp_merge_with_equal_priorities() {
        let mut merger = merger();
        let s1 = merger.add_source().unwrap();
        let s2 = merger.add_source().unwrap();

        merger.update_levels(s1, &[10, 20, 30]).unwrap();
        merger.update_universe_priority(s1, 100).unwrap();
        merger.update_levels(s2, &[5, 25, 25]).unwrap();
        merger.update_universe_priority(s2, 100).unwrap();

        assert_eq!(&merger.levels()[..3], &[10, 25, 30]);
        assert_eq!(&merger.owners()[..3], &[Some(s1), Some(s2), Some(s1)]);
    }

    #[test]
    fn pap_overrides_universe_priority() {
        let mut merger = merger();
        let s1 = merger.add_source().unwrap();
        let s2 = merger.add_source().unwrap();

        merger.update_levels(s1, &[10, 20, 30]).unwrap();
        merger.update_universe_priority(s1, 100).unwrap();
        merger.update_levels(s2, &[5, 25, 25]).unwrap();
        merger.update_universe_priority(s2, 100).unwrap();
        merger.update_pap(s2, &[0, 200, 200]).unwrap();

        assert_eq!(&merger.levels()[..3], &[10, 25, 25]);
        assert_eq!(&merger.owners()[..3], &[Some(s1), Some(s2), Some(s2)]);
        assert_eq!(&merger.winning_priorities()[..3], &[100, 200, 200]);
    }

    #[test]
    fn pap_zero_means_no_participation() {
        let mut merger = merger();
        let only = merger.add_source().unwrap();
        merger.update_levels(only, &[128, 128]).unwrap();
        merger.update_universe_priority(only, 100).unwrap();
        merger.update_pap(only, &[0, 50]).unwrap();

        assert_eq!(merger.levels()[0], 0);
        assert_eq!(merger.owners()[0], None);
        assert_eq!(merger.levels()[1], 128);
        assert_eq!(merger.owners()[1], Some(only));
    }

    #[test]
    fn source_skipped_until_universe_priority_arrives() {
        let mut merger = merger();
        let source = merger.add_source().unwrap();
        merger.update_levels(source, &[255]).unwrap();

        assert_eq!(merger.owners()[0], None);

        merger.update_universe_priority(source, 0).unwrap();
        assert_eq!(merger.owners()[0], Some(source));
        assert_eq!(merger.levels()[0], 255);
    }

    #[test]
    fn remove_pap_reverts_to_universe_priority() {
        let mut merger = merger();
        let s1 = merger.add_source().unwrap();
        let s2 = merger.add_source().unwrap();

        merger.update_levels(s1, &[100]).unwrap();
        merger.update_universe_priority(s1, 120).unwrap();
        merger.update_levels(s2, &[50]).unwrap();
        merger.update_universe_priority(s2, 100).unwrap();
        merger.update_pap(s2, &[200]).unwrap();
        assert_eq!(merger.owners()[0], Some(s2));

        merger.remove_pap(s2).unwrap();
        assert_eq!(merger.owners()[0], Some(s1));
        assert_eq!(merger.levels()[0], 100);
    }

    #[test]
    fn remove_source_releases_owned_slots() {
        let mut merger = merger();
        let source = merger.add_source().unwrap();
        merger.update_levels(source, &[1, 2, 3]).unwrap();
        merger.update_universe_priority(source, 100).unwrap();
        assert_eq!(merger.owners()[0], Some(source));

        merger.remove_source(source).unwrap();
        assert_eq!(merger.owners()[0], None);
        assert_eq!(merger.levels()[0], 0);
    }

    #[test]
    fn levels_shorter_than_before_zero_the_tail() {
        let mut merger = merger();
        let source = merger.add_source().unwrap();
        merger.update_universe_priority(source, 100).unwrap();
        merger.update_levels(source, &[9, 9, 9]).unwrap();
        merger.update_levels(source, &[9]).unwrap();

        assert_eq!(merger.levels()[1], 0);
        assert_eq!(merger.owners()[1], None);
    }

    #[test]
    fn source_cap_is_enforced() {
        let mut merger = Merger::new(MergerConfig { source_count_max: Some(1) });
        merger.add_source().unwrap();
        assert!(matches!(merger.add_source(), Err(Error::NoMem)));
    }

    #[test]
    fn duplicate_handle_rejected() {
        let mut merger = merger();
        let handle = RemoteSourceHandle::new(7).unwrap();
        merger.add_source_with_handle(handle).unwrap();
        assert!(matches!(merger.add_source_with_handle(handle), Err(Error::Exists)));
    }
}
