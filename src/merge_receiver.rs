//! Merge receiver: a receiver and a DMX merger composed into one.
//!
//! The merge receiver installs its own internal receiver callbacks, feeds
//! every tracked source's levels and priorities into a [`Merger`], and only
//! reports fully merged universe data. Merged notifications are gated until
//! the sampling period has ended and every known source has delivered its
//! first DMX packet, so the first merged callback already reflects every
//! source instead of a single-source snapshot followed by rapid overrides.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::merger::{Merger, MergerConfig};
use crate::netint::NetintConfig;
use crate::receiver::{
    self, Footprint, LostSource, ReceiverConfig, ReceiverHandle, ReceiverNotifications, Receivers,
    ReceiversInner, RemoteSource, UniverseData,
};
use crate::{DMX_ADDRESS_COUNT, Error, IpSupport, RemoteSourceHandle, UniverseId};

/// Configuration for a [`MergeReceiver`].
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MergeReceiverConfig {
    /// The universe to listen and merge on.
    pub universe: UniverseId,
    /// Slot range; must be the full universe (custom footprints are
    /// reserved).
    pub footprint: Footprint,
    /// Cap on simultaneously merged sources.
    pub source_count_max: Option<usize>,
    /// Honor per-address priority from sources. When false, 0xDD packets are
    /// ignored and only universe priorities merge.
    pub use_pap: bool,
    /// IP families to listen on.
    pub ip_support: IpSupport,
    /// Interfaces to listen on; `None` uses every usable interface.
    pub netints: Option<NetintConfig>,
}

impl MergeReceiverConfig {
    pub fn new(universe: UniverseId) -> Self {
        Self {
            universe,
            footprint: Footprint::default(),
            source_count_max: None,
            use_pap: true,
            ip_support: IpSupport::default(),
            netints: None,
        }
    }
}

/// One merged-data notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedData {
    pub universe_id: UniverseId,
    /// Winning level per slot.
    pub levels: [u8; DMX_ADDRESS_COUNT],
    /// Winning source per slot, `None` where no source participates.
    pub owners: [Option<RemoteSourceHandle>; DMX_ADDRESS_COUNT],
    /// How many sources are currently part of the merge.
    pub num_active_sources: usize,
}

/// Callbacks a merge receiver delivers from its receive thread.
pub trait MergeReceiverNotifications: Send + Sync {
    /// The merged output changed.
    fn merged_data(&self, handle: ReceiverHandle, data: &MergedData);

    /// A packet with a start code other than levels or per-address priority
    /// arrived; it bypasses the merge and is handed over raw.
    fn non_dmx(
        &self,
        handle: ReceiverHandle,
        source_addr: SocketAddr,
        source: &RemoteSource,
        data: &UniverseData<'_>,
    ) {
        let _ = (handle, source_addr, source, data);
    }

    /// A new source appeared past the source limit.
    fn source_limit_exceeded(&self, handle: ReceiverHandle, universe: UniverseId) {
        let _ = (handle, universe);
    }
}

struct MergeState {
    merger: Merger,
    /// Tracked sources; the value is the pending flag (no DMX seen yet).
    sources: BTreeMap<RemoteSourceHandle, bool>,
    num_pending_sources: usize,
    sampling: bool,
    use_pap: bool,
    universe: UniverseId,
    callbacks: Arc<dyn MergeReceiverNotifications>,
}

impl MergeState {
    /// Snapshot for a merged-data notification if the gates allow one:
    /// sampling over and no source still pending.
    fn pending_merged_data(&self) -> Option<MergedData> {
        if self.sampling || self.num_pending_sources > 0 {
            return None;
        }
        Some(MergedData {
            universe_id: self.universe,
            levels: *self.merger.levels(),
            owners: *self.merger.owners(),
            num_active_sources: self.sources.len(),
        })
    }
}

/// Internal receiver callbacks driving the merger.
struct MergeAdapter {
    state: Arc<Mutex<MergeState>>,
}

impl ReceiverNotifications for MergeAdapter {
    fn universe_data(
        &self,
        handle: ReceiverHandle,
        source_addr: SocketAddr,
        source: &RemoteSource,
        data: &UniverseData<'_>,
    ) {
        let mut merged = None;
        let mut non_dmx = false;
        let callbacks;
        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            callbacks = Arc::clone(&state.callbacks);

            if state.sources.contains_key(&source.handle) {
                let pending =
                    state.sources.get_mut(&source.handle).expect("presence checked above");
                // Pending clears on the first 0x00 packet; after the sampling
                // period that means 0xDD was either notified already or timed
                // out.
                if *pending && data.start_code == crate::STARTCODE_DMX {
                    *pending = false;
                    state.num_pending_sources -= 1;
                }
            } else {
                let _ = state.merger.add_source_with_handle(source.handle);
                let pending = state.use_pap && data.start_code == crate::STARTCODE_PRIORITY;
                state.sources.insert(source.handle, pending);
                if pending {
                    state.num_pending_sources += 1;
                }
            }

            let mut new_merge_occurred = false;
            if !data.slots.is_empty() && data.slots.len() <= DMX_ADDRESS_COUNT {
                match data.start_code {
                    crate::STARTCODE_DMX => {
                        let _ = state.merger.update_levels(source.handle, data.slots);
                        let _ =
                            state.merger.update_universe_priority(source.handle, data.priority);
                        new_merge_occurred = true;
                    }
                    crate::STARTCODE_PRIORITY if state.use_pap => {
                        let _ = state.merger.update_pap(source.handle, data.slots);
                        new_merge_occurred = true;
                    }
                    _ => {}
                }
            }

            if new_merge_occurred {
                merged = state.pending_merged_data();
            }
            if data.start_code != crate::STARTCODE_DMX
                && data.start_code != crate::STARTCODE_PRIORITY
            {
                non_dmx = true;
            }
        }

        if let Some(merged) = merged {
            callbacks.merged_data(handle, &merged);
        }
        if non_dmx {
            callbacks.non_dmx(handle, source_addr, source, data);
        }
    }

    fn sources_lost(&self, handle: ReceiverHandle, _universe: UniverseId, lost: &[LostSource]) {
        let merged;
        let callbacks;
        {
            let mut state = self.state.lock().unwrap();
            callbacks = Arc::clone(&state.callbacks);

            for source in lost {
                if let Some(pending) = state.sources.remove(&source.handle) {
                    if pending {
                        state.num_pending_sources -= 1;
                    }
                }
                let _ = state.merger.remove_source(source.handle);
            }

            merged = state.pending_merged_data();
        }

        if let Some(merged) = merged {
            callbacks.merged_data(handle, &merged);
        }
    }

    fn sampling_period_started(&self, _handle: ReceiverHandle, _universe: UniverseId) {
        self.state.lock().unwrap().sampling = true;
    }

    fn sampling_period_ended(&self, handle: ReceiverHandle, _universe: UniverseId) {
        let mut merged = None;
        let callbacks;
        {
            let mut state = self.state.lock().unwrap();
            callbacks = Arc::clone(&state.callbacks);
            state.sampling = false;
            if !state.sources.is_empty() {
                merged = state.pending_merged_data();
            }
        }

        if let Some(merged) = merged {
            callbacks.merged_data(handle, &merged);
        }
    }

    fn source_pap_lost(
        &self,
        handle: ReceiverHandle,
        _universe: UniverseId,
        source: &RemoteSource,
    ) {
        let merged;
        let callbacks;
        {
            let mut state = self.state.lock().unwrap();
            callbacks = Arc::clone(&state.callbacks);
            if !state.use_pap {
                return;
            }
            // The source reverts to its universe priority.
            let _ = state.merger.remove_pap(source.handle);
            merged = state.pending_merged_data();
        }

        if let Some(merged) = merged {
            callbacks.merged_data(handle, &merged);
        }
    }

    fn source_limit_exceeded(&self, handle: ReceiverHandle, universe: UniverseId) {
        let callbacks = Arc::clone(&self.state.lock().unwrap().callbacks);
        callbacks.source_limit_exceeded(handle, universe);
    }
}

/// A receiver that merges every tracked source into one universe view.
///
/// Dropping it destroys the underlying receiver.
pub struct MergeReceiver {
    inner: Arc<ReceiversInner>,
    handle: ReceiverHandle,
    state: Arc<Mutex<MergeState>>,
}

impl MergeReceiver {
    /// Creates a merge receiver on a [`Receivers`] engine.
    ///
    /// The underlying receiver filters preview data and uses the merge
    /// receiver's internal callbacks; the application only observes merged
    /// output.
    pub fn new(
        receivers: &Receivers,
        config: &MergeReceiverConfig,
        callbacks: Arc<dyn MergeReceiverNotifications>,
    ) -> Result<Self, Error> {
        if config.footprint != Footprint::default() {
            return Err(Error::NotImpl);
        }

        let state = Arc::new(Mutex::new(MergeState {
            merger: Merger::new(MergerConfig { source_count_max: config.source_count_max }),
            sources: BTreeMap::new(),
            num_pending_sources: 0,
            sampling: false,
            use_pap: config.use_pap,
            universe: config.universe,
            callbacks,
        }));

        let receiver_config = ReceiverConfig {
            universe: config.universe,
            footprint: config.footprint,
            source_count_max: config.source_count_max,
            filter_preview_data: true,
            ip_support: config.ip_support,
            netints: config.netints.clone(),
        };
        let adapter = Arc::new(MergeAdapter { state: Arc::clone(&state) });
        let handle = receivers.create(&receiver_config, adapter)?;

        Ok(Self { inner: Arc::clone(&receivers.inner), handle, state })
    }

    /// The underlying receiver handle, also used in merged-data
    /// notifications.
    pub fn handle(&self) -> ReceiverHandle {
        self.handle
    }

    /// The universe this merge receiver listens on.
    pub fn universe(&self) -> UniverseId {
        self.state.lock().unwrap().universe
    }

    /// The merge receiver's footprint. Always the full universe.
    pub fn footprint(&self) -> Footprint {
        Footprint::default()
    }

    /// Moves the merge receiver to a different universe. The merger starts
    /// over and a new sampling period gates the next merged notification.
    pub fn change_universe(
        &self,
        receivers: &Receivers,
        new_universe: UniverseId,
    ) -> Result<(), Error> {
        receivers.change_universe(self.handle, new_universe)?;

        let mut state = self.state.lock().unwrap();
        let handles: Vec<RemoteSourceHandle> = state.sources.keys().copied().collect();
        for handle in handles {
            let _ = state.merger.remove_source(handle);
        }
        state.sources.clear();
        state.num_pending_sources = 0;
        state.universe = new_universe;
        Ok(())
    }

    /// How many sources are currently part of the merge.
    pub fn num_sources(&self) -> usize {
        self.state.lock().unwrap().sources.len()
    }
}

impl Drop for MergeReceiver {
    fn drop(&mut self) {
        let _ = receiver::destroy_receiver(&self.inner, self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullCallbacks;
    impl MergeReceiverNotifications for NullCallbacks {
        fn merged_data(&self, _handle: ReceiverHandle, _data: &MergedData) {}
    }

    fn state_with(use_pap: bool) -> Arc<Mutex<MergeState>> {
        Arc::new(Mutex::new(MergeState {
            merger: Merger::new(MergerConfig::default()),
            sources: BTreeMap::new(),
            num_pending_sources: 0,
            sampling: false,
            use_pap,
            universe: UniverseId::new(1).unwrap(),
            callbacks: Arc::new(NullCallbacks),
        }))
    }

    fn remote(value: u16) -> RemoteSource {
        RemoteSource {
            handle: RemoteSourceHandle::new(value).unwrap(),
            cid: uuid::Uuid::new_v4(),
            name: "test".into(),
        }
    }

    fn dmx_data(slots: &[u8]) -> UniverseData<'_> {
        UniverseData {
            universe_id: UniverseId::new(1).unwrap(),
            priority: 100,
            preview: false,
            start_code: crate::STARTCODE_DMX,
            slots,
            is_sampling: false,
        }
    }

    #[cfg(feature = "pap")]
    fn pap_data(slots: &[u8]) -> UniverseData<'_> {
        UniverseData { start_code: crate::STARTCODE_PRIORITY, ..dmx_data(slots) }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:5568".parse().unwrap()
    }

    #[test]
    fn first_dmx_source_is_not_pending() {
        let state = state_with(true);
        let adapter = MergeAdapter { state: Arc::clone(&state) };

        adapter.universe_data(ReceiverHandle::from_raw(0), addr(), &remote(1), &dmx_data(&[1, 2, 3]));

        let state = state.lock().unwrap();
        assert_eq!(state.num_pending_sources, 0);
        assert_eq!(state.merger.levels()[..3], [1, 2, 3]);
    }

    #[cfg(feature = "pap")]
    #[test]
    fn pap_first_source_pends_until_dmx() {
        let state = state_with(true);
        let adapter = MergeAdapter { state: Arc::clone(&state) };
        let source = remote(1);

        adapter.universe_data(ReceiverHandle::from_raw(0), addr(), &source, &pap_data(&[200, 200]));
        assert_eq!(state.lock().unwrap().num_pending_sources, 1);
        assert!(state.lock().unwrap().pending_merged_data().is_none());

        adapter.universe_data(ReceiverHandle::from_raw(0), addr(), &source, &dmx_data(&[10, 20]));
        assert_eq!(state.lock().unwrap().num_pending_sources, 0);
        assert!(state.lock().unwrap().pending_merged_data().is_some());
    }

    #[test]
    fn sampling_gates_merged_data() {
        let state = state_with(true);
        let adapter = MergeAdapter { state: Arc::clone(&state) };

        adapter.sampling_period_started(ReceiverHandle::from_raw(0), UniverseId::new(1).unwrap());
        adapter.universe_data(ReceiverHandle::from_raw(0), addr(), &remote(1), &dmx_data(&[9]));
        assert!(state.lock().unwrap().pending_merged_data().is_none());

        adapter.sampling_period_ended(ReceiverHandle::from_raw(0), UniverseId::new(1).unwrap());
        assert!(state.lock().unwrap().pending_merged_data().is_some());
    }

    #[test]
    fn lost_sources_leave_the_merge() {
        let state = state_with(true);
        let adapter = MergeAdapter { state: Arc::clone(&state) };
        let source = remote(1);

        adapter.universe_data(ReceiverHandle::from_raw(0), addr(), &source, &dmx_data(&[50]));
        assert_eq!(state.lock().unwrap().sources.len(), 1);

        let lost = [LostSource {
            handle: source.handle,
            cid: source.cid,
            name: source.name.clone(),
            terminated: true,
        }];
        adapter.sources_lost(ReceiverHandle::from_raw(0), UniverseId::new(1).unwrap(), &lost);

        let state = state.lock().unwrap();
        assert!(state.sources.is_empty());
        assert_eq!(state.merger.owners()[0], None);
    }
}
