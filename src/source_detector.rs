//! Universe discovery listener.
//!
//! Rides on receive thread 0 of a [`Receivers`](crate::receiver::Receivers)
//! engine, reassembles universe discovery pages per source, and reports which
//! universes each discovered source transmits.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::netint::{NetintConfig, NetintId};
use crate::packet::{self, RootLayer};
use crate::receiver::{ReceiversInner, SocketHandles};
use crate::registry::RemoteSourceRegistry;
use crate::util::Timer;
use crate::{ComponentIdentifier, Error, IpSupport, RemoteSourceHandle, limits};

/// Configuration for the source detector.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SourceDetectorConfig {
    /// IP families to listen on.
    pub ip_support: IpSupport,
    /// Interfaces to listen on; `None` uses every usable interface.
    pub netints: Option<NetintConfig>,
    /// Cap on tracked sources. `None` means unlimited in the dynamic-memory
    /// build, or the compile-time pool bound otherwise.
    pub source_count_max: Option<usize>,
    /// Cap on universes tracked per source.
    pub universes_per_source_max: Option<usize>,
    /// How long a source may stay silent before it expires. Defaults to
    /// twice the universe discovery interval.
    pub expiry: Duration,
}

impl Default for SourceDetectorConfig {
    fn default() -> Self {
        Self {
            ip_support: IpSupport::default(),
            netints: None,
            source_count_max: None,
            universes_per_source_max: None,
            expiry: crate::source::UNIVERSE_DISCOVERY_INTERVAL * 2,
        }
    }
}

/// Callbacks the source detector delivers from receive thread 0.
pub trait SourceDetectorNotifications: Send + Sync {
    /// A source announced a new or changed complete universe list.
    fn source_updated(
        &self,
        handle: RemoteSourceHandle,
        cid: &ComponentIdentifier,
        name: &str,
        sourced_universes: &[u16],
    );

    /// A source stopped sending discovery packets.
    fn source_expired(&self, handle: RemoteSourceHandle, cid: &ComponentIdentifier, name: &str);

    /// A source or universe limit was reached. Rate limited until the
    /// tracked set shrinks.
    fn limit_exceeded(&self) {}
}

struct DiscoveredSource {
    name: String,
    universes: Vec<u16>,
    next_universe_index: usize,
    next_page: u8,
    universes_dirty: bool,
    last_notified_universe_count: usize,
    suppress_universe_limit_exceeded: bool,
    expiration: Timer,
}

pub(crate) struct DetectorState {
    callbacks: Arc<dyn SourceDetectorNotifications>,
    netints: Vec<NetintId>,
    sockets: SocketHandles,
    sources: BTreeMap<RemoteSourceHandle, DiscoveredSource>,
    source_count_max: Option<usize>,
    universes_per_source_max: Option<usize>,
    expiry: Duration,
    suppress_limit_exceeded: bool,
}

impl DetectorState {
    pub(crate) fn new(
        config: &SourceDetectorConfig,
        callbacks: Arc<dyn SourceDetectorNotifications>,
        netints: Vec<NetintId>,
        sockets: SocketHandles,
    ) -> Self {
        Self {
            callbacks,
            netints,
            sockets,
            sources: BTreeMap::new(),
            source_count_max: config.source_count_max,
            universes_per_source_max: config.universes_per_source_max,
            expiry: config.expiry,
            suppress_limit_exceeded: false,
        }
    }

    pub(crate) fn sockets(&self) -> &SocketHandles {
        &self.sockets
    }

    pub(crate) fn netints(&self) -> &[NetintId] {
        &self.netints
    }

    pub(crate) fn release_sources(&mut self, registry: &mut RemoteSourceRegistry) {
        for handle in std::mem::take(&mut self.sources).into_keys() {
            let _ = registry.release(handle);
        }
    }

    fn universe_cap(&self) -> usize {
        let default = if cfg!(feature = "dynamic-memory") {
            usize::MAX
        } else {
            limits::SOURCE_DETECTOR_MAX_UNIVERSES_PER_SOURCE
        };
        self.universes_per_source_max.unwrap_or(default).min(default)
    }

    fn has_room_for_source(&self) -> bool {
        if let Some(max) = self.source_count_max {
            if self.sources.len() >= max {
                return false;
            }
        }
        limits::ensure_room(self.sources.len(), limits::SOURCE_DETECTOR_MAX_SOURCES).is_ok()
    }
}

/// Handles one universe discovery packet arriving on a receive thread.
pub(crate) fn handle_discovery_packet(
    inner: &Arc<ReceiversInner>,
    root: &RootLayer<'_>,
    _from: SocketAddr,
) {
    let layer = match packet::parse_discovery_layer(root.data) {
        Ok(layer) => layer,
        Err(err) => {
            log::warn!(
                "ignoring malformed sACN universe discovery packet from component {}: {err}",
                root.cid
            );
            return;
        }
    };

    let mut updated: Option<(RemoteSourceHandle, String, Vec<u16>)> = None;
    let mut limit_exceeded = false;
    let callbacks;

    {
        let mut state = inner.state.lock().unwrap();
        let state = &mut *state;
        let Some(detector) = state.detector.as_mut() else {
            return;
        };
        callbacks = Arc::clone(&detector.callbacks);

        let known = state.registry.handle(&root.cid).filter(|h| detector.sources.contains_key(h));
        let handle = match known {
            Some(handle) => Some(handle),
            None => {
                if detector.has_room_for_source() {
                    match state.registry.add(&root.cid) {
                        Ok(handle) => {
                            detector.sources.insert(
                                handle,
                                DiscoveredSource {
                                    name: layer.source_name.clone(),
                                    universes: Vec::new(),
                                    next_universe_index: 0,
                                    next_page: 0,
                                    universes_dirty: false,
                                    last_notified_universe_count: 0,
                                    suppress_universe_limit_exceeded: false,
                                    expiration: Timer::new(detector.expiry),
                                },
                            );
                            Some(handle)
                        }
                        Err(_) => None,
                    }
                } else {
                    None
                }
            }
        };

        match handle {
            None => {
                if !detector.suppress_limit_exceeded {
                    detector.suppress_limit_exceeded = true;
                    limit_exceeded = true;
                }
            }
            Some(handle) => {
                let universe_cap = detector.universe_cap();
                let source = detector.sources.get_mut(&handle).expect("just looked up");
                source.expiration.reset();
                source.name = layer.source_name.clone();

                if process_page(source, &layer, universe_cap)
                    && !source.suppress_universe_limit_exceeded
                {
                    source.suppress_universe_limit_exceeded = true;
                    limit_exceeded = true;
                }

                if page_set_complete(source, &layer) {
                    updated = Some((handle, source.name.clone(), source.universes.clone()));
                }
            }
        }
    }

    if let Some((handle, name, universes)) = updated {
        callbacks.source_updated(handle, &root.cid, &name, &universes);
    }
    if limit_exceeded {
        callbacks.limit_exceeded();
    }
}

/// Applies one page to the source's universe list. Returns true if the
/// universe cap truncated the page.
fn process_page(
    source: &mut DiscoveredSource,
    layer: &packet::DiscoveryLayer<'_>,
    universe_cap: usize,
) -> bool {
    // Pages must arrive as a consecutive run starting at 0; anything else
    // restarts assembly.
    if layer.page != 0 && layer.page != source.next_page {
        source.next_universe_index = 0;
        source.next_page = 0;
        return false;
    }
    if layer.page == 0 {
        source.next_universe_index = 0;
        source.next_page = 0;
    }

    let page_universes: Vec<u16> = layer.universes().collect();
    let index = source.next_universe_index;
    let remaining = source.universes.len().saturating_sub(index);

    let modifies = page_universes.len() > remaining
        || (layer.page == layer.last_page && page_universes.len() < remaining)
        || source.universes.get(index..index + page_universes.len()) != Some(&page_universes[..]);

    let mut truncated = false;
    if modifies {
        source.universes_dirty = true;
        source.universes.truncate(index);

        let room = universe_cap.saturating_sub(index);
        if room < page_universes.len() {
            source.universes.extend_from_slice(&page_universes[..room]);
            truncated = true;
        } else {
            source.universes.extend_from_slice(&page_universes);
        }
    }

    if layer.page < layer.last_page {
        source.next_universe_index += page_universes.len();
        source.next_page += 1;
    }

    truncated
}

/// Once the last page of a consecutive set lands, decides whether the
/// completed list is new information worth notifying.
fn page_set_complete(source: &mut DiscoveredSource, layer: &packet::DiscoveryLayer<'_>) -> bool {
    if layer.page < layer.last_page || (layer.page != 0 && source.next_page != layer.page) {
        return false;
    }

    source.next_universe_index = 0;
    source.next_page = 0;

    if !source.universes_dirty {
        return false;
    }

    // Filter lists that are not in ascending order.
    if source.universes.windows(2).any(|pair| pair[0] >= pair[1]) {
        source.universes_dirty = false;
        return false;
    }

    if source.universes.len() < source.last_notified_universe_count {
        source.suppress_universe_limit_exceeded = false;
    }
    source.universes_dirty = false;
    source.last_notified_universe_count = source.universes.len();
    true
}

/// Expires sources that stopped sending discovery packets.
pub(crate) fn process_expired(inner: &Arc<ReceiversInner>) {
    let mut expired: Vec<(RemoteSourceHandle, ComponentIdentifier, String)> = Vec::new();
    let callbacks;

    {
        let mut state = inner.state.lock().unwrap();
        let state = &mut *state;
        let Some(detector) = state.detector.as_mut() else {
            return;
        };
        callbacks = Arc::clone(&detector.callbacks);

        let handles: Vec<RemoteSourceHandle> = detector
            .sources
            .iter()
            .filter(|(_, source)| source.expiration.is_expired())
            .map(|(&handle, _)| handle)
            .collect();

        for handle in handles {
            let source = detector.sources.remove(&handle).expect("just collected");
            let cid = state
                .registry
                .cid(handle)
                .copied()
                .unwrap_or_else(ComponentIdentifier::nil);
            let _ = state.registry.release(handle);
            detector.suppress_limit_exceeded = false;
            expired.push((handle, cid, source.name));
        }
    }

    for (handle, cid, name) in &expired {
        callbacks.source_expired(*handle, cid, name);
    }
}

/// Validation shared by the engine entry point.
pub(crate) fn validate_config(config: &SourceDetectorConfig) -> Result<(), Error> {
    if config.expiry.is_zero() {
        return Err(Error::Invalid("source detector expiry must be nonzero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DiscoverySendBuf;
    use uuid::Uuid;

    fn source() -> DiscoveredSource {
        DiscoveredSource {
            name: "s".into(),
            universes: Vec::new(),
            next_universe_index: 0,
            next_page: 0,
            universes_dirty: false,
            last_notified_universe_count: 0,
            suppress_universe_limit_exceeded: false,
            expiration: Timer::new(Duration::from_secs(20)),
        }
    }

    fn layer_from(buf: &DiscoverySendBuf) -> Vec<u8> {
        // Framing-relative payload, as the receive path hands it over.
        buf.as_slice()[crate::packet::UDP_PREAMBLE_SIZE + 22..].to_vec()
    }

    fn page(universes: &[u16], page: u8, last_page: u8) -> Vec<u8> {
        let mut buf = DiscoverySendBuf::new(&Uuid::new_v4(), "s").unwrap();
        buf.set_universes(universes);
        buf.set_page(page);
        buf.set_last_page(last_page);
        layer_from(&buf)
    }

    #[test]
    fn single_page_completes_and_notifies_once() {
        let mut src = source();
        let data = page(&[1, 2, 3], 0, 0);
        let layer = packet::parse_discovery_layer(&data).unwrap();

        assert!(!process_page(&mut src, &layer, usize::MAX));
        assert!(page_set_complete(&mut src, &layer));
        assert_eq!(src.universes, vec![1, 2, 3]);

        // The same list again is not new information.
        assert!(!process_page(&mut src, &layer, usize::MAX));
        assert!(!page_set_complete(&mut src, &layer));
    }

    #[test]
    fn out_of_order_page_restarts_assembly() {
        let mut src = source();
        let second = page(&[600, 601], 1, 1);
        let layer = packet::parse_discovery_layer(&second).unwrap();

        process_page(&mut src, &layer, usize::MAX);
        // Page 1 without page 0 first must not complete a set.
        assert!(src.universes.is_empty());
    }

    #[test]
    fn two_page_list_assembles_in_order() {
        let mut src = source();
        let first: Vec<u16> = (1..=512).collect();
        let second = [513u16, 514];

        let data0 = page(&first, 0, 1);
        let layer0 = packet::parse_discovery_layer(&data0).unwrap();
        process_page(&mut src, &layer0, usize::MAX);
        assert!(!page_set_complete(&mut src, &layer0));

        let data1 = page(&second, 1, 1);
        let layer1 = packet::parse_discovery_layer(&data1).unwrap();
        process_page(&mut src, &layer1, usize::MAX);
        assert!(page_set_complete(&mut src, &layer1));
        assert_eq!(src.universes.len(), 514);
        assert_eq!(src.universes[512], 513);
    }

    #[test]
    fn non_ascending_list_is_filtered() {
        let mut src = source();
        let data = page(&[5, 3, 4], 0, 0);
        let layer = packet::parse_discovery_layer(&data).unwrap();
        process_page(&mut src, &layer, usize::MAX);
        assert!(!page_set_complete(&mut src, &layer));
    }

    #[test]
    fn universe_cap_truncates_page() {
        let mut src = source();
        let data = page(&[1, 2, 3, 4], 0, 0);
        let layer = packet::parse_discovery_layer(&data).unwrap();
        assert!(process_page(&mut src, &layer, 2));
        assert_eq!(src.universes, vec![1, 2]);
    }
}
