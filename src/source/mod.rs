//! The sACN source engine.
//!
//! [`Sources`] owns the send-socket pool and a single tick thread that paces
//! every thread-based source: data transmission with suppression, termination
//! sequencing and universe discovery. Manually processed sources advance only
//! when the application calls [`Sources::process_manual`].

pub(crate) mod universe;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::netint::{NetintConfig, NetintId};
use crate::packet::{DataSendBuf, DiscoverySendBuf, MAX_UNIVERSES_PER_PAGE};
use crate::sockets::{self, SendSockets};
use crate::util::{HandleAllocator, Timer};
use crate::{
    ComponentIdentifier, DISCOVERY_UNIVERSE, DMX_ADDRESS_COUNT, Error, IpSupport, MAX_PRIORITY,
    SOURCE_NAME_MAX_LEN, UniverseId, limits,
};

pub use universe::UniverseConfig;
use universe::{
    NUM_PRE_SUPPRESSION_PACKETS, NUM_TERMINATION_PACKETS, SourceUniverse, TerminateBehavior,
    TerminationState, UnicastDest,
};

/// How often the tick thread processes thread-based sources.
pub const SOURCE_THREAD_INTERVAL: Duration = Duration::from_millis(23);

/// How often a source announces its universes via universe discovery.
pub const UNIVERSE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);

/// Identifies one source within a [`Sources`] engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceHandle(i32);

impl std::fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for one source.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SourceConfig {
    /// The source's CID. Must not be nil.
    pub cid: ComponentIdentifier,
    /// Source name (under 64 bytes including the wire NUL).
    pub name: String,
    /// Cap on universes per source. `None` means unlimited in the
    /// dynamic-memory build, or the compile-time pool bound otherwise.
    pub universe_count_max: Option<usize>,
    /// Only advance this source from [`Sources::process_manual`] instead of
    /// the tick thread.
    pub manually_process_source: bool,
    /// IP families to send on.
    pub ip_support: IpSupport,
    /// Keep-alive interval for suppressed level transmission.
    pub keep_alive_interval: Duration,
    /// Keep-alive interval for suppressed per-address-priority transmission.
    pub pap_keep_alive_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            cid: ComponentIdentifier::new_v4(),
            name: "New sACN Source".to_string(),
            universe_count_max: None,
            manually_process_source: false,
            ip_support: IpSupport::default(),
            keep_alive_interval: Duration::from_millis(800),
            pap_keep_alive_interval: Duration::from_millis(800),
        }
    }
}

/// Engine-wide options.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SourceOptions {
    /// Tick interval of the source thread.
    pub tick_interval: Duration,
    /// Universe discovery send interval.
    pub universe_discovery_interval: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            tick_interval: SOURCE_THREAD_INTERVAL,
            universe_discovery_interval: UNIVERSE_DISCOVERY_INTERVAL,
        }
    }
}

struct SourceNetint {
    id: NetintId,
    refs: usize,
}

struct SourceState {
    handle: SourceHandle,
    cid: ComponentIdentifier,
    name: String,
    terminating: bool,
    num_active_universes: usize,
    universe_discovery_timer: Timer,
    process_manually: bool,
    ip_support: IpSupport,
    keep_alive: Duration,
    #[cfg_attr(not(feature = "pap"), allow(dead_code))]
    pap_keep_alive: Duration,
    universe_count_max: Option<usize>,
    universes: Vec<SourceUniverse>,
    netints: Vec<SourceNetint>,
    discovery_buf: DiscoverySendBuf,
}

impl SourceState {
    fn universe_index(&self, universe: u16) -> Option<usize> {
        self.universes.iter().position(|entry| entry.id == universe)
    }

    fn add_netint_ref(&mut self, id: NetintId) {
        match self.netints.iter().position(|netint| netint.id == id) {
            Some(index) => self.netints[index].refs += 1,
            None => self.netints.push(SourceNetint { id, refs: 1 }),
        }
    }

    fn remove_netint_ref(&mut self, id: NetintId) {
        if let Some(index) = self.netints.iter().position(|netint| netint.id == id) {
            self.netints[index].refs = self.netints[index].refs.saturating_sub(1);
            if self.netints[index].refs == 0 {
                self.netints.remove(index);
            }
        }
    }

    fn set_terminating(&mut self) {
        if !self.terminating {
            self.terminating = true;
            for universe in &mut self.universes {
                universe.set_terminating(TerminateBehavior::AndRemove);
            }
        }
    }
}

enum ProcessBehavior {
    Threaded,
    Manual,
}

struct SourcesState {
    send: SendSockets,
    sources: Vec<SourceState>,
    handle_alloc: HandleAllocator,
    shutting_down: bool,
    thread: Option<JoinHandle<()>>,
    thread_running: bool,
}

struct SourcesInner {
    options: SourceOptions,
    state: Mutex<SourcesState>,
}

/// The source engine.
///
/// Dropping it terminates every thread-based source (three termination
/// packets per universe with data) before the tick thread exits.
pub struct Sources {
    inner: Arc<SourcesInner>,
}

impl Sources {
    /// Probes the system's interfaces and builds the send-socket pool.
    pub fn new(options: SourceOptions, netints: Option<&NetintConfig>) -> Result<Self, Error> {
        if options.tick_interval.is_zero() {
            return Err(Error::Invalid("tick interval must be nonzero"));
        }

        let send = SendSockets::new(netints)?;
        Ok(Self {
            inner: Arc::new(SourcesInner {
                options,
                state: Mutex::new(SourcesState {
                    send,
                    sources: Vec::new(),
                    handle_alloc: HandleAllocator::default(),
                    shutting_down: false,
                    thread: None,
                    thread_running: false,
                }),
            }),
        })
    }

    /// Creates a new source. The tick thread starts with the first source.
    pub fn create(&self, config: &SourceConfig) -> Result<SourceHandle, Error> {
        if config.cid.is_nil() {
            return Err(Error::Invalid("source CID must not be nil"));
        }
        if config.name.len() >= SOURCE_NAME_MAX_LEN {
            return Err(Error::Invalid("source name too long"));
        }
        if config.keep_alive_interval.is_zero() || config.pap_keep_alive_interval.is_zero() {
            return Err(Error::Invalid("keep-alive intervals must be nonzero"));
        }

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        limits::ensure_room(state.sources.len(), limits::SOURCE_MAX_SOURCES)?;

        let discovery_buf = DiscoverySendBuf::new(&config.cid, &config.name)
            .map_err(|_| Error::Invalid("source name too long"))?;

        let handle = {
            let sources = &state.sources;
            SourceHandle(state.handle_alloc.next_handle(|value| {
                sources.iter().any(|source| source.handle == SourceHandle(value))
            }))
        };

        state.sources.push(SourceState {
            handle,
            cid: config.cid,
            name: config.name.clone(),
            terminating: false,
            num_active_universes: 0,
            universe_discovery_timer: Timer::new(self.inner.options.universe_discovery_interval),
            process_manually: config.manually_process_source,
            ip_support: config.ip_support,
            keep_alive: config.keep_alive_interval,
            pap_keep_alive: config.pap_keep_alive_interval,
            universe_count_max: config.universe_count_max,
            universes: Vec::new(),
            netints: Vec::new(),
            discovery_buf,
        });

        if !state.thread_running {
            let inner = Arc::clone(&self.inner);
            let join = std::thread::Builder::new()
                .name("sacn-source".to_string())
                .spawn(move || source_thread(inner))?;
            state.thread = Some(join);
            state.thread_running = true;
        }

        Ok(handle)
    }

    /// Begins termination of a source. Its universes each send three
    /// termination packets before the source disappears.
    pub fn destroy(&self, handle: SourceHandle) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let source = lookup_source(&mut state.sources, handle)?;
        source.set_terminating();
        Ok(())
    }

    /// Adds a universe to a source.
    pub fn add_universe(
        &self,
        handle: SourceHandle,
        config: &UniverseConfig,
    ) -> Result<(), Error> {
        if config.priority > MAX_PRIORITY {
            return Err(Error::Invalid("priority above 200"));
        }
        if config.sync_universe != 0 && UniverseId::new(config.sync_universe).is_err() {
            return Err(Error::Invalid("sync universe out of range"));
        }
        for (i, dest) in config.unicast_destinations.iter().enumerate() {
            if config.unicast_destinations[..i].contains(dest) {
                return Err(Error::Exists);
            }
        }

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        let netints = sockets::resolve_netints(config.netints.as_ref(), state.send.sys_netints())?;

        let source = lookup_source(&mut state.sources, handle)?;
        if source.universe_index(config.universe.get()).is_some() {
            return Err(Error::Exists);
        }
        if let Some(max) = source.universe_count_max {
            if source.universes.len() >= max {
                return Err(Error::NoMem);
            }
        }
        limits::ensure_room(source.universes.len(), limits::SOURCE_MAX_UNIVERSES_PER_SOURCE)?;
        limits::ensure_room(
            config.unicast_destinations.len().saturating_sub(1),
            limits::MAX_UNICAST_DESTINATIONS_PER_UNIVERSE,
        )?;

        let universe = SourceUniverse::new(&source.cid, &source.name, config, netints)?;
        for netint in universe.netints.clone() {
            source.add_netint_ref(netint);
        }
        source.universes.push(universe);
        Ok(())
    }

    /// Begins removal of a universe: three termination packets, then the
    /// universe and its interface references go away.
    pub fn remove_universe(&self, handle: SourceHandle, universe: UniverseId) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let (_, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        entry.set_terminating(TerminateBehavior::AndRemove);
        Ok(())
    }

    /// The universes on a source, excluding those being removed.
    pub fn universes(&self, handle: SourceHandle) -> Result<Vec<UniverseId>, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let source = lookup_source(&mut state.sources, handle)?;
        Ok(source
            .universes
            .iter()
            .filter(|entry| entry.termination_state != TerminationState::TerminatingAndRemoving)
            .filter_map(|entry| UniverseId::new(entry.id).ok())
            .collect())
    }

    /// Adds a unicast destination for a universe.
    pub fn add_unicast_destination(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        dest: IpAddr,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        let keep_alive;
        #[cfg(feature = "pap")]
        let pap_keep_alive;
        {
            let source = lookup_source(&mut state.sources, handle)?;
            keep_alive = source.keep_alive;
            #[cfg(feature = "pap")]
            {
                pap_keep_alive = source.pap_keep_alive;
            }
        }

        let (_, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        let existing = entry
            .unicast_dests
            .iter()
            .any(|d| d.addr == dest && d.termination_state != TerminationState::TerminatingAndRemoving);
        if existing {
            return Err(Error::Exists);
        }
        limits::ensure_room(
            entry.unicast_dests.len(),
            limits::MAX_UNICAST_DESTINATIONS_PER_UNIVERSE,
        )?;

        entry.unicast_dests.push(UnicastDest::new(dest));
        entry.reset_level_suppression(keep_alive);
        #[cfg(feature = "pap")]
        entry.reset_pap_suppression(pap_keep_alive);
        Ok(())
    }

    /// Begins removal of a unicast destination (three termination packets).
    pub fn remove_unicast_destination(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        dest: IpAddr,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let (_, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        let found = entry.unicast_dests.iter_mut().find(|d| {
            d.addr == dest && d.termination_state != TerminationState::TerminatingAndRemoving
        });
        match found {
            Some(dest) => {
                dest.set_terminating(TerminateBehavior::AndRemove);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// The unicast destinations of a universe, excluding those being removed.
    pub fn unicast_destinations(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
    ) -> Result<Vec<IpAddr>, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let (_, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        Ok(entry
            .unicast_dests
            .iter()
            .filter(|d| d.termination_state != TerminationState::TerminatingAndRemoving)
            .map(|d| d.addr)
            .collect())
    }

    /// Changes a universe's priority and restarts its transmission burst.
    pub fn change_priority(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        priority: u8,
    ) -> Result<(), Error> {
        if priority > MAX_PRIORITY {
            return Err(Error::Invalid("priority above 200"));
        }

        let mut state = self.inner.state.lock().unwrap();
        let (source_props, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        entry.priority = priority;
        entry.level_buf.set_priority(priority);
        #[cfg(feature = "pap")]
        entry.pap_buf.set_priority(priority);
        entry.reset_level_suppression(source_props.keep_alive);
        #[cfg(feature = "pap")]
        entry.reset_pap_suppression(source_props.pap_keep_alive);
        Ok(())
    }

    /// Changes a universe's preview flag and restarts its transmission burst.
    pub fn change_preview_flag(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        preview: bool,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let (source_props, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        entry.send_preview = preview;
        entry.level_buf.set_preview(preview);
        #[cfg(feature = "pap")]
        entry.pap_buf.set_preview(preview);
        entry.reset_level_suppression(source_props.keep_alive);
        #[cfg(feature = "pap")]
        entry.reset_pap_suppression(source_props.pap_keep_alive);
        Ok(())
    }

    /// Renames a source, rewriting the name in every outgoing buffer and
    /// restarting every universe's transmission burst.
    pub fn change_name(&self, handle: SourceHandle, new_name: &str) -> Result<(), Error> {
        if new_name.len() >= SOURCE_NAME_MAX_LEN {
            return Err(Error::Invalid("source name too long"));
        }

        let mut state = self.inner.state.lock().unwrap();
        let source = lookup_source(&mut state.sources, handle)?;
        source.name = new_name.to_string();
        source
            .discovery_buf
            .set_source_name(new_name)
            .map_err(|_| Error::Invalid("source name too long"))?;

        let keep_alive = source.keep_alive;
        #[cfg(feature = "pap")]
        let pap_keep_alive = source.pap_keep_alive;
        for entry in &mut source.universes {
            let _ = entry.level_buf.set_source_name(new_name);
            #[cfg(feature = "pap")]
            let _ = entry.pap_buf.set_source_name(new_name);
            entry.reset_level_suppression(keep_alive);
            #[cfg(feature = "pap")]
            entry.reset_pap_suppression(pap_keep_alive);
        }
        Ok(())
    }

    /// Copies new levels into a universe's outgoing packet.
    ///
    /// `None` terminates transmission on the universe without removing it;
    /// the next update resumes it.
    pub fn update_levels(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        levels: Option<&[u8]>,
    ) -> Result<(), Error> {
        self.update(handle, universe, levels, UpdatePap::Keep)
    }

    /// Copies new levels and per-address priorities into a universe's
    /// outgoing packets. PAP is updated before levels so the zero-priority
    /// coupling reflects the new priorities.
    ///
    /// `levels: None` terminates transmission without removing the universe.
    /// `pap: None` stops PAP transmission; receivers revert to the universe
    /// priority once their PAP times out.
    #[cfg(feature = "pap")]
    pub fn update_levels_and_pap(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        levels: Option<&[u8]>,
        pap: Option<&[u8]>,
    ) -> Result<(), Error> {
        match pap {
            Some(pap) => self.update(handle, universe, levels, UpdatePap::Set(pap)),
            None => self.update(handle, universe, levels, UpdatePap::Disable),
        }
    }

    /// Stops transmission on a universe without removing it. Three
    /// termination packets go out, then the universe idles until the next
    /// update.
    pub fn terminate_universe(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
    ) -> Result<(), Error> {
        self.update(handle, universe, None, UpdatePap::Disable)
    }

    /// Builds and immediately transmits a single packet with an arbitrary
    /// start code on a universe, bypassing pacing.
    pub fn send_now(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        start_code: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.is_empty() || data.len() > DMX_ADDRESS_COUNT {
            return Err(Error::Invalid("data must be 1..=512 bytes"));
        }

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        let source_index = state
            .sources
            .iter()
            .position(|source| source.handle == handle)
            .ok_or(Error::NotFound)?;
        let (cid, name, ip_support) = {
            let source = &state.sources[source_index];
            (source.cid, source.name.clone(), source.ip_support)
        };
        let source = &mut state.sources[source_index];
        let Some(universe_index) = source.universe_index(universe.get()) else {
            return Err(Error::NotFound);
        };
        let entry = &mut source.universes[universe_index];
        if entry.termination_state == TerminationState::TerminatingAndRemoving {
            return Err(Error::NotFound);
        }

        let mut buf = DataSendBuf::new(
            &cid,
            &name,
            entry.priority,
            entry.id,
            0,
            entry.send_preview,
            start_code,
        )
        .map_err(|_| Error::Invalid("source name too long"))?;
        buf.set_sequence(entry.seq);
        buf.set_data(data);

        let mut sent_any = false;
        if !entry.send_unicast_only {
            for netint in &entry.netints {
                match state.send.send_multicast(entry.id, ip_support, buf.as_slice(), netint) {
                    Ok(()) => sent_any = true,
                    Err(err) => entry.last_send_error = Some(err.kind()),
                }
            }
        }
        for dest in &mut entry.unicast_dests {
            if dest.termination_state != TerminationState::TerminatingAndRemoving {
                match state.send.send_unicast(
                    ip_support,
                    buf.as_slice(),
                    dest.addr,
                    &mut dest.last_send_error,
                ) {
                    Ok(()) => sent_any = true,
                    Err(err) => entry.last_send_error = Some(err.kind()),
                }
            }
        }
        entry.increment_sequence();

        if sent_any {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::from(
                entry.last_send_error.unwrap_or(std::io::ErrorKind::NotConnected),
            )))
        }
    }

    /// Sending synchronization packets is reserved.
    pub fn send_synchronization(
        &self,
        _handle: SourceHandle,
        _sync_universe: UniverseId,
    ) -> Result<(), Error> {
        Err(Error::NotImpl)
    }

    /// Processes every manually processed source once. Returns how many
    /// manual sources are still tracked.
    pub fn process_manual(&self) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        process_sources(&mut state, ProcessBehavior::Manual, &self.inner.options)
    }

    /// The interfaces a universe multicasts on.
    pub fn universe_netints(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
    ) -> Result<Vec<NetintId>, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let (_, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;
        Ok(entry.netints.clone())
    }

    /// The union of interfaces in use across a source's universes.
    pub fn netints(&self, handle: SourceHandle) -> Result<Vec<NetintId>, Error> {
        let mut state = self.inner.state.lock().unwrap();
        let source = lookup_source(&mut state.sources, handle)?;
        Ok(source.netints.iter().map(|netint| netint.id).collect())
    }

    /// Tears down and rebuilds the send-socket pool, re-resolving every
    /// universe's interfaces and restarting every transmission burst.
    pub fn reset_networking(&self, netints: Option<&NetintConfig>) -> Result<(), Error> {
        let send = SendSockets::new(netints)?;

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        state.send = send;

        for source in &mut state.sources {
            source.netints.clear();
            let keep_alive = source.keep_alive;
            #[cfg(feature = "pap")]
            let pap_keep_alive = source.pap_keep_alive;

            let mut netint_refs = Vec::new();
            for entry in &mut source.universes {
                // Universes configured with an interface subset keep it.
                entry.netints = sockets::resolve_netints(
                    entry.netint_config.as_ref(),
                    state.send.sys_netints(),
                )?;
                netint_refs.extend(entry.netints.iter().copied());
                entry.reset_level_suppression(keep_alive);
                #[cfg(feature = "pap")]
                entry.reset_pap_suppression(pap_keep_alive);
            }
            for netint in netint_refs {
                source.add_netint_ref(netint);
            }
        }
        Ok(())
    }

    fn update(
        &self,
        handle: SourceHandle,
        universe: UniverseId,
        levels: Option<&[u8]>,
        pap: UpdatePap<'_>,
    ) -> Result<(), Error> {
        if levels.is_some_and(|levels| levels.len() > DMX_ADDRESS_COUNT) {
            return Err(Error::Invalid("more than 512 levels"));
        }
        if let UpdatePap::Set(pap) = pap {
            if pap.len() > DMX_ADDRESS_COUNT {
                return Err(Error::Invalid("more than 512 priorities"));
            }
        }

        let mut state = self.inner.state.lock().unwrap();
        let (source_props, entry) = lookup_universe(&mut state.sources, handle, universe.get())?;

        let mut active_universe_delta: isize = 0;
        let was_part_of_discovery = entry.part_of_discovery();

        if levels.is_none() {
            entry.set_terminating(TerminateBehavior::WithoutRemoving);
        }
        if levels.is_none() || matches!(pap, UpdatePap::Disable) {
            #[cfg(feature = "pap")]
            {
                entry.has_pap_data = false;
            }
        }

        if let Some(levels) = levels {
            // PAP must be updated before levels so zeroed priorities force
            // zeroed levels.
            #[cfg(feature = "pap")]
            if let UpdatePap::Set(pap) = pap {
                entry.pap_buf.set_data(pap);
                entry.has_pap_data = true;
                entry.reset_pap_suppression(source_props.pap_keep_alive);
            }
            #[cfg(not(feature = "pap"))]
            let _ = &pap;

            entry.cancel_termination_if_not_removing();
            entry.level_buf.set_data(levels);
            entry.has_level_data = true;
            #[cfg(feature = "pap")]
            if entry.has_pap_data {
                entry.zero_levels_where_pap_is_zero();
            }
            entry.reset_level_suppression(source_props.keep_alive);

            if !was_part_of_discovery && entry.part_of_discovery() {
                active_universe_delta = 1;
            }
        }

        if active_universe_delta > 0 {
            let source = lookup_source(&mut state.sources, handle)?;
            source.num_active_universes += 1;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum UpdatePap<'a> {
    /// Leave existing PAP state alone.
    Keep,
    /// Replace the PAP buffer.
    #[cfg_attr(not(feature = "pap"), allow(dead_code))]
    Set(&'a [u8]),
    /// Stop transmitting PAP.
    Disable,
}

impl Drop for Sources {
    fn drop(&mut self) {
        let join = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutting_down = true;
            state.thread.take()
        };
        // The thread keeps ticking until every thread-based source has
        // finished terminating.
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

/* ----------------------------- Lookup helpers ---------------------------- */

fn lookup_source(
    sources: &mut [SourceState],
    handle: SourceHandle,
) -> Result<&mut SourceState, Error> {
    sources.iter_mut().find(|source| source.handle == handle).ok_or(Error::NotFound)
}

/// Properties of the owning source needed while a universe is borrowed.
struct SourceProps {
    keep_alive: Duration,
    #[cfg_attr(not(feature = "pap"), allow(dead_code))]
    pap_keep_alive: Duration,
}

/// Looks up a universe on a source. Universes already being removed count as
/// not found.
fn lookup_universe<'a>(
    sources: &'a mut [SourceState],
    handle: SourceHandle,
    universe: u16,
) -> Result<(SourceProps, &'a mut SourceUniverse), Error> {
    let source = lookup_source(sources, handle)?;
    let props = SourceProps {
        keep_alive: source.keep_alive,
        pap_keep_alive: source.pap_keep_alive,
    };
    let index = source.universe_index(universe).ok_or(Error::NotFound)?;
    let entry = &mut source.universes[index];
    if entry.termination_state == TerminationState::TerminatingAndRemoving {
        return Err(Error::NotFound);
    }
    Ok((props, entry))
}

/* ------------------------------- Tick thread ----------------------------- */

fn source_thread(inner: Arc<SourcesInner>) {
    log::debug!("sACN source thread started");

    let mut keep_running = true;
    let mut num_thread_based = 0;
    let mut interval = Timer::new(inner.options.tick_interval);

    // Keeps running through shutdown until all thread-based sources have
    // finished their termination packets.
    while keep_running || num_thread_based > 0 {
        num_thread_based = {
            let mut state = inner.state.lock().unwrap();
            process_sources(&mut state, ProcessBehavior::Threaded, &inner.options)
        };

        spin_sleep::sleep(interval.remaining());
        interval.reset();

        keep_running = !inner.state.lock().unwrap().shutting_down;
    }

    log::debug!("sACN source thread stopped");
}

fn process_sources(
    state: &mut SourcesState,
    behavior: ProcessBehavior,
    options: &SourceOptions,
) -> usize {
    let process_manual = matches!(behavior, ProcessBehavior::Manual);
    let shutting_down = state.shutting_down;
    let SourcesState { send, sources, .. } = state;

    let mut num_processed = 0;
    for index in (0..sources.len()).rev() {
        let source = &mut sources[index];
        if source.process_manually != process_manual {
            continue;
        }

        // Shutdown cascades into termination of every thread-based source.
        if !process_manual && shutting_down {
            source.set_terminating();
        }
        num_processed += 1;

        process_universe_discovery(send, source, options);
        process_universes(send, source);

        if source.terminating && source.universes.is_empty() {
            sources.remove(index);
        }
    }

    num_processed
}

fn process_universe_discovery(
    send: &mut SendSockets,
    source: &mut SourceState,
    options: &SourceOptions,
) {
    if !source.terminating && source.universe_discovery_timer.is_expired() {
        send_universe_discovery(send, source);
        source.universe_discovery_timer.start(options.universe_discovery_interval);
    }
}

fn send_universe_discovery(send: &mut SendSockets, source: &mut SourceState) {
    if source.netints.is_empty() {
        return;
    }

    // Only universes with level data that aren't unicast-only are announced,
    // in ascending order.
    let mut active: Vec<u16> = source
        .universes
        .iter()
        .filter(|universe| universe.part_of_discovery())
        .map(|universe| universe.id)
        .collect();
    active.sort_unstable();
    if active.is_empty() {
        return;
    }

    let last_page = ((active.len() - 1) / MAX_UNIVERSES_PER_PAGE) as u8;
    for (page, chunk) in active.chunks(MAX_UNIVERSES_PER_PAGE).enumerate() {
        source.discovery_buf.set_universes(chunk);
        source.discovery_buf.set_page(page as u8);
        source.discovery_buf.set_last_page(last_page);

        for netint in &source.netints {
            let _ = send.send_multicast(
                DISCOVERY_UNIVERSE,
                source.ip_support,
                source.discovery_buf.as_slice(),
                &netint.id,
            );
        }

        source.discovery_buf.increment_sequence();
    }
}

fn process_universes(send: &mut SendSockets, source: &mut SourceState) {
    for index in (0..source.universes.len()).rev() {
        let unicast_terminating =
            process_unicast_dests(send, source.ip_support, &mut source.universes[index]);

        if source.universes[index].termination_state == TerminationState::NotTerminating {
            transmit_levels_and_pap_when_needed(
                send,
                source.ip_support,
                &mut source.universes[index],
            );
        } else {
            process_universe_termination(send, source, index, unicast_terminating);
        }
    }
}

/// Walks a universe's unicast destinations, driving any in-progress
/// terminations. Returns whether any destination is still terminating.
fn process_unicast_dests(
    send: &mut SendSockets,
    ip_support: IpSupport,
    universe: &mut SourceUniverse,
) -> bool {
    let mut terminating = false;

    for index in (0..universe.unicast_dests.len()).rev() {
        if universe.unicast_dests[index].termination_state == TerminationState::NotTerminating {
            continue;
        }

        if universe.unicast_dests[index].num_terminations_sent < NUM_TERMINATION_PACKETS
            && universe.has_level_data
        {
            send_termination_unicast(send, ip_support, universe, index);
        }

        if universe.unicast_dests[index].num_terminations_sent >= NUM_TERMINATION_PACKETS
            || !universe.has_level_data
        {
            finish_unicast_dest_termination(universe, index);
        } else {
            terminating = true;
        }
    }

    terminating
}

fn finish_unicast_dest_termination(universe: &mut SourceUniverse, index: usize) {
    if universe.unicast_dests[index].termination_state == TerminationState::TerminatingAndRemoving
    {
        universe.unicast_dests.remove(index);
    } else {
        universe.unicast_dests[index].reset();
    }
}

fn process_universe_termination(
    send: &mut SendSockets,
    source: &mut SourceState,
    index: usize,
    unicast_terminating: bool,
) {
    let universe = &mut source.universes[index];

    if universe.num_terminations_sent < NUM_TERMINATION_PACKETS && universe.has_level_data {
        send_termination_multicast(send, source.ip_support, universe);
    }

    if (universe.num_terminations_sent >= NUM_TERMINATION_PACKETS && !unicast_terminating)
        || !universe.has_level_data
    {
        finish_universe_termination(source, index);
    }
}

fn finish_universe_termination(source: &mut SourceState, index: usize) {
    // Unicast destinations finish with their universe.
    for dest_index in (0..source.universes[index].unicast_dests.len()).rev() {
        finish_unicast_dest_termination(&mut source.universes[index], dest_index);
    }

    if source.universes[index].part_of_discovery() {
        source.num_active_universes = source.num_active_universes.saturating_sub(1);
    }

    if source.universes[index].termination_state == TerminationState::TerminatingAndRemoving {
        let removed = source.universes.remove(index);
        for netint in removed.netints {
            source.remove_netint_ref(netint);
        }
    } else {
        source.universes[index].reset_after_termination();
    }
}

/// Sends level and PAP packets when within the pre-suppression burst or the
/// keep-alive interval elapsed. Each stream is paced independently.
fn transmit_levels_and_pap_when_needed(
    send: &mut SendSockets,
    ip_support: IpSupport,
    universe: &mut SourceUniverse,
) {
    if universe.has_level_data
        && (universe.level_packets_sent_before_suppression < NUM_PRE_SUPPRESSION_PACKETS
            || universe.level_keep_alive.is_expired())
    {
        send_universe_multicast(send, ip_support, universe, Stream::Level);
        send_universe_unicast(send, ip_support, universe, Stream::Level);
        universe.increment_sequence();

        if universe.level_packets_sent_before_suppression < NUM_PRE_SUPPRESSION_PACKETS {
            universe.level_packets_sent_before_suppression += 1;
        }
        universe.level_keep_alive.reset();
    }

    #[cfg(feature = "pap")]
    if universe.has_pap_data
        && (universe.pap_packets_sent_before_suppression < NUM_PRE_SUPPRESSION_PACKETS
            || universe.pap_keep_alive.is_expired())
    {
        send_universe_multicast(send, ip_support, universe, Stream::Pap);
        send_universe_unicast(send, ip_support, universe, Stream::Pap);
        universe.increment_sequence();

        if universe.pap_packets_sent_before_suppression < NUM_PRE_SUPPRESSION_PACKETS {
            universe.pap_packets_sent_before_suppression += 1;
        }
        universe.pap_keep_alive.reset();
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Level,
    #[cfg(feature = "pap")]
    Pap,
}

fn send_universe_multicast(
    send: &mut SendSockets,
    ip_support: IpSupport,
    universe: &mut SourceUniverse,
    stream: Stream,
) {
    if universe.send_unicast_only {
        return;
    }

    let mut last_err = None;
    {
        let buf = match stream {
            Stream::Level => &universe.level_buf,
            #[cfg(feature = "pap")]
            Stream::Pap => &universe.pap_buf,
        };
        for netint in &universe.netints {
            if let Err(err) = send.send_multicast(universe.id, ip_support, buf.as_slice(), netint)
            {
                last_err = Some(err.kind());
            }
        }
    }
    if last_err.is_some() {
        universe.last_send_error = last_err;
    }
}

fn send_universe_unicast(
    send: &mut SendSockets,
    ip_support: IpSupport,
    universe: &mut SourceUniverse,
    stream: Stream,
) {
    let mut last_err = None;

    for index in 0..universe.unicast_dests.len() {
        if universe.unicast_dests[index].termination_state
            == TerminationState::TerminatingAndRemoving
        {
            continue;
        }

        let result = {
            let buf = match stream {
                Stream::Level => &universe.level_buf,
                #[cfg(feature = "pap")]
                Stream::Pap => &universe.pap_buf,
            };
            let addr = universe.unicast_dests[index].addr;
            send.send_unicast(
                ip_support,
                buf.as_slice(),
                addr,
                &mut universe.unicast_dests[index].last_send_error,
            )
        };
        if let Err(err) = result {
            last_err = Some(err.kind());
        }
    }

    if last_err.is_some() {
        universe.last_send_error = last_err;
    }
}

/// Sends one termination packet to the multicast groups, repurposing the
/// level buffer with the terminated bit set.
fn send_termination_multicast(
    send: &mut SendSockets,
    ip_support: IpSupport,
    universe: &mut SourceUniverse,
) {
    let old_terminated = universe.level_buf.terminated();
    universe.level_buf.set_terminated(true);

    send_universe_multicast(send, ip_support, universe, Stream::Level);
    universe.increment_sequence();
    universe.num_terminations_sent += 1;

    universe.level_buf.set_terminated(old_terminated);
}

/// Sends one termination packet to a single unicast destination.
fn send_termination_unicast(
    send: &mut SendSockets,
    ip_support: IpSupport,
    universe: &mut SourceUniverse,
    dest_index: usize,
) {
    let old_terminated = universe.level_buf.terminated();
    universe.level_buf.set_terminated(true);

    {
        let addr = universe.unicast_dests[dest_index].addr;
        let _ = send.send_unicast(
            ip_support,
            universe.level_buf.as_slice(),
            addr,
            &mut universe.unicast_dests[dest_index].last_send_error,
        );
    }
    universe.increment_sequence();
    universe.unicast_dests[dest_index].num_terminations_sent += 1;

    universe.level_buf.set_terminated(old_terminated);
}
