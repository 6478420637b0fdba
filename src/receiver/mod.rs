//! The sACN receiver engine.
//!
//! [`Receivers`] owns a fixed set of receive threads and the shared remote
//! source registry. Each receiver listens on one universe, tracks the sources
//! it hears, gates everything through the sampling period, and reports data
//! and source loss through [`ReceiverNotifications`].

pub(crate) mod tracked_source;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::netint::{IpType, NetintConfig, NetintId};
use crate::packet::{
    self, DataPacket, RootLayer, VECTOR_E131_EXTENDED_DISCOVERY, VECTOR_ROOT_E131_DATA,
    VECTOR_ROOT_E131_EXTENDED,
};
use crate::registry::RemoteSourceRegistry;
use crate::sockets::{self, CleanupBehavior, McastInterface, RecvThreadSockets};
use crate::source_detector::{self, DetectorState};
use crate::source_loss::{self, OfflineSource, TerminationSet};
use crate::util::{HandleAllocator, Timer};
use crate::{
    ComponentIdentifier, DISCOVERY_UNIVERSE, Error, IpSupport, RemoteSourceHandle, UniverseId,
    limits,
};

use tracked_source::{SourceStatus, TrackedSource};

/// Identifies one receiver within a [`Receivers`] engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverHandle(i32);

impl ReceiverHandle {
    #[cfg(test)]
    pub(crate) fn from_raw(value: i32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ReceiverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The slot range a receiver listens to.
///
/// Custom footprints are reserved; the full universe is always used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Footprint {
    pub start_address: u16,
    pub address_count: u16,
}

impl Default for Footprint {
    fn default() -> Self {
        Self { start_address: 1, address_count: crate::DMX_ADDRESS_COUNT as u16 }
    }
}

/// Configuration for one receiver.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ReceiverConfig {
    /// The universe to listen on.
    pub universe: UniverseId,
    /// Slot range; must be the full universe (custom footprints are
    /// reserved).
    pub footprint: Footprint,
    /// Cap on simultaneously tracked sources. `None` means unlimited in the
    /// dynamic-memory build, or the compile-time pool bound otherwise.
    pub source_count_max: Option<usize>,
    /// Drop packets with the preview bit instead of notifying them.
    pub filter_preview_data: bool,
    /// IP families to listen on.
    pub ip_support: IpSupport,
    /// Interfaces to listen on; `None` uses every usable interface.
    pub netints: Option<NetintConfig>,
}

impl ReceiverConfig {
    pub fn new(universe: UniverseId) -> Self {
        Self {
            universe,
            footprint: Footprint::default(),
            source_count_max: None,
            filter_preview_data: false,
            ip_support: IpSupport::default(),
            netints: None,
        }
    }
}

/// Engine-wide options.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ReceiverOptions {
    /// Number of receive threads receivers are load-balanced onto.
    pub threads: usize,
    /// How long a source must stay offline before it is reported lost.
    pub expired_wait: Duration,
    /// Length of the sampling period after subscription changes.
    pub sample_time: Duration,
    /// Cadence of periodic timeout processing.
    pub periodic_interval: Duration,
    /// Data loss timeout per the E1.31 network data loss behavior.
    pub source_loss_timeout: Duration,
    /// How long to withhold a new source's first DMX packet waiting for
    /// per-address priority (after the sampling period).
    pub wait_for_priority: Duration,
    /// Per-iteration blocking read timeout of the receive threads.
    pub read_timeout: Duration,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            expired_wait: Duration::from_millis(1000),
            sample_time: Duration::from_millis(1500),
            periodic_interval: Duration::from_millis(250),
            source_loss_timeout: Duration::from_millis(2500),
            wait_for_priority: Duration::from_millis(1500),
            read_timeout: sockets::READ_TIMEOUT,
        }
    }
}

/// A remote source as reported in notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub handle: RemoteSourceHandle,
    pub cid: ComponentIdentifier,
    pub name: String,
}

/// A source reported by a sources-lost notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostSource {
    pub handle: RemoteSourceHandle,
    pub cid: ComponentIdentifier,
    pub name: String,
    /// True when the source announced termination, false when it timed out.
    pub terminated: bool,
}

/// One universe-data notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseData<'a> {
    pub universe_id: UniverseId,
    /// Universe priority of the sending source.
    pub priority: u8,
    pub preview: bool,
    pub start_code: u8,
    pub slots: &'a [u8],
    /// True while the arrival interface is still in its sampling period.
    pub is_sampling: bool,
}

/// Callbacks a receiver delivers from its receive thread.
///
/// Callbacks for one receiver are serialized; the engine lock is released
/// while they run.
pub trait ReceiverNotifications: Send + Sync {
    /// New universe data from one source passed sequence and state filtering.
    fn universe_data(
        &self,
        receiver: ReceiverHandle,
        source_addr: SocketAddr,
        source: &RemoteSource,
        data: &UniverseData<'_>,
    );

    /// One or more sources went offline together.
    fn sources_lost(&self, receiver: ReceiverHandle, universe: UniverseId, lost: &[LostSource]) {
        let _ = (receiver, universe, lost);
    }

    fn sampling_period_started(&self, receiver: ReceiverHandle, universe: UniverseId) {
        let _ = (receiver, universe);
    }

    fn sampling_period_ended(&self, receiver: ReceiverHandle, universe: UniverseId) {
        let _ = (receiver, universe);
    }

    /// A tracked source stopped sending per-address priority but still sends
    /// DMX.
    fn source_pap_lost(
        &self,
        receiver: ReceiverHandle,
        universe: UniverseId,
        source: &RemoteSource,
    ) {
        let _ = (receiver, universe, source);
    }

    /// A new source appeared but the tracked-source limit was reached. Fired
    /// at most once until a source leaves.
    fn source_limit_exceeded(&self, receiver: ReceiverHandle, universe: UniverseId) {
        let _ = (receiver, universe);
    }
}

#[derive(Default)]
pub(crate) struct SocketHandles {
    pub v4: Vec<RawFd>,
    pub v6: Vec<RawFd>,
}

impl SocketHandles {
    fn all(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.v4.iter().chain(self.v6.iter()).copied()
    }
}

struct ReceiverState {
    handle: ReceiverHandle,
    universe: UniverseId,
    thread_id: usize,
    ip_support: IpSupport,
    filter_preview: bool,
    source_count_max: Option<usize>,
    callbacks: Arc<dyn ReceiverNotifications>,
    netints: Vec<NetintId>,
    /// The interface selection this receiver was configured with, re-applied
    /// whenever networking resets.
    netint_config: Option<NetintConfig>,
    sockets: SocketHandles,
    /// Value is true for interfaces waiting on a *future* sampling period.
    sampling_period_netints: BTreeMap<NetintId, bool>,
    sampling: bool,
    notified_sampling_started: bool,
    sample_timer: Timer,
    suppress_limit_exceeded: bool,
    sources: BTreeMap<RemoteSourceHandle, TrackedSource>,
    term_sets: Vec<TerminationSet>,
}

struct ThreadState {
    running: bool,
    join: Option<JoinHandle<()>>,
    sockets: RecvThreadSockets,
    num_receivers: usize,
    periodic: Option<Timer>,
}

pub(crate) struct State {
    sys_netints: Vec<McastInterface>,
    pub(crate) registry: RemoteSourceRegistry,
    receivers: BTreeMap<ReceiverHandle, ReceiverState>,
    by_universe: BTreeMap<u16, ReceiverHandle>,
    threads: Vec<ThreadState>,
    handle_alloc: HandleAllocator,
    expired_wait: Duration,
    pub(crate) detector: Option<DetectorState>,
}

pub(crate) struct ReceiversInner {
    options: ReceiverOptions,
    pub(crate) state: Mutex<State>,
}

/// The receiver engine.
///
/// Dropping it stops every receive thread and closes all sockets.
pub struct Receivers {
    pub(crate) inner: Arc<ReceiversInner>,
}

impl Receivers {
    /// Probes the system's interfaces and sets up `options.threads` receive
    /// thread slots. Threads start lazily when the first receiver is
    /// assigned to them.
    pub fn new(options: ReceiverOptions, netints: Option<&NetintConfig>) -> Result<Self, Error> {
        if options.threads == 0 {
            return Err(Error::Invalid("at least one receive thread is required"));
        }
        limits::ensure_room(options.threads - 1, limits::RECEIVER_MAX_THREADS)?;

        let sys_netints = sockets::test_receiver_netints(netints)?;

        let threads = (0..options.threads)
            .map(|_| ThreadState {
                running: false,
                join: None,
                sockets: RecvThreadSockets::default(),
                num_receivers: 0,
                periodic: None,
            })
            .collect();

        Ok(Self {
            inner: Arc::new(ReceiversInner {
                options,
                state: Mutex::new(State {
                    sys_netints,
                    registry: RemoteSourceRegistry::new(),
                    receivers: BTreeMap::new(),
                    by_universe: BTreeMap::new(),
                    threads,
                    handle_alloc: HandleAllocator::default(),
                    expired_wait: Duration::ZERO,
                    detector: None,
                }),
            }),
        })
    }

    /// Creates a receiver listening on the configured universe and assigns it
    /// to the least loaded receive thread.
    pub fn create(
        &self,
        config: &ReceiverConfig,
        callbacks: Arc<dyn ReceiverNotifications>,
    ) -> Result<ReceiverHandle, Error> {
        if config.footprint != Footprint::default() {
            return Err(Error::NotImpl);
        }

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        if state.by_universe.contains_key(&config.universe.get()) {
            return Err(Error::Exists);
        }
        limits::ensure_room(state.receivers.len(), limits::RECEIVER_MAX_UNIVERSES)?;

        let netints = sockets::resolve_netints(config.netints.as_ref(), &state.sys_netints)?;

        let handle = {
            let receivers = &state.receivers;
            ReceiverHandle(
                state.handle_alloc.next_handle(|value| {
                    receivers.contains_key(&ReceiverHandle(value))
                }),
            )
        };

        // Assign to the thread with the fewest receivers.
        let thread_id = state
            .threads
            .iter()
            .enumerate()
            .min_by_key(|(_, thread)| thread.num_receivers)
            .map(|(id, _)| id)
            .expect("at least one thread is configured");

        let thread = &mut state.threads[thread_id];
        let socket_handles = add_receiver_sockets(
            &mut thread.sockets,
            config.ip_support,
            config.universe.get(),
            &netints,
        )?;

        if !thread.running {
            if let Err(err) = start_receiver_thread(&self.inner, thread_id, thread) {
                remove_socket_handles(
                    &mut thread.sockets,
                    &socket_handles,
                    config.universe.get(),
                    &netints,
                    CleanupBehavior::Now,
                );
                return Err(err);
            }
        }
        thread.num_receivers += 1;

        let mut receiver = ReceiverState {
            handle,
            universe: config.universe,
            thread_id,
            ip_support: config.ip_support,
            filter_preview: config.filter_preview_data,
            source_count_max: config.source_count_max,
            callbacks,
            sampling_period_netints: netints.iter().map(|netint| (*netint, false)).collect(),
            netints,
            netint_config: config.netints.clone(),
            sockets: socket_handles,
            sampling: false,
            notified_sampling_started: false,
            sample_timer: Timer::expired(),
            suppress_limit_exceeded: false,
            sources: BTreeMap::new(),
            term_sets: Vec::new(),
        };
        begin_sampling_period(&mut receiver, &self.inner.options);

        state.by_universe.insert(config.universe.get(), handle);
        state.receivers.insert(handle, receiver);

        Ok(handle)
    }

    /// Destroys a receiver, leaving its multicast groups and releasing its
    /// tracked sources.
    pub fn destroy(&self, handle: ReceiverHandle) -> Result<(), Error> {
        destroy_receiver(&self.inner, handle)
    }

    /// The universe a receiver is listening on.
    pub fn universe(&self, handle: ReceiverHandle) -> Result<UniverseId, Error> {
        let state = self.inner.state.lock().unwrap();
        state.receivers.get(&handle).map(|receiver| receiver.universe).ok_or(Error::NotFound)
    }

    /// The receiver's footprint. Always the full universe.
    pub fn footprint(&self, handle: ReceiverHandle) -> Result<Footprint, Error> {
        let state = self.inner.state.lock().unwrap();
        state.receivers.get(&handle).map(|_| Footprint::default()).ok_or(Error::NotFound)
    }

    /// Changing the footprint is reserved.
    pub fn change_footprint(
        &self,
        _handle: ReceiverHandle,
        _footprint: Footprint,
    ) -> Result<(), Error> {
        Err(Error::NotImpl)
    }

    /// Moves a receiver to a different universe. Tracked sources are cleared
    /// and a new sampling period begins.
    pub fn change_universe(
        &self,
        handle: ReceiverHandle,
        new_universe: UniverseId,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        if state.by_universe.contains_key(&new_universe.get()) {
            return Err(Error::Exists);
        }
        let receiver = state.receivers.get_mut(&handle).ok_or(Error::NotFound)?;

        let thread = &mut state.threads[receiver.thread_id];
        let cleanup =
            if thread.running { CleanupBehavior::Queue } else { CleanupBehavior::Now };
        remove_socket_handles(
            &mut thread.sockets,
            &receiver.sockets,
            receiver.universe.get(),
            &receiver.netints,
            cleanup,
        );

        state.by_universe.remove(&receiver.universe.get());
        receiver.universe = new_universe;
        state.by_universe.insert(new_universe.get(), handle);

        clear_receiver_sources(receiver, &mut state.registry);

        receiver.sockets = add_receiver_sockets(
            &mut thread.sockets,
            receiver.ip_support,
            new_universe.get(),
            &receiver.netints,
        )?;

        // Every interface observes the new universe from scratch.
        receiver.sampling_period_netints =
            receiver.netints.iter().map(|netint| (*netint, false)).collect();
        receiver.sampling = false;
        begin_sampling_period(receiver, &self.inner.options);

        Ok(())
    }

    /// The interfaces a receiver currently listens on.
    pub fn netints(&self, handle: ReceiverHandle) -> Result<Vec<NetintId>, Error> {
        let state = self.inner.state.lock().unwrap();
        state.receivers.get(&handle).map(|receiver| receiver.netints.clone()).ok_or(Error::NotFound)
    }

    /// Sets the source-loss reporting window shared by all receivers.
    pub fn set_expired_wait(&self, wait: Duration) {
        self.inner.state.lock().unwrap().expired_wait = wait;
    }

    pub fn expired_wait(&self) -> Duration {
        let configured = self.inner.state.lock().unwrap().expired_wait;
        if configured.is_zero() { self.inner.options.expired_wait } else { configured }
    }

    /// Re-tests the system interface list and rebuilds every receiver's
    /// sockets and subscriptions. Sources on interfaces that went away are
    /// marked terminated, and every receiver re-enters a sampling period.
    pub fn reset_networking(&self, netints: Option<&NetintConfig>) -> Result<(), Error> {
        let sys_netints = sockets::test_receiver_netints(netints)?;

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        state.sys_netints = sys_netints;

        for receiver in state.receivers.values_mut() {
            // Receivers configured with an interface subset keep it.
            let new_netints =
                sockets::resolve_netints(receiver.netint_config.as_ref(), &state.sys_netints)?;

            let thread = &mut state.threads[receiver.thread_id];
            let cleanup =
                if thread.running { CleanupBehavior::Queue } else { CleanupBehavior::Now };
            remove_socket_handles(
                &mut thread.sockets,
                &receiver.sockets,
                receiver.universe.get(),
                &receiver.netints,
                cleanup,
            );

            // Sources living on removed interfaces will never be heard again.
            for source in receiver.sources.values_mut() {
                if !new_netints.contains(&source.netint) {
                    source.mark_terminated();
                }
            }

            // New interfaces wait for the next sampling period if one is
            // already running; otherwise every interface starts a fresh one.
            if receiver.sampling {
                receiver
                    .sampling_period_netints
                    .retain(|netint, _| new_netints.contains(netint));
                for netint in &new_netints {
                    if !receiver.netints.contains(netint) {
                        receiver.sampling_period_netints.insert(*netint, true);
                    }
                }
            } else {
                receiver.sampling_period_netints =
                    new_netints.iter().map(|netint| (*netint, false)).collect();
            }

            receiver.netints = new_netints;
            receiver.sockets = add_receiver_sockets(
                &mut thread.sockets,
                receiver.ip_support,
                receiver.universe.get(),
                &receiver.netints,
            )?;

            begin_sampling_period(receiver, &self.inner.options);
        }

        Ok(())
    }

    /// Attaches the universe discovery listener to receive thread 0.
    pub fn set_source_detector(
        &self,
        config: &source_detector::SourceDetectorConfig,
        callbacks: Arc<dyn source_detector::SourceDetectorNotifications>,
    ) -> Result<(), Error> {
        source_detector::validate_config(config)?;

        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        if state.detector.is_some() {
            return Err(Error::Exists);
        }

        let netints = sockets::resolve_netints(config.netints.as_ref(), &state.sys_netints)?;
        let thread = &mut state.threads[0];
        let socket_handles = add_receiver_sockets(
            &mut thread.sockets,
            config.ip_support,
            DISCOVERY_UNIVERSE,
            &netints,
        )?;

        if !thread.running {
            if let Err(err) = start_receiver_thread(&self.inner, 0, thread) {
                remove_socket_handles(
                    &mut thread.sockets,
                    &socket_handles,
                    DISCOVERY_UNIVERSE,
                    &netints,
                    CleanupBehavior::Now,
                );
                return Err(err);
            }
        }

        state.detector = Some(DetectorState::new(config, callbacks, netints, socket_handles));
        Ok(())
    }

    /// Detaches the universe discovery listener.
    pub fn remove_source_detector(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        let mut detector = state.detector.take().ok_or(Error::NotFound)?;
        let thread = &mut state.threads[0];
        let cleanup =
            if thread.running { CleanupBehavior::Queue } else { CleanupBehavior::Now };
        remove_socket_handles(
            &mut thread.sockets,
            detector.sockets(),
            DISCOVERY_UNIVERSE,
            detector.netints(),
            cleanup,
        );
        detector.release_sources(&mut state.registry);
        Ok(())
    }
}

impl Drop for Receivers {
    fn drop(&mut self) {
        let mut joins = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            for thread in &mut state.threads {
                if thread.running {
                    thread.running = false;
                    joins.extend(thread.join.take());
                }
            }
        }

        for join in joins {
            let _ = join.join();
        }

        let mut state = self.inner.state.lock().unwrap();
        for thread in &mut state.threads {
            sockets::close_all(&mut thread.sockets);
        }
    }
}

/// Destroys a receiver through the shared engine state; lets composed
/// façades tear their receiver down without holding a `Receivers`.
pub(crate) fn destroy_receiver(
    inner: &Arc<ReceiversInner>,
    handle: ReceiverHandle,
) -> Result<(), Error> {
    let mut state = inner.state.lock().unwrap();
    let state = &mut *state;

    let mut receiver = state.receivers.remove(&handle).ok_or(Error::NotFound)?;
    state.by_universe.remove(&receiver.universe.get());

    let thread = &mut state.threads[receiver.thread_id];
    let cleanup = if thread.running { CleanupBehavior::Queue } else { CleanupBehavior::Now };
    remove_socket_handles(
        &mut thread.sockets,
        &receiver.sockets,
        receiver.universe.get(),
        &receiver.netints,
        cleanup,
    );
    thread.num_receivers = thread.num_receivers.saturating_sub(1);

    clear_receiver_sources(&mut receiver, &mut state.registry);
    Ok(())
}

/* ------------------------- Socket handle plumbing ------------------------ */

fn add_receiver_sockets(
    thread_sockets: &mut RecvThreadSockets,
    ip_support: IpSupport,
    universe: u16,
    netints: &[NetintId],
) -> Result<SocketHandles, Error> {
    let mut handles = SocketHandles::default();

    let mut v4_result: Result<(), Error> = Err(Error::NoNetints);
    let mut v6_result: Result<(), Error> = Err(Error::NoNetints);

    if ip_support.supports_v4() {
        v4_result = add_family_sockets(thread_sockets, IpType::V4, universe, netints, &mut handles.v4);
    }
    let v4_usable = matches!(v4_result, Ok(()) | Err(Error::NoNetints));
    if v4_usable && ip_support.supports_v6() {
        v6_result = add_family_sockets(thread_sockets, IpType::V6, universe, netints, &mut handles.v6);
    }

    // One family without usable interfaces is fine as long as the other
    // family subscribed.
    let result = if v4_usable && !matches!(v6_result, Err(Error::NoNetints)) {
        v6_result
    } else {
        v4_result
    };

    match result {
        Ok(()) => Ok(handles),
        Err(err) => {
            remove_socket_handles(thread_sockets, &handles, universe, netints, CleanupBehavior::Queue);
            Err(err)
        }
    }
}

fn add_family_sockets(
    thread_sockets: &mut RecvThreadSockets,
    ip_type: IpType,
    universe: u16,
    netints: &[NetintId],
    fds: &mut Vec<RawFd>,
) -> Result<(), Error> {
    if cfg!(feature = "socket-per-nic") {
        let mut any = false;
        for netint in netints.iter().filter(|netint| netint.ip_type == ip_type) {
            limits::ensure_room(fds.len(), limits::MAX_NETINTS)?;
            let fd =
                sockets::add_receiver_socket(thread_sockets, ip_type, universe, &[*netint])?;
            fds.push(fd);
            any = true;
        }
        if any { Ok(()) } else { Err(Error::NoNetints) }
    } else {
        let fd = sockets::add_receiver_socket(thread_sockets, ip_type, universe, netints)?;
        fds.push(fd);
        Ok(())
    }
}

fn remove_socket_handles(
    thread_sockets: &mut RecvThreadSockets,
    handles: &SocketHandles,
    universe: u16,
    netints: &[NetintId],
    cleanup: CleanupBehavior,
) {
    for fd in handles.all() {
        if cfg!(feature = "socket-per-nic") {
            if let Some(index) = thread_sockets.find_ref_by_fd(fd) {
                let socket = &thread_sockets.refs[index].socket;
                let netint = NetintId { index: socket.ifindex, ip_type: socket.ip_type };
                sockets::remove_receiver_socket(thread_sockets, fd, universe, &[netint], cleanup);
            }
        } else {
            sockets::remove_receiver_socket(thread_sockets, fd, universe, netints, cleanup);
        }
    }
}

fn clear_receiver_sources(receiver: &mut ReceiverState, registry: &mut RemoteSourceRegistry) {
    for handle in std::mem::take(&mut receiver.sources).into_keys() {
        let _ = registry.release(handle);
    }
    receiver.term_sets.clear();
    receiver.suppress_limit_exceeded = false;
}

fn begin_sampling_period(receiver: &mut ReceiverState, options: &ReceiverOptions) {
    if !receiver.sampling {
        receiver.sampling = true;
        receiver.notified_sampling_started = false;
        receiver.sample_timer.start(options.sample_time);
    }
}

fn start_receiver_thread(
    inner: &Arc<ReceiversInner>,
    thread_id: usize,
    thread: &mut ThreadState,
) -> Result<(), Error> {
    thread.running = true;
    thread.periodic = None;

    let inner = Arc::clone(inner);
    let spawned = std::thread::Builder::new()
        .name(format!("sacn-recv-{thread_id}"))
        .spawn(move || receive_thread(inner, thread_id));

    match spawned {
        Ok(join) => {
            thread.join = Some(join);
            Ok(())
        }
        Err(err) => {
            thread.running = false;
            Err(err.into())
        }
    }
}

/* ----------------------------- Receive thread ---------------------------- */

fn receive_thread(inner: Arc<ReceiversInner>, thread_id: usize) {
    log::debug!("sACN receive thread {thread_id} started");
    let mut buf = [0u8; packet::MTU];

    loop {
        // Reconcile queued socket work, then snapshot the poll set. Actual
        // syscalls on this thread's sockets happen only here.
        let entries = {
            let mut state = inner.state.lock().unwrap();
            let thread = &mut state.threads[thread_id];
            if !thread.running {
                break;
            }
            sockets::process_queues(&mut thread.sockets);
            thread.sockets.poll_entries()
        };

        match sockets::read(&entries, &mut buf, inner.options.read_timeout) {
            Ok(sockets::Read::Packet(result)) => {
                handle_incoming(&inner, thread_id, &buf[..result.len], result.from, result.netint);
            }
            Ok(sockets::Read::TimedOut) => {}
            Ok(sockets::Read::NoSockets) => std::thread::sleep(inner.options.read_timeout),
            Err(err) => {
                log::warn!("error occurred while attempting to read sACN incoming data: {err}");
                std::thread::sleep(inner.options.read_timeout);
            }
        }

        let run_periodic = {
            let mut state = inner.state.lock().unwrap();
            let thread = &mut state.threads[thread_id];
            match &mut thread.periodic {
                None => {
                    thread.periodic = Some(Timer::new(inner.options.periodic_interval));
                    false
                }
                Some(timer) if timer.is_expired() => {
                    timer.reset();
                    true
                }
                Some(_) => false,
            }
        };

        if run_periodic {
            process_receivers(&inner, thread_id);
            process_source_detector(&inner, thread_id);
        }
    }

    log::debug!("sACN receive thread {thread_id} stopped");
}

fn handle_incoming(
    inner: &Arc<ReceiversInner>,
    thread_id: usize,
    data: &[u8],
    from: SocketAddr,
    netint: NetintId,
) {
    let Ok(block) = packet::parse_udp_preamble(data) else {
        return;
    };

    for root in packet::RootLayerPdus::new(block) {
        match root.vector {
            VECTOR_ROOT_E131_DATA => handle_data_packet(inner, &root, from, netint),
            VECTOR_ROOT_E131_EXTENDED => handle_extended_packet(inner, thread_id, &root, from),
            _ => {}
        }
    }
}

struct PendingUniverseData {
    callbacks: Arc<dyn ReceiverNotifications>,
    receiver: ReceiverHandle,
    universe: UniverseId,
    source: RemoteSource,
    is_sampling: bool,
}

struct PendingSourceEvent {
    callbacks: Arc<dyn ReceiverNotifications>,
    receiver: ReceiverHandle,
    universe: UniverseId,
    source: RemoteSource,
}

struct PendingLimitExceeded {
    callbacks: Arc<dyn ReceiverNotifications>,
    receiver: ReceiverHandle,
    universe: UniverseId,
}

fn handle_data_packet(
    inner: &Arc<ReceiversInner>,
    root: &RootLayer<'_>,
    from: SocketAddr,
    netint: NetintId,
) {
    let packet = match packet::parse_data_packet(root.data) {
        Ok(packet) => packet,
        Err(err) => {
            log::warn!("ignoring malformed sACN data packet from component {}: {err}", root.cid);
            return;
        }
    };

    // Without the PAP extension, priority packets are ignored entirely.
    if cfg!(not(feature = "pap")) && packet.start_code == crate::STARTCODE_PRIORITY {
        return;
    }

    let mut universe_data: Option<PendingUniverseData> = None;
    let mut pap_lost: Option<PendingSourceEvent> = None;
    let mut limit_exceeded: Option<PendingLimitExceeded> = None;

    {
        let mut state = inner.state.lock().unwrap();
        let state = &mut *state;

        let Some(&receiver_handle) = state.by_universe.get(&packet.universe) else {
            // Not listening to this universe.
            return;
        };
        let receiver = state.receivers.get_mut(&receiver_handle).expect("maps stay in sync");

        // Drop everything arriving on interfaces scheduled for a future
        // sampling period.
        let sampling_entry = receiver.sampling_period_netints.get(&netint).copied();
        if sampling_entry == Some(true) {
            return;
        }
        let is_sampling = sampling_entry.is_some();

        let mut notify = false;
        let mut pap_lost_flag = false;
        let tracked = state
            .registry
            .handle(&root.cid)
            .filter(|handle| receiver.sources.contains_key(handle));
        let mut source_handle = tracked;

        match tracked {
            Some(handle) => {
                let source = receiver.sources.get_mut(&handle).expect("presence checked above");

                // One netint per source; some network stacks deliver packet
                // info late, so keep updating during the sampling period
                // instead of dropping.
                if source.netint != netint {
                    if receiver.sampling {
                        source.netint = netint;
                    } else {
                        return;
                    }
                }

                if packet.terminated {
                    source.mark_terminated();
                }
                // Also covers a source terminated by an earlier packet but
                // not yet removed.
                if source.terminated {
                    return;
                }

                if !check_sequence(packet.sequence, source.seq) {
                    return;
                }
                source.seq = packet.sequence;

                match packet.start_code {
                    crate::STARTCODE_DMX => {
                        let outcome = source.process_levels(&inner.options);
                        notify = outcome.notify;
                        pap_lost_flag = outcome.pap_lost;
                    }
                    #[cfg(feature = "pap")]
                    crate::STARTCODE_PRIORITY => {
                        notify = source.process_pap(&inner.options);
                    }
                    _ => notify = true,
                }
            }
            None if !packet.terminated => {
                source_handle = process_new_source_data(
                    &mut state.registry,
                    receiver,
                    &root.cid,
                    &packet,
                    netint,
                    &inner.options,
                    &mut notify,
                    &mut limit_exceeded,
                );
            }
            // Unknown source announcing termination; nothing to do.
            None => return,
        }

        if let Some(handle) = source_handle {
            if packet.preview && receiver.filter_preview {
                notify = false;
            }

            let source = RemoteSource {
                handle,
                cid: root.cid,
                name: packet.source_name.clone(),
            };
            if pap_lost_flag {
                pap_lost = Some(PendingSourceEvent {
                    callbacks: Arc::clone(&receiver.callbacks),
                    receiver: receiver_handle,
                    universe: receiver.universe,
                    source: source.clone(),
                });
            }
            if notify {
                universe_data = Some(PendingUniverseData {
                    callbacks: Arc::clone(&receiver.callbacks),
                    receiver: receiver_handle,
                    universe: receiver.universe,
                    source,
                    is_sampling,
                });
            }
        }
    }

    // Deliver callbacks with the lock released.
    if let Some(pending) = limit_exceeded {
        log::warn!(
            "no room to track new sACN source {} on universe {}. This message will only be \
             logged once each time the maximum number of sources is exceeded.",
            root.cid,
            pending.universe,
        );
        pending.callbacks.source_limit_exceeded(pending.receiver, pending.universe);
    }

    if let Some(pending) = pap_lost {
        pending.callbacks.source_pap_lost(pending.receiver, pending.universe, &pending.source);
    }

    if let Some(pending) = universe_data {
        let data = UniverseData {
            universe_id: pending.universe,
            priority: packet.priority,
            preview: packet.preview,
            start_code: packet.start_code,
            slots: packet.slots,
            is_sampling: pending.is_sampling,
        };
        pending.callbacks.universe_data(pending.receiver, from, &pending.source, &data);
    }
}

#[allow(clippy::too_many_arguments)]
fn process_new_source_data(
    registry: &mut RemoteSourceRegistry,
    receiver: &mut ReceiverState,
    cid: &ComponentIdentifier,
    packet: &DataPacket<'_>,
    netint: NetintId,
    options: &ReceiverOptions,
    notify: &mut bool,
    limit_exceeded: &mut Option<PendingLimitExceeded>,
) -> Option<RemoteSourceHandle> {
    let trackable = packet.start_code == crate::STARTCODE_DMX
        || (cfg!(feature = "pap") && packet.start_code == crate::STARTCODE_PRIORITY);
    if !trackable {
        return None;
    }

    // Notify universe data during and after the sampling period.
    *notify = true;

    match add_tracked_source(registry, receiver, cid, packet, netint, options) {
        Ok(handle) => {
            // After the sampling period, the first DMX packet is withheld so
            // 0x00 notifies after 0xDD.
            if cfg!(feature = "pap")
                && packet.start_code == crate::STARTCODE_DMX
                && !receiver.sampling
            {
                *notify = false;
            }

            log::debug!(
                "tracking new source {} ({cid}) on universe {} with initial start code {:#04x}",
                packet.source_name,
                packet.universe,
                packet.start_code,
            );
            Some(handle)
        }
        Err(_) => {
            // No room for the new source.
            if !receiver.suppress_limit_exceeded {
                receiver.suppress_limit_exceeded = true;
                *limit_exceeded = Some(PendingLimitExceeded {
                    callbacks: Arc::clone(&receiver.callbacks),
                    receiver: receiver.handle,
                    universe: receiver.universe,
                });
            }
            None
        }
    }
}

fn add_tracked_source(
    registry: &mut RemoteSourceRegistry,
    receiver: &mut ReceiverState,
    cid: &ComponentIdentifier,
    packet: &DataPacket<'_>,
    netint: NetintId,
    options: &ReceiverOptions,
) -> Result<RemoteSourceHandle, Error> {
    if let Some(max) = receiver.source_count_max {
        if receiver.sources.len() >= max {
            return Err(Error::NoMem);
        }
    }
    limits::ensure_room(receiver.sources.len(), limits::RECEIVER_MAX_SOURCES_PER_UNIVERSE)?;

    let handle = registry.add(cid)?;
    receiver.sources.insert(
        handle,
        TrackedSource::new(
            handle,
            packet.source_name.clone(),
            netint,
            packet.sequence,
            packet.start_code,
            receiver.sampling,
            options,
        ),
    );
    Ok(handle)
}

/// E1.31 sequence numbering: accept iff the signed 8-bit difference to the
/// previous sequence number is positive or at most -20.
fn check_sequence(new_seq: u8, old_seq: u8) -> bool {
    let diff = new_seq.wrapping_sub(old_seq) as i8;
    diff > 0 || diff <= -20
}

fn handle_extended_packet(
    inner: &Arc<ReceiversInner>,
    _thread_id: usize,
    root: &RootLayer<'_>,
    from: SocketAddr,
) {
    let Ok(vector) = packet::parse_framing_vector(root.data) else {
        return;
    };

    if vector == VECTOR_E131_EXTENDED_DISCOVERY {
        source_detector::handle_discovery_packet(inner, root, from);
    }
    // Synchronization packets are reserved and ignored.
}

/* --------------------------- Periodic processing ------------------------- */

struct PendingSamplingEvent {
    callbacks: Arc<dyn ReceiverNotifications>,
    receiver: ReceiverHandle,
    universe: UniverseId,
}

struct PendingSourcesLost {
    callbacks: Arc<dyn ReceiverNotifications>,
    receiver: ReceiverHandle,
    universe: UniverseId,
    lost: Vec<LostSource>,
}

fn process_receivers(inner: &Arc<ReceiversInner>, thread_id: usize) {
    let mut sampling_started = Vec::new();
    let mut sampling_ended = Vec::new();
    let mut sources_lost = Vec::new();

    {
        let mut state = inner.state.lock().unwrap();
        let state = &mut *state;
        let expired_wait = if state.expired_wait.is_zero() {
            inner.options.expired_wait
        } else {
            state.expired_wait
        };

        for receiver in state.receivers.values_mut() {
            if receiver.thread_id != thread_id {
                continue;
            }

            if receiver.sampling && receiver.sample_timer.is_expired() {
                end_current_sampling_period(receiver, &inner.options);
                sampling_ended.push(PendingSamplingEvent {
                    callbacks: Arc::clone(&receiver.callbacks),
                    receiver: receiver.handle,
                    universe: receiver.universe,
                });
            }

            if !receiver.notified_sampling_started {
                receiver.notified_sampling_started = true;
                sampling_started.push(PendingSamplingEvent {
                    callbacks: Arc::clone(&receiver.callbacks),
                    receiver: receiver.handle,
                    universe: receiver.universe,
                });
            }

            if let Some(lost) =
                process_receiver_sources(&mut state.registry, receiver, expired_wait)
            {
                sources_lost.push(PendingSourcesLost {
                    callbacks: Arc::clone(&receiver.callbacks),
                    receiver: receiver.handle,
                    universe: receiver.universe,
                    lost,
                });
            }
        }
    }

    for event in sampling_ended {
        event.callbacks.sampling_period_ended(event.receiver, event.universe);
    }
    for event in sampling_started {
        event.callbacks.sampling_period_started(event.receiver, event.universe);
    }
    for event in sources_lost {
        event.callbacks.sources_lost(event.receiver, event.universe, &event.lost);
    }
}

fn process_receiver_sources(
    registry: &mut RemoteSourceRegistry,
    receiver: &mut ReceiverState,
    expired_wait: Duration,
) -> Option<Vec<LostSource>> {
    let mut offline = Vec::new();
    let mut online = Vec::new();
    let mut unknown = Vec::new();
    let mut to_erase = Vec::new();

    for (&handle, source) in receiver.sources.iter_mut() {
        match source.check_timeouts() {
            SourceStatus::RemoveNow => to_erase.push(handle),
            SourceStatus::Offline => offline.push(OfflineSource {
                handle,
                name: source.name.clone(),
                terminated: source.terminated,
            }),
            SourceStatus::Online => online.push(handle),
            SourceStatus::Unknown => unknown.push(OfflineSource {
                handle,
                name: source.name.clone(),
                terminated: source.terminated,
            }),
            SourceStatus::Pending => {}
        }
    }

    source_loss::mark_sources_offline(&offline, &unknown, &mut receiver.term_sets, expired_wait);
    source_loss::mark_sources_online(&online, &mut receiver.term_sets);
    let expired = source_loss::get_expired_sources(&mut receiver.term_sets);

    for handle in to_erase {
        log::debug!("removing internally tracked source {handle}");
        receiver.sources.remove(&handle);
        let _ = registry.release(handle);
    }

    if expired.is_empty() {
        return None;
    }

    let lost: Vec<LostSource> = expired
        .into_iter()
        .map(|source| LostSource {
            handle: source.handle,
            cid: registry.cid(source.handle).copied().unwrap_or_else(ComponentIdentifier::nil),
            name: source.name,
            terminated: source.terminated,
        })
        .collect();

    for source in &lost {
        receiver.sources.remove(&source.handle);
        let _ = registry.release(source.handle);
    }
    receiver.suppress_limit_exceeded = false;

    Some(lost)
}

fn end_current_sampling_period(receiver: &mut ReceiverState, options: &ReceiverOptions) {
    // Drop the interfaces whose sampling period just finished.
    receiver.sampling_period_netints.retain(|_, future| *future);
    receiver.sampling = false;

    // Any future-period interfaces become current and start a new period.
    if !receiver.sampling_period_netints.is_empty() {
        for future in receiver.sampling_period_netints.values_mut() {
            *future = false;
        }
        begin_sampling_period(receiver, options);
    }
}

fn process_source_detector(inner: &Arc<ReceiversInner>, thread_id: usize) {
    if thread_id != 0 {
        return;
    }
    source_detector::process_expired(inner);
}
