//! End-to-end tests exercising the engines over real sockets.
//!
//! Every test multicasts on a local interface with loopback delivery and
//! subscribes on the same host. Tests use distinct universes so they can
//! coexist on the shared sACN port, and serialize on a common mutex to keep
//! timing stable.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use sacn::merge_receiver::{MergeReceiver, MergeReceiverConfig, MergeReceiverNotifications, MergedData};
use sacn::netint::{IpType, NetintConfig, NetintInfo};
use sacn::packet::{DataSendBuf, RootLayerPdus, parse_data_packet, parse_udp_preamble};
use sacn::receiver::{
    LostSource, ReceiverConfig, ReceiverHandle, ReceiverNotifications, ReceiverOptions, Receivers,
    RemoteSource, UniverseData,
};
use sacn::source::{SourceConfig, SourceOptions, Sources, UniverseConfig};
use sacn::{ComponentIdentifier, SACN_PORT, UniverseId};

fn serial() -> MutexGuard<'static, ()> {
    let _ = pretty_env_logger::try_init();
    static SERIAL: OnceLock<Mutex<()>> = OnceLock::new();
    SERIAL
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn fast_receiver_options() -> ReceiverOptions {
    ReceiverOptions {
        threads: 1,
        expired_wait: Duration::from_millis(250),
        sample_time: Duration::from_millis(400),
        periodic_interval: Duration::from_millis(50),
        source_loss_timeout: Duration::from_millis(500),
        wait_for_priority: Duration::from_millis(400),
        read_timeout: Duration::from_millis(50),
    }
}

fn first_v4_netint() -> Option<NetintInfo> {
    sacn::netint::system_netints()
        .ok()?
        .into_iter()
        .find(|netint| netint.id.ip_type == IpType::V4)
}

fn multicast_group(universe: u16) -> SocketAddr {
    let ip = Ipv4Addr::new(239, 255, (universe >> 8) as u8, (universe & 0xFF) as u8);
    SocketAddr::new(IpAddr::V4(ip), SACN_PORT)
}

/// A hand-driven remote source sending packed data packets on one interface.
struct RawSource {
    socket: UdpSocket,
    level_buf: DataSendBuf,
    #[cfg(feature = "pap")]
    pap_buf: DataSendBuf,
    universe: u16,
    seq: u8,
}

impl RawSource {
    fn new(netint: &NetintInfo, cid: &ComponentIdentifier, name: &str, priority: u8, universe: u16) -> Self {
        let IpAddr::V4(addr) = netint.addr else { panic!("v4 netint expected") };
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .unwrap();
        socket.set_multicast_if_v4(&addr).unwrap();
        socket.set_multicast_loop_v4(true).unwrap();

        Self {
            socket: socket.into(),
            level_buf: DataSendBuf::new(cid, name, priority, universe, 0, false, sacn::STARTCODE_DMX)
                .unwrap(),
            #[cfg(feature = "pap")]
            pap_buf: DataSendBuf::new(cid, name, priority, universe, 0, false, sacn::STARTCODE_PRIORITY)
                .unwrap(),
            universe,
            seq: 0,
        }
    }

    fn send_levels(&mut self, slots: &[u8]) {
        self.level_buf.set_data(slots);
        self.level_buf.set_sequence(self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.socket
            .send_to(self.level_buf.as_slice(), multicast_group(self.universe))
            .unwrap();
    }

    #[cfg(feature = "pap")]
    fn send_pap(&mut self, slots: &[u8]) {
        self.pap_buf.set_data(slots);
        self.pap_buf.set_sequence(self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.socket
            .send_to(self.pap_buf.as_slice(), multicast_group(self.universe))
            .unwrap();
    }

    fn send_terminated(&mut self) {
        self.level_buf.set_terminated(true);
        self.level_buf.set_sequence(self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.socket
            .send_to(self.level_buf.as_slice(), multicast_group(self.universe))
            .unwrap();
        self.level_buf.set_terminated(false);
    }
}

/// Collects receiver notifications for assertions.
#[derive(Default)]
struct Events {
    data: Mutex<Vec<(u8, Vec<u8>, u8, bool)>>, // (start_code, slots, priority, is_sampling)
    lost: Mutex<Vec<(String, bool)>>,
    pap_lost: Mutex<Vec<String>>,
    sampling_started: Mutex<usize>,
    sampling_ended: Mutex<usize>,
}

impl Events {
    fn data_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn sampling_over(&self) -> bool {
        *self.sampling_ended.lock().unwrap() > 0
    }
}

impl ReceiverNotifications for Events {
    fn universe_data(
        &self,
        _receiver: ReceiverHandle,
        _source_addr: SocketAddr,
        _source: &RemoteSource,
        data: &UniverseData<'_>,
    ) {
        self.data.lock().unwrap().push((
            data.start_code,
            data.slots.to_vec(),
            data.priority,
            data.is_sampling,
        ));
    }

    fn sources_lost(&self, _receiver: ReceiverHandle, _universe: UniverseId, lost: &[LostSource]) {
        let mut events = self.lost.lock().unwrap();
        for source in lost {
            events.push((source.name.clone(), source.terminated));
        }
    }

    fn sampling_period_started(&self, _receiver: ReceiverHandle, _universe: UniverseId) {
        *self.sampling_started.lock().unwrap() += 1;
    }

    fn sampling_period_ended(&self, _receiver: ReceiverHandle, _universe: UniverseId) {
        *self.sampling_ended.lock().unwrap() += 1;
    }

    fn source_pap_lost(
        &self,
        _receiver: ReceiverHandle,
        _universe: UniverseId,
        source: &RemoteSource,
    ) {
        self.pap_lost.lock().unwrap().push(source.name.clone());
    }
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn source_to_receiver_end_to_end() {
    let _guard = serial();
    let Ok(receivers) = Receivers::new(fast_receiver_options(), None) else {
        eprintln!("skipping: no usable network interfaces");
        return;
    };
    let Ok(sources) = Sources::new(SourceOptions::default(), None) else {
        return;
    };

    let events = Arc::new(Events::default());
    let universe = UniverseId::new(101).unwrap();
    receivers
        .create(&ReceiverConfig::new(universe), Arc::clone(&events) as _)
        .unwrap();

    let source = sources.create(&SourceConfig::default()).unwrap();
    sources.add_universe(source, &UniverseConfig::new(universe)).unwrap();
    sources.update_levels(source, universe, Some(&[1, 2, 3])).unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            events.data.lock().unwrap().iter().any(|(start_code, slots, priority, _)| {
                *start_code == sacn::STARTCODE_DMX && slots == &[1, 2, 3] && *priority == 100
            })
        }),
        "no universe data arrived over loopback"
    );
    assert!(*events.sampling_started.lock().unwrap() > 0);

    // The first packets arrive during the sampling period.
    let first = events.data.lock().unwrap().first().cloned().unwrap();
    assert!(first.3, "first packet should be flagged as sampling");
}

#[test]
fn source_timeout_is_reported_as_loss() {
    let _guard = serial();
    let Ok(receivers) = Receivers::new(fast_receiver_options(), None) else {
        return;
    };
    let Some(netint) = first_v4_netint() else {
        return;
    };

    let events = Arc::new(Events::default());
    let universe = UniverseId::new(102).unwrap();
    receivers
        .create(&ReceiverConfig::new(universe), Arc::clone(&events) as _)
        .unwrap();

    let cid = ComponentIdentifier::new_v4();
    let mut remote = RawSource::new(&netint, &cid, "timeout source", 100, 102);
    for _ in 0..3 {
        remote.send_levels(&[42]);
        std::thread::sleep(Duration::from_millis(50));
    }
    // Then silence: loss timeout plus the expired wait must elapse.

    assert!(
        wait_until(Duration::from_secs(4), || !events.lost.lock().unwrap().is_empty()),
        "source loss was never reported"
    );
    let lost = events.lost.lock().unwrap();
    assert_eq!(lost[0].0, "timeout source");
    assert!(!lost[0].1, "timeout loss must not be flagged as terminated");
}

#[test]
fn explicit_termination_is_reported_as_loss() {
    let _guard = serial();
    let Ok(receivers) = Receivers::new(fast_receiver_options(), None) else {
        return;
    };
    let Some(netint) = first_v4_netint() else {
        return;
    };

    let events = Arc::new(Events::default());
    let universe = UniverseId::new(103).unwrap();
    receivers
        .create(&ReceiverConfig::new(universe), Arc::clone(&events) as _)
        .unwrap();

    let cid = ComponentIdentifier::new_v4();
    let mut remote = RawSource::new(&netint, &cid, "terminating source", 100, 103);
    remote.send_levels(&[1]);
    std::thread::sleep(Duration::from_millis(50));
    remote.send_terminated();

    assert!(
        wait_until(Duration::from_secs(2), || !events.lost.lock().unwrap().is_empty()),
        "terminated source was never reported lost"
    );
    let lost = events.lost.lock().unwrap();
    assert!(lost[0].1, "explicit termination must be flagged as terminated");
}

#[cfg(feature = "pap")]
#[test]
fn first_dmx_after_sampling_waits_for_pap() {
    let _guard = serial();
    let Ok(receivers) = Receivers::new(fast_receiver_options(), None) else {
        return;
    };
    let Some(netint) = first_v4_netint() else {
        return;
    };

    let events = Arc::new(Events::default());
    let universe = UniverseId::new(104).unwrap();
    receivers
        .create(&ReceiverConfig::new(universe), Arc::clone(&events) as _)
        .unwrap();

    // Let the sampling period run out before the source appears.
    assert!(wait_until(Duration::from_secs(2), || events.sampling_over()));

    let cid = ComponentIdentifier::new_v4();
    let mut remote = RawSource::new(&netint, &cid, "pap source", 100, 104);
    remote.send_levels(&[1, 2, 3]);

    // The first DMX packet is withheld while waiting for PAP.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(events.data_count(), 0, "first DMX after sampling should be withheld");

    remote.send_pap(&[200, 200, 200]);
    assert!(wait_until(Duration::from_secs(1), || events.data_count() >= 1));
    assert_eq!(events.data.lock().unwrap()[0].0, sacn::STARTCODE_PRIORITY);

    remote.send_levels(&[1, 2, 3]);
    assert!(wait_until(Duration::from_secs(1), || events.data_count() >= 2));
    let data = events.data.lock().unwrap();
    assert_eq!(data[1].0, sacn::STARTCODE_DMX);
    assert!(!data[1].3, "post-sampling data must not be flagged as sampling");
}

/// Counts data packets for one universe arriving on a test socket.
struct PacketCounter {
    socket: UdpSocket,
    universe: u16,
}

impl PacketCounter {
    fn new(netint: &NetintInfo, universe: u16) -> Self {
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .unwrap();
        socket.set_reuse_address(true).unwrap();
        socket.set_reuse_port(true).unwrap();
        socket
            .bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), SACN_PORT).into())
            .unwrap();
        let group = match multicast_group(universe).ip() {
            IpAddr::V4(group) => group,
            IpAddr::V6(_) => unreachable!(),
        };
        socket
            .join_multicast_v4_n(&group, &socket2::InterfaceIndexOrAddress::Index(netint.id.index))
            .unwrap();
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        Self { socket, universe }
    }

    /// Collects (sequence, terminated) pairs for `duration`.
    fn collect(&self, duration: Duration) -> Vec<(u8, bool)> {
        let mut packets = Vec::new();
        let mut buf = [0u8; 1500];
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            let Ok(len) = self.socket.recv(&mut buf) else {
                continue;
            };
            let Ok(block) = parse_udp_preamble(&buf[..len]) else {
                continue;
            };
            for root in RootLayerPdus::new(block) {
                if let Ok(packet) = parse_data_packet(root.data) {
                    if packet.universe == self.universe {
                        packets.push((packet.sequence, packet.terminated));
                    }
                }
            }
        }
        packets
    }
}

#[test]
fn transmission_suppression_and_termination_pacing() {
    let _guard = serial();
    let Some(netint) = first_v4_netint() else {
        return;
    };
    let netint_config = NetintConfig { netints: vec![netint.id], no_netints: false };
    let Ok(sources) = Sources::new(SourceOptions::default(), Some(&netint_config)) else {
        return;
    };

    let universe = UniverseId::new(105).unwrap();
    let counter = PacketCounter::new(&netint, 105);

    let source = sources
        .create(&SourceConfig { keep_alive_interval: Duration::from_millis(800), ..Default::default() })
        .unwrap();
    sources.add_universe(source, &UniverseConfig::new(universe)).unwrap();
    sources.update_levels(source, universe, Some(&[10; 16])).unwrap();

    // Four back-to-back packets, then at most one keep-alive by 1.2 s.
    let packets = counter.collect(Duration::from_millis(1200));
    assert!(packets.len() >= 4, "expected the pre-suppression burst, got {}", packets.len());
    assert!(packets.len() <= 6, "suppression did not engage, got {} packets", packets.len());

    // Sequence numbers advance by one per transmitted packet.
    for pair in packets.windows(2) {
        assert_eq!(pair[1].0, pair[0].0.wrapping_add(1));
    }

    // Removal emits exactly three termination packets.
    sources.remove_universe(source, universe).unwrap();
    let packets = counter.collect(Duration::from_millis(800));
    let terminations = packets.iter().filter(|(_, terminated)| *terminated).count();
    assert_eq!(terminations, 3);
    assert!(sources.universes(source).unwrap().is_empty());
}

#[test]
fn reset_networking_keeps_receiver_netint_subset() {
    let _guard = serial();
    let Ok(receivers) = Receivers::new(fast_receiver_options(), None) else {
        return;
    };
    let Some(netint) = first_v4_netint() else {
        return;
    };

    let universe = UniverseId::new(109).unwrap();
    let mut config = ReceiverConfig::new(universe);
    config.netints = Some(NetintConfig { netints: vec![netint.id], no_netints: false });

    let events = Arc::new(Events::default());
    let handle = receivers.create(&config, Arc::clone(&events) as _).unwrap();
    assert_eq!(receivers.netints(handle).unwrap(), vec![netint.id]);

    // The configured subset survives a networking reset instead of widening
    // to every usable interface.
    receivers.reset_networking(None).unwrap();
    assert_eq!(receivers.netints(handle).unwrap(), vec![netint.id]);
}

#[test]
fn reset_networking_keeps_universe_netint_subset() {
    let _guard = serial();
    let Ok(sources) = Sources::new(SourceOptions::default(), None) else {
        return;
    };
    let Some(netint) = first_v4_netint() else {
        return;
    };

    let universe = UniverseId::new(110).unwrap();
    let source = sources.create(&SourceConfig::default()).unwrap();
    let mut config = UniverseConfig::new(universe);
    config.netints = Some(NetintConfig { netints: vec![netint.id], no_netints: false });
    sources.add_universe(source, &config).unwrap();
    assert_eq!(sources.universe_netints(source, universe).unwrap(), vec![netint.id]);

    sources.reset_networking(None).unwrap();
    assert_eq!(sources.universe_netints(source, universe).unwrap(), vec![netint.id]);
}

/// Collects merge receiver notifications.
#[derive(Default)]
struct MergeEvents {
    merged: Mutex<Vec<MergedData>>,
}

impl MergeReceiverNotifications for MergeEvents {
    fn merged_data(&self, _handle: ReceiverHandle, data: &MergedData) {
        self.merged.lock().unwrap().push(data.clone());
    }
}

#[test]
fn merge_receiver_merges_two_sources() {
    let _guard = serial();
    let Ok(receivers) = Receivers::new(fast_receiver_options(), None) else {
        return;
    };
    let Some(netint) = first_v4_netint() else {
        return;
    };

    let events = Arc::new(MergeEvents::default());
    let universe = UniverseId::new(107).unwrap();
    let merge_receiver = MergeReceiver::new(
        &receivers,
        &MergeReceiverConfig::new(universe),
        Arc::clone(&events) as _,
    )
    .unwrap();
    assert_eq!(merge_receiver.universe(), universe);

    let cid1 = ComponentIdentifier::new_v4();
    let cid2 = ComponentIdentifier::new_v4();
    let mut s1 = RawSource::new(&netint, &cid1, "s1", 100, 107);
    let mut s2 = RawSource::new(&netint, &cid2, "s2", 100, 107);

    // Keep both sources alive until the sampling period ends and the merge
    // reflects both.
    let merged = |events: &MergeEvents| {
        events.merged.lock().unwrap().iter().any(|data| {
            data.num_active_sources == 2 && data.levels[..3] == [10, 25, 30]
        })
    };
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut success = false;
    while Instant::now() < deadline && !success {
        s1.send_levels(&[10, 20, 30]);
        s2.send_levels(&[5, 25, 25]);
        std::thread::sleep(Duration::from_millis(100));
        success = merged(&events);
    }
    assert!(success, "merged HTP output never appeared");

    #[cfg(feature = "pap")]
    {
        // Per-address priority overrides HTP where nonzero and withdraws the
        // source where zero.
        s2.send_pap(&[0, 200, 200]);
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut papped = false;
        while Instant::now() < deadline && !papped {
            s1.send_levels(&[10, 20, 30]);
            s2.send_levels(&[5, 25, 25]);
            std::thread::sleep(Duration::from_millis(100));
            papped = events
                .merged
                .lock()
                .unwrap()
                .iter()
                .any(|data| data.levels[..3] == [10, 25, 25]);
        }
        assert!(papped, "PAP override never appeared in merged output");
    }
}
