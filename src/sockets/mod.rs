//! Socket handling for sACN sources and receivers.
//!
//! Hides interface probing, the multicast send-socket pool, shared receive
//! sockets with refcounted subscriptions, and the poll/recvmsg read path from
//! the engines above.

pub(crate) mod pktinfo;

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::netint::{self, IpType, NetintConfig, NetintId};
use crate::{Error, IpSupport, SACN_PORT};

/// How long a receive thread blocks waiting for traffic per loop iteration.
pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound of multicast memberships per shared receive socket.
pub(crate) const MAX_SUBS_PER_SOCKET: usize = 20;

const MULTICAST_TTL: u32 = 64;
const SEND_BUFFER_SIZE: usize = 32 * 1024;
const RECV_BUFFER_SIZE: usize = 32 * 1024;

/// The sACN multicast group for a universe.
///
/// IPv4: `239.255.U_HI.U_LO`. IPv6: `ff18::8300:U`.
pub(crate) fn multicast_addr(ip_type: IpType, universe: u16) -> SocketAddr {
    let ip = match ip_type {
        IpType::V4 => IpAddr::V4(Ipv4Addr::from(0xEFFF_0000 | universe as u32)),
        IpType::V6 => {
            IpAddr::V6(Ipv6Addr::new(0xFF18, 0, 0, 0, 0, 0, 0x8300, universe))
        }
    };
    SocketAddr::new(ip, SACN_PORT)
}

/// One tested system interface with its usability status.
#[derive(Debug, Clone, Copy)]
pub(crate) struct McastInterface {
    pub id: NetintId,
    pub status: Result<(), io::ErrorKind>,
}

/// Resolves an application interface selection against the tested system
/// interfaces, keeping only usable entries.
pub(crate) fn resolve_netints(
    config: Option<&NetintConfig>,
    sys_netints: &[McastInterface],
) -> Result<Vec<NetintId>, Error> {
    if let Some(config) = config {
        if !config.is_valid() {
            return Err(Error::Invalid("network interface config"));
        }
        if config.no_netints {
            return Ok(Vec::new());
        }
    }

    let requested: Option<&[NetintId]> = match config {
        Some(config) if !config.netints.is_empty() => Some(&config.netints),
        _ => None,
    };

    let mut resolved = Vec::new();
    for netint in sys_netints.iter().filter(|netint| netint.status.is_ok()) {
        let wanted = requested.is_none_or(|ids| ids.contains(&netint.id));
        if wanted && !resolved.contains(&netint.id) {
            resolved.push(netint.id);
        }
    }

    if resolved.is_empty() { Err(Error::NoNetints) } else { Ok(resolved) }
}

fn domain_of(ip_type: IpType) -> Domain {
    match ip_type {
        IpType::V4 => Domain::IPV4,
        IpType::V6 => Domain::IPV6,
    }
}

fn wildcard(ip_type: IpType) -> SocketAddr {
    match ip_type {
        IpType::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), SACN_PORT),
        IpType::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), SACN_PORT),
    }
}

/// Joins a multicast group on a specific interface via raw fd.
///
/// Queued subscription requests outlive any borrow of the owning socket, so
/// membership changes go through the fd like the rest of the reconciliation
/// path.
pub(crate) fn join_group(fd: RawFd, group: IpAddr, ifindex: u32) -> io::Result<()> {
    set_membership(fd, group, ifindex, true)
}

/// Leaves a multicast group on a specific interface via raw fd.
pub(crate) fn leave_group(fd: RawFd, group: IpAddr, ifindex: u32) -> io::Result<()> {
    set_membership(fd, group, ifindex, false)
}

fn set_membership(fd: RawFd, group: IpAddr, ifindex: u32, join: bool) -> io::Result<()> {
    let ret = match group {
        IpAddr::V4(addr) => {
            let mreqn = libc::ip_mreqn {
                imr_multiaddr: libc::in_addr { s_addr: u32::from(addr).to_be() },
                imr_address: libc::in_addr { s_addr: 0 },
                imr_ifindex: ifindex as libc::c_int,
            };
            let option = if join { libc::IP_ADD_MEMBERSHIP } else { libc::IP_DROP_MEMBERSHIP };
            // SAFETY: mreqn is a properly initialized ip_mreqn on the stack.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    option,
                    &mreqn as *const _ as *const libc::c_void,
                    mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
                )
            }
        }
        IpAddr::V6(addr) => {
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr { s6_addr: addr.octets() },
                ipv6mr_interface: ifindex,
            };
            let option = if join { libc::IPV6_ADD_MEMBERSHIP } else { libc::IPV6_DROP_MEMBERSHIP };
            // SAFETY: mreq is a properly initialized ipv6_mreq on the stack.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IPV6,
                    option,
                    &mreq as *const _ as *const libc::c_void,
                    mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
                )
            }
        }
    };
    if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn set_multicast_if(socket: &Socket, netint: &NetintId) -> io::Result<()> {
    match netint.ip_type {
        IpType::V4 => {
            let mreqn = libc::ip_mreqn {
                imr_multiaddr: libc::in_addr { s_addr: 0 },
                imr_address: libc::in_addr { s_addr: 0 },
                imr_ifindex: netint.index as libc::c_int,
            };
            // SAFETY: mreqn is a properly initialized ip_mreqn on the stack.
            let ret = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IP,
                    libc::IP_MULTICAST_IF,
                    &mreqn as *const _ as *const libc::c_void,
                    mem::size_of::<libc::ip_mreqn>() as libc::socklen_t,
                )
            };
            if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }
        IpType::V6 => socket.set_multicast_if_v6(netint.index),
    }
}

/* ---------------------------- Source send path --------------------------- */

struct MulticastSendSocket {
    socket: Socket,
    last_send_error: Option<io::ErrorKind>,
}

/// The source-side socket pool: one multicast send socket per usable
/// interface plus one unicast send socket per IP family.
pub(crate) struct SendSockets {
    sys_netints: Vec<McastInterface>,
    // Parallel to sys_netints; None where the interface test failed.
    sockets: Vec<Option<MulticastSendSocket>>,
    unicast_v4: Option<Socket>,
    unicast_v6: Option<Socket>,
}

impl SendSockets {
    /// Probes every selected system interface with a test send socket and
    /// builds the send pool from the ones that work.
    pub(crate) fn new(netint_config: Option<&NetintConfig>) -> Result<Self, Error> {
        if netint_config.is_some_and(|config| !config.is_valid()) {
            return Err(Error::Invalid("network interface config"));
        }

        let no_netints = netint_config.is_some_and(|config| config.no_netints);
        let requested: Option<&[NetintId]> = match netint_config {
            Some(config) if !config.netints.is_empty() => Some(&config.netints),
            _ => None,
        };

        let mut sys_netints = Vec::new();
        let mut sockets = Vec::new();
        if !no_netints {
            for info in netint::system_netints()? {
                if requested.is_some_and(|ids| !ids.contains(&info.id)) {
                    continue;
                }

                match create_multicast_send_socket(&info.id) {
                    Ok(socket) => {
                        sys_netints.push(McastInterface { id: info.id, status: Ok(()) });
                        sockets.push(Some(MulticastSendSocket { socket, last_send_error: None }));
                    }
                    Err(err) => {
                        log::warn!(
                            "error creating multicast test send socket on network interface {} ({:?}): {err}. \
                             This network interface will not be used for sending sACN.",
                            info.name,
                            info.addr,
                        );
                        sys_netints.push(McastInterface { id: info.id, status: Err(err.kind()) });
                        sockets.push(None);
                    }
                }
            }

            if !sys_netints.iter().any(|netint| netint.status.is_ok()) {
                return Err(Error::NoNetints);
            }
        }

        let unicast_v4 = create_unicast_send_socket(IpType::V4)?;
        let unicast_v6 = create_unicast_send_socket(IpType::V6)?;

        Ok(Self {
            sys_netints,
            sockets,
            unicast_v4: Some(unicast_v4),
            unicast_v6: Some(unicast_v6),
        })
    }

    pub(crate) fn sys_netints(&self) -> &[McastInterface] {
        &self.sys_netints
    }

    /// Sends a packed buffer to a universe's multicast group on one
    /// interface. Interfaces outside `ip_support` are silently skipped.
    pub(crate) fn send_multicast(
        &mut self,
        universe: u16,
        ip_support: IpSupport,
        buf: &[u8],
        netint: &NetintId,
    ) -> io::Result<()> {
        let in_scope = match netint.ip_type {
            IpType::V4 => ip_support.supports_v4(),
            IpType::V6 => ip_support.supports_v6(),
        };
        if !in_scope {
            return Ok(());
        }

        let index = self
            .sys_netints
            .iter()
            .position(|sys| sys.id == *netint)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let entry = self.sockets[index]
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let dest = SockAddr::from(multicast_addr(netint.ip_type, universe));
        let result = entry.socket.send_to(buf, &dest).map(|_| ());

        if let Err(err) = &result {
            // Log sustained failures once per distinct error.
            if entry.last_send_error != Some(err.kind()) {
                log::warn!(
                    "multicast send on network interface {} failed at least once with error: {err}",
                    netint.index
                );
                entry.last_send_error = Some(err.kind());
            }
        }
        result
    }

    /// Sends a packed buffer to a unicast destination.
    ///
    /// `last_send_error` belongs to the destination; failures are logged only
    /// when the error changes.
    pub(crate) fn send_unicast(
        &mut self,
        ip_support: IpSupport,
        buf: &[u8],
        dest: IpAddr,
        last_send_error: &mut Option<io::ErrorKind>,
    ) -> io::Result<()> {
        let socket = match dest {
            IpAddr::V4(_) if ip_support.supports_v4() => self.unicast_v4.as_ref(),
            IpAddr::V6(_) if ip_support.supports_v6() => self.unicast_v6.as_ref(),
            _ => return Ok(()),
        };
        let socket = socket.ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        let sockaddr = SockAddr::from(SocketAddr::new(dest, SACN_PORT));
        let result = socket.send_to(buf, &sockaddr).map(|_| ());

        if let Err(err) = &result {
            if *last_send_error != Some(err.kind()) {
                log::warn!("unicast send to {dest} failed at least once with error: {err}");
                *last_send_error = Some(err.kind());
            }
        }
        result
    }
}

fn create_multicast_send_socket(netint: &NetintId) -> io::Result<Socket> {
    let socket = Socket::new(domain_of(netint.ip_type), Type::DGRAM, Some(Protocol::UDP))?;

    match netint.ip_type {
        IpType::V4 => socket.set_multicast_ttl_v4(MULTICAST_TTL)?,
        IpType::V6 => socket.set_multicast_hops_v6(MULTICAST_TTL)?,
    }
    set_multicast_if(&socket, netint)?;
    match netint.ip_type {
        IpType::V4 => socket.set_multicast_loop_v4(true)?,
        IpType::V6 => socket.set_multicast_loop_v6(true)?,
    }
    let _ = socket.set_send_buffer_size(SEND_BUFFER_SIZE);

    Ok(socket)
}

fn create_unicast_send_socket(ip_type: IpType) -> io::Result<Socket> {
    let socket = Socket::new(domain_of(ip_type), Type::DGRAM, Some(Protocol::UDP))?;
    let _ = socket.set_send_buffer_size(SEND_BUFFER_SIZE);
    Ok(socket)
}

/* --------------------------- Receiver read path -------------------------- */

/// Probes every selected system interface with a test receive socket
/// (join + leave on a probe group) and records per-interface status.
pub(crate) fn test_receiver_netints(
    netint_config: Option<&NetintConfig>,
) -> Result<Vec<McastInterface>, Error> {
    if netint_config.is_some_and(|config| !config.is_valid()) {
        return Err(Error::Invalid("network interface config"));
    }

    let no_netints = netint_config.is_some_and(|config| config.no_netints);
    if no_netints {
        return Ok(Vec::new());
    }

    let requested: Option<&[NetintId]> = match netint_config {
        Some(config) if !config.netints.is_empty() => Some(&config.netints),
        _ => None,
    };

    let mut sys_netints = Vec::new();
    for info in netint::system_netints()? {
        if requested.is_some_and(|ids| !ids.contains(&info.id)) {
            continue;
        }

        let status = test_receiver_netint(&info.id);
        if let Err(err) = status {
            log::warn!(
                "error creating multicast test receive socket on network interface {} ({:?}): \
                 {err:?}. This network interface will not be used for the sACN receiver.",
                info.name,
                info.addr,
            );
        }
        sys_netints.push(McastInterface { id: info.id, status });
    }

    if sys_netints.iter().any(|netint| netint.status.is_ok()) {
        Ok(sys_netints)
    } else {
        Err(Error::NoNetints)
    }
}

fn test_receiver_netint(netint: &NetintId) -> Result<(), io::ErrorKind> {
    let probe = || -> io::Result<()> {
        let socket = Socket::new(domain_of(netint.ip_type), Type::DGRAM, Some(Protocol::UDP))?;
        let group = multicast_addr(netint.ip_type, 1).ip();
        join_group(socket.as_raw_fd(), group, netint.index)?;
        leave_group(socket.as_raw_fd(), group, netint.index)?;
        Ok(())
    };
    probe().map_err(|err| err.kind())
}

/// A receive socket owned by one receive thread.
pub(crate) struct ReceiveSocket {
    pub socket: Socket,
    pub ip_type: IpType,
    pub bound: bool,
    pub polling: bool,
    /// Interface this socket is dedicated to (`socket-per-nic` mode only).
    pub ifindex: u32,
}

impl ReceiveSocket {
    pub(crate) fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// A shared receive socket plus the number of subscriptions using it.
pub(crate) struct SocketRef {
    pub socket: ReceiveSocket,
    pub refcount: usize,
    /// Created this cycle; not yet added to the poll set.
    pub pending: bool,
}

/// A queued multicast membership change.
pub(crate) struct GroupReq {
    pub fd: RawFd,
    pub group: IpAddr,
    pub ifindex: u32,
}

impl GroupReq {
    fn matches(&self, other: &GroupReq) -> bool {
        self.fd == other.fd && self.group == other.group && self.ifindex == other.ifindex
    }
}

/// Whether socket teardown happens inline or is queued to the receive thread.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum CleanupBehavior {
    /// The owning thread is not running; apply all changes immediately.
    Now,
    /// Queue for the owning thread's next reconciliation cycle.
    Queue,
}

/// Per-receive-thread socket state. Sockets are created and closed only by
/// the owning thread; other threads queue requests here under the engine
/// lock.
#[derive(Default)]
pub(crate) struct RecvThreadSockets {
    pub refs: Vec<SocketRef>,
    pub subscribes: Vec<GroupReq>,
    pub unsubscribes: Vec<GroupReq>,
    pub dead: Vec<ReceiveSocket>,
    pub ipv4_bound: bool,
    pub ipv6_bound: bool,
}

impl RecvThreadSockets {
    fn find_ref_with_room(&self, ip_type: IpType, ifindex: u32) -> Option<usize> {
        self.refs.iter().position(|socket_ref| {
            socket_ref.socket.ip_type == ip_type
                && socket_ref.refcount < MAX_SUBS_PER_SOCKET
                && (!cfg!(feature = "socket-per-nic") || socket_ref.socket.ifindex == ifindex)
        })
    }

    pub(crate) fn find_ref_by_fd(&self, fd: RawFd) -> Option<usize> {
        self.refs.iter().position(|socket_ref| socket_ref.socket.fd() == fd)
    }

    /// The sockets to poll this cycle.
    pub(crate) fn poll_entries(&self) -> Vec<PollEntry> {
        self.refs
            .iter()
            .filter(|socket_ref| socket_ref.socket.polling)
            .map(|socket_ref| PollEntry {
                fd: socket_ref.socket.fd(),
                ip_type: socket_ref.socket.ip_type,
                ifindex: socket_ref.socket.ifindex,
            })
            .collect()
    }
}

/// Finds or creates a receive socket for `universe` and queues subscriptions
/// on the given interfaces. Returns the fd identifying the socket ref.
pub(crate) fn add_receiver_socket(
    sockets: &mut RecvThreadSockets,
    ip_type: IpType,
    universe: u16,
    netints: &[NetintId],
) -> Result<RawFd, Error> {
    let ifindex = netints.first().map_or(0, |netint| netint.index);
    if !netints.iter().any(|netint| netint.ip_type == ip_type) {
        return Err(Error::NoNetints);
    }

    let ref_index = match sockets.find_ref_with_room(ip_type, ifindex) {
        Some(index) => {
            sockets.refs[index].refcount += 1;
            index
        }
        None => {
            let perform_bind = if cfg!(feature = "limit-bind") {
                match ip_type {
                    IpType::V4 => !sockets.ipv4_bound,
                    IpType::V6 => !sockets.ipv6_bound,
                }
            } else {
                true
            };

            let socket = match create_receive_socket(ip_type, perform_bind, true, ifindex) {
                Ok(socket) => socket,
                Err(err) => {
                    log::warn!("couldn't create new sACN receiver socket: {err}");
                    return Err(err.into());
                }
            };

            if socket.bound {
                match ip_type {
                    IpType::V4 => sockets.ipv4_bound = true,
                    IpType::V6 => sockets.ipv6_bound = true,
                }
            }
            sockets.refs.push(SocketRef { socket, refcount: 1, pending: true });
            sockets.refs.len() - 1
        }
    };

    let fd = sockets.refs[ref_index].socket.fd();
    let group = multicast_addr(ip_type, universe).ip();

    for netint in netints.iter().filter(|netint| netint.ip_type == ip_type) {
        let req = GroupReq { fd, group, ifindex: netint.index };
        // A queued unsubscribe for the same tuple cancels out; no IGMP traffic.
        if let Some(pos) = sockets.unsubscribes.iter().position(|queued| queued.matches(&req)) {
            sockets.unsubscribes.swap_remove(pos);
        } else {
            sockets.subscribes.push(req);
        }
    }

    Ok(fd)
}

/// Releases one universe's use of a receive socket, queueing (or performing)
/// the unsubscribes and closing the socket when unused.
pub(crate) fn remove_receiver_socket(
    sockets: &mut RecvThreadSockets,
    fd: RawFd,
    universe: u16,
    netints: &[NetintId],
    cleanup: CleanupBehavior,
) {
    if let Some(index) = sockets.find_ref_by_fd(fd) {
        unsubscribe_socket_ref(sockets, index, universe, netints, cleanup);
    }
}

fn unsubscribe_socket_ref(
    sockets: &mut RecvThreadSockets,
    ref_index: usize,
    universe: u16,
    netints: &[NetintId],
    cleanup: CleanupBehavior,
) {
    let fd = sockets.refs[ref_index].socket.fd();
    let ip_type = sockets.refs[ref_index].socket.ip_type;
    let group = multicast_addr(ip_type, universe).ip();

    for netint in netints.iter().filter(|netint| netint.ip_type == ip_type) {
        let req = GroupReq { fd, group, ifindex: netint.index };
        // A queued subscribe for the same tuple cancels out; no IGMP traffic.
        if let Some(pos) = sockets.subscribes.iter().position(|queued| queued.matches(&req)) {
            sockets.subscribes.swap_remove(pos);
        } else if cleanup == CleanupBehavior::Queue {
            sockets.unsubscribes.push(req);
        } else if let Err(err) = leave_group(fd, group, netint.index) {
            log::warn!(
                "error unsubscribing from multicast address {group} on interface {}: {err}",
                netint.index
            );
        }
    }

    let socket_ref = &mut sockets.refs[ref_index];
    socket_ref.refcount = socket_ref.refcount.saturating_sub(1);
    if socket_ref.refcount == 0 {
        let socket_ref = sockets.refs.swap_remove(ref_index);
        if socket_ref.socket.bound {
            match socket_ref.socket.ip_type {
                IpType::V4 => sockets.ipv4_bound = false,
                IpType::V6 => sockets.ipv6_bound = false,
            }
        }
        cleanup_receive_socket(sockets, socket_ref.socket, cleanup);
    }
}

fn cleanup_receive_socket(
    sockets: &mut RecvThreadSockets,
    socket: ReceiveSocket,
    cleanup: CleanupBehavior,
) {
    match cleanup {
        CleanupBehavior::Now => {
            let was_bound = socket.bound;
            let ip_type = socket.ip_type;
            drop(socket);

            // With limit-bind, receives stop unless a successor socket of the
            // same family gets bound in the closed socket's place.
            if cfg!(feature = "limit-bind") && was_bound {
                bind_successor(sockets, ip_type);
            }
        }
        CleanupBehavior::Queue => sockets.dead.push(socket),
    }
}

fn bind_successor(sockets: &mut RecvThreadSockets, ip_type: IpType) {
    let already_bound = match ip_type {
        IpType::V4 => sockets.ipv4_bound,
        IpType::V6 => sockets.ipv6_bound,
    };
    if already_bound {
        return;
    }

    if let Some(successor) = sockets
        .refs
        .iter_mut()
        .find(|socket_ref| socket_ref.socket.ip_type == ip_type && !socket_ref.socket.bound)
    {
        if successor.socket.socket.bind(&SockAddr::from(wildcard(ip_type))).is_ok() {
            successor.socket.bound = true;
            if !successor.pending {
                successor.socket.polling = true;
            }
            match ip_type {
                IpType::V4 => sockets.ipv4_bound = true,
                IpType::V6 => sockets.ipv6_bound = true,
            }
        }
    }
}

/// Applies queued membership changes and socket cleanup. Unsubscribes run
/// before subscribes so a socket never exceeds its membership limit; dead
/// sockets close before new ones start polling.
pub(crate) fn process_queues(sockets: &mut RecvThreadSockets) {
    for req in mem::take(&mut sockets.unsubscribes) {
        if let Err(err) = leave_group(req.fd, req.group, req.ifindex) {
            log::warn!(
                "error unsubscribing from multicast address {} on interface {}: {err}",
                req.group,
                req.ifindex
            );
        }
    }

    for req in mem::take(&mut sockets.subscribes) {
        if let Err(err) = join_group(req.fd, req.group, req.ifindex) {
            log::warn!(
                "error subscribing to multicast address {} on interface {}: {err}",
                req.group,
                req.ifindex
            );
        }
    }

    for socket in mem::take(&mut sockets.dead) {
        cleanup_receive_socket(sockets, socket, CleanupBehavior::Now);
    }

    for socket_ref in &mut sockets.refs {
        if socket_ref.pending {
            socket_ref.pending = false;
            if socket_ref.socket.bound {
                socket_ref.socket.polling = true;
            }
        }
    }
}

/// Closes every socket of a thread immediately. Only valid once the owning
/// thread has stopped.
pub(crate) fn close_all(sockets: &mut RecvThreadSockets) {
    sockets.subscribes.clear();
    sockets.unsubscribes.clear();
    sockets.dead.clear();
    sockets.refs.clear();
    sockets.ipv4_bound = false;
    sockets.ipv6_bound = false;
}

/// One pollable socket, snapshotted from the thread's refs.
#[derive(Clone, Copy)]
pub(crate) struct PollEntry {
    pub fd: RawFd,
    pub ip_type: IpType,
    pub ifindex: u32,
}

/// Outcome of one blocking read cycle.
pub(crate) enum Read {
    Packet(ReadResult),
    TimedOut,
    /// Nothing to poll; the caller should sleep instead of spinning.
    NoSockets,
}

pub(crate) struct ReadResult {
    pub len: usize,
    pub from: SocketAddr,
    pub netint: NetintId,
}

/// Blocks up to `timeout` for one datagram on any of `entries`.
///
/// The arrival interface comes from PKTINFO on shared sockets, or from the
/// socket's own record in `socket-per-nic` mode. Truncated datagrams are
/// dropped (sACN packets fit the MTU).
pub(crate) fn read(entries: &[PollEntry], buf: &mut [u8], timeout: Duration) -> io::Result<Read> {
    if entries.is_empty() {
        return Ok(Read::NoSockets);
    }

    let mut pollfds: Vec<libc::pollfd> = entries
        .iter()
        .map(|entry| libc::pollfd { fd: entry.fd, events: libc::POLLIN, revents: 0 })
        .collect();

    // SAFETY: pollfds is a valid array of initialized pollfd structs.
    let ready = unsafe {
        libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout.as_millis() as i32)
    };
    if ready < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::Interrupted { Ok(Read::TimedOut) } else { Err(err) };
    }
    if ready == 0 {
        return Ok(Read::TimedOut);
    }

    for (entry, pollfd) in entries.iter().zip(&pollfds) {
        if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::other("receive socket reported an error condition"));
        }
        if pollfd.revents & libc::POLLIN == 0 {
            continue;
        }

        let info = pktinfo::recv_msg(entry.fd, buf)?;
        if info.truncated {
            log::warn!("dropping truncated sACN datagram");
            return Ok(Read::TimedOut);
        }
        let Some(from) = info.from else {
            return Ok(Read::TimedOut);
        };

        let netint = if cfg!(feature = "socket-per-nic") {
            NetintId { index: entry.ifindex, ip_type: entry.ip_type }
        } else {
            match info.netint {
                Some(netint) => netint,
                None => return Err(io::Error::other("no packet info on received datagram")),
            }
        };

        return Ok(Read::Packet(ReadResult { len: info.len, from, netint }));
    }

    Ok(Read::TimedOut)
}

fn create_receive_socket(
    ip_type: IpType,
    bind: bool,
    set_sockopts: bool,
    ifindex: u32,
) -> io::Result<ReceiveSocket> {
    let socket = Socket::new(domain_of(ip_type), Type::DGRAM, Some(Protocol::UDP))?;

    if set_sockopts {
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        let _ = socket.set_recv_buffer_size(RECV_BUFFER_SIZE);
        if ip_type == IpType::V6 {
            socket.set_only_v6(true)?;
        }
        if !cfg!(feature = "socket-per-nic") {
            pktinfo::enable_pktinfo(socket.as_raw_fd(), ip_type)?;
        }
    }

    if bind {
        socket.bind(&SockAddr::from(wildcard(ip_type)))?;
    }

    Ok(ReceiveSocket { socket, ip_type, bound: bind, polling: false, ifindex })
}
