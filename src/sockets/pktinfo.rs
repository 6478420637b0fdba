//! `recvmsg` with `IP_PKTINFO`/`IPV6_PKTINFO` control data, used to learn the
//! interface a datagram arrived on when receive sockets are shared between
//! interfaces.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

use crate::netint::{IpType, NetintId};

/// Enables delivery of packet info control messages on a receive socket.
pub(crate) fn enable_pktinfo(fd: RawFd, ip_type: IpType) -> io::Result<()> {
    let val: libc::c_int = 1;
    let (level, option) = match ip_type {
        IpType::V4 => (libc::IPPROTO_IP, libc::IP_PKTINFO),
        IpType::V6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO),
    };
    // SAFETY: fd is a valid socket and val is a c_int on the stack.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// One received datagram plus its metadata.
pub(crate) struct RecvInfo {
    pub len: usize,
    pub from: Option<SocketAddr>,
    pub netint: Option<NetintId>,
    pub truncated: bool,
}

#[repr(C, align(8))]
struct CmsgBuf([u8; 128]);

/// Receives one datagram with ancillary data.
pub(crate) fn recv_msg(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvInfo> {
    // SAFETY: all pointers handed to recvmsg reference stack or caller
    // buffers that outlive the call; lengths match the buffers.
    unsafe {
        let mut name: libc::sockaddr_storage = mem::zeroed();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = CmsgBuf([0; 128]);

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.0.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.0.len() as _;

        let received = libc::recvmsg(fd, &mut msg, 0);
        if received < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut netint = None;
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let info: libc::in_pktinfo =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                netint = Some(NetintId { index: info.ipi_ifindex as u32, ip_type: IpType::V4 });
                break;
            }
            if (*cmsg).cmsg_level == libc::IPPROTO_IPV6 && (*cmsg).cmsg_type == libc::IPV6_PKTINFO
            {
                let info: libc::in6_pktinfo =
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                netint = Some(NetintId { index: info.ipi6_ifindex, ip_type: IpType::V6 });
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }

        Ok(RecvInfo {
            len: received as usize,
            from: sockaddr_to_addr(&name),
            netint,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        })
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: ss_family says this is a sockaddr_in.
            let addr: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family says this is a sockaddr_in6.
            let addr: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(addr.sin6_port)))
        }
        _ => None,
    }
}
