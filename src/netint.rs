//! Network interface enumeration and identification.

use std::ffi::CString;
use std::net::IpAddr;

use crate::Error;

/// The IP family of an interface or address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum IpType {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl IpType {
    pub(crate) fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpType::V4,
            IpAddr::V6(_) => IpType::V6,
        }
    }
}

/// Identifies one usable (interface, IP family) pair.
///
/// The same OS interface appears once per family it has an address on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct NetintId {
    /// OS interface index.
    pub index: u32,
    /// IP family.
    pub ip_type: IpType,
}

/// An enumerated system interface.
#[derive(Debug, Clone)]
pub struct NetintInfo {
    /// Interface identifier.
    pub id: NetintId,
    /// Primary address of this (interface, family) pair.
    pub addr: IpAddr,
    /// OS interface name.
    pub name: String,
}

/// Application selection of network interfaces.
///
/// `netints` empty means "use every usable system interface". `no_netints`
/// explicitly requests a data-less instance (nothing is joined or sent).
#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct NetintConfig {
    /// Interfaces to use. Empty selects all usable system interfaces.
    pub netints: Vec<NetintId>,
    /// Use no interfaces at all.
    pub no_netints: bool,
}

impl NetintConfig {
    /// Configuration selecting every usable system interface.
    pub fn all() -> Self {
        Self::default()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.netints.iter().all(|id| id.index != 0)
    }
}

/// Enumerates the system's multicast-capable interfaces, one entry per
/// (interface, family) pair.
pub fn system_netints() -> Result<Vec<NetintInfo>, Error> {
    let ifas = local_ip_address::list_afinet_netifas().map_err(|_| Error::NoNetints)?;

    let mut netints: Vec<NetintInfo> = Vec::new();
    for (name, addr) in ifas {
        let Some(index) = name_to_index(&name) else {
            continue;
        };
        let id = NetintId { index, ip_type: IpType::of(&addr) };
        // One entry per (index, family); extra addresses don't add interfaces.
        if netints.iter().any(|existing| existing.id == id) {
            continue;
        }
        netints.push(NetintInfo { id, addr, name });
    }

    if netints.is_empty() { Err(Error::NoNetints) } else { Ok(netints) }
}

fn name_to_index(name: &str) -> Option<u32> {
    let cname = CString::new(name).ok()?;
    // SAFETY: cname is a valid NUL-terminated string for the duration of the call.
    let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if index == 0 { None } else { Some(index) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_resolves_to_an_index() {
        assert!(name_to_index("lo").is_some());
    }

    #[test]
    fn unknown_interface_has_no_index() {
        assert!(name_to_index("sacn-does-not-exist0").is_none());
    }

    #[test]
    fn system_netints_deduplicates_pairs() {
        let netints = system_netints().unwrap();
        for (i, netint) in netints.iter().enumerate() {
            assert!(!netints[i + 1..].iter().any(|other| other.id == netint.id));
        }
    }
}
