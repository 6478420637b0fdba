//! # sACN
//!
//! Streaming ACN (ANSI E1.31) over IP: multicast sources, receivers with
//! source tracking and loss detection, and highest-takes-precedence DMX
//! merging with per-address-priority support.
//!
//! The crate is organized as four cooperating engines:
//!
//! - [`source::Sources`] paces outgoing universe data, handles transmission
//!   suppression, termination sequencing and universe discovery.
//! - [`receiver::Receivers`] ingests universe data on one or more receive
//!   threads, tracks remote sources and reports source loss.
//! - [`merger::Merger`] computes the per-slot winner among multiple sources.
//! - [`merge_receiver::MergeReceiver`] composes a receiver and a merger and
//!   reports fully merged universe data.

pub use error::Error;

pub mod error;
pub mod limits;
pub mod merge_receiver;
pub mod merger;
pub mod netint;
pub mod packet;
pub mod receiver;
pub mod source;
pub mod source_detector;

mod registry;
mod sockets;
mod source_loss;
mod util;

use std::fmt;

pub use registry::RemoteSourceHandle;

/// # E1.31 5.6 CID (Component Identifier)
///
/// A 128-bit UUID identifying an sACN component for its entire lifetime.
pub type ComponentIdentifier = uuid::Uuid;

/// The UDP port sACN packets are sent and received on.
pub const SACN_PORT: u16 = 5568;

/// The universe number on which universe discovery packets are sent.
pub const DISCOVERY_UNIVERSE: u16 = 64214;

/// The number of addresses in a DMX universe.
pub const DMX_ADDRESS_COUNT: usize = 512;

/// Maximum length of a source name, including the NUL terminator on the wire.
pub const SOURCE_NAME_MAX_LEN: usize = 64;

/// DMX512-A NULL start code (dimmer levels).
pub const STARTCODE_DMX: u8 = 0x00;

/// Start code for per-address priority (PAP) packets.
pub const STARTCODE_PRIORITY: u8 = 0xDD;

/// The highest priority a source may use, per-universe or per-address.
pub const MAX_PRIORITY: u8 = 200;

/// # E1.31 3.3 Universe Number
///
/// A validated sACN universe number. Valid universes are within the range
/// 1..=63999; the universe discovery universe is reserved and handled
/// internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct UniverseId(u16);

impl UniverseId {
    /// The minimum valid universe number.
    pub const MIN: Self = Self(1);

    /// The maximum valid universe number.
    pub const MAX: Self = Self(63999);

    /// Creates a new [UniverseId] within the valid range 1..=63999.
    pub fn new(universe: u16) -> Result<Self, Error> {
        match universe {
            1..=63999 => Ok(Self(universe)),
            _ => Err(Error::Invalid("universe id out of range")),
        }
    }

    /// The raw universe number.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for UniverseId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for UniverseId {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Error> {
        Self::new(value)
    }
}

impl From<UniverseId> for u16 {
    fn from(value: UniverseId) -> u16 {
        value.0
    }
}

/// Which IP families a source or receiver uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum IpSupport {
    /// IPv4 only.
    V4Only,
    /// IPv6 only.
    V6Only,
    /// Both IPv4 and IPv6.
    #[default]
    V4AndV6,
}

impl IpSupport {
    /// Whether IPv4 traffic is in scope.
    pub fn supports_v4(self) -> bool {
        matches!(self, IpSupport::V4Only | IpSupport::V4AndV6)
    }

    /// Whether IPv6 traffic is in scope.
    pub fn supports_v6(self) -> bool {
        matches!(self, IpSupport::V6Only | IpSupport::V4AndV6)
    }
}

#[cfg(test)]
mod tests {
    use super::UniverseId;

    #[test]
    fn universe_id_in_range() {
        assert!(UniverseId::new(1).is_ok());
        assert!(UniverseId::new(63999).is_ok());
    }

    #[test]
    fn universe_id_out_of_range() {
        assert!(UniverseId::new(0).is_err());
        assert!(UniverseId::new(64000).is_err());
        assert!(UniverseId::new(65535).is_err());
    }
}
