//! Per-universe transmission state of a source.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use crate::netint::{NetintConfig, NetintId};
use crate::packet::DataSendBuf;
use crate::util::Timer;
use crate::{ComponentIdentifier, Error, UniverseId};

/// How many packets a stream sends back-to-back after an update before
/// transmission suppression kicks in.
pub(crate) const NUM_PRE_SUPPRESSION_PACKETS: u8 = 4;

/// How many termination packets are sent when a stream shuts down.
pub(crate) const NUM_TERMINATION_PACKETS: u8 = 3;

/// Configuration for one universe on a source.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct UniverseConfig {
    /// The universe to transmit on.
    pub universe: UniverseId,
    /// Universe priority (0..=200).
    pub priority: u8,
    /// Set the preview bit on outgoing data.
    pub send_preview: bool,
    /// Skip multicast entirely; only the unicast destinations receive data.
    pub send_unicast_only: bool,
    /// Unicast destinations receiving this universe alongside multicast.
    pub unicast_destinations: Vec<IpAddr>,
    /// Synchronization universe. Accepted for configuration but packed as 0;
    /// synchronization is not implemented.
    pub sync_universe: u16,
    /// Interfaces this universe multicasts on; `None` uses all of the
    /// source's usable interfaces.
    pub netints: Option<NetintConfig>,
}

impl UniverseConfig {
    pub fn new(universe: UniverseId) -> Self {
        Self {
            universe,
            priority: 100,
            send_preview: false,
            send_unicast_only: false,
            unicast_destinations: Vec::new(),
            sync_universe: 0,
            netints: None,
        }
    }
}

/// Stream termination progress for universes and unicast destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminationState {
    NotTerminating,
    /// Send terminations, then keep the entity with its data cleared.
    TerminatingWithoutRemoving,
    /// Send terminations, then remove the entity.
    TerminatingAndRemoving,
}

/// Which behavior a termination request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminateBehavior {
    AndRemove,
    WithoutRemoving,
}

pub(crate) struct UnicastDest {
    pub addr: IpAddr,
    pub termination_state: TerminationState,
    pub num_terminations_sent: u8,
    pub last_send_error: Option<io::ErrorKind>,
}

impl UnicastDest {
    pub(crate) fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            termination_state: TerminationState::NotTerminating,
            num_terminations_sent: 0,
            last_send_error: None,
        }
    }

    pub(crate) fn set_terminating(&mut self, behavior: TerminateBehavior) {
        if self.termination_state == TerminationState::NotTerminating {
            self.num_terminations_sent = 0;
        }
        match behavior {
            TerminateBehavior::AndRemove => {
                self.termination_state = TerminationState::TerminatingAndRemoving;
            }
            TerminateBehavior::WithoutRemoving => {
                // Continue a removal already in progress.
                if self.termination_state != TerminationState::TerminatingAndRemoving {
                    self.termination_state = TerminationState::TerminatingWithoutRemoving;
                }
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.termination_state = TerminationState::NotTerminating;
        self.num_terminations_sent = 0;
    }
}

/// One universe being transmitted by a source.
///
/// Keeps two packet-ready send buffers (levels and per-address priority) with
/// current header fields, so the tick path only patches the sequence number.
pub(crate) struct SourceUniverse {
    pub id: u16,
    pub priority: u8,
    pub send_preview: bool,
    pub send_unicast_only: bool,
    pub unicast_dests: Vec<UnicastDest>,
    pub netints: Vec<NetintId>,
    /// The interface selection this universe was configured with, re-applied
    /// whenever networking resets.
    pub netint_config: Option<NetintConfig>,
    pub level_buf: DataSendBuf,
    pub has_level_data: bool,
    #[cfg(feature = "pap")]
    pub pap_buf: DataSendBuf,
    #[cfg(feature = "pap")]
    pub has_pap_data: bool,
    pub level_packets_sent_before_suppression: u8,
    #[cfg(feature = "pap")]
    pub pap_packets_sent_before_suppression: u8,
    pub level_keep_alive: Timer,
    #[cfg(feature = "pap")]
    pub pap_keep_alive: Timer,
    pub termination_state: TerminationState,
    pub num_terminations_sent: u8,
    pub seq: u8,
    pub last_send_error: Option<io::ErrorKind>,
}

impl SourceUniverse {
    pub(crate) fn new(
        cid: &ComponentIdentifier,
        source_name: &str,
        config: &UniverseConfig,
        netints: Vec<NetintId>,
    ) -> Result<Self, Error> {
        let universe = config.universe.get();
        let level_buf = DataSendBuf::new(
            cid,
            source_name,
            config.priority,
            universe,
            config.sync_universe,
            config.send_preview,
            crate::STARTCODE_DMX,
        )
        .map_err(|_| Error::Invalid("source name too long"))?;

        #[cfg(feature = "pap")]
        let pap_buf = DataSendBuf::new(
            cid,
            source_name,
            config.priority,
            universe,
            config.sync_universe,
            config.send_preview,
            crate::STARTCODE_PRIORITY,
        )
        .map_err(|_| Error::Invalid("source name too long"))?;

        Ok(Self {
            id: universe,
            priority: config.priority,
            send_preview: config.send_preview,
            send_unicast_only: config.send_unicast_only,
            unicast_dests: config.unicast_destinations.iter().copied().map(UnicastDest::new).collect(),
            netints,
            netint_config: config.netints.clone(),
            level_buf,
            has_level_data: false,
            #[cfg(feature = "pap")]
            pap_buf,
            #[cfg(feature = "pap")]
            has_pap_data: false,
            level_packets_sent_before_suppression: 0,
            #[cfg(feature = "pap")]
            pap_packets_sent_before_suppression: 0,
            level_keep_alive: Timer::expired(),
            #[cfg(feature = "pap")]
            pap_keep_alive: Timer::expired(),
            termination_state: TerminationState::NotTerminating,
            num_terminations_sent: 0,
            seq: 0,
            last_send_error: None,
        })
    }

    /// Whether this universe is announced by universe discovery.
    pub(crate) fn part_of_discovery(&self) -> bool {
        self.has_level_data && !self.send_unicast_only
    }

    /// Bumps the universe's sequence counter and patches it into both send
    /// buffers. Every transmitted packet of any start code advances it.
    pub(crate) fn increment_sequence(&mut self) {
        self.seq = self.seq.wrapping_add(1);
        self.level_buf.set_sequence(self.seq);
        #[cfg(feature = "pap")]
        self.pap_buf.set_sequence(self.seq);
    }

    /// Restarts the level stream's pre-suppression burst and keep-alive.
    pub(crate) fn reset_level_suppression(&mut self, keep_alive: Duration) {
        self.level_packets_sent_before_suppression = 0;
        if self.has_level_data {
            self.level_keep_alive.start(keep_alive);
        }
    }

    /// Restarts the PAP stream's pre-suppression burst and keep-alive.
    #[cfg(feature = "pap")]
    pub(crate) fn reset_pap_suppression(&mut self, keep_alive: Duration) {
        self.pap_packets_sent_before_suppression = 0;
        if self.has_pap_data {
            self.pap_keep_alive.start(keep_alive);
        }
    }

    /// Forces outgoing levels to zero wherever the outgoing per-address
    /// priority is zero (or absent beyond the PAP count). The PAP buffer must
    /// already hold the latest priorities.
    #[cfg(feature = "pap")]
    pub(crate) fn zero_levels_where_pap_is_zero(&mut self) {
        let level_count = self.level_buf.slot_count();
        let pap_count = self.pap_buf.slot_count();
        for slot in 0..level_count {
            if slot >= pap_count || self.pap_buf.slot(slot) == 0 {
                self.level_buf.set_slot(slot, 0);
            }
        }
    }

    pub(crate) fn set_terminating(&mut self, behavior: TerminateBehavior) {
        if self.termination_state == TerminationState::NotTerminating {
            self.num_terminations_sent = 0;
        }
        match behavior {
            TerminateBehavior::AndRemove => {
                self.termination_state = TerminationState::TerminatingAndRemoving;
            }
            TerminateBehavior::WithoutRemoving => {
                // Continue a removal already in progress.
                if self.termination_state != TerminationState::TerminatingAndRemoving {
                    self.termination_state = TerminationState::TerminatingWithoutRemoving;
                }
            }
        }
        for dest in &mut self.unicast_dests {
            dest.set_terminating(behavior);
        }
    }

    /// Leaves termination without removing; data must be re-supplied before
    /// transmission resumes.
    pub(crate) fn reset_after_termination(&mut self) {
        self.termination_state = TerminationState::NotTerminating;
        self.num_terminations_sent = 0;
        self.has_level_data = false;
        #[cfg(feature = "pap")]
        {
            self.has_pap_data = false;
        }
    }

    /// An update arrived while terminating-without-removing; cancel the
    /// termination and resume.
    pub(crate) fn cancel_termination_if_not_removing(&mut self) {
        if self.termination_state == TerminationState::TerminatingWithoutRemoving {
            self.termination_state = TerminationState::NotTerminating;
            self.num_terminations_sent = 0;

            for dest in &mut self.unicast_dests {
                if dest.termination_state == TerminationState::TerminatingWithoutRemoving {
                    dest.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn universe() -> SourceUniverse {
        let config = UniverseConfig::new(UniverseId::new(1).unwrap());
        SourceUniverse::new(&Uuid::new_v4(), "test", &config, Vec::new()).unwrap()
    }

    #[cfg(feature = "pap")]
    #[test]
    fn zero_pap_forces_zero_levels() {
        let mut universe = universe();
        universe.pap_buf.set_data(&[0, 100, 0]);
        universe.has_pap_data = true;
        universe.level_buf.set_data(&[10, 20, 30, 40]);
        universe.has_level_data = true;

        universe.zero_levels_where_pap_is_zero();

        // Zero PAP and slots beyond the PAP count both force level zero.
        assert_eq!(universe.level_buf.slots(), &[0, 20, 0, 0]);
    }

    #[test]
    fn sequence_increments_with_wraparound() {
        let mut universe = universe();
        universe.seq = 255;
        universe.increment_sequence();
        assert_eq!(universe.seq, 0);
        assert_eq!(universe.level_buf.sequence(), 0);
    }

    #[test]
    fn suppression_reset_restarts_the_burst() {
        let mut universe = universe();
        universe.has_level_data = true;
        universe.level_packets_sent_before_suppression = NUM_PRE_SUPPRESSION_PACKETS;

        universe.reset_level_suppression(Duration::from_millis(800));
        assert_eq!(universe.level_packets_sent_before_suppression, 0);
        assert!(!universe.level_keep_alive.is_expired());
    }

    #[test]
    fn update_cancels_termination_without_removing() {
        let mut universe = universe();
        universe.set_terminating(TerminateBehavior::WithoutRemoving);
        assert_eq!(universe.termination_state, TerminationState::TerminatingWithoutRemoving);

        universe.cancel_termination_if_not_removing();
        assert_eq!(universe.termination_state, TerminationState::NotTerminating);
        assert_eq!(universe.num_terminations_sent, 0);
    }

    #[test]
    fn removal_in_progress_is_not_cancelled() {
        let mut universe = universe();
        universe.set_terminating(TerminateBehavior::AndRemove);
        universe.cancel_termination_if_not_removing();
        assert_eq!(universe.termination_state, TerminationState::TerminatingAndRemoving);

        // A later terminate-without-removing keeps the removal going.
        universe.set_terminating(TerminateBehavior::WithoutRemoving);
        assert_eq!(universe.termination_state, TerminationState::TerminatingAndRemoving);
    }
}
