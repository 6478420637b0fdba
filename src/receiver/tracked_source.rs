//! Per-receiver state for one remote source.

use crate::RemoteSourceHandle;
use crate::netint::NetintId;
use crate::util::Timer;

use super::ReceiverOptions;

/// Where a source stands in the levels/per-address-priority handshake.
#[cfg(feature = "pap")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvState {
    /// First DMX arrived after the sampling period; levels are withheld for a
    /// while in case the source also sends per-address priorities.
    WaitingForPap,
    HaveDmxOnly,
    HavePapOnly,
    HaveDmxAndPap,
}

/// What to do after processing a NULL start code packet.
pub(crate) struct LevelsOutcome {
    pub notify: bool,
    pub pap_lost: bool,
}

/// A source being tracked by one receiver.
pub(crate) struct TrackedSource {
    pub handle: RemoteSourceHandle,
    pub name: String,
    /// The interface the source's first valid packet arrived on. Packets on
    /// other interfaces are dropped once the sampling period ends.
    pub netint: NetintId,
    pub seq: u8,
    pub terminated: bool,
    pub dmx_received_since_last_tick: bool,
    pub packet_timer: Timer,
    #[cfg(feature = "pap")]
    pub pap_timer: Timer,
    #[cfg(feature = "pap")]
    pub recv_state: RecvState,
}

/// Result of the periodic timeout check for one source.
#[cfg_attr(not(feature = "pap"), allow(dead_code))]
pub(crate) enum SourceStatus {
    Online,
    Offline,
    Unknown,
    /// Still waiting for per-address priority; not reported to the loss
    /// algorithm yet.
    Pending,
    /// Timed out while still waiting for per-address priority; remove
    /// immediately without a loss notification.
    RemoveNow,
}

impl TrackedSource {
    pub(crate) fn new(
        handle: RemoteSourceHandle,
        name: String,
        netint: NetintId,
        seq: u8,
        start_code: u8,
        sampling: bool,
        options: &ReceiverOptions,
    ) -> Self {
        #[cfg(not(feature = "pap"))]
        let _ = (start_code, sampling);

        Self {
            handle,
            name,
            netint,
            seq,
            terminated: false,
            dmx_received_since_last_tick: start_code == crate::STARTCODE_DMX,
            packet_timer: Timer::new(options.source_loss_timeout),
            #[cfg(feature = "pap")]
            pap_timer: if start_code == crate::STARTCODE_PRIORITY || sampling {
                Timer::new(options.source_loss_timeout)
            } else {
                Timer::new(options.wait_for_priority)
            },
            #[cfg(feature = "pap")]
            recv_state: match start_code {
                crate::STARTCODE_PRIORITY => RecvState::HavePapOnly,
                _ if sampling => RecvState::HaveDmxOnly,
                _ => RecvState::WaitingForPap,
            },
        }
    }

    /// Flags the source terminated and lets the loss machinery pick it up on
    /// the next tick.
    pub(crate) fn mark_terminated(&mut self) {
        self.terminated = true;
        self.packet_timer = Timer::expired();
    }

    /// Updates state for a NULL start code packet from this source.
    pub(crate) fn process_levels(&mut self, options: &ReceiverOptions) -> LevelsOutcome {
        let mut outcome = LevelsOutcome { notify: true, pap_lost: false };

        // No matter how valid, we got something.
        self.dmx_received_since_last_tick = true;
        self.packet_timer.start(options.source_loss_timeout);

        #[cfg(feature = "pap")]
        match self.recv_state {
            RecvState::HavePapOnly => {
                self.recv_state = RecvState::HaveDmxAndPap;
            }
            RecvState::WaitingForPap => {
                if self.pap_timer.is_expired() {
                    // The waiting period ran out; keep the timer going in case
                    // the source starts sending PAP later.
                    self.recv_state = RecvState::HaveDmxOnly;
                    self.pap_timer.start(options.source_loss_timeout);
                } else {
                    // DMX during the waiting period stays quiet.
                    outcome.notify = false;
                }
            }
            RecvState::HaveDmxOnly => {}
            RecvState::HaveDmxAndPap => {
                if self.pap_timer.is_expired() {
                    // The source stopped sending PAP but still sends DMX.
                    self.recv_state = RecvState::HaveDmxOnly;
                    outcome.pap_lost = true;
                }
            }
        }

        #[cfg(not(feature = "pap"))]
        let _ = options;

        outcome
    }

    /// Updates state for a per-address priority packet from this source.
    /// Returns whether to notify.
    #[cfg(feature = "pap")]
    pub(crate) fn process_pap(&mut self, options: &ReceiverOptions) -> bool {
        match self.recv_state {
            RecvState::WaitingForPap | RecvState::HaveDmxOnly => {
                self.recv_state = RecvState::HaveDmxAndPap;
                self.pap_timer.start(options.source_loss_timeout);
            }
            RecvState::HaveDmxAndPap | RecvState::HavePapOnly => {
                self.pap_timer.reset();
            }
        }
        true
    }

    /// Periodic timeout check; clears the since-last-tick flag when online.
    pub(crate) fn check_timeouts(&mut self) -> SourceStatus {
        #[cfg(feature = "pap")]
        if self.recv_state == RecvState::WaitingForPap {
            return if self.packet_timer.is_expired() {
                SourceStatus::RemoveNow
            } else {
                SourceStatus::Pending
            };
        }

        if self.packet_timer.is_expired() {
            SourceStatus::Offline
        } else if self.dmx_received_since_last_tick {
            self.dmx_received_since_last_tick = false;
            SourceStatus::Online
        } else {
            SourceStatus::Unknown
        }
    }
}
