//! Semantic boundary to the wire-level PTP implementation.
//!
//! The codec delivers per-event timestamps and the grandmaster fields from
//! Announce; bit-exact packet handling stays on the far side of this trait.

use crate::domain::grandmaster::GrandmasterInfo;
use crate::domain::timespec::Timespec;

/// Events surfaced by the PTP codec, already paired with timestamps.
#[derive(Debug, Clone)]
pub enum PtpEvent {
    /// Sync (plus Follow_Up in two-step mode): master tx, local rx.
    Sync {
        seq: u16,
        tx: Timespec,
        rx: Timespec,
        correction: Timespec,
    },
    /// Delay_Req/Delay_Resp pair: local tx, master rx.
    DelayResp {
        seq: u16,
        tx: Timespec,
        rx: Timespec,
        correction: Timespec,
    },
    /// Peer-delay exchange, both legs.
    PeerDelay {
        seq: u16,
        s2p_tx: Timespec,
        s2p_rx: Timespec,
        p2s_tx: Timespec,
        p2s_rx: Timespec,
        correction: Timespec,
    },
    /// A two-step Sync whose Follow_Up never arrived.
    FollowUpMissed { seq: u16 },
    /// Announce: grandmaster characterization and time properties.
    Announce {
        gm: GrandmasterInfo,
        utc_offset: i16,
        utc_offset_valid: bool,
        leap59: bool,
        leap61: bool,
    },
}

/// Non-blocking event pump driven from the module's tick.
pub trait PtpCodec: Send {
    /// Next pending event, if any.
    fn pull(&mut self) -> Option<PtpEvent>;
    /// Whether the underlying port currently has a usable transport.
    fn port_usable(&self) -> bool;
}

/// Scripted codec for tests and bring-up: events are queued up front and
/// handed out in order.
#[derive(Debug, Default)]
pub struct ScriptedCodec {
    events: std::collections::VecDeque<PtpEvent>,
    usable: bool,
}

impl ScriptedCodec {
    pub fn new() -> Self {
        ScriptedCodec {
            events: Default::default(),
            usable: true,
        }
    }

    pub fn push(&mut self, event: PtpEvent) {
        self.events.push_back(event);
    }

    pub fn set_usable(&mut self, usable: bool) {
        self.usable = usable;
    }
}

impl PtpCodec for ScriptedCodec {
    fn pull(&mut self) -> Option<PtpEvent> {
        self.events.pop_front()
    }

    fn port_usable(&self) -> bool {
        self.usable
    }
}
