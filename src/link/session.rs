use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;

use super::commands::Command;
use crate::error::ErrorKind;
use crate::radio::codec::RadioFrame;
use crate::telemetry::TelemetrySample;

/// Connection state of the link to the rover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Closed,
    Listen,
    SynReceived,
    Established,
    FinWait,
    TimeWait,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "CLOSED",
            SessionState::Listen => "LISTEN",
            SessionState::SynReceived => "SYN_RECEIVED",
            SessionState::Established => "ESTABLISHED",
            SessionState::FinWait => "FIN_WAIT",
            SessionState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// Mutable protocol state owned by the connection state machine.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub state: SessionState,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Last frame handed to the radio, resent verbatim on retransmission.
    pub last_sent: Option<RadioFrame>,
    pub pending_commands: VecDeque<Command>,
    /// Command sent and awaiting the rover's acknowledgement.
    pub in_flight: Option<Command>,
    pub close_requested: bool,
    /// Consecutive retransmissions since the last accepted message.
    pub retransmits: u32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back to defaults in `state`, dropping counters, queued commands and the last frame.
    pub fn reset(&mut self, state: SessionState) {
        *self = Session { state, ..Session::default() };
    }
}

/// Read-only view of a session published to observers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub seq_num: u32,
    pub ack_num: u32,
    pub pending_commands: usize,
    pub close_requested: bool,
    pub last_telemetry: Option<TelemetrySample>,
    pub last_rssi: Option<i32>,
    pub last_snr: Option<i32>,
}

impl SessionSnapshot {
    pub fn of(session: &Session) -> Self {
        SessionSnapshot {
            state: session.state,
            seq_num: session.seq_num,
            ack_num: session.ack_num,
            pending_commands: session.pending_commands.len(),
            close_requested: session.close_requested,
            ..SessionSnapshot::default()
        }
    }
}

/// Notifications delivered to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    Telemetry(TelemetrySample),
    /// The rover acknowledged this command.
    CommandDelivered(Command),
    Error { kind: ErrorKind, detail: String },
}
