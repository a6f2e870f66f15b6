//! Connection state machine for the rover link.
//!
//! A TCP-like handshake, stop-and-wait delivery and teardown layered on a
//! radio that carries one message at a time. The machine performs no I/O:
//! every input returns the [`Action`]s the caller must carry out, in order.
//!
//! ```text
//! CLOSED --open--> LISTEN --SYN--> SYN_RECEIVED --ACK--> ESTABLISHED
//! ESTABLISHED --close requested, ACK--> FIN_WAIT --FIN--> TIME_WAIT --quiet--> CLOSED
//! ```

use log::{debug, info, trace, warn};

use super::commands::Command;
use super::session::{Session, SessionEvent, SessionState};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;
use crate::radio::codec::{format_logical, LogicalMessage, MessageType, RadioFrame};

/// Something the state machine needs done on its behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Hand this frame to the radio.
    Send(RadioFrame),
    Notify(SessionEvent),
}

pub struct ConnectionStateMachine {
    session: Session,
    rover_address: u16,
    max_retransmits: Option<u32>,
}

impl ConnectionStateMachine {
    /// `max_retransmits` of `None` retransmits without limit.
    pub fn new(rover_address: u16, max_retransmits: Option<u32>) -> Self {
        ConnectionStateMachine { session: Session::new(), rover_address, max_retransmits }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn rover_address(&self) -> u16 {
        self.rover_address
    }

    /// Start listening for the rover's SYN. No-op unless CLOSED.
    pub fn open(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.session.state != SessionState::Closed {
            warn!("open ignored in {}", self.session.state);
            return actions;
        }
        self.session.reset(SessionState::Closed);
        self.transition(SessionState::Listen, &mut actions);
        actions
    }

    /// Queue a command for delivery once the link is established.
    pub fn enqueue(&mut self, command: Command) -> Result<()> {
        match self.session.state {
            SessionState::Closed | SessionState::FinWait | SessionState::TimeWait => Err(Error::NotConnected),
            _ if self.session.close_requested => Err(Error::NotConnected),
            _ => {
                debug!("queued {}", command);
                self.session.pending_commands.push_back(command);
                Ok(())
            }
        }
    }

    /// Ask for a graceful close. Before the handshake completes the session
    /// goes straight to CLOSED.
    pub fn request_close(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        match self.session.state {
            SessionState::Established => {
                info!("close requested, FIN follows the next acknowledgement");
                self.session.close_requested = true;
            }
            SessionState::Listen | SessionState::SynReceived => {
                info!("close requested before handshake completed");
                self.close(&mut actions);
            }
            SessionState::Closed | SessionState::FinWait | SessionState::TimeWait => {
                trace!("close already under way ({})", self.session.state);
            }
        }
        actions
    }

    /// End the TIME_WAIT quiet period.
    pub fn finish_time_wait(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.session.state == SessionState::TimeWait {
            self.close(&mut actions);
        }
        actions
    }

    /// Drop the session where it stands, without a FIN exchange.
    pub fn abort(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.session.state != SessionState::Closed {
            warn!("aborting link in {}", self.session.state);
            self.close(&mut actions);
        }
        actions
    }

    /// Feed one message received from the rover.
    pub fn on_message(&mut self, msg: &LogicalMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        trace!("{} <- {} {} {}", self.session.state, msg.seq, msg.ack, msg.kind);
        match self.session.state {
            SessionState::Closed => trace!("closed, dropping message"),
            SessionState::Listen => self.on_listen(msg, &mut actions),
            SessionState::SynReceived => self.on_syn_received(msg, &mut actions),
            SessionState::Established => self.on_established(msg, &mut actions),
            SessionState::FinWait => self.on_fin_wait(msg, &mut actions),
            SessionState::TimeWait => self.on_time_wait(msg, &mut actions),
        }
        actions
    }

    fn on_listen(&mut self, msg: &LogicalMessage, actions: &mut Vec<Action>) {
        if msg.kind != MessageType::Syn {
            debug!("listening, ignoring {}", msg.kind);
            return;
        }
        self.session.ack_num = msg.seq.wrapping_add(1);
        self.session.seq_num = 0;
        self.session.retransmits = 0;
        self.transition(SessionState::SynReceived, actions);
        self.send(MessageType::Ack, Vec::new(), actions);
    }

    fn on_syn_received(&mut self, msg: &LogicalMessage, actions: &mut Vec<Action>) {
        let matching = msg.kind == MessageType::Ack
            && msg.seq == self.session.ack_num
            && msg.ack == self.session.seq_num.wrapping_add(1);
        if !matching {
            debug!("handshake: unexpected {} {} {}, resending", msg.seq, msg.ack, msg.kind);
            self.retransmit(actions);
            return;
        }
        self.session.seq_num = msg.ack;
        self.session.retransmits = 0;
        self.transition(SessionState::Established, actions);
        self.send(MessageType::Ack, Vec::new(), actions);
    }

    fn on_established(&mut self, msg: &LogicalMessage, actions: &mut Vec<Action>) {
        match msg.kind {
            MessageType::Ack if msg.seq == self.session.ack_num => self.accept(msg, actions),
            MessageType::Ack => {
                debug!("sequence mismatch: got {}, expected {}", msg.seq, self.session.ack_num);
                self.retransmit(actions);
            }
            _ => debug!("established, ignoring {}", msg.kind),
        }
    }

    fn accept(&mut self, msg: &LogicalMessage, actions: &mut Vec<Action>) {
        self.session.ack_num = msg.seq.wrapping_add(1);
        self.session.seq_num = msg.ack;
        self.session.retransmits = 0;

        if let Some(sample) = &msg.telemetry {
            actions.push(Action::Notify(SessionEvent::Telemetry(sample.clone())));
        }
        if let Some(delivered) = self.session.in_flight.take() {
            info!("rover acknowledged {}", delivered);
            actions.push(Action::Notify(SessionEvent::CommandDelivered(delivered)));
        }

        if self.session.close_requested {
            self.transition(SessionState::FinWait, actions);
            self.send(MessageType::Fin, Vec::new(), actions);
        } else if let Some(cmd) = self.session.pending_commands.pop_front() {
            self.send(cmd.message_type(), cmd.body.clone(), actions);
            self.session.in_flight = Some(cmd);
        } else {
            self.send(MessageType::Ack, Vec::new(), actions);
        }
    }

    fn on_fin_wait(&mut self, msg: &LogicalMessage, actions: &mut Vec<Action>) {
        if msg.kind != MessageType::Fin {
            debug!("waiting for FIN, got {}; resending FIN", msg.kind);
            self.retransmit(actions);
            return;
        }
        self.session.seq_num = msg.ack;
        self.session.ack_num = msg.seq.wrapping_add(1);
        self.session.retransmits = 0;
        self.transition(SessionState::TimeWait, actions);
        self.send(MessageType::Ack, Vec::new(), actions);
        self.session.seq_num = 0;
        self.session.ack_num = 0;
    }

    fn on_time_wait(&mut self, msg: &LogicalMessage, actions: &mut Vec<Action>) {
        if msg.kind == MessageType::Fin {
            debug!("duplicate FIN, resending final ACK");
            self.retransmit(actions);
        }
    }

    fn send(&mut self, kind: MessageType, body: Vec<String>, actions: &mut Vec<Action>) {
        let payload = format_logical(self.session.seq_num, self.session.ack_num, &kind, &body);
        let frame = RadioFrame::new(self.rover_address, payload);
        self.session.last_sent = Some(frame.clone());
        actions.push(Action::Send(frame));
    }

    fn retransmit(&mut self, actions: &mut Vec<Action>) {
        let Some(frame) = self.session.last_sent.clone() else {
            return;
        };
        if let Some(limit) = self.max_retransmits {
            if self.session.retransmits >= limit {
                let err = Error::LinkStalled { attempts: self.session.retransmits };
                warn!("{} in {}, closing", err, self.session.state);
                actions.push(Action::Notify(SessionEvent::Error { kind: ErrorKind::LinkStalled, detail: err.to_string() }));
                self.close(actions);
                return;
            }
        }
        self.session.retransmits += 1;
        metrics::inc_retransmissions();
        actions.push(Action::Send(frame));
    }

    fn close(&mut self, actions: &mut Vec<Action>) {
        let from = self.session.state;
        self.session.reset(SessionState::Closed);
        if from != SessionState::Closed {
            info!("link {} -> {}", from, SessionState::Closed);
            actions.push(Action::Notify(SessionEvent::StateChanged { from, to: SessionState::Closed }));
        }
    }

    fn transition(&mut self, to: SessionState, actions: &mut Vec<Action>) {
        let from = self.session.state;
        if from == to {
            return;
        }
        info!("link {} -> {}", from, to);
        self.session.state = to;
        actions.push(Action::Notify(SessionEvent::StateChanged { from, to }));
    }
}
