//! Ground station session: modem bring-up plus the task that runs the
//! connection state machine against the radio.

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::commands::Command;
use super::machine::{Action, ConnectionStateMachine};
use super::session::{SessionEvent, SessionSnapshot, SessionState};
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::metrics;
use crate::radio::codec::{decode_received, parse_logical};
use crate::radio::modem::ModemConfigurator;
use crate::radio::record::FrameRecord;
use crate::radio::{frame_channel, RadioChannel, SerialLink};
use crate::telemetry::TelemetrySample;

enum Request {
    Command(Command),
    Close,
}

/// Receiving ends handed back when a session opens.
pub struct SessionChannels {
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Every line sent to or received from the modem.
    pub frames: mpsc::UnboundedReceiver<FrameRecord>,
}

/// Caller-side handle to a running session.
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Open the configured serial device, bring the modem up and start listening.
    #[cfg(feature = "serial")]
    pub async fn open(config: &Config) -> Result<(SessionHandle, SessionChannels)> {
        let (tap, frames) = frame_channel();
        let channel = RadioChannel::open(&config.serial, tap, config.session.poll_interval())?;
        Self::start(channel, frames, config).await
    }

    /// As [`open`](Self::open), over an already-connected link.
    pub async fn open_with_link(link: Box<dyn SerialLink>, config: &Config) -> Result<(SessionHandle, SessionChannels)> {
        let (tap, frames) = frame_channel();
        let channel = RadioChannel::from_link(link, tap, config.session.poll_interval());
        Self::start(channel, frames, config).await
    }

    async fn start(
        mut channel: RadioChannel,
        frames: mpsc::UnboundedReceiver<FrameRecord>,
        config: &Config,
    ) -> Result<(SessionHandle, SessionChannels)> {
        if let Err(e) = bring_up(&mut channel, config).await {
            error!("Modem bring-up failed: {}", e);
            channel.close().await;
            return Err(e);
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());
        let cancel = channel.cancellation();

        let station = StationLoop {
            machine: ConnectionStateMachine::new(config.radio.rover_address, config.session.retransmit_limit()),
            requests: requests_rx,
            requests_open: true,
            events: events_tx,
            snapshot: snapshot_tx,
            cancel: cancel.clone(),
            time_wait: config.session.time_wait(),
            time_wait_until: None,
            close_timeout: config.session.close_timeout(),
            abandon_at: None,
            last_rssi: None,
            last_snr: None,
            last_telemetry: None,
        };
        let task = tokio::spawn(station.run(channel));
        info!("Session listening for rover {}", config.radio.rover_address);

        Ok((SessionHandle { requests, snapshot, cancel, task: Some(task) }, SessionChannels { events, frames }))
    }

    /// Queue a command for the rover; it goes out on the next acknowledgement cycle.
    pub fn enqueue_command(&self, command: Command) -> Result<()> {
        self.requests.send(Request::Command(command)).map_err(|_| Error::NotConnected)
    }

    pub fn request_close(&self) -> Result<()> {
        self.requests.send(Request::Close).map_err(|_| Error::NotConnected)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    /// Watch receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the session reaches `state`, or `within` elapses.
    pub async fn wait_for_state(&self, state: SessionState, within: Duration) -> bool {
        let mut rx = self.snapshot.clone();
        let reached = async {
            loop {
                if rx.borrow_and_update().state == state {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().state == state;
                }
            }
        };
        timeout(within, reached).await.unwrap_or(false)
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Request a graceful close and wait up to `grace` for it, then cancel.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.request_close();
        if let Some(mut task) = self.task.take() {
            match timeout(grace, &mut task).await {
                Ok(Err(e)) => warn!("Session task ended abnormally: {}", e),
                Ok(Ok(())) => {}
                Err(_) => {
                    warn!("Session did not close within {:?}, cancelling", grace);
                    self.cancel.cancel();
                    let _ = task.await;
                }
            }
        }
        info!("Session shut down");
    }

    /// Stop the session and its send worker without a FIN exchange.
    pub fn abort(self) {
        self.cancel.cancel();
    }
}

async fn bring_up(channel: &mut RadioChannel, config: &Config) -> Result<()> {
    let mut modem = ModemConfigurator::new(channel, config.session.exchange_timeout());
    modem.try_initialize().await?;
    if config.session.configure_radio {
        modem.try_apply_all(&config.radio).await?;
    }
    Ok(())
}

struct StationLoop {
    machine: ConnectionStateMachine,
    requests: mpsc::UnboundedReceiver<Request>,
    requests_open: bool,
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    time_wait: Duration,
    time_wait_until: Option<Instant>,
    close_timeout: Duration,
    /// Set once the handle is gone; the session is dropped if still open by then.
    abandon_at: Option<Instant>,
    last_rssi: Option<i32>,
    last_snr: Option<i32>,
    last_telemetry: Option<TelemetrySample>,
}

impl StationLoop {
    async fn run(mut self, mut channel: RadioChannel) {
        let opened = self.machine.open();
        self.apply(&channel, opened);
        let poll = channel.poll_interval();
        let cancel = self.cancel.clone();

        loop {
            self.drain_requests(&channel);

            if let Some(until) = self.time_wait_until {
                if Instant::now() >= until {
                    self.time_wait_until = None;
                    let actions = self.machine.finish_time_wait();
                    self.apply(&channel, actions);
                }
            }
            if self.abandon_at.is_some_and(|at| Instant::now() >= at) {
                warn!("Session not closed within {:?} of its handle being dropped", self.close_timeout);
                let actions = self.machine.abort();
                self.apply(&channel, actions);
            }
            if self.machine.state() == SessionState::Closed {
                break;
            }

            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = channel.recv_line(poll) => line,
            };
            match line {
                Ok(Some(line)) => self.handle_line(&channel, &line),
                Ok(None) => {}
                Err(e) => {
                    error!("Radio receive failed: {}", e);
                    self.notify(SessionEvent::Error { kind: e.kind(), detail: e.to_string() });
                    break;
                }
            }
        }

        let ended_in = self.machine.state();
        let actions = self.machine.abort();
        self.apply(&channel, actions);

        if cancel.is_cancelled() {
            channel.abort();
        } else {
            channel.close().await;
        }
        info!("Session loop finished in {}", ended_in);
    }

    fn drain_requests(&mut self, channel: &RadioChannel) {
        while self.requests_open {
            match self.requests.try_recv() {
                Ok(Request::Command(cmd)) => {
                    if let Err(e) = self.machine.enqueue(cmd) {
                        self.notify(SessionEvent::Error { kind: e.kind(), detail: e.to_string() });
                    }
                    self.publish();
                }
                Ok(Request::Close) => {
                    let actions = self.machine.request_close();
                    self.apply(channel, actions);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!("Session handle dropped, closing");
                    self.requests_open = false;
                    self.abandon_at = Some(Instant::now() + self.close_timeout);
                    let actions = self.machine.request_close();
                    self.apply(channel, actions);
                }
            }
        }
    }

    fn handle_line(&mut self, channel: &RadioChannel, line: &str) {
        let Some(received) = decode_received(line) else {
            trace!("modem: {}", line);
            return;
        };
        if received.frame.address != self.machine.rover_address() {
            debug!("ignoring frame from address {}", received.frame.address);
            return;
        }
        self.last_rssi = Some(received.rssi);
        self.last_snr = Some(received.snr);
        match parse_logical(&received.frame.payload) {
            Ok(msg) => {
                let actions = self.machine.on_message(&msg);
                self.apply(channel, actions);
            }
            Err(e) => {
                metrics::inc_malformed_dropped();
                warn!("Dropping frame '{}': {}", received.frame.payload, e);
                self.publish();
            }
        }
    }

    fn apply(&mut self, channel: &RadioChannel, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(frame) => {
                    if let Err(e) = channel.try_send(frame.encode()) {
                        error!("Could not queue frame '{}': {}", frame.payload, e);
                        self.notify(SessionEvent::Error { kind: ErrorKind::NotConnected, detail: e.to_string() });
                    }
                }
                Action::Notify(event) => {
                    match &event {
                        SessionEvent::StateChanged { to: SessionState::TimeWait, .. } => {
                            self.time_wait_until = Some(Instant::now() + self.time_wait);
                        }
                        SessionEvent::Telemetry(sample) => self.last_telemetry = Some(sample.clone()),
                        SessionEvent::CommandDelivered(_) => metrics::inc_commands_delivered(),
                        _ => {}
                    }
                    self.notify(event);
                }
            }
        }
        self.publish();
    }

    fn notify(&self, event: SessionEvent) {
        // the caller may have stopped listening; the session keeps running
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            last_telemetry: self.last_telemetry.clone(),
            last_rssi: self.last_rssi,
            last_snr: self.last_snr,
            ..SessionSnapshot::of(self.machine.session())
        };
        self.snapshot.send_replace(snapshot);
    }
}
