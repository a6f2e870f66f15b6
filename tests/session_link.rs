//! Full session over an in-memory modem: bring-up, handshake, command
//! delivery with telemetry, and teardown.

use std::time::Duration;

use groundstation::config::Config;
use groundstation::error::{Error, ErrorKind};
use groundstation::link::{Command, SessionChannels, SessionEvent, SessionHandle, SessionSnapshot, SessionState};
use groundstation::metrics;
use groundstation::radio::mock::{MockHandle, MockLink};
use groundstation::radio::record::Direction;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(2);

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.session.exchange_timeout_ms = 500;
    cfg.session.time_wait_ms = 50;
    cfg.session.poll_interval_ms = 1;
    cfg
}

fn modem_that_says_ok() -> (MockLink, MockHandle) {
    let (link, modem) = MockLink::new();
    modem.set_responder(|line| if line.starts_with("AT") { vec!["+OK".into()] } else { vec![] });
    (link, modem)
}

fn at_send(payload: &str) -> String {
    format!("AT+SEND=102,{},{}", payload.len(), payload)
}

fn rcv(payload: &str) -> String {
    format!("+RCV=102,{},{},-40,9", payload.len(), payload)
}

async fn expect_write(modem: &MockHandle, payload: &str) {
    let wanted = at_send(payload);
    let found = modem.wait_for_write(WAIT, |l| l == wanted).await;
    assert!(found.is_some(), "never wrote '{}'; wrote {:?}", wanted, modem.written_lines());
}

async fn wait_snapshot<F>(handle: &SessionHandle, pred: F) -> SessionSnapshot
where
    F: Fn(&SessionSnapshot) -> bool,
{
    let mut rx = handle.subscribe();
    let waited = tokio::time::timeout(WAIT, async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&*snap) {
                    return (*snap).clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    })
    .await;
    waited.expect("snapshot condition not reached")
}

async fn establish(handle: &SessionHandle, modem: &MockHandle) {
    assert!(handle.wait_for_state(SessionState::Listen, WAIT).await);
    modem.push_line(&rcv("0 0 SYN"));
    expect_write(modem, "0 1 ACK").await;
    modem.push_line(&rcv("1 1 ACK"));
    assert!(handle.wait_for_state(SessionState::Established, WAIT).await);
}

#[tokio::test]
async fn handshake_command_and_teardown() {
    let (link, modem) = modem_that_says_ok();
    let (handle, SessionChannels { mut events, mut frames }) =
        assert_ok!(SessionHandle::open_with_link(Box::new(link), &test_config()).await);

    assert_eq!(
        &modem.written_lines()[..6],
        ["AT", "AT+PARAMETER=12,7,2,5", "AT+IPR=115200", "AT+BAND=915000000", "AT+NETWORKID=5", "AT+ADDRESS=101"]
    );

    establish(&handle, &modem).await;
    let snap = handle.snapshot();
    assert_eq!((snap.seq_num, snap.ack_num), (1, 1));

    assert_ok!(handle.enqueue_command(Command::blind_drive(1.0, 2.0).unwrap()));
    wait_snapshot(&handle, |s| s.pending_commands == 1).await;
    modem.push_line(&rcv("1 2 ACK"));
    expect_write(&modem, "2 2 CMD BD [Lat:1.0][Long:2.0]").await;

    modem.push_line("+RCV=102,41,2 3 ACK DRIVING 1.0 2.0 0.0 28.6 -81.2 10.0,-37,6");
    expect_write(&modem, "3 3 ACK").await;
    let snap = handle.snapshot();
    assert_eq!(snap.last_rssi, Some(-37));
    assert_eq!(snap.last_telemetry.as_ref().map(|t| t.vehicle_state.as_str()), Some("DRIVING"));

    assert_ok!(handle.request_close());
    wait_snapshot(&handle, |s| s.close_requested).await;
    modem.push_line(&rcv("3 4 ACK"));
    expect_write(&modem, "4 4 FIN").await;
    assert!(handle.wait_for_state(SessionState::FinWait, WAIT).await);

    modem.push_line(&rcv("4 5 FIN"));
    expect_write(&modem, "5 5 ACK").await;
    assert!(handle.wait_for_state(SessionState::Closed, WAIT).await);
    let snap = handle.snapshot();
    assert_eq!((snap.seq_num, snap.ack_num), (0, 0));

    handle.shutdown(WAIT).await;

    let mut states = Vec::new();
    let mut delivered = Vec::new();
    let mut telemetry = 0;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { to, .. } => states.push(to),
            SessionEvent::CommandDelivered(cmd) => delivered.push(cmd),
            SessionEvent::Telemetry(_) => telemetry += 1,
            SessionEvent::Error { kind, detail } => panic!("unexpected error {}: {}", kind, detail),
        }
    }
    assert_eq!(
        states,
        vec![
            SessionState::Listen,
            SessionState::SynReceived,
            SessionState::Established,
            SessionState::FinWait,
            SessionState::TimeWait,
            SessionState::Closed,
        ]
    );
    assert_eq!(delivered, vec![Command::blind_drive(1.0, 2.0).unwrap()]);
    assert_eq!(telemetry, 1);

    let mut saw_syn = false;
    while let Ok(record) = frames.try_recv() {
        if record.direction == Direction::Received && record.raw == rcv("0 0 SYN") {
            saw_syn = true;
        }
    }
    assert!(saw_syn, "SYN missing from frame records");
}

#[tokio::test]
async fn mismatched_ack_gets_identical_retransmission() {
    let (link, modem) = modem_that_says_ok();
    let (handle, _channels) = assert_ok!(SessionHandle::open_with_link(Box::new(link), &test_config()).await);
    establish(&handle, &modem).await;

    modem.push_line(&rcv("1 2 ACK"));
    expect_write(&modem, "2 2 ACK").await;
    modem.clear_written();
    modem.push_line(&rcv("1 2 ACK"));
    expect_write(&modem, "2 2 ACK").await;
    assert_eq!(handle.state(), SessionState::Established);

    handle.shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn foreign_and_malformed_frames_are_dropped() {
    let (link, modem) = modem_that_says_ok();
    let (handle, _channels) = assert_ok!(SessionHandle::open_with_link(Box::new(link), &test_config()).await);
    assert!(handle.wait_for_state(SessionState::Listen, WAIT).await);

    let before = metrics::snapshot().malformed_dropped;
    modem.push_line("+RCV=7,7,0 0 SYN,-40,9");
    modem.push_line(&rcv("hello there"));
    modem.push_line("+READY");
    wait_snapshot(&handle, |s| s.last_rssi.is_some()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(handle.state(), SessionState::Listen);
    assert!(metrics::snapshot().malformed_dropped > before);
    assert!(!modem.written_lines().iter().any(|l| l.starts_with("AT+SEND")));

    handle.shutdown(WAIT).await;
}

#[tokio::test]
async fn stalled_link_closes_with_error() {
    let mut cfg = test_config();
    cfg.session.max_retransmits = 2;
    let (link, modem) = modem_that_says_ok();
    let (handle, SessionChannels { mut events, .. }) =
        assert_ok!(SessionHandle::open_with_link(Box::new(link), &cfg).await);
    establish(&handle, &modem).await;

    for _ in 0..3 {
        modem.push_line(&rcv("9 9 ACK"));
    }
    assert!(handle.wait_for_state(SessionState::Closed, WAIT).await);

    let mut stalled = false;
    while let Some(event) = events.recv().await {
        if let SessionEvent::Error { kind: ErrorKind::LinkStalled, .. } = event {
            stalled = true;
        }
    }
    assert!(stalled);
    let finished = tokio::time::timeout(WAIT, async {
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert_ok!(finished);
}

#[tokio::test]
async fn close_before_handshake_finishes_immediately() {
    let (link, _modem) = modem_that_says_ok();
    let (handle, _channels) = assert_ok!(SessionHandle::open_with_link(Box::new(link), &test_config()).await);
    assert!(handle.wait_for_state(SessionState::Listen, WAIT).await);

    assert_ok!(handle.request_close());
    assert!(handle.wait_for_state(SessionState::Closed, WAIT).await);
    let closed = handle.subscribe();
    handle.shutdown(WAIT).await;
    assert_eq!(closed.borrow().state, SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn time_wait_holds_for_the_quiet_period() {
    const QUIET: Duration = Duration::from_secs(5);
    let mut cfg = test_config();
    cfg.session.time_wait_ms = QUIET.as_millis() as u64;
    let (link, modem) = modem_that_says_ok();
    let (handle, _channels) = assert_ok!(SessionHandle::open_with_link(Box::new(link), &cfg).await);
    establish(&handle, &modem).await;

    assert_ok!(handle.request_close());
    wait_snapshot(&handle, |s| s.close_requested).await;
    modem.push_line(&rcv("1 2 ACK"));
    expect_write(&modem, "2 2 FIN").await;
    modem.push_line(&rcv("2 3 FIN"));
    expect_write(&modem, "3 3 ACK").await;
    assert!(handle.wait_for_state(SessionState::TimeWait, WAIT).await);
    let entered = tokio::time::Instant::now();

    tokio::time::sleep(QUIET - Duration::from_millis(200)).await;
    assert_eq!(handle.state(), SessionState::TimeWait);

    assert!(handle.wait_for_state(SessionState::Closed, WAIT).await);
    assert!(entered.elapsed() >= QUIET - Duration::from_millis(50));
    let snap = handle.snapshot();
    assert_eq!((snap.seq_num, snap.ack_num), (0, 0));
    handle.shutdown(WAIT).await;
}

#[tokio::test]
async fn cancelled_session_still_reports_closed() {
    let (link, modem) = modem_that_says_ok();
    let (handle, SessionChannels { mut events, .. }) =
        assert_ok!(SessionHandle::open_with_link(Box::new(link), &test_config()).await);
    establish(&handle, &modem).await;

    // the rover never answers, so the graceful close cannot finish
    let observer = handle.subscribe();
    handle.shutdown(Duration::from_millis(50)).await;

    let last = observer.borrow().clone();
    assert_eq!(last.state, SessionState::Closed);
    assert_eq!((last.seq_num, last.ack_num), (0, 0));
    assert!(!last.close_requested);

    let mut closed_from = None;
    while let Some(event) = events.recv().await {
        if let SessionEvent::StateChanged { from, to: SessionState::Closed } = event {
            closed_from = Some(from);
        }
    }
    assert_eq!(closed_from, Some(SessionState::Established));
}

#[tokio::test]
async fn dropped_handle_releases_a_silent_session() {
    let mut cfg = test_config();
    cfg.session.close_timeout_ms = 100;
    let (link, modem) = modem_that_says_ok();
    let (handle, SessionChannels { mut events, .. }) =
        assert_ok!(SessionHandle::open_with_link(Box::new(link), &cfg).await);
    establish(&handle, &modem).await;

    let mut observer = handle.subscribe();
    drop(handle);

    let closed = tokio::time::timeout(WAIT, observer.wait_for(|s| s.state == SessionState::Closed)).await;
    assert!(matches!(closed, Ok(Ok(_))), "session never closed after its handle was dropped");
    // the loop is gone once every event sender has been dropped
    let drained = tokio::time::timeout(WAIT, async { while events.recv().await.is_some() {} }).await;
    assert_ok!(drained);
    assert!(!modem.written_lines().iter().any(|l| l.ends_with("FIN")));
}

#[tokio::test]
async fn bring_up_stops_at_rejected_setting() {
    let (link, modem) = MockLink::new();
    modem.set_responder(|line| {
        if line.starts_with("AT+BAND") {
            vec!["+ERR=5".into()]
        } else {
            vec!["+OK".into()]
        }
    });
    match SessionHandle::open_with_link(Box::new(link), &test_config()).await {
        Err(Error::ModemRejected(code)) => assert_eq!(code, "5"),
        Err(other) => panic!("expected ModemRejected, got {}", other),
        Ok(_) => panic!("bring-up succeeded against a rejecting modem"),
    }
    let written = modem.written_lines();
    assert_eq!(written.last().map(String::as_str), Some("AT+BAND=915000000"));
    assert!(!written.iter().any(|l| l.starts_with("AT+NETWORKID")));
}

#[tokio::test]
async fn configure_radio_can_be_skipped() {
    let mut cfg = test_config();
    cfg.session.configure_radio = false;
    let (link, modem) = modem_that_says_ok();
    let (handle, _channels) = assert_ok!(SessionHandle::open_with_link(Box::new(link), &cfg).await);
    assert_eq!(modem.written_lines(), vec!["AT".to_string()]);
    handle.abort();
}
