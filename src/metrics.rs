//! Process-wide link counters.
//! Relaxed atomics only; read them together through [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};

static FRAMES_SENT: AtomicU64 = AtomicU64::new(0);
static LINES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static RETRANSMISSIONS: AtomicU64 = AtomicU64::new(0);
static MALFORMED_DROPPED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_DELIVERED: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_sent() { FRAMES_SENT.fetch_add(1, Ordering::Relaxed); }
pub fn inc_lines_received() { LINES_RECEIVED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_retransmissions() { RETRANSMISSIONS.fetch_add(1, Ordering::Relaxed); }
pub fn inc_malformed_dropped() { MALFORMED_DROPPED.fetch_add(1, Ordering::Relaxed); }
pub fn inc_commands_delivered() { COMMANDS_DELIVERED.fetch_add(1, Ordering::Relaxed); }

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Snapshot {
    pub frames_sent: u64,
    pub lines_received: u64,
    pub retransmissions: u64,
    pub malformed_dropped: u64,
    pub commands_delivered: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        frames_sent: FRAMES_SENT.load(Ordering::Relaxed),
        lines_received: LINES_RECEIVED.load(Ordering::Relaxed),
        retransmissions: RETRANSMISSIONS.load(Ordering::Relaxed),
        malformed_dropped: MALFORMED_DROPPED.load(Ordering::Relaxed),
        commands_delivered: COMMANDS_DELIVERED.load(Ordering::Relaxed),
    }
}
