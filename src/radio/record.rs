//! Raw line records handed to the frame logger.

use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::mpsc;

/// Which way a line crossed the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// One line written to or read from the modem, as it appeared on the wire.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub timestamp: DateTime<Local>,
    pub direction: Direction,
    pub raw: String,
}

impl FrameRecord {
    pub fn new(direction: Direction, raw: impl Into<String>) -> Self {
        FrameRecord { timestamp: Local::now(), direction, raw: raw.into() }
    }
}

impl fmt::Display for FrameRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.direction {
            Direction::Sent => ">>",
            Direction::Received => "<<",
        };
        write!(f, "[{}]  {} {}", self.timestamp.format("%b %d %H:%M:%S"), arrow, self.raw.trim_end())
    }
}

/// Optional sender side of the frame-record channel.
#[derive(Debug, Clone, Default)]
pub struct FrameTap(Option<mpsc::UnboundedSender<FrameRecord>>);

impl FrameTap {
    pub fn new(tx: mpsc::UnboundedSender<FrameRecord>) -> Self {
        FrameTap(Some(tx))
    }

    pub fn disabled() -> Self {
        FrameTap(None)
    }

    pub fn record(&self, direction: Direction, raw: &str) {
        if let Some(tx) = &self.0 {
            // receiver gone means nobody is logging any more
            let _ = tx.send(FrameRecord::new(direction, raw));
        }
    }
}
