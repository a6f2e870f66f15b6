//! Send worker: the only task that writes to the serial device.

use log::{debug, error, trace};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::record::{Direction, FrameTap};
use super::{lock_link, SharedLink};
use crate::metrics;

/// Drains the outbound queue in FIFO order until the queue closes or the
/// channel is cancelled.
pub(crate) struct SendWorker {
    link: SharedLink,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tap: FrameTap,
    cancel: CancellationToken,
}

impl SendWorker {
    pub(crate) fn new(
        link: SharedLink,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        tap: FrameTap,
        cancel: CancellationToken,
    ) -> Self {
        SendWorker { link, rx, tap, cancel }
    }

    pub(crate) async fn run(mut self) {
        debug!("Send worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("Send worker cancelled");
                    break;
                }
                next = self.rx.recv() => match next {
                    Some(bytes) => self.write(&bytes),
                    None => {
                        debug!("Outbound queue closed, send worker exiting");
                        break;
                    }
                },
            }
        }
    }

    fn write(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches(['\r', '\n']);
        let result = lock_link(&self.link).and_then(|mut link| link.write_all(bytes).map_err(Into::into));
        match result {
            Ok(()) => {
                trace!("radio << {}", line);
                self.tap.record(Direction::Sent, line);
                metrics::inc_frames_sent();
            }
            // a failed write is surfaced by the missing reply, not retried here
            Err(e) => error!("Serial write failed for '{}': {}", line, e),
        }
    }
}
