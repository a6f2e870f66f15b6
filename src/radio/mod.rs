//! Serial radio channel
//!
//! This module owns the physical link to the AT-command LoRa modem. Outbound
//! bytes are queued to a [`writer::SendWorker`] task so callers never block on
//! the device; inbound bytes are polled, split into CR-LF terminated lines and
//! handed back one at a time.

pub mod codec;
pub mod mock;
pub mod modem;
pub mod record;
mod writer;

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics;
use record::{Direction, FrameRecord, FrameTap};
use writer::SendWorker;

#[cfg(feature = "serial")]
use crate::config::SerialConfig;

const READ_CHUNK: usize = 1024;
/// Unterminated input kept while waiting for a newline.
const MAX_PARTIAL_LINE: usize = READ_CHUNK * 4;

/// Byte-level access to the modem's serial line.
///
/// Implemented for real serial ports and for [`mock::MockLink`].
pub trait SerialLink: Send {
    /// Bytes currently buffered by the driver and readable without blocking.
    fn bytes_to_read(&mut self) -> io::Result<u32>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[cfg(feature = "serial")]
impl SerialLink for Box<dyn serialport::SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        serialport::SerialPort::bytes_to_read(&**self).map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match io::Read::read(&mut **self, buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut **self, bytes)?;
        io::Write::flush(&mut **self)
    }
}

/// Link shared between the channel (reads) and its send worker (writes).
pub(crate) type SharedLink = Arc<Mutex<Box<dyn SerialLink>>>;

pub(crate) fn lock_link(link: &SharedLink) -> Result<MutexGuard<'_, Box<dyn SerialLink>>> {
    link.lock()
        .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::Other, "serial link lock poisoned")))
}

/// Names of the serial devices the OS reports.
#[cfg(feature = "serial")]
pub fn available_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(|e| Error::Io(io::Error::from(e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Frame-record tap plus the receiving end a logger should drain.
pub fn frame_channel() -> (FrameTap, mpsc::UnboundedReceiver<FrameRecord>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrameTap::new(tx), rx)
}

/// An open connection to the modem.
pub struct RadioChannel {
    link: SharedLink,
    outbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx_buf: Vec<u8>,
    lines: VecDeque<String>,
    tap: FrameTap,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl RadioChannel {
    /// Open the configured serial device: 1 stop bit, no parity.
    #[cfg(feature = "serial")]
    pub fn open(config: &SerialConfig, tap: FrameTap, poll_interval: Duration) -> Result<Self> {
        info!("Opening radio on {} at {} baud", config.port, config.baud_rate);
        let data_bits = match config.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(config.timeout())
            .open()
            .map_err(|e| Error::PortUnavailable(format!("{}: {}", config.port, e)))?;
        Ok(Self::from_link(Box::new(port), tap, poll_interval))
    }

    /// Build a channel over any [`SerialLink`] and start its send worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_link(link: Box<dyn SerialLink>, tap: FrameTap, poll_interval: Duration) -> Self {
        let link: SharedLink = Arc::new(Mutex::new(link));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = SendWorker::new(link.clone(), rx, tap.clone(), cancel.clone());
        let handle = tokio::spawn(worker.run());
        debug!("Radio channel ready (poll interval {:?})", poll_interval);
        RadioChannel {
            link,
            outbound: Some(tx),
            rx_buf: Vec::with_capacity(READ_CHUNK),
            lines: VecDeque::new(),
            tap,
            cancel,
            worker: Some(handle),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Token that stops the send worker when cancelled. Shared with the session loop.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue bytes for the send worker. Never blocks.
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(Error::NotConnected)?;
        tx.send(bytes).map_err(|_| Error::NotConnected)
    }

    /// Return one complete line if the device has delivered one, without waiting.
    ///
    /// The CR-LF terminator is stripped and blank lines are skipped.
    pub fn try_receive_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.lines.pop_front() {
            return Ok(Some(line));
        }
        if self.outbound.is_none() {
            return Err(Error::NotConnected);
        }

        let mut chunk = [0u8; READ_CHUNK];
        let read = {
            let mut link = lock_link(&self.link)?;
            let available = link.bytes_to_read()? as usize;
            if available == 0 {
                return Ok(None);
            }
            link.read(&mut chunk[..available.min(READ_CHUNK)])?
        };
        if read == 0 {
            return Ok(None);
        }
        trace!("read {} bytes from radio", read);
        self.rx_buf.extend_from_slice(&chunk[..read]);

        while let Some(pos) = self.rx_buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.rx_buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string();
            if line.trim().is_empty() {
                continue;
            }
            self.tap.record(Direction::Received, &line);
            metrics::inc_lines_received();
            self.lines.push_back(line);
        }
        if self.rx_buf.len() > MAX_PARTIAL_LINE {
            warn!("discarding {} bytes of unterminated radio input", self.rx_buf.len());
            self.rx_buf.clear();
        }
        Ok(self.lines.pop_front())
    }

    /// Wait up to `wait` for a line, polling every `poll_interval`.
    pub async fn recv_line(&mut self, wait: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(line) = self.try_receive_line()? {
                return Ok(Some(line));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Stop accepting sends, let queued writes drain, then release the device.
    pub async fn close(mut self) {
        self.outbound = None;
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Send worker ended abnormally: {}", e);
            }
        }
        debug!("Radio channel closed");
    }

    /// Stop the send worker immediately, discarding anything still queued.
    pub fn abort(mut self) {
        self.outbound = None;
        self.cancel.cancel();
        debug!("Radio channel aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockLink;
    use super::*;

    #[tokio::test]
    async fn splits_lines_and_skips_blanks() {
        let (link, handle) = MockLink::new();
        let mut channel = RadioChannel::from_link(Box::new(link), FrameTap::disabled(), Duration::from_millis(1));
        handle.push_raw(b"+OK\r\n\r\n+RCV=102,7,0 0 SYN,-40,9\r\n+REA");
        assert_eq!(channel.try_receive_line().unwrap().as_deref(), Some("+OK"));
        assert_eq!(channel.try_receive_line().unwrap().as_deref(), Some("+RCV=102,7,0 0 SYN,-40,9"));
        assert_eq!(channel.try_receive_line().unwrap(), None);
        handle.push_raw(b"DY\r\n");
        assert_eq!(channel.try_receive_line().unwrap().as_deref(), Some("+READY"));
        channel.close().await;
    }

    #[tokio::test]
    async fn close_drains_queued_writes() {
        let (link, handle) = MockLink::new();
        let (tap, mut frames) = frame_channel();
        let channel = RadioChannel::from_link(Box::new(link), tap, Duration::from_millis(1));
        channel.try_send(b"AT\r\n".to_vec()).unwrap();
        channel.try_send(b"AT+VER?\r\n".to_vec()).unwrap();
        channel.close().await;
        // close drains the queue before releasing the device
        assert_eq!(handle.written_lines(), vec!["AT".to_string(), "AT+VER?".to_string()]);
        let first = frames.recv().await.expect("record");
        assert_eq!(first.direction, Direction::Sent);
        assert_eq!(first.raw, "AT");
    }

    #[tokio::test]
    async fn try_send_fails_once_outbound_is_gone() {
        let (link, _handle) = MockLink::new();
        let mut channel = RadioChannel::from_link(Box::new(link), FrameTap::disabled(), Duration::from_millis(1));
        channel.outbound = None;
        assert!(matches!(channel.try_send(b"AT\r\n".to_vec()), Err(Error::NotConnected)));
        assert!(matches!(channel.try_receive_line(), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn unterminated_noise_is_discarded() {
        let (link, handle) = MockLink::new();
        let mut channel = RadioChannel::from_link(Box::new(link), FrameTap::disabled(), Duration::from_millis(1));
        handle.push_raw(&vec![b'~'; MAX_PARTIAL_LINE + 1]);
        // four full reads stay under the cap, the fifth pushes past it
        for _ in 0..5 {
            assert_eq!(channel.try_receive_line().unwrap(), None);
        }
        assert!(channel.rx_buf.is_empty());
        handle.push_raw(b"+OK\r\n");
        assert_eq!(channel.try_receive_line().unwrap().as_deref(), Some("+OK"));
        channel.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn recv_line_gives_up_after_wait() {
        let (link, _handle) = MockLink::new();
        let mut channel = RadioChannel::from_link(Box::new(link), FrameTap::disabled(), Duration::from_millis(10));
        let started = Instant::now();
        assert_eq!(channel.recv_line(Duration::from_millis(250)).await.unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(250));
        channel.abort();
    }
}
