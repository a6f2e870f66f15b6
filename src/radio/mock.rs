//! In-memory serial link for exercising the channel, modem and session
//! without hardware.
//!
//! ```
//! use groundstation::radio::mock::MockLink;
//!
//! let (link, handle) = MockLink::new();
//! handle.set_responder(|line| if line.starts_with("AT") { vec!["+OK".into()] } else { vec![] });
//! # drop(link);
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::SerialLink;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    written: Vec<String>,
    responder: Option<Responder>,
    fail_writes: bool,
}

fn lock(state: &Arc<Mutex<MockState>>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The device side handed to a [`super::RadioChannel`].
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

/// The test side: feeds inbound lines and inspects what was written.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn new() -> (MockLink, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (MockLink { state: state.clone() }, MockHandle { state })
    }
}

impl MockHandle {
    /// Queue `line` followed by CR-LF as if the modem had emitted it.
    pub fn push_line(&self, line: &str) {
        let mut state = lock(&self.state);
        state.inbound.extend(line.as_bytes());
        state.inbound.extend(b"\r\n");
    }

    pub fn push_raw(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes);
    }

    /// Every write so far, CR-LF stripped, oldest first.
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.state).written.clone()
    }

    pub fn last_written(&self) -> Option<String> {
        lock(&self.state).written.last().cloned()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }

    /// Reply automatically to each written line with the lines `f` returns.
    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(f));
    }

    pub fn clear_responder(&self) {
        lock(&self.state).responder = None;
    }

    /// Make every subsequent write fail with a broken pipe.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Poll until a written line satisfies `pred`, or `within` elapses.
    pub async fn wait_for_write<P>(&self, within: Duration, mut pred: P) -> Option<String>
    where
        P: FnMut(&str) -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if let Some(found) = lock(&self.state).written.iter().find(|l| pred(l.as_str())).cloned() {
                return Some(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl SerialLink for MockLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(lock(&self.state).inbound.len() as u32)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock link write failure"));
        }
        let line = String::from_utf8_lossy(bytes).trim_end_matches(['\r', '\n']).to_string();
        let replies = match state.responder.as_mut() {
            Some(respond) => respond(&line),
            None => Vec::new(),
        };
        state.written.push(line);
        for reply in replies {
            state.inbound.extend(reply.as_bytes());
            state.inbound.extend(b"\r\n");
        }
        Ok(())
    }
}
