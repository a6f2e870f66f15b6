//! Error types for the ground station link.
//!
//! Every fallible operation in the library returns [`Result<T>`]. Modem
//! exchange failures, protocol decode failures, and serial device failures
//! are all captured by [`Error`].

use std::fmt;

/// The error type for all link operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No modem reply arrived within the exchange window.
    #[error("timeout waiting for modem response")]
    Timeout,

    /// The modem replied, but not with a `+`-prefixed line.
    #[error("invalid modem response: {0}")]
    InvalidResponse(String),

    /// The modem answered a command with `+ERR=<code>`.
    #[error("modem rejected command: ERR={0}")]
    ModemRejected(String),

    /// An inbound payload did not parse into a logical message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The serial device could not be opened or claimed.
    #[error("serial port unavailable: {0}")]
    PortUnavailable(String),

    /// The peer never realigned its sequence numbers.
    #[error("link stalled after {attempts} retransmissions")]
    LinkStalled { attempts: u32 },

    /// An application command failed validation before being queued.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The channel or session has already been closed.
    #[error("not connected")]
    NotConnected,

    /// An underlying I/O error from the serial device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant of [`Error`], carried on error events delivered to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    InvalidResponse,
    ModemRejected,
    MalformedMessage,
    PortUnavailable,
    LinkStalled,
    InvalidCommand,
    NotConnected,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout => ErrorKind::Timeout,
            Error::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Error::ModemRejected(_) => ErrorKind::ModemRejected,
            Error::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Error::PortUnavailable(_) => ErrorKind::PortUnavailable,
            Error::LinkStalled { .. } => ErrorKind::LinkStalled,
            Error::InvalidCommand(_) => ErrorKind::InvalidCommand,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the caller can retry the operation on the same session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::InvalidResponse(_) | Error::ModemRejected(_) | Error::MalformedMessage(_)
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidResponse => "invalid-response",
            ErrorKind::ModemRejected => "modem-rejected",
            ErrorKind::MalformedMessage => "malformed-message",
            ErrorKind::PortUnavailable => "port-unavailable",
            ErrorKind::LinkStalled => "link-stalled",
            ErrorKind::InvalidCommand => "invalid-command",
            ErrorKind::NotConnected => "not-connected",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_timeout() {
        assert_eq!(Error::Timeout.to_string(), "timeout waiting for modem response");
    }

    #[test]
    fn error_display_link_stalled() {
        let e = Error::LinkStalled { attempts: 32 };
        assert_eq!(e.to_string(), "link stalled after 32 retransmissions");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn recoverable_kinds() {
        assert!(Error::Timeout.is_recoverable());
        assert!(Error::InvalidResponse("OK".into()).is_recoverable());
        assert!(!Error::PortUnavailable("/dev/ttyUSB0".into()).is_recoverable());
        assert!(!Error::LinkStalled { attempts: 1 }.is_recoverable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
