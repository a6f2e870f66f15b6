//! Application commands queued for delivery to the rover.

use std::fmt;

use crate::error::{Error, Result};
use crate::radio::codec::{CommandKind, MessageType};

/// Longest command text (`CMD <kind> [body]`) accepted; leaves header room
/// under the modem's 240-byte payload limit.
pub const MAX_COMMAND_TEXT: usize = 200;

/// A command before it is assigned seq/ack numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub body: Vec<String>,
}

/// Manual drive keys understood by the rover.
pub const MANUAL_KEYS: [char; 4] = ['w', 'a', 's', 'd'];

impl Command {
    /// Build a validated command.
    pub fn new(kind: CommandKind, body: Vec<String>) -> Result<Self> {
        let cmd = Command { kind, body };
        cmd.validate()?;
        Ok(cmd)
    }

    /// Blind-drive to a destination: `CMD BD [Lat:<lat>][Long:<long>]`.
    pub fn blind_drive(lat: f64, long: f64) -> Result<Self> {
        if !(lat.is_finite() && long.is_finite()) || lat.abs() > 90.0 || long.abs() > 180.0 {
            return Err(Error::InvalidCommand(format!("destination {}, {} is not a coordinate", lat, long)));
        }
        Self::new(CommandKind::BlindDrive, vec![format!("[Lat:{:?}][Long:{:?}]", lat, long)])
    }

    /// Abort a blind drive in progress.
    pub fn cancel_travel() -> Self {
        Command { kind: CommandKind::BlindDrive, body: vec!["Cancel".to_string()] }
    }

    /// One manual drive key on channel `MAN1` or `MAN2`.
    pub fn manual(kind: CommandKind, key: char) -> Result<Self> {
        if !matches!(kind, CommandKind::Manual1 | CommandKind::Manual2) {
            return Err(Error::InvalidCommand(format!("{} is not a manual drive channel", kind)));
        }
        let key = key.to_ascii_lowercase();
        if !MANUAL_KEYS.contains(&key) {
            return Err(Error::InvalidCommand(format!("'{}' is not a drive key (w/a/s/d)", key)));
        }
        Self::new(kind, vec![key.to_string()])
    }

    /// Parse one line of operator input.
    ///
    /// Accepted forms: `bd <lat> <long>`, `cancel`, `man1 <key>`, `man2 <key>`,
    /// and `raw <KIND> [args...]` for anything else the rover understands.
    pub fn parse_console(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let verb = words.next().map(str::to_ascii_lowercase).unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let coordinate = |s: &str| {
            s.parse::<f64>().map_err(|_| Error::InvalidCommand(format!("'{}' is not a number", s)))
        };
        match (verb.as_str(), args.as_slice()) {
            ("bd", [lat, long]) => Self::blind_drive(coordinate(*lat)?, coordinate(*long)?),
            ("cancel", []) => Ok(Self::cancel_travel()),
            ("man1", [key]) | ("man2", [key]) => {
                let kind = if verb == "man1" { CommandKind::Manual1 } else { CommandKind::Manual2 };
                let mut chars = key.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Self::manual(kind, c),
                    _ => Err(Error::InvalidCommand(format!("'{}' is not a single drive key", key))),
                }
            }
            ("raw", [kind, rest @ ..]) => {
                Self::new(CommandKind::from_tag(kind), rest.iter().map(|t| t.to_string()).collect())
            }
            ("", _) => Err(Error::InvalidCommand("empty command".into())),
            _ => Err(Error::InvalidCommand(format!("unrecognised command '{}'", line.trim()))),
        }
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::Command(self.kind.clone())
    }

    /// Command text as it appears after the seq/ack header.
    pub fn text(&self) -> String {
        self.to_string()
    }

    fn validate(&self) -> Result<()> {
        let tag = self.kind.tag();
        if !is_token(tag) {
            return Err(Error::InvalidCommand(format!("command kind '{}' is not a single token", tag)));
        }
        if let Some(bad) = self.body.iter().find(|t| !is_token(t)) {
            return Err(Error::InvalidCommand(format!("argument '{}' is empty or contains whitespace", bad.escape_debug())));
        }
        let len = self.text().len();
        if len > MAX_COMMAND_TEXT {
            return Err(Error::InvalidCommand(format!("command is {} bytes, limit is {}", len, MAX_COMMAND_TEXT)));
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_type())?;
        for token in &self.body {
            write!(f, " {}", token)?;
        }
        Ok(())
    }
}

// CR/LF would end the AT line early; commas are fine since the decoder keeps them
fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.chars().any(char::is_whitespace)
}
