//! AT-command framing and the logical message grammar carried inside it.
//!
//! Outbound frames are `AT+SEND=<address>,<len>,<payload>\r\n`. Inbound
//! notifications are `+RCV=<sender>,<len>,<payload>,<rssi>,<snr>`. The payload
//! itself is a space-separated logical message: `<seq> <ack> <TYPE> [args...]`.

use std::fmt;

use crate::error::{Error, Result};
use crate::telemetry::{TelemetrySample, TELEMETRY_FIELDS};

/// Prefix of an inbound radio notification.
pub const RCV_PREFIX: &str = "+RCV=";

/// Largest payload the modem accepts in one `AT+SEND`.
pub const MAX_PAYLOAD_LEN: usize = 240;

/// The unit the modem accepts and emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    pub address: u16,
    pub payload: String,
}

impl RadioFrame {
    pub fn new(address: u16, payload: impl Into<String>) -> Self {
        RadioFrame { address, payload: payload.into() }
    }

    /// Wire bytes for this frame. Deterministic, so a retransmission is byte-identical.
    pub fn encode(&self) -> Vec<u8> {
        encode_send(self.address, &self.payload)
    }
}

/// A decoded `+RCV=` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub frame: RadioFrame,
    pub length: usize,
    pub rssi: i32,
    pub snr: i32,
}

/// Application command families understood by the rover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    BlindDrive,
    Manual1,
    Manual2,
    Custom(String),
}

impl CommandKind {
    pub fn tag(&self) -> &str {
        match self {
            CommandKind::BlindDrive => "BD",
            CommandKind::Manual1 => "MAN1",
            CommandKind::Manual2 => "MAN2",
            CommandKind::Custom(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "BD" => CommandKind::BlindDrive,
            "MAN1" => CommandKind::Manual1,
            "MAN2" => CommandKind::Manual2,
            other => CommandKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Type tag of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Syn,
    Ack,
    Fin,
    Command(CommandKind),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Syn => f.write_str("SYN"),
            MessageType::Ack => f.write_str("ACK"),
            MessageType::Fin => f.write_str("FIN"),
            MessageType::Command(kind) => write!(f, "CMD {}", kind),
        }
    }
}

/// The seq/ack/type-tagged payload carried inside a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    pub seq: u32,
    pub ack: u32,
    pub kind: MessageType,
    pub body: Vec<String>,
    pub telemetry: Option<TelemetrySample>,
}

impl LogicalMessage {
    pub fn command_kind(&self) -> Option<&CommandKind> {
        match &self.kind {
            MessageType::Command(kind) => Some(kind),
            _ => None,
        }
    }
}

/// `AT+SEND=<address>,<len(payload)>,<payload>\r\n`. No escaping is performed.
pub fn encode_send(address: u16, payload: &str) -> Vec<u8> {
    format!("AT+SEND={},{},{}\r\n", address, payload.len(), payload).into_bytes()
}

/// Decode a `+RCV=` line. Anything else, or a line with missing fields, is `None`.
pub fn decode_received(line: &str) -> Option<ReceivedFrame> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(RCV_PREFIX)?;

    // sender and length from the left, rssi and snr from the right; the
    // payload keeps any commas of its own
    let mut head = rest.splitn(3, ',');
    let address: u16 = head.next()?.trim().parse().ok()?;
    let length: usize = head.next()?.trim().parse().ok()?;
    let tail = head.next()?;

    let mut back = tail.rsplitn(3, ',');
    let snr: i32 = back.next()?.trim().parse().ok()?;
    let rssi: i32 = back.next()?.trim().parse().ok()?;
    let payload = back.next()?;

    Some(ReceivedFrame {
        frame: RadioFrame::new(address, payload),
        length,
        rssi,
        snr,
    })
}

/// Parse a logical payload into a [`LogicalMessage`].
pub fn parse_logical(payload: &str) -> Result<LogicalMessage> {
    let tokens: Vec<&str> = payload.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(Error::MalformedMessage(format!("expected at least 3 tokens in '{}'", payload)));
    }
    let seq = parse_counter(tokens[0], "seq")?;
    let ack = parse_counter(tokens[1], "ack")?;

    let (kind, rest) = match tokens[2] {
        "SYN" => (MessageType::Syn, &tokens[3..]),
        "ACK" => (MessageType::Ack, &tokens[3..]),
        "FIN" => (MessageType::Fin, &tokens[3..]),
        "CMD" => {
            let tag = tokens
                .get(3)
                .ok_or_else(|| Error::MalformedMessage("CMD without a command kind".into()))?;
            (MessageType::Command(CommandKind::from_tag(tag)), &tokens[4..])
        }
        other => return Err(Error::MalformedMessage(format!("unknown message type '{}'", other))),
    };

    let (telemetry, body) = if kind == MessageType::Ack && rest.len() >= TELEMETRY_FIELDS {
        let sample = TelemetrySample::from_tokens(&rest[..TELEMETRY_FIELDS])
            .map_err(|field| Error::MalformedMessage(format!("telemetry field {} is not numeric", field)))?;
        (Some(sample), &rest[TELEMETRY_FIELDS..])
    } else {
        (None, rest)
    };

    Ok(LogicalMessage {
        seq,
        ack,
        kind,
        body: body.iter().map(|t| t.to_string()).collect(),
        telemetry,
    })
}

/// Inverse of [`parse_logical`]. Telemetry is never emitted by the console.
pub fn format_logical(seq: u32, ack: u32, kind: &MessageType, body: &[String]) -> String {
    let mut out = format!("{} {} {}", seq, ack, kind);
    for token in body {
        out.push(' ');
        out.push_str(token);
    }
    out
}

fn parse_counter(token: &str, name: &str) -> Result<u32> {
    token
        .parse::<u32>()
        .map_err(|_| Error::MalformedMessage(format!("{} '{}' is not a non-negative integer", name, token)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_send_counts_payload_bytes() {
        assert_eq!(encode_send(102, "0 1 ACK"), b"AT+SEND=102,7,0 1 ACK\r\n".to_vec());
        assert_eq!(RadioFrame::new(5, "").encode(), b"AT+SEND=5,0,\r\n".to_vec());
    }

    #[test]
    fn decode_received_fields() {
        let rcv = decode_received("+RCV=102,7,0 0 SYN,-42,11\r\n").expect("frame");
        assert_eq!(rcv.frame.address, 102);
        assert_eq!(rcv.length, 7);
        assert_eq!(rcv.frame.payload, "0 0 SYN");
        assert_eq!(rcv.rssi, -42);
        assert_eq!(rcv.snr, 11);
    }

    #[test]
    fn decode_received_keeps_commas_in_payload() {
        let rcv = decode_received("+RCV=102,9,a,b,c d e,-99,-3").expect("frame");
        assert_eq!(rcv.frame.payload, "a,b,c d e");
        assert_eq!(rcv.snr, -3);
    }

    #[test]
    fn decode_received_rejects_other_lines() {
        assert!(decode_received("+OK").is_none());
        assert!(decode_received("RCV=1,2,ab,3,4").is_none());
        assert!(decode_received("+RCV=102,7").is_none());
        assert!(decode_received("+RCV=102,7,0 0 SYN").is_none());
        assert!(decode_received("+RCV=rover,7,0 0 SYN,-40,9").is_none());
    }

    #[test]
    fn parse_syn() {
        let msg = parse_logical("0 0 SYN").unwrap();
        assert_eq!((msg.seq, msg.ack), (0, 0));
        assert_eq!(msg.kind, MessageType::Syn);
        assert!(msg.body.is_empty());
        assert!(msg.telemetry.is_none());
    }

    #[test]
    fn parse_ack_with_telemetry() {
        let msg = parse_logical("4 7 ACK DRIVING 1.0 2.0 0.5 28.6 -81.2 12.0").unwrap();
        let t = msg.telemetry.expect("telemetry");
        assert_eq!(t.vehicle_state, "DRIVING");
        assert_eq!(t.pos_z, 0.5);
        assert_eq!(t.lat, 28.6);
        assert!(msg.body.is_empty());
    }

    #[test]
    fn short_ack_tail_is_body_not_telemetry() {
        let msg = parse_logical("4 7 ACK IDLE 1.0").unwrap();
        assert!(msg.telemetry.is_none());
        assert_eq!(msg.body, vec!["IDLE".to_string(), "1.0".to_string()]);
    }

    #[test]
    fn parse_command() {
        let msg = parse_logical("3 5 CMD MAN2 w").unwrap();
        assert_eq!(msg.command_kind(), Some(&CommandKind::Manual2));
        assert_eq!(msg.body, vec!["w".to_string()]);
    }

    #[test]
    fn malformed_payloads() {
        for bad in ["", "0 0", "x 0 SYN", "0 -1 ACK", "0 0 PING", "0 0 CMD", "1 1 ACK S 1 2 3 lat 5 6"] {
            match parse_logical(bad) {
                Err(Error::MalformedMessage(_)) => {}
                other => panic!("expected MalformedMessage for '{}', got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn format_then_parse_reconstructs() {
        let cases = [
            (0, 1, MessageType::Ack, vec![]),
            (12, 40, MessageType::Fin, vec![]),
            (3, 3, MessageType::Command(CommandKind::BlindDrive), vec!["[Lat:1.0][Long:2.0]".to_string()]),
            (9, 2, MessageType::Command(CommandKind::Custom("LIGHTS".into())), vec!["on".to_string(), "2".to_string()]),
        ];
        for (seq, ack, kind, body) in cases {
            let text = format_logical(seq, ack, &kind, &body);
            let msg = parse_logical(&text).unwrap();
            assert_eq!((msg.seq, msg.ack, &msg.kind, &msg.body), (seq, ack, &kind, &body), "payload '{}'", text);
        }
    }
}
