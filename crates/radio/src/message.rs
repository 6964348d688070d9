//! Application messages carried in packet payloads.
//!
//! Payloads are comma separated ASCII. A leading `B` or `T` field marks a
//! broadcast probe or a time query, anything else is sensor data:
//!
//! ```text
//! B,<timestamp>,<node_id>,<seq>,<node_addr>
//! T,<node_addr>
//! 2024-01-09T09:58:05,21.4,55.0,3.71
//! ```
//!
//! Time query replies are binary: a 4-byte little-endian signed epoch.

use std::fmt;

use loralog_core::Timestamp;
use thiserror::Error;

use crate::Address;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("bad {field} field '{value}'")]
    BadField { field: &'static str, value: String },

    #[error("time reply must be 4 bytes, got {0}")]
    BadTimeReply(usize),

    #[error("epoch {0} does not fit the time reply")]
    EpochOutOfRange(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Data,
    Broadcast,
    TimeQuery,
}

impl MessageType {
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            MessageType::Data => None,
            MessageType::Broadcast => Some("B"),
            MessageType::TimeQuery => Some("T"),
        }
    }

    /// Classifies by the first field. Untagged payloads are data.
    pub fn classify(payload: &str) -> Self {
        match payload.split(',').next() {
            Some("B") => MessageType::Broadcast,
            Some("T") => MessageType::TimeQuery,
            _ => MessageType::Data,
        }
    }

    /// Prepends the tag, if any, to a type-specific body.
    pub fn frame(&self, body: &str) -> String {
        match (self.tag(), body.is_empty()) {
            (Some(tag), true) => tag.to_string(),
            (Some(tag), false) => format!("{},{}", tag, body),
            (None, _) => body.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastProbe {
    pub timestamp: Timestamp,
    pub node_id: String,
    pub seq: u32,
    pub node_addr: Option<Address>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Data(String),
    Broadcast(BroadcastProbe),
    TimeQuery { node_addr: Option<Address> },
}

fn field<'a>(it: &mut impl Iterator<Item = &'a str>, name: &'static str) -> Result<&'a str, WireError> {
    it.next().ok_or(WireError::MissingField(name))
}

fn parse_field<T: std::str::FromStr>(value: &str, name: &'static str) -> Result<T, WireError> {
    value.trim().parse().map_err(|_| WireError::BadField {
        field: name,
        value: value.to_string(),
    })
}

fn optional_addr(value: Option<&str>) -> Result<Option<Address>, WireError> {
    match value {
        Some(v) if !v.trim().is_empty() => parse_field(v, "node_addr").map(Some),
        _ => Ok(None),
    }
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Data(_) => MessageType::Data,
            Message::Broadcast(_) => MessageType::Broadcast,
            Message::TimeQuery { .. } => MessageType::TimeQuery,
        }
    }

    pub fn parse(payload: &str) -> Result<Self, WireError> {
        let kind = MessageType::classify(payload);
        let mut fields = payload.split(',').skip(1);
        match kind {
            MessageType::Data => Ok(Message::Data(payload.to_string())),
            MessageType::Broadcast => {
                let timestamp = parse_field(field(&mut fields, "timestamp")?, "timestamp")?;
                let node_id = field(&mut fields, "node_id")?.to_string();
                let seq = parse_field(field(&mut fields, "seq")?, "seq")?;
                let node_addr = optional_addr(fields.next())?;
                Ok(Message::Broadcast(BroadcastProbe {
                    timestamp,
                    node_id,
                    seq,
                    node_addr,
                }))
            }
            MessageType::TimeQuery => Ok(Message::TimeQuery {
                node_addr: optional_addr(fields.next())?,
            }),
        }
    }

    pub fn parse_bytes(payload: &[u8]) -> Result<Self, WireError> {
        std::str::from_utf8(payload)
            .map_err(|_| WireError::NotUtf8)
            .and_then(Self::parse)
    }

    /// Address the sender asked replies to go to, if it named one.
    pub fn reply_addr(&self) -> Option<Address> {
        match self {
            Message::Broadcast(probe) => probe.node_addr,
            Message::TimeQuery { node_addr } => *node_addr,
            Message::Data(_) => None,
        }
    }

    pub fn to_payload(&self) -> String {
        let addr = |a: &Option<Address>| a.map(|a| a.to_string()).unwrap_or_default();
        match self {
            Message::Data(body) => body.clone(),
            Message::Broadcast(p) => MessageType::Broadcast.frame(&format!(
                "{},{},{},{}",
                p.timestamp,
                p.node_id,
                p.seq,
                addr(&p.node_addr)
            )),
            Message::TimeQuery { node_addr } => MessageType::TimeQuery.frame(&addr(node_addr)),
        }
    }
}

/// A gateway's answer to a broadcast probe: the echoed sequence number and
/// the link quality the gateway observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeEcho {
    pub seq: u32,
    pub snr: f32,
    pub rssi: f32,
}

impl fmt::Display for ProbeEcho {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{:.1},{:.0}", self.seq, self.snr, self.rssi)
    }
}

impl ProbeEcho {
    pub fn parse(payload: &str) -> Result<Self, WireError> {
        let mut fields = payload.split(',');
        Ok(Self {
            seq: parse_field(field(&mut fields, "seq")?, "seq")?,
            snr: parse_field(field(&mut fields, "snr")?, "snr")?,
            rssi: parse_field(field(&mut fields, "rssi")?, "rssi")?,
        })
    }
}

pub fn encode_time_reply(epoch: i64) -> Result<[u8; 4], WireError> {
    i32::try_from(epoch)
        .map(i32::to_le_bytes)
        .map_err(|_| WireError::EpochOutOfRange(epoch))
}

pub fn decode_time_reply(bytes: &[u8]) -> Result<i64, WireError> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| WireError::BadTimeReply(bytes.len()))?;
    Ok(i32::from_le_bytes(raw) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(MessageType::classify("B,2024-01-09T09:58:05,ID1,7,3"), MessageType::Broadcast);
        assert_eq!(MessageType::classify("T,3"), MessageType::TimeQuery);
        assert_eq!(MessageType::classify("T"), MessageType::TimeQuery);
        assert_eq!(MessageType::classify("2024-01-09T09:58:05,21.4"), MessageType::Data);
        assert_eq!(MessageType::classify("Temp,12"), MessageType::Data);
        assert_eq!(MessageType::classify(""), MessageType::Data);
    }

    #[test]
    fn test_parse_broadcast() {
        let msg = Message::parse("B,2024-01-09T09:58:05,ID1,7,3").unwrap();
        assert_eq!(
            msg,
            Message::Broadcast(BroadcastProbe {
                timestamp: Timestamp::new(2024, 1, 9, 9, 58, 5),
                node_id: "ID1".to_string(),
                seq: 7,
                node_addr: Some(3),
            })
        );
        assert_eq!(msg.reply_addr(), Some(3));
        assert_eq!(msg.to_payload(), "B,2024-01-09T09:58:05,ID1,7,3");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Message::parse("B,2024-01-09T09:58:05,ID1"),
            Err(WireError::MissingField("seq"))
        );
        assert!(matches!(
            Message::parse("B,yesterday,ID1,7,3"),
            Err(WireError::BadField { field: "timestamp", .. })
        ));
        assert_eq!(Message::parse_bytes(&[0xff, 0xfe]), Err(WireError::NotUtf8));
    }

    #[test]
    fn test_time_query_forms() {
        assert_eq!(Message::parse("T").unwrap(), Message::TimeQuery { node_addr: None });
        assert_eq!(Message::parse("T,4").unwrap(), Message::TimeQuery { node_addr: Some(4) });
        assert_eq!(Message::TimeQuery { node_addr: None }.to_payload(), "T");
    }

    #[test]
    fn test_probe_echo() {
        let echo = ProbeEcho {
            seq: 7,
            snr: 9.3,
            rssi: -71.4,
        };
        assert_eq!(echo.to_string(), "7,9.3,-71");
        let back = ProbeEcho::parse("7,9.3,-71").unwrap();
        assert_eq!(back.seq, 7);
        assert!(ProbeEcho::parse("7").is_err());
    }

    #[test]
    fn test_time_reply() {
        let bytes = encode_time_reply(1_704_794_285).unwrap();
        assert_eq!(bytes, 1_704_794_285i32.to_le_bytes());
        assert_eq!(decode_time_reply(&bytes).unwrap(), 1_704_794_285);
        assert_eq!(decode_time_reply(&bytes[..3]), Err(WireError::BadTimeReply(3)));
        assert!(encode_time_reply(i64::MAX).is_err());
    }
}
