//! On-air packet layout: 4-byte header followed by the payload

use crate::{Address, RadioError};

pub const HEADER_LEN: usize = 4;

/// FIFO size of the transceiver minus the header.
pub const MAX_PAYLOAD: usize = 252;

pub const BROADCAST_ADDR: Address = 0xff;

pub const FLAG_ACK: u8 = 0x80;
pub const FLAG_RETRY: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub destination: Address,
    pub source: Address,
    pub packet_id: u8,
    pub flags: u8,
}

impl Header {
    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_retry(&self) -> bool {
        self.flags & FLAG_RETRY != 0
    }

    pub fn is_for(&self, addr: Address) -> bool {
        self.destination == addr || self.destination == BROADCAST_ADDR
    }

    /// Acknowledgement for this packet, sent back by `me`.
    pub fn ack_from(&self, me: Address) -> Header {
        Header {
            destination: self.source,
            source: me,
            packet_id: self.packet_id,
            flags: FLAG_ACK,
        }
    }
}

/// A framed packet. The payload cannot change once framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: Header,
    payload: Box<[u8]>,
}

impl Packet {
    pub fn new(header: Header, payload: impl Into<Vec<u8>>) -> Result<Self, RadioError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(RadioError::PacketTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            header,
            payload: payload.into_boxed_slice(),
        })
    }

    /// Empty acknowledgement for `received`, sent by `me`.
    pub fn ack(received: &Header, me: Address) -> Self {
        Self {
            header: received.ack_from(me),
            payload: Box::new([]),
        }
    }

    /// Same payload under different header flags, for retransmissions.
    pub fn with_flags(&self, flags: u8) -> Self {
        Self {
            header: Header { flags, ..self.header },
            payload: self.payload.clone(),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload.into_vec()
    }

    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&[h.destination, h.source, h.packet_id, h.flags]);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RadioError> {
        if bytes.len() < HEADER_LEN {
            return Err(RadioError::InvalidFrame);
        }
        let header = Header {
            destination: bytes[0],
            source: bytes[1],
            packet_id: bytes[2],
            flags: bytes[3],
        };
        Self::new(header, &bytes[HEADER_LEN..])
    }
}
