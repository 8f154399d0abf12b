// Chain packet format
//
// Packet format (little-endian):
// [MAGIC, HEAD_CK, BODY_CK, ADDRESS, ID[4], OPCODE, LEN[2], Payload...]
// HEAD_CK is the additive sum of bytes 2..11 (body checksum through length),
// BODY_CK the additive sum of the payload.

use crate::command::Id;
use crate::command::codec::PRE_CHAIN;
use crate::config::CHAIN_BUFFER_SIZE;
use crate::error::{Error, Result};

pub const MAGIC: u8 = 0xAB;
pub const HEADER_LEN: usize = 11;
/// Largest packet a receiving board can hold in its input buffer
pub const MAX_PACKET: usize = CHAIN_BUFFER_SIZE;
pub const MAX_PAYLOAD: usize = MAX_PACKET - HEADER_LEN;

/// Address a board consumes as its own
pub const ADDR_SELF: u8 = 0x00;
/// Address of packets travelling back to the master; every hop decrements it
pub const ADDR_UPSTREAM: u8 = 0xFF;

// Chain control opcodes share the reserved precondition class
pub const OP_PING: u8 = PRE_CHAIN | 0x00;
pub const OP_ACK: u8 = PRE_CHAIN | 0x01;
pub const OP_SYNC: u8 = PRE_CHAIN | 0x02;
pub const OP_CONFIG: u8 = PRE_CHAIN | 0x03; // slave -> master, MotorConfig JSON
pub const OP_STATE: u8 = PRE_CHAIN | 0x04; // slave -> master, SlaveState JSON
pub const OP_EMPTY: u8 = PRE_CHAIN | 0x05; // [queue]
pub const OP_ESTOP: u8 = PRE_CHAIN | 0x06; // [hiz, soft]
pub const OP_COPY: u8 = PRE_CHAIN | 0x07; // [dst, src]
pub const OP_SAVE: u8 = PRE_CHAIN | 0x08; // [queue]
pub const OP_LOAD: u8 = PRE_CHAIN | 0x09; // [queue]

/// Ack status byte for an accepted request
pub const ACK_OK: u8 = 0;

pub fn is_control(opcode: u8) -> bool {
    opcode & PRE_CHAIN == PRE_CHAIN
}

/// Additive 8-bit checksum
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Fixed-size packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub head_ck: u8,
    pub body_ck: u8,
    pub address: u8,
    pub id: Id,
    pub opcode: u8,
    pub length: u16,
}

impl Header {
    /// Parse the header at the front of `bytes`; no checksum verification
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN || bytes[0] != MAGIC {
            return None;
        }
        Some(Self {
            head_ck: bytes[1],
            body_ck: bytes[2],
            address: bytes[3],
            id: Id::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            opcode: bytes[8],
            length: u16::from_le_bytes([bytes[9], bytes[10]]),
        })
    }

    pub fn packet_len(&self) -> usize {
        HEADER_LEN + self.length as usize
    }
}

/// A decoded or outgoing chain packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub address: u8,
    pub id: Id,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(address: u8, id: Id, opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            address,
            id,
            opcode,
            payload,
        }
    }

    /// Append the wire form. Nothing is written when the packet would not fit
    /// a receiver's input buffer.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let payload = self.payload.as_slice();
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::MalformedCommand {
                opcode: self.opcode,
                reason: format!(
                    "{} byte packet exceeds the {} byte chain buffer",
                    HEADER_LEN + payload.len(),
                    MAX_PACKET
                ),
            });
        }
        let start = out.len();

        out.push(MAGIC);
        out.push(0); // head checksum, filled below
        out.push(checksum8(payload));
        out.push(self.address);
        out.extend_from_slice(&self.id.to_le_bytes());
        out.push(self.opcode);
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out[start + 1] = checksum8(&out[start + 2..start + HEADER_LEN]);
        out.extend_from_slice(payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.encode(&mut out)?;
        Ok(out)
    }
}
