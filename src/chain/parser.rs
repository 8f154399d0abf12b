// Chain frame parser
//
// Input bytes are appended as they arrive and scanned for packets:
// seek MAGIC -> verify header -> (relay or) wait for body -> verify body -> dispatch.
// A checksum failure shifts the window by one byte and resyncs. On a relaying
// board (any non-master) skipped bytes and packets for other boards are queued
// for forwarding instead of being dropped.

use tracing::debug;

use super::packet::{ADDR_SELF, HEADER_LEN, Header, checksum8};
use crate::command::Id;
use crate::error::{ChecksumSection, Error};

/// A packet addressed to this board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub id: Id,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Frame(Frame),
    /// Header of a packet being passed through to the next board
    /// (address as received, before decrementing)
    Relayed { address: u8, id: Id, opcode: u8 },
    Fault(Error),
}

pub struct FrameParser {
    relay: bool,
    buf: Vec<u8>,
    capacity: usize,
    passthrough: usize, // bytes of a relayed packet still to forward
    forward: Vec<u8>,
    checksum_failures: u32,
}

impl FrameParser {
    pub fn new(relay: bool, capacity: usize) -> Self {
        Self {
            relay,
            buf: Vec::with_capacity(capacity),
            capacity,
            passthrough: 0,
            forward: Vec::new(),
            checksum_failures: 0,
        }
    }

    /// Free space in the input buffer
    pub fn space(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True while a relayed packet is only partly forwarded
    pub fn relaying(&self) -> bool {
        self.passthrough > 0
    }

    /// Append input; returns how many bytes fitted
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    /// Header and body checksum failures seen since start-up
    pub fn checksum_failures(&self) -> u32 {
        self.checksum_failures
    }

    /// Bytes queued for the next board
    pub fn take_forward(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.forward)
    }

    /// Advance the state machine until it produces an event or needs more input
    pub fn next_event(&mut self) -> Option<Event> {
        loop {
            if self.passthrough > 0 {
                let n = self.passthrough.min(self.buf.len());
                if n == 0 {
                    return None;
                }
                self.skip(n);
                self.passthrough -= n;
                continue;
            }

            if self.buf.is_empty() {
                return None;
            }

            // Seeking sync
            match self.buf.iter().position(|&b| b == super::packet::MAGIC) {
                None => {
                    let n = self.buf.len();
                    self.skip(n);
                    return None;
                }
                Some(0) => {}
                Some(i) => self.skip(i),
            }

            // Header
            let Some(header) = Header::parse(&self.buf) else {
                return self.check_overflow();
            };
            let computed = checksum8(&self.buf[2..HEADER_LEN]);
            if computed != header.head_ck {
                self.resync(ChecksumSection::Head, header.head_ck, computed);
                continue;
            }

            // Not for us: patch the hop count and pass the packet along
            if self.relay && header.address != ADDR_SELF {
                self.buf[3] = header.address.wrapping_sub(1);
                self.buf[1] = header.head_ck.wrapping_sub(1);
                self.passthrough = header.packet_len();
                return Some(Event::Relayed {
                    address: header.address,
                    id: header.id,
                    opcode: header.opcode,
                });
            }

            // Body
            let total = header.packet_len();
            if self.buf.len() < total {
                return self.check_overflow();
            }
            let computed = checksum8(&self.buf[HEADER_LEN..total]);
            if computed != header.body_ck {
                self.resync(ChecksumSection::Body, header.body_ck, computed);
                continue;
            }

            let frame = Frame {
                address: header.address,
                id: header.id,
                opcode: header.opcode,
                payload: self.buf[HEADER_LEN..total].to_vec(),
            };
            self.buf.drain(..total);
            return Some(Event::Frame(frame));
        }
    }

    /// Not a real packet start: count it and shift the window by one byte
    fn resync(&mut self, section: ChecksumSection, expected: u8, computed: u8) {
        self.checksum_failures = self.checksum_failures.wrapping_add(1);
        let e = Error::ChecksumMismatch {
            section,
            expected,
            computed,
        };
        debug!("{}, resyncing", e);
        self.skip(1);
    }

    /// Remove `n` bytes from the front, forwarding them on a relaying board
    fn skip(&mut self, n: usize) {
        if self.relay {
            self.forward.extend_from_slice(&self.buf[..n]);
        }
        self.buf.drain(..n);
    }

    /// A full buffer that still lacks a complete frame can never make progress
    fn check_overflow(&mut self) -> Option<Event> {
        if self.buf.len() < self.capacity {
            return None;
        }
        let len = self.buf.len();
        self.buf.clear();
        Some(Event::Fault(Error::InputBufferOverflow { len }))
    }
}
