// Error taxonomy and the process-wide "last error" record polled by front-ends

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::Id;

/// Errors raised by the queue engine and the chain transport
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Queue {queue} full: {required} bytes required, {available} available")]
    QueueCapacityExceeded {
        queue: usize,
        required: usize,
        available: usize,
    },

    #[error("No such queue: {queue}")]
    NoSuchQueue { queue: usize },

    #[error("Malformed command (opcode 0x{opcode:02X}): {reason}")]
    MalformedCommand { opcode: u8, reason: String },

    #[error("Unknown opcode 0x{opcode:02X}")]
    UnknownOpcode { opcode: u8 },

    #[error("{section:?} checksum mismatch: expected 0x{expected:02X}, computed 0x{computed:02X}")]
    ChecksumMismatch {
        section: ChecksumSection,
        expected: u8,
        computed: u8,
    },

    #[error("Acknowledgement for {id} never arrived (received ack for {received})")]
    AcknowledgementMismatch { id: Id, received: Id },

    #[error("Chain input buffer overflow ({len} bytes without a complete frame)")]
    InputBufferOverflow { len: usize },

    #[error("Storage error for {key}: {reason}")]
    Storage { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSection {
    Head,
    Body,
}

/// Serializable error class, also carried as the status byte of chain acks
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueueCapacityExceeded = 1,
    NoSuchQueue = 2,
    MalformedCommand = 3,
    UnknownOpcode = 4,
    ChecksumMismatch = 5,
    AcknowledgementMismatch = 6,
    InputBufferOverflow = 7,
    Storage = 8,
}

impl ErrorKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::QueueCapacityExceeded,
            2 => Self::NoSuchQueue,
            3 => Self::MalformedCommand,
            4 => Self::UnknownOpcode,
            5 => Self::ChecksumMismatch,
            6 => Self::AcknowledgementMismatch,
            7 => Self::InputBufferOverflow,
            8 => Self::Storage,
            _ => return None,
        })
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::QueueCapacityExceeded { .. } => ErrorKind::QueueCapacityExceeded,
            Error::NoSuchQueue { .. } => ErrorKind::NoSuchQueue,
            Error::MalformedCommand { .. } => ErrorKind::MalformedCommand,
            Error::UnknownOpcode { .. } => ErrorKind::UnknownOpcode,
            Error::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Error::AcknowledgementMismatch { .. } => ErrorKind::AcknowledgementMismatch,
            Error::InputBufferOverflow { .. } => ErrorKind::InputBufferOverflow,
            Error::Storage { .. } => ErrorKind::Storage,
        }
    }

    /// Optional numeric argument stored alongside the error record
    pub fn arg(&self) -> Option<u32> {
        match self {
            Error::QueueCapacityExceeded { queue, .. } | Error::NoSuchQueue { queue } => {
                Some(*queue as u32)
            }
            Error::MalformedCommand { opcode, .. } | Error::UnknownOpcode { opcode } => {
                Some(*opcode as u32)
            }
            Error::AcknowledgementMismatch { received, .. } => Some(*received),
            Error::InputBufferOverflow { len } => Some(*len as u32),
            Error::ChecksumMismatch { .. } | Error::Storage { .. } => None,
        }
    }
}

/// Which part of the board raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Command,
    Chain,
    Storage,
}

/// Most recent error, as polled by front-ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub subsystem: Subsystem,
    pub id: Id,
    pub kind: ErrorKind,
    pub arg: Option<u32>,
    pub when: u64,
}

#[derive(Debug, Default)]
pub struct ErrorState {
    last: Option<ErrorRecord>,
    count: u32,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, subsystem: Subsystem, id: Id, error: &Error, now: u64) {
        warn!("{:?} error on id {}: {}", subsystem, id, error);
        self.record_kind(subsystem, id, error.kind(), error.arg(), now);
    }

    pub fn record_kind(
        &mut self,
        subsystem: Subsystem,
        id: Id,
        kind: ErrorKind,
        arg: Option<u32>,
        now: u64,
    ) {
        self.count = self.count.wrapping_add(1);
        self.last = Some(ErrorRecord {
            subsystem,
            id,
            kind,
            arg,
            when: now,
        });
    }

    pub fn last(&self) -> Option<&ErrorRecord> {
        self.last.as_ref()
    }

    /// Total errors recorded since start-up
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_code_round_trip() {
        for code in 1..=8u8 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(9), None);
    }

    #[test]
    fn test_record_keeps_latest() {
        let mut errors = ErrorState::new();
        errors.record(Subsystem::Command, 4, &Error::NoSuchQueue { queue: 12 }, 10);
        errors.record(Subsystem::Chain, 7, &Error::UnknownOpcode { opcode: 0x1F }, 20);

        let last = errors.last().unwrap();
        assert_eq!(last.subsystem, Subsystem::Chain);
        assert_eq!(last.id, 7);
        assert_eq!(last.kind, ErrorKind::UnknownOpcode);
        assert_eq!(last.arg, Some(0x1F));
        assert_eq!(last.when, 20);
        assert_eq!(errors.count(), 2);
    }
}
