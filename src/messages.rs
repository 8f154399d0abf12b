// Message types exchanged with front-ends over zenoh

use serde::{Deserialize, Serialize};

use crate::chain::ChainSnapshot;
use crate::command::{Command, CommandState, Id, LIVE, MotorSnapshot};
use crate::error::ErrorRecord;

fn live() -> usize {
    LIVE
}

// Request from teleop/scripts -> runtime
// `target` selects a chain slave (by index); absent means this board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Command {
        #[serde(default)]
        target: Option<u8>,
        #[serde(default = "live")]
        queue: usize,
        command: Command,
    },
    Empty {
        #[serde(default)]
        target: Option<u8>,
        #[serde(default = "live")]
        queue: usize,
    },
    Estop {
        #[serde(default)]
        target: Option<u8>,
        #[serde(default)]
        hiz: bool,
        #[serde(default)]
        soft: bool,
    },
    Copy {
        #[serde(default)]
        target: Option<u8>,
        dst: usize,
        src: usize,
    },
    Save {
        #[serde(default)]
        target: Option<u8>,
        queue: usize,
    },
    Load {
        #[serde(default)]
        target: Option<u8>,
        queue: usize,
    },
}

impl Request {
    pub fn target(&self) -> Option<u8> {
        match self {
            Request::Command { target, .. }
            | Request::Empty { target, .. }
            | Request::Estop { target, .. }
            | Request::Copy { target, .. }
            | Request::Save { target, .. }
            | Request::Load { target, .. } => *target,
        }
    }
}

/// A request with an optional client sequence number echoed in the receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

/// Synchronous result of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub seq: Option<u64>,
    pub ok: bool,
    pub id: Option<Id>, // command id assigned to the request, if any
    pub error: Option<String>,
}

impl Receipt {
    pub fn accepted(seq: Option<u64>, id: Option<Id>) -> Self {
        Self {
            seq,
            ok: true,
            id,
            error: None,
        }
    }

    pub fn rejected(seq: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            seq,
            ok: false,
            id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueUsage {
    pub len: usize,
    pub capacity: usize,
}

/// Periodic status published by the runtime
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: CommandState,
    pub motor: MotorSnapshot,
    pub error: Option<ErrorRecord>,
    pub error_count: u32,
    pub queues: Vec<QueueUsage>,
    pub chain: Option<ChainSnapshot>,
}
