// Command codec
//
// Queue entry layout (little-endian, packed):
//   [id: u32][opcode: u8][body...]
// The three high bits of the opcode select the precondition class, the low
// bits select the variant. Body sizes are fixed per opcode except for
// set-configuration, which is [len: u16][utf-8 bytes; len][0x00].

use serde::{Deserialize, Serialize};

use super::Id;
use crate::error::{Error, Result};
use crate::motor::{Direction, PositionAction};

/// Size of the `{id, opcode}` header in front of every queued command
pub const HEADER_LEN: usize = 5;

// Precondition classes (high bits of the opcode)
pub const PRE_MASK: u8 = 0xE0;
pub const PRE_NONE: u8 = 0x00;
pub const PRE_NOT_BUSY: u8 = 0x20;
pub const PRE_STOPPED: u8 = 0x40;
pub const PRE_STATUS: u8 = 0x80;
pub const PRE_CHAIN: u8 = 0xE0; // reserved for chain control packets

// Opcode table
pub const OP_NOP: u8 = PRE_NONE | 0x00;
pub const OP_STOP: u8 = PRE_NONE | 0x01;
pub const OP_RUN: u8 = PRE_NONE | 0x02;
pub const OP_STEP_CLOCK: u8 = PRE_STOPPED | 0x03;
pub const OP_MOVE: u8 = PRE_STOPPED | 0x04;
pub const OP_GOTO: u8 = PRE_NOT_BUSY | 0x05;
pub const OP_GO_UNTIL: u8 = PRE_NONE | 0x06;
pub const OP_RELEASE_SWITCH: u8 = PRE_NOT_BUSY | 0x07;
pub const OP_GO_HOME: u8 = PRE_NOT_BUSY | 0x08;
pub const OP_GO_MARK: u8 = PRE_NOT_BUSY | 0x09;
pub const OP_RESET_POSITION: u8 = PRE_STOPPED | 0x0A;
pub const OP_SET_POSITION: u8 = PRE_NONE | 0x0B;
pub const OP_SET_MARK: u8 = PRE_NONE | 0x0C;
pub const OP_SET_CONFIG: u8 = PRE_STOPPED | 0x0D;
pub const OP_WAIT_NOT_BUSY: u8 = PRE_NOT_BUSY | 0x0E;
pub const OP_WAIT_STOPPED: u8 = PRE_STOPPED | 0x0F;
pub const OP_WAIT_MILLIS: u8 = PRE_NONE | 0x10;
pub const OP_WAIT_SWITCH: u8 = PRE_STATUS | 0x11;

/// Gate evaluated against live motor status before a command may dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    None,
    NotBusy,
    Stopped,
    Status,
}

impl Precondition {
    pub fn of(opcode: u8) -> Option<Self> {
        match opcode & PRE_MASK {
            PRE_NONE => Some(Self::None),
            PRE_NOT_BUSY => Some(Self::NotBusy),
            PRE_STOPPED => Some(Self::Stopped),
            PRE_STATUS => Some(Self::Status),
            _ => None,
        }
    }
}

/// A queued motion or configuration command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Nop,
    Stop {
        hiz: bool,
        soft: bool,
    },
    Run {
        dir: Direction,
        steps_per_sec: f32,
    },
    StepClock {
        dir: Direction,
    },
    Move {
        dir: Direction,
        microsteps: u32,
    },
    Goto {
        position: i32,
        #[serde(default)]
        dir: Option<Direction>,
    },
    GoUntil {
        action: PositionAction,
        dir: Direction,
        steps_per_sec: f32,
    },
    ReleaseSwitch {
        action: PositionAction,
        dir: Direction,
    },
    GoHome,
    GoMark,
    ResetPosition,
    SetPosition {
        position: i32,
    },
    SetMark {
        mark: i32,
    },
    SetConfig {
        config: String,
    },
    WaitNotBusy,
    WaitStopped,
    WaitMillis {
        millis: u32,
        // Stamped the first time the interpreter sees the command
        #[serde(skip)]
        started: Option<u64>,
    },
    WaitSwitch {
        closed: bool,
    },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Nop => OP_NOP,
            Command::Stop { .. } => OP_STOP,
            Command::Run { .. } => OP_RUN,
            Command::StepClock { .. } => OP_STEP_CLOCK,
            Command::Move { .. } => OP_MOVE,
            Command::Goto { .. } => OP_GOTO,
            Command::GoUntil { .. } => OP_GO_UNTIL,
            Command::ReleaseSwitch { .. } => OP_RELEASE_SWITCH,
            Command::GoHome => OP_GO_HOME,
            Command::GoMark => OP_GO_MARK,
            Command::ResetPosition => OP_RESET_POSITION,
            Command::SetPosition { .. } => OP_SET_POSITION,
            Command::SetMark { .. } => OP_SET_MARK,
            Command::SetConfig { .. } => OP_SET_CONFIG,
            Command::WaitNotBusy => OP_WAIT_NOT_BUSY,
            Command::WaitStopped => OP_WAIT_STOPPED,
            Command::WaitMillis { .. } => OP_WAIT_MILLIS,
            Command::WaitSwitch { .. } => OP_WAIT_SWITCH,
        }
    }

    pub fn precondition(&self) -> Precondition {
        // Every opcode in the table carries a valid class
        Precondition::of(self.opcode()).unwrap_or(Precondition::None)
    }

    pub fn wait_millis(millis: u32) -> Self {
        Command::WaitMillis {
            millis,
            started: None,
        }
    }

    /// Reject commands that cannot be represented on the wire
    pub fn check(&self) -> Result<()> {
        if let Command::SetConfig { config } = self {
            if config.len() > u16::MAX as usize {
                return Err(malformed(OP_SET_CONFIG, "configuration too long"));
            }
            if config.as_bytes().contains(&0) {
                return Err(malformed(OP_SET_CONFIG, "configuration contains NUL"));
            }
        }
        Ok(())
    }

    /// Encoded body length, header excluded
    pub fn body_len(&self) -> usize {
        match self {
            Command::Stop { .. } | Command::ReleaseSwitch { .. } => 2,
            Command::Run { .. } | Command::Move { .. } => 5,
            Command::StepClock { .. } | Command::WaitSwitch { .. } => 1,
            Command::Goto { .. } | Command::GoUntil { .. } => 6,
            Command::SetPosition { .. } | Command::SetMark { .. } => 4,
            Command::SetConfig { config } => 2 + config.len() + 1,
            Command::WaitMillis { .. } => 13,
            Command::Nop
            | Command::GoHome
            | Command::GoMark
            | Command::ResetPosition
            | Command::WaitNotBusy
            | Command::WaitStopped => 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }

    /// Append header and body
    pub fn encode(&self, id: Id, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len());
        out.extend_from_slice(&id.to_le_bytes());
        out.push(self.opcode());
        self.encode_body(out);
    }

    /// Append the body only (chain packets carry id and opcode in their own header)
    pub fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Command::Stop { hiz, soft } => {
                out.push(*hiz as u8);
                out.push(*soft as u8);
            }
            Command::Run { dir, steps_per_sec } => {
                out.push(*dir as u8);
                out.extend_from_slice(&steps_per_sec.to_le_bytes());
            }
            Command::StepClock { dir } => out.push(*dir as u8),
            Command::Move { dir, microsteps } => {
                out.push(*dir as u8);
                out.extend_from_slice(&microsteps.to_le_bytes());
            }
            Command::Goto { position, dir } => {
                out.push(dir.is_some() as u8);
                out.push(dir.map_or(0, |d| d as u8));
                out.extend_from_slice(&position.to_le_bytes());
            }
            Command::GoUntil {
                action,
                dir,
                steps_per_sec,
            } => {
                out.push(*action as u8);
                out.push(*dir as u8);
                out.extend_from_slice(&steps_per_sec.to_le_bytes());
            }
            Command::ReleaseSwitch { action, dir } => {
                out.push(*action as u8);
                out.push(*dir as u8);
            }
            Command::SetPosition { position } => out.extend_from_slice(&position.to_le_bytes()),
            Command::SetMark { mark } => out.extend_from_slice(&mark.to_le_bytes()),
            Command::SetConfig { config } => {
                out.extend_from_slice(&(config.len() as u16).to_le_bytes());
                out.extend_from_slice(config.as_bytes());
                out.push(0);
            }
            Command::WaitMillis { millis, started } => {
                out.extend_from_slice(&millis.to_le_bytes());
                out.push(started.is_some() as u8);
                out.extend_from_slice(&started.unwrap_or(0).to_le_bytes());
            }
            Command::WaitSwitch { closed } => out.push(*closed as u8),
            Command::Nop
            | Command::GoHome
            | Command::GoMark
            | Command::ResetPosition
            | Command::WaitNotBusy
            | Command::WaitStopped => {}
        }
    }

    /// Decode a body for `opcode`; the body must be exactly the declared size
    pub fn decode_body(opcode: u8, body: &[u8]) -> Result<Command> {
        let expected = body_len(opcode, body)?;
        if body.len() != expected {
            return Err(malformed(
                opcode,
                format!("body is {} bytes, expected {}", body.len(), expected),
            ));
        }

        let mut r = Reader::new(opcode, body);
        let command = match opcode {
            OP_NOP => Command::Nop,
            OP_STOP => Command::Stop {
                hiz: r.bool()?,
                soft: r.bool()?,
            },
            OP_RUN => Command::Run {
                dir: r.direction()?,
                steps_per_sec: r.f32()?,
            },
            OP_STEP_CLOCK => Command::StepClock {
                dir: r.direction()?,
            },
            OP_MOVE => Command::Move {
                dir: r.direction()?,
                microsteps: r.u32()?,
            },
            OP_GOTO => {
                let has_dir = r.bool()?;
                let dir = r.direction()?;
                Command::Goto {
                    position: r.i32()?,
                    dir: has_dir.then_some(dir),
                }
            }
            OP_GO_UNTIL => Command::GoUntil {
                action: r.action()?,
                dir: r.direction()?,
                steps_per_sec: r.f32()?,
            },
            OP_RELEASE_SWITCH => Command::ReleaseSwitch {
                action: r.action()?,
                dir: r.direction()?,
            },
            OP_GO_HOME => Command::GoHome,
            OP_GO_MARK => Command::GoMark,
            OP_RESET_POSITION => Command::ResetPosition,
            OP_SET_POSITION => Command::SetPosition { position: r.i32()? },
            OP_SET_MARK => Command::SetMark { mark: r.i32()? },
            OP_SET_CONFIG => {
                let len = r.u16()? as usize;
                let text = r.take(len)?;
                if r.u8()? != 0 {
                    return Err(malformed(opcode, "configuration is not NUL-terminated"));
                }
                let config = std::str::from_utf8(text)
                    .map_err(|_| malformed(opcode, "configuration is not UTF-8"))?;
                Command::SetConfig {
                    config: config.to_string(),
                }
            }
            OP_WAIT_NOT_BUSY => Command::WaitNotBusy,
            OP_WAIT_STOPPED => Command::WaitStopped,
            OP_WAIT_MILLIS => {
                let millis = r.u32()?;
                let has_started = r.bool()?;
                let started = r.u64()?;
                Command::WaitMillis {
                    millis,
                    started: has_started.then_some(started),
                }
            }
            OP_WAIT_SWITCH => Command::WaitSwitch { closed: r.bool()? },
            _ => return Err(Error::UnknownOpcode { opcode }),
        };
        Ok(command)
    }
}

/// Body length for `opcode`, reading the length prefix of variable-size bodies
pub fn body_len(opcode: u8, body: &[u8]) -> Result<usize> {
    Ok(match opcode {
        OP_NOP | OP_GO_HOME | OP_GO_MARK | OP_RESET_POSITION | OP_WAIT_NOT_BUSY
        | OP_WAIT_STOPPED => 0,
        OP_STOP | OP_RELEASE_SWITCH => 2,
        OP_RUN | OP_MOVE => 5,
        OP_STEP_CLOCK | OP_WAIT_SWITCH => 1,
        OP_GOTO | OP_GO_UNTIL => 6,
        OP_SET_POSITION | OP_SET_MARK => 4,
        OP_WAIT_MILLIS => 13,
        OP_SET_CONFIG => {
            if body.len() < 2 {
                return Err(malformed(opcode, "missing configuration length"));
            }
            2 + u16::from_le_bytes([body[0], body[1]]) as usize + 1
        }
        _ => return Err(Error::UnknownOpcode { opcode }),
    })
}

/// Read `{id, opcode}` at the front of `bytes`
pub fn peek_header(bytes: &[u8]) -> Option<(Id, u8)> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let id = Id::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Some((id, bytes[4]))
}

/// Decode the queue entry at the front of `bytes`, returning its byte span
pub fn decode_entry(bytes: &[u8]) -> Result<(Id, Command, usize)> {
    let (id, opcode) = peek_header(bytes).ok_or_else(|| malformed(0, "truncated header"))?;
    let rest = &bytes[HEADER_LEN..];
    let len = body_len(opcode, rest)?;
    if rest.len() < len {
        return Err(malformed(opcode, "truncated body"));
    }
    let command = Command::decode_body(opcode, &rest[..len])?;
    Ok((id, command, HEADER_LEN + len))
}

/// Check that `bytes` is a sequence of complete commands; returns the count
pub fn validate(bytes: &[u8]) -> Result<usize> {
    let mut offset = 0;
    let mut count = 0;
    while offset < bytes.len() {
        let (_, _, span) = decode_entry(&bytes[offset..])?;
        offset += span;
        count += 1;
    }
    Ok(count)
}

fn malformed(opcode: u8, reason: impl Into<String>) -> Error {
    Error::MalformedCommand {
        opcode,
        reason: reason.into(),
    }
}

/// Little-endian cursor over a command body
struct Reader<'a> {
    opcode: u8,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(opcode: u8, bytes: &'a [u8]) -> Self {
        Self {
            opcode,
            bytes,
            pos: 0,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(malformed(self.opcode, "truncated body"));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn direction(&mut self) -> Result<Direction> {
        let raw = self.u8()?;
        Direction::from_u8(raw)
            .ok_or_else(|| malformed(self.opcode, format!("invalid direction {}", raw)))
    }

    fn action(&mut self) -> Result<PositionAction> {
        let raw = self.u8()?;
        PositionAction::from_u8(raw)
            .ok_or_else(|| malformed(self.opcode, format!("invalid switch action {}", raw)))
    }
}
