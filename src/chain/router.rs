// Chain router and acknowledgement correlator
//
// The chain is a ring: the master's TX feeds slave 0, each slave's TX feeds the
// next, and the last slave's TX feeds the master. Downstream packets carry the
// target slave index as hop count. Upstream packets start at ADDR_UPSTREAM and
// lose one per board they pass, so the master can tell where they came from.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::packet::*;
use super::parser::Frame;
use crate::command::{Command, CommandState, Engine, Id, MotorSnapshot};
use crate::config::{ACTIVE_TIMEOUT, PING_INTERVAL, SLAVE_CONFIG_INTERVAL, SLAVE_STATE_INTERVAL};
use crate::error::{Error, ErrorKind, ErrorRecord, Result, Subsystem};
use crate::motor::{MotorConfig, MotorDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Slave,
}

/// Live state a slave pushes to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveState {
    pub command: CommandState,
    pub motor: MotorSnapshot,
    pub error: Option<ErrorRecord>,
}

/// Master-side copy of what a slave last reported
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlaveShadow {
    pub config: Option<MotorConfig>,
    pub state: Option<SlaveState>,
    pub last_seen: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSnapshot {
    pub role: Role,
    pub active: bool,
    pub outstanding: usize,
    pub checksum_failures: u32,
    pub slaves: Vec<SlaveShadow>,
}

/// A decoded request addressed to this slave
#[derive(Debug)]
enum Request {
    Enqueue { queue: usize, command: Command },
    Empty { queue: usize },
    Estop { hiz: bool, soft: bool },
    Copy { dst: usize, src: usize },
    Save { queue: usize },
    Load { queue: usize },
}

fn millis(d: std::time::Duration) -> u64 {
    d.as_millis() as u64
}

fn wire_queue(queue: usize) -> Result<u8> {
    u8::try_from(queue).map_err(|_| Error::NoSuchQueue { queue })
}

pub struct Router {
    role: Role,
    outbox: Vec<u8>,
    outstanding: VecDeque<Id>,
    slaves: Vec<SlaveShadow>,
    active: bool,
    last_ping: Option<u64>,
    next_ping: u64,
    next_state: u64,
    next_config: u64,
}

impl Router {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            outbox: Vec::new(),
            outstanding: VecDeque::new(),
            slaves: Vec::new(),
            active: false,
            last_ping: None,
            next_ping: 0,
            next_state: 0,
            next_config: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Ids sent down the chain and not yet acknowledged, oldest first
    pub fn outstanding(&self) -> &VecDeque<Id> {
        &self.outstanding
    }

    pub fn slaves(&self) -> &[SlaveShadow] {
        &self.slaves
    }

    /// Packets built since the last flush
    pub fn take_outbox(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbox)
    }

    /// Build a packet into the outbox. On the master a non-zero id is tracked
    /// until its acknowledgement arrives; a packet that cannot be encoded is
    /// neither queued nor tracked.
    pub fn send(&mut self, address: u8, id: Id, opcode: u8, payload: Vec<u8>) -> Result<()> {
        Packet::new(address, id, opcode, payload).encode(&mut self.outbox)?;
        if self.role == Role::Master && id != 0 {
            self.outstanding.push_back(id);
        }
        Ok(())
    }

    // Pings, syncs, acks and snapshots nobody waits on
    fn send_untracked(&mut self, address: u8, id: Id, opcode: u8, payload: Vec<u8>) {
        if let Err(e) = self.send(address, id, opcode, payload) {
            warn!("Dropping 0x{:02X} packet: {}", opcode, e);
        }
    }

    /// Timers: keepalive pings (master), snapshots (slave), activity timeout
    pub fn tick<D: MotorDriver>(&mut self, engine: &mut Engine<D>, now: u64) {
        if self.active
            && self
                .last_ping
                .is_some_and(|seen| now.saturating_sub(seen) > millis(ACTIVE_TIMEOUT))
        {
            info!("Chain inactive: no ping for {}ms", millis(ACTIVE_TIMEOUT));
            self.active = false;
        }

        match self.role {
            Role::Master => {
                if now >= self.next_ping {
                    self.send_untracked(ADDR_UPSTREAM, 0, OP_PING, Vec::new());
                    self.next_ping = now + millis(PING_INTERVAL);
                }
            }
            Role::Slave => {
                if !self.active {
                    return;
                }
                if now >= self.next_state {
                    self.push_state(engine);
                    self.next_state = now + millis(SLAVE_STATE_INTERVAL);
                }
                if now >= self.next_config {
                    self.push_config(engine);
                    self.next_config = now + millis(SLAVE_CONFIG_INTERVAL);
                }
            }
        }
    }

    /// A packet for another board passed through this one
    pub fn on_relayed(&mut self, address: u8, id: Id, opcode: u8, now: u64) {
        if opcode == OP_PING {
            self.observe_ping(now);
        } else {
            debug!("Relayed 0x{:02X} (id {}, address {})", opcode, id, address);
        }
    }

    /// Dispatch a packet addressed to this board
    pub fn on_frame<D: MotorDriver>(&mut self, frame: Frame, engine: &mut Engine<D>, now: u64) {
        match self.role {
            Role::Master => self.master_dispatch(frame, engine, now),
            Role::Slave => self.slave_dispatch(frame, engine, now),
        }
    }

    fn observe_ping(&mut self, now: u64) {
        if !self.active {
            info!("Chain active");
        }
        self.active = true;
        self.last_ping = Some(now);
    }

    fn master_dispatch<D: MotorDriver>(&mut self, frame: Frame, engine: &mut Engine<D>, now: u64) {
        match frame.opcode {
            OP_PING => {
                self.observe_ping(now);
                let count = ADDR_UPSTREAM.wrapping_sub(frame.address) as usize;
                if count != self.slaves.len() {
                    info!("Chain topology changed: {} -> {} slave(s)", self.slaves.len(), count);
                    self.slaves = vec![SlaveShadow::default(); count];
                    for index in 0..count {
                        self.send_untracked(index as u8, 0, OP_SYNC, Vec::new());
                    }
                }
            }
            OP_ACK => {
                let status = frame.payload.first().copied().unwrap_or(ACK_OK);
                self.on_ack(frame.id, status, engine);
            }
            OP_STATE => match serde_json::from_slice::<SlaveState>(&frame.payload) {
                Ok(state) => {
                    if let Some(slave) = self.slave_mut(frame.address) {
                        slave.state = Some(state);
                        slave.last_seen = Some(now);
                    }
                }
                Err(e) => warn!("Bad state snapshot: {}", e),
            },
            OP_CONFIG => match serde_json::from_slice::<MotorConfig>(&frame.payload) {
                Ok(config) => {
                    if let Some(slave) = self.slave_mut(frame.address) {
                        slave.config = Some(config);
                        slave.last_seen = Some(now);
                    }
                }
                Err(e) => warn!("Bad config snapshot: {}", e),
            },
            opcode => debug!("Master ignoring opcode 0x{:02X}", opcode),
        }
    }

    /// Shadow entry of the slave an upstream packet came from
    fn slave_mut(&mut self, address: u8) -> Option<&mut SlaveShadow> {
        let hops = ADDR_UPSTREAM.wrapping_sub(address) as usize;
        let index = self.slaves.len().checked_sub(hops + 1);
        if index.is_none() {
            debug!("Upstream packet from unknown slave (address {})", address);
        }
        index.and_then(|i| self.slaves.get_mut(i))
    }

    /// Evict the outstanding list up to and including `id`; every id evicted
    /// before the match is reported as lost
    fn on_ack<D: MotorDriver>(&mut self, id: Id, status: u8, engine: &mut Engine<D>) {
        let now = engine.now();
        match self.outstanding.iter().position(|&pending| pending == id) {
            Some(pos) => {
                let lost: Vec<Id> = self.outstanding.drain(..=pos).take(pos).collect();
                for missing in lost {
                    engine.record_error(
                        missing,
                        &Error::AcknowledgementMismatch {
                            id: missing,
                            received: id,
                        },
                    );
                }
            }
            None => {
                warn!("Acknowledgement for unknown id {}", id);
                engine.errors_mut().record_kind(
                    Subsystem::Chain,
                    id,
                    ErrorKind::AcknowledgementMismatch,
                    Some(id),
                    now,
                );
            }
        }

        if status != ACK_OK {
            let kind = ErrorKind::from_code(status).unwrap_or(ErrorKind::MalformedCommand);
            warn!("Slave rejected {}: {:?}", id, kind);
            engine
                .errors_mut()
                .record_kind(Subsystem::Chain, id, kind, None, now);
        }
    }

    fn slave_dispatch<D: MotorDriver>(&mut self, frame: Frame, engine: &mut Engine<D>, now: u64) {
        match frame.opcode {
            OP_PING => {
                self.observe_ping(now);
                return;
            }
            OP_SYNC => {
                debug!("Sync requested, pushing snapshots");
                self.next_state = now;
                self.next_config = now;
                return;
            }
            _ => {}
        }

        let status = match Self::decode_request(&frame) {
            Ok(request) => match Self::apply(request, frame.id, engine) {
                Ok(()) => ACK_OK,
                Err(e) => e.kind().code(),
            },
            Err(e) => {
                engine.record_error(frame.id, &e);
                e.kind().code()
            }
        };

        if frame.id != 0 {
            self.send_untracked(ADDR_UPSTREAM, frame.id, OP_ACK, vec![status]);
        }
    }

    fn decode_request(frame: &Frame) -> Result<Request> {
        let arg = |i: usize| -> Result<u8> {
            frame.payload.get(i).copied().ok_or_else(|| Error::MalformedCommand {
                opcode: frame.opcode,
                reason: format!("payload too short ({} bytes)", frame.payload.len()),
            })
        };

        Ok(match frame.opcode {
            OP_EMPTY => Request::Empty {
                queue: arg(0)? as usize,
            },
            OP_ESTOP => Request::Estop {
                hiz: arg(0)? != 0,
                soft: arg(1)? != 0,
            },
            OP_COPY => Request::Copy {
                dst: arg(0)? as usize,
                src: arg(1)? as usize,
            },
            OP_SAVE => Request::Save {
                queue: arg(0)? as usize,
            },
            OP_LOAD => Request::Load {
                queue: arg(0)? as usize,
            },
            opcode if is_control(opcode) => return Err(Error::UnknownOpcode { opcode }),
            opcode => {
                let queue = arg(0)? as usize;
                let command = Command::decode_body(opcode, &frame.payload[1..])?;
                Request::Enqueue { queue, command }
            }
        })
    }

    /// Run a request against the local engine, which records its own failures
    fn apply<D: MotorDriver>(request: Request, id: Id, engine: &mut Engine<D>) -> Result<()> {
        debug!("Chain request {}: {:?}", id, request);
        match request {
            Request::Enqueue { queue, command } => engine.enqueue_with_id(queue, id, &command),
            Request::Empty { queue } => engine.empty(queue).map(|_| ()),
            Request::Estop { hiz, soft } => engine.estop(hiz, soft).map(|_| ()),
            Request::Copy { dst, src } => engine.copy(dst, src),
            Request::Save { queue } => engine.save(queue),
            Request::Load { queue } => engine.load(queue),
        }
    }

    fn push_state<D: MotorDriver>(&mut self, engine: &mut Engine<D>) {
        let state = SlaveState {
            command: engine.state(),
            motor: engine.motor_snapshot(),
            error: engine.errors().last().cloned(),
        };
        match serde_json::to_vec(&state) {
            Ok(payload) => self.send_untracked(ADDR_UPSTREAM, 0, OP_STATE, payload),
            Err(e) => warn!("Failed to encode state snapshot: {}", e),
        }
    }

    fn push_config<D: MotorDriver>(&mut self, engine: &mut Engine<D>) {
        match serde_json::to_vec(engine.config()) {
            Ok(payload) => self.send_untracked(ADDR_UPSTREAM, 0, OP_CONFIG, payload),
            Err(e) => warn!("Failed to encode config snapshot: {}", e),
        }
    }

    // Master remote API. Every request takes an id from the shared id space and
    // is tracked until the slave acknowledges it. A request that cannot be put
    // on the wire is returned as an error and recorded against its id.

    pub fn remote_command<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        queue: usize,
        command: &Command,
    ) -> Result<Id> {
        self.remote(engine, address, command.opcode(), || {
            let mut payload = vec![wire_queue(queue)?];
            command.check()?;
            command.encode_body(&mut payload);
            Ok(payload)
        })
    }

    pub fn remote_empty<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        queue: usize,
    ) -> Result<Id> {
        self.remote(engine, address, OP_EMPTY, || Ok(vec![wire_queue(queue)?]))
    }

    pub fn remote_estop<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        hiz: bool,
        soft: bool,
    ) -> Result<Id> {
        self.remote(engine, address, OP_ESTOP, || Ok(vec![hiz as u8, soft as u8]))
    }

    pub fn remote_copy<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        dst: usize,
        src: usize,
    ) -> Result<Id> {
        self.remote(engine, address, OP_COPY, || {
            Ok(vec![wire_queue(dst)?, wire_queue(src)?])
        })
    }

    pub fn remote_save<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        queue: usize,
    ) -> Result<Id> {
        self.remote(engine, address, OP_SAVE, || Ok(vec![wire_queue(queue)?]))
    }

    pub fn remote_load<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        queue: usize,
    ) -> Result<Id> {
        self.remote(engine, address, OP_LOAD, || Ok(vec![wire_queue(queue)?]))
    }

    fn remote<D: MotorDriver>(
        &mut self,
        engine: &mut Engine<D>,
        address: u8,
        opcode: u8,
        payload: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<Id> {
        let id = engine.allocate_id();
        let sent = payload().and_then(|payload| self.send(address, id, opcode, payload));
        match sent {
            Ok(()) => Ok(id),
            Err(e) => {
                engine.record_error(id, &e);
                Err(e)
            }
        }
    }
}
