// Scheduler loop: one cooperative tick per period
//
// Each tick drains zenoh requests into the engine (or down the chain), advances
// the simulated motor, runs the chain port and then the queue interpreter.
// Nothing here blocks; a command whose precondition is not met simply waits
// for a later tick.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{info, warn};

use crate::chain::{ChainPort, Role, SerialLink, SerialPortLink};
use crate::command::{Engine, Id, QueueSet};
use crate::config::{
    LIVE_QUEUE_SIZE, LOOP_HZ, NAMED_QUEUE_SIZE, STATE_PUBLISH_PERIOD, TOPIC_CMD, TOPIC_RECEIPT,
    TOPIC_STATE,
};
use crate::error::Result;
use crate::messages::{Envelope, QueueUsage, Receipt, Request, StatusReport};
use crate::motor::SimulatedDriver;
use crate::storage::FileStorage;

/// Start-up options, filled in from the command line
#[derive(Debug, Clone)]
pub struct Options {
    pub role: Option<Role>, // None runs without a chain link
    pub port: String,
    pub baud: u32,
    pub storage_dir: PathBuf,
    pub named_queues: usize,
}

pub struct Runtime<L: SerialLink> {
    engine: Engine<SimulatedDriver>,
    chain: Option<ChainPort<L>>,
    last_tick: u64,
}

impl<L: SerialLink> Runtime<L> {
    pub fn new(engine: Engine<SimulatedDriver>, chain: Option<ChainPort<L>>) -> Self {
        Self {
            engine,
            chain,
            last_tick: 0,
        }
    }

    pub fn engine(&self) -> &Engine<SimulatedDriver> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<SimulatedDriver> {
        &mut self.engine
    }

    pub fn chain_mut(&mut self) -> Option<&mut ChainPort<L>> {
        self.chain.as_mut()
    }

    /// Handle one request and build its receipt
    pub fn on_envelope(&mut self, envelope: Envelope) -> Receipt {
        info!("Received request: {:?}", &envelope.request);
        let seq = envelope.seq;
        let result = match envelope.request.target() {
            None => self.local(envelope.request).map_err(|e| e.to_string()),
            Some(address) => self.remote(address, envelope.request),
        };
        match result {
            Ok(id) => Receipt::accepted(seq, id),
            Err(reason) => Receipt::rejected(seq, reason),
        }
    }

    fn local(&mut self, request: Request) -> Result<Option<Id>> {
        let engine = &mut self.engine;
        match request {
            Request::Command { queue, command, .. } => engine.enqueue(queue, &command).map(Some),
            Request::Empty { queue, .. } => engine.empty(queue).map(Some),
            Request::Estop { hiz, soft, .. } => engine.estop(hiz, soft).map(Some),
            Request::Copy { dst, src, .. } => engine.copy(dst, src).map(|()| None),
            Request::Save { queue, .. } => engine.save(queue).map(|()| None),
            Request::Load { queue, .. } => engine.load(queue).map(|()| None),
        }
    }

    fn remote(&mut self, address: u8, request: Request) -> std::result::Result<Option<Id>, String> {
        let Some(chain) = self.chain.as_mut() else {
            return Err("no chain link".to_string());
        };
        if chain.router().role() != Role::Master {
            return Err("chain targets require the master role".to_string());
        }

        let engine = &mut self.engine;
        let router = chain.router_mut();
        let id = match request {
            Request::Command { queue, command, .. } => {
                router.remote_command(engine, address, queue, &command)
            }
            Request::Empty { queue, .. } => router.remote_empty(engine, address, queue),
            Request::Estop { hiz, soft, .. } => router.remote_estop(engine, address, hiz, soft),
            Request::Copy { dst, src, .. } => router.remote_copy(engine, address, dst, src),
            Request::Save { queue, .. } => router.remote_save(engine, address, queue),
            Request::Load { queue, .. } => router.remote_load(engine, address, queue),
        };
        id.map(Some).map_err(|e| e.to_string())
    }

    /// One scheduler pass at `now` milliseconds since start-up
    pub fn tick(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.last_tick);
        self.last_tick = now;
        self.engine.driver_mut().advance(elapsed);

        if let Some(chain) = self.chain.as_mut() {
            if let Err(e) = chain.tick(&mut self.engine, now) {
                warn!("Chain link error: {}", e);
            }
        }

        self.engine.run_once(now);
    }

    pub fn report(&mut self) -> StatusReport {
        let queues = self.engine.queues();
        let usage = (0..queues.count())
            .filter_map(|i| queues.get(i).ok())
            .map(|q| QueueUsage {
                len: q.len(),
                capacity: q.capacity(),
            })
            .collect();

        StatusReport {
            state: self.engine.state(),
            motor: self.engine.motor_snapshot(),
            error: self.engine.errors().last().cloned(),
            error_count: self.engine.errors().count(),
            queues: usage,
            chain: self.chain.as_ref().map(|c| c.snapshot()),
        }
    }
}

pub async fn run(options: Options) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let storage = FileStorage::open(&options.storage_dir)?;
    let queues = QueueSet::new(LIVE_QUEUE_SIZE, options.named_queues, NAMED_QUEUE_SIZE);
    let mut engine = Engine::with_queues(SimulatedDriver::new(), Box::new(storage), queues);
    if let Err(e) = engine.restore_config() {
        warn!("Keeping default motor configuration: {}", e);
    }

    let chain = match options.role {
        Some(role) => {
            info!("Opening chain link {} as {:?}", options.port, role);
            let link = SerialPortLink::open(&options.port, options.baud)?;
            Some(ChainPort::new(link, role))
        }
        None => None,
    };

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_receipt = session.declare_publisher(TOPIC_RECEIPT).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE).await?;

    let mut runtime = Runtime::new(engine, chain);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let started = Instant::now();
    let mut last_report = Instant::now();

    info!(
        "Runtime started: {}Hz loop, {} queue(s)",
        LOOP_HZ,
        options.named_queues + 1
    );
    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}, {}", TOPIC_RECEIPT, TOPIC_STATE);

    loop {
        tick.tick().await;

        // 1. Drain all pending requests (non-blocking), answer each one
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            let receipt = match serde_json::from_slice::<Envelope>(&payload) {
                Ok(envelope) => runtime.on_envelope(envelope),
                Err(e) => {
                    warn!("Failed to parse request: {}", e);
                    Receipt::rejected(None, e.to_string())
                }
            };
            pub_receipt.put(serde_json::to_string(&receipt)?).await?;
        }

        // 2. Motor, chain, queue interpreter
        runtime.tick(started.elapsed().as_millis() as u64);

        // 3. Publish status
        if last_report.elapsed() >= STATE_PUBLISH_PERIOD {
            last_report = Instant::now();
            let report_json = serde_json::to_string(&runtime.report())?;
            pub_state.put(report_json).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MemoryLink, Packet, packet};
    use crate::command::{Command, LIVE};
    use crate::motor::Direction;
    use crate::storage::MemoryStorage;

    fn runtime(role: Option<Role>) -> Runtime<MemoryLink> {
        let engine = Engine::new(SimulatedDriver::new(), Box::new(MemoryStorage::new()));
        let chain = role.map(|r| ChainPort::new(MemoryLink::new(), r));
        Runtime::new(engine, chain)
    }

    fn envelope(request: Request) -> Envelope {
        Envelope { seq: Some(1), request }
    }

    #[test]
    fn test_local_command_runs_on_tick() {
        let mut rt = runtime(None);
        let receipt = rt.on_envelope(envelope(Request::Command {
            target: None,
            queue: LIVE,
            command: Command::Run {
                dir: Direction::Forward,
                steps_per_sec: 100.0,
            },
        }));
        assert!(receipt.ok);
        let id = receipt.id.unwrap();

        rt.tick(0);
        assert_eq!(rt.engine().state().last_command, id);
        rt.tick(1000);
        assert_eq!(rt.report().motor.position, 100);
    }

    #[test]
    fn test_rejection_is_reported() {
        let mut rt = runtime(None);
        let receipt = rt.on_envelope(envelope(Request::Save {
            target: None,
            queue: 99,
        }));
        assert!(!receipt.ok);
        assert_eq!(receipt.seq, Some(1));
        assert!(receipt.error.unwrap().contains("99"));
    }

    #[test]
    fn test_remote_requires_master() {
        let mut rt = runtime(None);
        let receipt = rt.on_envelope(envelope(Request::Empty {
            target: Some(0),
            queue: LIVE,
        }));
        assert!(!receipt.ok);

        let mut rt = runtime(Some(Role::Slave));
        let receipt = rt.on_envelope(envelope(Request::Empty {
            target: Some(0),
            queue: LIVE,
        }));
        assert!(!receipt.ok);
    }

    #[test]
    fn test_remote_command_goes_down_the_chain() {
        let mut rt = runtime(Some(Role::Master));
        let receipt = rt.on_envelope(envelope(Request::Command {
            target: Some(1),
            queue: LIVE,
            command: Command::GoHome,
        }));
        let id = receipt.id.unwrap();

        rt.tick(0);
        let written = rt.chain_mut().unwrap().link_mut().take_written();
        let mut expected = Packet::new(1, id, Command::GoHome.opcode(), vec![0]).to_bytes().unwrap();
        expected.extend(Packet::new(packet::ADDR_UPSTREAM, 0, packet::OP_PING, Vec::new()).to_bytes().unwrap());
        assert_eq!(written, expected);
    }

    #[test]
    fn test_report_lists_queues() {
        let mut rt = runtime(None);
        let report = rt.report();
        assert_eq!(report.queues.len(), 1 + crate::config::NAMED_QUEUES);
        assert!(report.chain.is_none());
    }
}
