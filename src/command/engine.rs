// Command queue engine
//
// `run_once` is called once per scheduler tick. It walks the live queue from
// the head, evaluating each command's precondition against freshly read motor
// status, dispatching to the driver and removing exactly the consumed bytes.
// A blocked precondition ends the tick with the command left at the head.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::codec::{self, Command, HEADER_LEN, Precondition};
use super::queue::{LIVE, QueueSet};
use super::{Id, IdAllocator};
use crate::config::{KEY_MOTOR_CONFIG, LIVE_QUEUE_SIZE, NAMED_QUEUE_SIZE, NAMED_QUEUES, queue_key};
use crate::error::{Error, ErrorKind, ErrorState, Result, Subsystem};
use crate::motor::{MotorConfig, MotorDriver, MotorStatus, MovementPhase};
use crate::storage::{self, Storage, StorageError};

/// Progress bookkeeping polled by front-ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandState {
    pub this_command: Id,   // head of the live queue while it is being worked on
    pub last_command: Id,   // last completed
    pub last_completed: u64, // completion timestamp, ms
}

/// Position and status readout for state reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorSnapshot {
    pub position: i32,
    pub mark: i32,
    pub steps_per_sec: f32,
    pub busy: bool,
    pub status: MotorStatus,
}

enum Step {
    Done,
    Blocked,
}

pub struct Engine<D: MotorDriver> {
    driver: D,
    storage: Box<dyn Storage>,
    queues: QueueSet,
    ids: IdAllocator,
    config: MotorConfig,
    status: MotorStatus,
    state: CommandState,
    errors: ErrorState,
    now: u64,
}

fn storage_error(key: &str, e: StorageError) -> Error {
    Error::Storage {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

impl<D: MotorDriver> Engine<D> {
    pub fn new(driver: D, storage: Box<dyn Storage>) -> Self {
        let queues = QueueSet::new(LIVE_QUEUE_SIZE, NAMED_QUEUES, NAMED_QUEUE_SIZE);
        Self::with_queues(driver, storage, queues)
    }

    pub fn with_queues(mut driver: D, storage: Box<dyn Storage>, queues: QueueSet) -> Self {
        let config = MotorConfig::default();
        driver.apply_config(&config);
        let status = driver.status();
        Self {
            driver,
            storage,
            queues,
            ids: IdAllocator::new(),
            config,
            status,
            state: CommandState::default(),
            errors: ErrorState::new(),
            now: 0,
        }
    }

    /// Load the persisted motor configuration; defaults stay when none is stored
    pub fn restore_config(&mut self) -> Result<()> {
        match storage::read_json::<MotorConfig>(self.storage.as_mut(), KEY_MOTOR_CONFIG) {
            Ok(config) => {
                config.validate()?;
                info!("Restored motor configuration from {}", KEY_MOTOR_CONFIG);
                self.config = config;
                self.driver.apply_config(&self.config);
                Ok(())
            }
            Err(StorageError::NotFound { .. }) => Ok(()),
            Err(e) => Err(storage_error(KEY_MOTOR_CONFIG, e)),
        }
    }

    /// Allocate an identifier from the shared id space
    pub fn allocate_id(&mut self) -> Id {
        self.ids.allocate()
    }

    /// Enqueue with a freshly allocated id. The id counter advances even when
    /// the command is rejected.
    pub fn enqueue(&mut self, queue: usize, command: &Command) -> Result<Id> {
        let id = self.ids.allocate();
        self.enqueue_with_id(queue, id, command)?;
        Ok(id)
    }

    /// Enqueue with an id chosen elsewhere (a chain master)
    pub fn enqueue_with_id(&mut self, queue: usize, id: Id, command: &Command) -> Result<()> {
        let result = command.check().and_then(|()| {
            let mut entry = Vec::with_capacity(command.encoded_len());
            command.encode(id, &mut entry);
            self.queues.append(queue, &entry)
        });
        match &result {
            Ok(()) => debug!("Queued {:?} as {} on queue {}", command, id, queue),
            Err(e) => self.record_error(id, e),
        }
        result
    }

    /// Discard every pending command of a queue, then queue a no-op so the
    /// current-command bookkeeping clears on the next tick
    pub fn empty(&mut self, queue: usize) -> Result<Id> {
        match self.queues.get_mut(queue) {
            Ok(q) => q.clear(),
            Err(e) => {
                let id = self.ids.allocate();
                self.record_error(id, &e);
                return Err(e);
            }
        }
        debug!("Emptied queue {}", queue);
        self.enqueue(queue, &Command::Nop)
    }

    /// Stop the motor immediately and empty the live queue
    pub fn estop(&mut self, hiz: bool, soft: bool) -> Result<Id> {
        info!("Emergency stop (hiz={}, soft={})", hiz, soft);
        self.stop_driver(hiz, soft);
        self.empty(LIVE)
    }

    /// Append all of `src` to `dst`
    pub fn copy(&mut self, dst: usize, src: usize) -> Result<()> {
        let result = self.queues.copy(dst, src);
        if let Err(e) = &result {
            self.record_error(0, e);
        } else {
            debug!("Copied queue {} onto queue {}", src, dst);
        }
        result
    }

    /// Persist a queue's bytes
    pub fn save(&mut self, queue: usize) -> Result<()> {
        let result = self.queues.get(queue).map(|q| q.as_bytes().to_vec()).and_then(|data| {
            let key = queue_key(queue);
            self.storage
                .write(&key, &data)
                .map_err(|e| storage_error(&key, e))
        });
        if let Err(e) = &result {
            self.record_error(0, e);
        } else {
            info!("Saved queue {}", queue);
        }
        result
    }

    /// Restore a queue's bytes; the stored data must decode as whole commands
    pub fn load(&mut self, queue: usize) -> Result<()> {
        let result = self.queues.get(queue).map(|_| ()).and_then(|()| {
            let key = queue_key(queue);
            let data = self
                .storage
                .read(&key)
                .map_err(|e| storage_error(&key, e))?;
            codec::validate(&data)?;
            self.queues.replace(queue, &data)
        });
        if let Err(e) = &result {
            self.record_error(0, e);
        } else {
            info!("Loaded queue {}", queue);
        }
        result
    }

    /// Interpret the live queue until it empties or a precondition blocks
    pub fn run_once(&mut self, now: u64) {
        self.now = now;
        self.state.this_command = 0;

        loop {
            let head = self.queues.live().as_bytes();
            if head.is_empty() {
                return;
            }

            let decoded = codec::decode_entry(head);
            let (id, command, span) = match decoded {
                Ok(entry) => entry,
                Err(e) => {
                    // Entry boundaries past an undecodable head cannot be trusted,
                    // so the rest of the live queue goes with it.
                    let id = codec::peek_header(self.queues.live().as_bytes()).map_or(0, |(id, _)| id);
                    self.record_error(id, &e);
                    warn!("Discarding {} live queue byte(s)", self.queues.live().len());
                    self.queues.live_mut().clear();
                    return;
                }
            };
            self.state.this_command = id;

            if !self.precondition_met(command.precondition()) {
                return;
            }

            match self.dispatch(id, &command, now) {
                Step::Done => {
                    self.queues.live_mut().consume(span);
                    self.state.last_command = id;
                    self.state.last_completed = now;
                    debug!("Completed {} ({:?})", id, command);
                }
                Step::Blocked => return,
            }
        }
    }

    fn precondition_met(&mut self, precondition: Precondition) -> bool {
        if precondition == Precondition::None {
            return true;
        }
        self.status = self.driver.status();
        match precondition {
            Precondition::NotBusy => !self.status.busy,
            Precondition::Stopped => self.status.movement == MovementPhase::Stopped,
            Precondition::Status | Precondition::None => true,
        }
    }

    fn dispatch(&mut self, id: Id, command: &Command, now: u64) -> Step {
        match command {
            Command::Nop | Command::WaitNotBusy | Command::WaitStopped => {}
            Command::Stop { hiz, soft } => self.stop_driver(*hiz, *soft),
            Command::Run { dir, steps_per_sec } => {
                self.driver.run(self.config.direction(*dir), *steps_per_sec)
            }
            Command::StepClock { dir } => self.driver.step_clock(self.config.direction(*dir)),
            Command::Move { dir, microsteps } => {
                self.driver.move_steps(self.config.direction(*dir), *microsteps)
            }
            Command::Goto { position, dir } => {
                let dir = dir.map(|d| self.config.direction(d));
                self.driver.goto(self.config.position(*position), dir)
            }
            Command::GoUntil {
                action,
                dir,
                steps_per_sec,
            } => self
                .driver
                .go_until(*action, self.config.direction(*dir), *steps_per_sec),
            Command::ReleaseSwitch { action, dir } => {
                self.driver.release_switch(*action, self.config.direction(*dir))
            }
            Command::GoHome => self.driver.go_home(),
            Command::GoMark => self.driver.go_mark(),
            Command::ResetPosition => self.driver.reset_position(),
            Command::SetPosition { position } => {
                self.driver.set_position(self.config.position(*position))
            }
            Command::SetMark { mark } => self.driver.set_mark(self.config.position(*mark)),
            Command::SetConfig { config } => self.set_config(id, config),
            Command::WaitMillis { millis, started } => {
                let start = match started {
                    Some(start) => *start,
                    None => {
                        self.stamp_wait(id, *millis, now);
                        now
                    }
                };
                if now.saturating_sub(start) < u64::from(*millis) {
                    return Step::Blocked;
                }
            }
            Command::WaitSwitch { closed } => {
                if self.status.user_switch != *closed {
                    return Step::Blocked;
                }
            }
        }
        Step::Done
    }

    /// Re-serialize the head wait command with its first-seen time
    fn stamp_wait(&mut self, id: Id, millis: u32, now: u64) {
        let mut entry = Vec::with_capacity(HEADER_LEN + 13);
        Command::WaitMillis {
            millis,
            started: Some(now),
        }
        .encode(id, &mut entry);
        self.queues.live_mut().overwrite(0, &entry);
    }

    fn set_config(&mut self, id: Id, doc: &str) {
        let update = match self.config.apply_json(doc) {
            Ok(update) => update,
            Err(e) => {
                self.record_error(id, &e);
                return;
            }
        };
        info!("Applied {} motor configuration field(s)", update.applied);
        self.driver.apply_config(&self.config);

        if update.save {
            if let Err(e) = storage::write_json(self.storage.as_mut(), KEY_MOTOR_CONFIG, &self.config) {
                let err = storage_error(KEY_MOTOR_CONFIG, e);
                self.record_error(id, &err);
            }
        }
    }

    fn stop_driver(&mut self, hiz: bool, soft: bool) {
        match (hiz, soft) {
            (true, true) => self.driver.soft_hiz(),
            (true, false) => self.driver.hard_hiz(),
            (false, true) => self.driver.soft_stop(),
            (false, false) => self.driver.hard_stop(),
        }
    }

    /// Record an error in the last-error record
    pub fn record_error(&mut self, id: Id, error: &Error) {
        let subsystem = match error.kind() {
            ErrorKind::Storage => Subsystem::Storage,
            ErrorKind::ChecksumMismatch
            | ErrorKind::AcknowledgementMismatch
            | ErrorKind::InputBufferOverflow => Subsystem::Chain,
            _ => Subsystem::Command,
        };
        self.errors.record(subsystem, id, error, self.now);
    }

    pub fn errors(&self) -> &ErrorState {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorState {
        &mut self.errors
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    /// Status as of the last precondition check
    pub fn status(&self) -> MotorStatus {
        self.status
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Timestamp of the last tick
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Fresh position and status readout
    pub fn motor_snapshot(&mut self) -> MotorSnapshot {
        self.status = self.driver.status();
        MotorSnapshot {
            position: self.driver.position(),
            mark: self.driver.mark(),
            steps_per_sec: self.driver.speed(),
            busy: self.status.busy,
            status: self.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::{Direction, PositionAction};
    use crate::storage::MemoryStorage;

    /// Records every driver call; motion state is set directly by the test
    #[derive(Default)]
    struct MockDriver {
        calls: Vec<String>,
        busy: bool,
        moving: bool,
        switch: bool,
        config: Option<MotorConfig>,
    }

    impl MotorDriver for MockDriver {
        fn soft_stop(&mut self) {
            self.calls.push("soft_stop".into());
        }
        fn hard_stop(&mut self) {
            self.calls.push("hard_stop".into());
        }
        fn soft_hiz(&mut self) {
            self.calls.push("soft_hiz".into());
        }
        fn hard_hiz(&mut self) {
            self.calls.push("hard_hiz".into());
        }
        fn run(&mut self, dir: Direction, steps_per_sec: f32) {
            self.calls.push(format!("run {:?} {}", dir, steps_per_sec));
        }
        fn step_clock(&mut self, dir: Direction) {
            self.calls.push(format!("step_clock {:?}", dir));
        }
        fn move_steps(&mut self, dir: Direction, microsteps: u32) {
            self.calls.push(format!("move {:?} {}", dir, microsteps));
        }
        fn goto(&mut self, position: i32, dir: Option<Direction>) {
            self.calls.push(format!("goto {} {:?}", position, dir));
        }
        fn go_until(&mut self, action: PositionAction, dir: Direction, steps_per_sec: f32) {
            self.calls
                .push(format!("go_until {:?} {:?} {}", action, dir, steps_per_sec));
        }
        fn release_switch(&mut self, action: PositionAction, dir: Direction) {
            self.calls.push(format!("release_switch {:?} {:?}", action, dir));
        }
        fn go_home(&mut self) {
            self.calls.push("go_home".into());
        }
        fn go_mark(&mut self) {
            self.calls.push("go_mark".into());
        }
        fn reset_position(&mut self) {
            self.calls.push("reset_position".into());
        }
        fn set_position(&mut self, position: i32) {
            self.calls.push(format!("set_position {}", position));
        }
        fn set_mark(&mut self, mark: i32) {
            self.calls.push(format!("set_mark {}", mark));
        }
        fn status(&mut self) -> MotorStatus {
            MotorStatus {
                busy: self.busy,
                movement: if self.moving {
                    MovementPhase::ConstantSpeed
                } else {
                    MovementPhase::Stopped
                },
                user_switch: self.switch,
                ..MotorStatus::default()
            }
        }
        fn position(&mut self) -> i32 {
            0
        }
        fn mark(&mut self) -> i32 {
            0
        }
        fn speed(&mut self) -> f32 {
            0.0
        }
        fn apply_config(&mut self, config: &MotorConfig) {
            self.config = Some(config.clone());
        }
    }

    fn engine() -> Engine<MockDriver> {
        Engine::with_queues(
            MockDriver::default(),
            Box::new(MemoryStorage::new()),
            QueueSet::new(256, 2, 64),
        )
    }

    #[test]
    fn test_fifo_execution() {
        let mut engine = engine();
        engine.enqueue(LIVE, &Command::SetMark { mark: 5 }).unwrap();
        engine.enqueue(LIVE, &Command::GoHome).unwrap();
        let last = engine.enqueue(LIVE, &Command::SetPosition { position: 7 }).unwrap();

        engine.run_once(1);

        assert_eq!(
            engine.driver().calls,
            vec!["set_mark 5", "go_home", "set_position 7"]
        );
        assert!(engine.queues().live().is_empty());
        assert_eq!(engine.state().last_command, last);
        assert_eq!(engine.state().last_completed, 1);
    }

    #[test]
    fn test_not_busy_gate() {
        let mut engine = engine();
        engine.driver_mut().busy = true;
        let id = engine.enqueue(LIVE, &Command::GoMark).unwrap();

        engine.run_once(1);
        engine.run_once(2);
        assert!(engine.driver().calls.is_empty());
        assert_eq!(engine.state().this_command, id);

        engine.driver_mut().busy = false;
        engine.run_once(3);
        assert_eq!(engine.driver().calls, vec!["go_mark"]);
        assert_eq!(engine.state().last_command, id);
    }

    #[test]
    fn test_stopped_gate() {
        let mut engine = engine();
        engine.driver_mut().moving = true;
        engine
            .enqueue(
                LIVE,
                &Command::Move {
                    dir: Direction::Forward,
                    microsteps: 100,
                },
            )
            .unwrap();

        engine.run_once(1);
        assert!(engine.driver().calls.is_empty());

        engine.driver_mut().moving = false;
        engine.run_once(2);
        assert_eq!(engine.driver().calls, vec!["move Forward 100"]);
    }

    #[test]
    fn test_wait_millis_stamps_in_place() {
        let mut engine = engine();
        let id = engine.enqueue(LIVE, &Command::wait_millis(100)).unwrap();
        engine.enqueue(LIVE, &Command::GoHome).unwrap();

        engine.run_once(1000);
        let (_, head, _) = codec::decode_entry(engine.queues().live().as_bytes()).unwrap();
        assert_eq!(
            head,
            Command::WaitMillis {
                millis: 100,
                started: Some(1000)
            }
        );

        engine.run_once(1050);
        engine.run_once(1099);
        assert!(engine.driver().calls.is_empty());
        assert_eq!(engine.state().this_command, id);

        engine.run_once(1100);
        assert_eq!(engine.driver().calls, vec!["go_home"]);
        assert!(engine.queues().live().is_empty());
    }

    #[test]
    fn test_wait_switch() {
        let mut engine = engine();
        engine.enqueue(LIVE, &Command::WaitSwitch { closed: true }).unwrap();
        engine.enqueue(LIVE, &Command::ResetPosition).unwrap();

        engine.run_once(1);
        assert!(engine.driver().calls.is_empty());

        engine.driver_mut().switch = true;
        engine.run_once(2);
        assert_eq!(engine.driver().calls, vec!["reset_position"]);
    }

    #[test]
    fn test_capacity_rejection_leaves_queue_untouched() {
        let mut engine = Engine::with_queues(
            MockDriver::default(),
            Box::new(MemoryStorage::new()),
            QueueSet::new(12, 0, 0),
        );
        engine.enqueue(LIVE, &Command::GoHome).unwrap();
        let before = engine.queues().live().as_bytes().to_vec();

        let err = engine
            .enqueue(
                LIVE,
                &Command::Run {
                    dir: Direction::Forward,
                    steps_per_sec: 1.0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::QueueCapacityExceeded { .. }));
        assert_eq!(engine.queues().live().as_bytes(), before.as_slice());
        assert_eq!(
            engine.errors().last().unwrap().kind,
            ErrorKind::QueueCapacityExceeded
        );

        // The rejected call still consumed an id
        assert_eq!(engine.enqueue(LIVE, &Command::GoMark).unwrap(), 3);
    }

    #[test]
    fn test_no_such_queue() {
        let mut engine = engine();
        let err = engine.enqueue(9, &Command::Nop).unwrap_err();
        assert_eq!(err, Error::NoSuchQueue { queue: 9 });
        let record = engine.errors().last().unwrap();
        assert_eq!(record.id, 1);
        assert_eq!(record.arg, Some(9));
    }

    #[test]
    fn test_unknown_opcode_discards_live_queue() {
        let mut engine = engine();
        engine.enqueue(LIVE, &Command::SetMark { mark: 1 }).unwrap();
        engine
            .queues
            .append(LIVE, &[9, 0, 0, 0, 0x1F, 0x05, 0, 0, 0, 0])
            .unwrap();
        engine.enqueue(LIVE, &Command::GoHome).unwrap();

        engine.run_once(5);

        let record = engine.errors().last().unwrap();
        assert_eq!(record.kind, ErrorKind::UnknownOpcode);
        assert_eq!(record.id, 9);
        // Nothing after the bad head runs, even bytes that would decode
        assert_eq!(engine.driver().calls, vec!["set_mark 1"]);
        assert!(engine.queues().live().is_empty());

        engine.enqueue(LIVE, &Command::GoMark).unwrap();
        engine.run_once(6);
        assert_eq!(engine.driver().calls, vec!["set_mark 1", "go_mark"]);
    }

    #[test]
    fn test_empty_injects_nop() {
        let mut engine = engine();
        engine.driver_mut().busy = true;
        engine.enqueue(LIVE, &Command::GoHome).unwrap();
        engine.enqueue(LIVE, &Command::GoMark).unwrap();

        let nop = engine.empty(LIVE).unwrap();
        engine.run_once(1);
        assert!(engine.driver().calls.is_empty());
        assert_eq!(engine.state().last_command, nop);
        assert!(engine.queues().live().is_empty());
    }

    #[test]
    fn test_estop_stops_then_empties() {
        let mut engine = engine();
        engine.driver_mut().busy = true;
        engine.enqueue(LIVE, &Command::GoHome).unwrap();

        engine.estop(false, false).unwrap();
        assert_eq!(engine.driver().calls, vec!["hard_stop"]);
        let (_, head, _) = codec::decode_entry(engine.queues().live().as_bytes()).unwrap();
        assert_eq!(head, Command::Nop);
    }

    #[test]
    fn test_copy_save_load() {
        let mut engine = engine();
        engine.enqueue(1, &Command::SetMark { mark: 1 }).unwrap();
        engine.enqueue(1, &Command::GoMark).unwrap();
        let macro_bytes = engine.queues().get(1).unwrap().as_bytes().to_vec();

        engine.save(1).unwrap();
        engine.empty(1).unwrap();
        engine.load(1).unwrap();
        assert_eq!(engine.queues().get(1).unwrap().as_bytes(), macro_bytes.as_slice());

        engine.copy(LIVE, 1).unwrap();
        engine.run_once(1);
        assert_eq!(engine.driver().calls, vec!["set_mark 1", "go_mark"]);
    }

    #[test]
    fn test_load_missing_queue_reports_storage_error() {
        let mut engine = engine();
        let err = engine.load(2).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert_eq!(engine.errors().last().unwrap().subsystem, Subsystem::Storage);
    }

    #[test]
    fn test_set_config_applies_and_persists() {
        let mut engine = engine();
        engine
            .enqueue(
                LIVE,
                &Command::SetConfig {
                    config: r#"{"maxspeed": 250.0, "reverse": true, "save": true}"#.into(),
                },
            )
            .unwrap();
        engine
            .enqueue(
                LIVE,
                &Command::Goto {
                    position: 10,
                    dir: Some(Direction::Forward),
                },
            )
            .unwrap();

        engine.run_once(1);

        assert_eq!(engine.config().max_speed, 250.0);
        assert_eq!(engine.driver().config.as_ref().unwrap().max_speed, 250.0);
        assert_eq!(engine.driver().calls, vec!["goto -10 Some(Reverse)"]);

        let saved: MotorConfig =
            storage::read_json(engine.storage.as_mut(), KEY_MOTOR_CONFIG).unwrap();
        assert!(saved.reverse);
    }

    #[test]
    fn test_bad_config_is_reported_but_consumed() {
        let mut engine = engine();
        let id = engine
            .enqueue(
                LIVE,
                &Command::SetConfig {
                    config: "{oops".into(),
                },
            )
            .unwrap();

        engine.run_once(1);
        assert!(engine.queues().live().is_empty());
        let record = engine.errors().last().unwrap();
        assert_eq!(record.kind, ErrorKind::MalformedCommand);
        assert_eq!(record.id, id);
    }
}
