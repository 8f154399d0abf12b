// End-to-end queue engine scenarios against a mock driver

mod common;

use common::MockDriver;
use stepper_chain_runtime::command::{Command, Engine, LIVE, QueueSet};
use stepper_chain_runtime::error::{Error, ErrorKind};
use stepper_chain_runtime::motor::Direction;
use stepper_chain_runtime::storage::MemoryStorage;

fn engine_with(queues: QueueSet) -> Engine<MockDriver> {
    Engine::with_queues(MockDriver::default(), Box::new(MemoryStorage::new()), queues)
}

#[test]
fn test_run_wait_stopped_goto() {
    let mut engine = engine_with(QueueSet::new(256, 1, 64));
    engine
        .enqueue(
            LIVE,
            &Command::Run {
                dir: Direction::Forward,
                steps_per_sec: 200.0,
            },
        )
        .unwrap();
    engine.enqueue(LIVE, &Command::WaitStopped).unwrap();
    let goto = engine
        .enqueue(
            LIVE,
            &Command::Goto {
                position: 1000,
                dir: None,
            },
        )
        .unwrap();

    engine.run_once(0);
    assert_eq!(engine.driver().calls, vec!["run Forward 200"]);

    for now in 1..10 {
        engine.run_once(now);
    }
    assert_eq!(engine.driver().calls.len(), 1);
    assert!(!engine.queues().live().is_empty());

    engine.driver_mut().advance();
    engine.run_once(10);

    assert_eq!(engine.driver().calls, vec!["run Forward 200", "goto 1000"]);
    assert!(engine.queues().live().is_empty());
    assert_eq!(engine.state().last_command, goto);
    assert_eq!(engine.state().last_completed, 10);
}

#[test]
fn test_wait_millis_never_early() {
    let mut engine = engine_with(QueueSet::new(256, 0, 0));
    engine.enqueue(LIVE, &Command::wait_millis(250)).unwrap();
    let mark = engine.enqueue(LIVE, &Command::SetMark { mark: 4 }).unwrap();

    // First sight at t=40, so the wait ends at t=290
    for now in (40..290).step_by(7) {
        engine.run_once(now);
        assert!(engine.driver().calls.is_empty(), "dispatched early at {}", now);
    }
    engine.run_once(290);
    assert_eq!(engine.driver().calls, vec!["set_mark 4"]);
    assert_eq!(engine.state().last_command, mark);
}

#[test]
fn test_full_queue_rejects_larger_command() {
    // Room for exactly one more bodiless command (5 bytes)
    let mut engine = engine_with(QueueSet::new(10, 0, 0));
    engine.enqueue(LIVE, &Command::GoHome).unwrap();
    let before = engine.queues().live().as_bytes().to_vec();

    let err = engine
        .enqueue(LIVE, &Command::SetPosition { position: 1 })
        .unwrap_err();
    assert_eq!(
        err,
        Error::QueueCapacityExceeded {
            queue: LIVE,
            required: 9,
            available: 5
        }
    );
    assert_eq!(engine.queues().live().as_bytes(), before.as_slice());
    assert_eq!(
        engine.errors().last().unwrap().kind,
        ErrorKind::QueueCapacityExceeded
    );

    engine.enqueue(LIVE, &Command::GoMark).unwrap();
    assert_eq!(engine.queues().live().available(), 0);
}

#[test]
fn test_macro_copied_into_live_queue() {
    let mut engine = engine_with(QueueSet::new(256, 2, 128));
    engine.enqueue(2, &Command::GoHome).unwrap();
    engine.enqueue(2, &Command::WaitNotBusy).unwrap();
    engine.enqueue(2, &Command::SetPosition { position: 50 }).unwrap();

    engine.copy(LIVE, 2).unwrap();
    engine.copy(LIVE, 2).unwrap();

    engine.run_once(0);
    assert_eq!(engine.driver().calls, vec!["go_home"]);
    engine.driver_mut().advance();
    engine.run_once(1);
    assert_eq!(
        engine.driver().calls,
        vec!["go_home", "set_position 50", "go_home"]
    );
    engine.driver_mut().advance();
    engine.run_once(2);
    assert!(engine.queues().live().is_empty());
    assert_eq!(engine.queues().get(2).unwrap().len(), 19);
}

#[test]
fn test_estop_cancels_pending_work() {
    let mut engine = engine_with(QueueSet::new(256, 0, 0));
    engine
        .enqueue(
            LIVE,
            &Command::Move {
                dir: Direction::Reverse,
                microsteps: 10,
            },
        )
        .unwrap();
    engine.enqueue(LIVE, &Command::WaitNotBusy).unwrap();
    engine.enqueue(LIVE, &Command::GoHome).unwrap();
    engine.run_once(0);

    let nop = engine.estop(true, true).unwrap();
    engine.run_once(1);

    assert_eq!(engine.driver().calls, vec!["move Reverse 10", "soft_hiz"]);
    assert!(engine.queues().live().is_empty());
    assert_eq!(engine.state().last_command, nop);
}
