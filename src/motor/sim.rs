// Simulated stepper IC
//
// Constant-speed kinematics, no acceleration ramps. Motion advances only when
// `advance` is called, so the scheduler decides how fast simulated time moves.

use tracing::debug;

use super::config::MotorConfig;
use super::driver::{
    Alarms, Direction, MotorDriver, MotorStatus, MovementPhase, PositionAction,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Idle,
    Run { dir: Direction, speed: f32 },
    StepClock { dir: Direction },
    Target { position: i32, dir: Direction },
    Until { action: PositionAction, dir: Direction, speed: f32 },
}

pub struct SimulatedDriver {
    config: MotorConfig,
    motion: Motion,
    position: i32,
    mark: i32,
    hiz: bool,
    user_switch: bool,
    direction: Direction,
    remainder: f32, // fractional steps carried between updates
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            config: MotorConfig::default(),
            motion: Motion::Idle,
            position: 0,
            mark: 0,
            hiz: true,
            user_switch: false,
            direction: Direction::Forward,
            remainder: 0.0,
        }
    }

    /// Close or open the simulated user switch
    pub fn set_switch(&mut self, closed: bool) {
        self.user_switch = closed;
        if closed {
            if let Motion::Until { action, .. } = self.motion {
                self.switch_action(action);
                self.motion = Motion::Idle;
            }
        }
    }

    /// Advance simulated time
    pub fn advance(&mut self, elapsed_ms: u64) {
        let speed = match self.motion {
            Motion::Idle | Motion::StepClock { .. } => return,
            Motion::Run { speed, .. } | Motion::Until { speed, .. } => speed,
            Motion::Target { .. } => self.config.max_speed,
        };

        let steps = speed * elapsed_ms as f32 / 1000.0 + self.remainder;
        let whole = steps.floor();
        self.remainder = steps - whole;
        let delta = whole as i32;

        match self.motion {
            Motion::Target { position, dir } => {
                let remaining = position.wrapping_sub(self.position);
                if remaining.unsigned_abs() <= delta as u32 {
                    self.position = position;
                    self.motion = Motion::Idle;
                    self.remainder = 0.0;
                    debug!("Simulated move reached {}", position);
                } else {
                    self.step(dir, delta);
                }
            }
            Motion::Run { dir, .. } | Motion::Until { dir, .. } => self.step(dir, delta),
            Motion::Idle | Motion::StepClock { .. } => {}
        }
    }

    fn step(&mut self, dir: Direction, delta: i32) {
        self.position = match dir {
            Direction::Forward => self.position.wrapping_add(delta),
            Direction::Reverse => self.position.wrapping_sub(delta),
        };
    }

    fn switch_action(&mut self, action: PositionAction) {
        match action {
            PositionAction::Reset => self.position = 0,
            PositionAction::CopyMark => self.mark = self.position,
        }
    }

    fn start(&mut self, motion: Motion, dir: Direction) {
        self.hiz = false;
        self.direction = dir;
        self.motion = motion;
    }

    fn halt(&mut self, hiz: bool) {
        self.motion = Motion::Idle;
        self.remainder = 0.0;
        self.hiz = hiz;
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorDriver for SimulatedDriver {
    fn soft_stop(&mut self) {
        self.halt(false);
    }

    fn hard_stop(&mut self) {
        self.halt(false);
    }

    fn soft_hiz(&mut self) {
        self.halt(true);
    }

    fn hard_hiz(&mut self) {
        self.halt(true);
    }

    fn run(&mut self, dir: Direction, steps_per_sec: f32) {
        let speed = steps_per_sec.clamp(self.config.min_speed, self.config.max_speed);
        self.start(Motion::Run { dir, speed }, dir);
    }

    fn step_clock(&mut self, dir: Direction) {
        self.start(Motion::StepClock { dir }, dir);
    }

    fn move_steps(&mut self, dir: Direction, microsteps: u32) {
        let delta = microsteps as i32;
        let position = match dir {
            Direction::Forward => self.position.wrapping_add(delta),
            Direction::Reverse => self.position.wrapping_sub(delta),
        };
        self.start(Motion::Target { position, dir }, dir);
    }

    fn goto(&mut self, position: i32, dir: Option<Direction>) {
        let dir = dir.unwrap_or(if position >= self.position {
            Direction::Forward
        } else {
            Direction::Reverse
        });
        self.start(Motion::Target { position, dir }, dir);
    }

    fn go_until(&mut self, action: PositionAction, dir: Direction, steps_per_sec: f32) {
        if self.user_switch {
            self.switch_action(action);
            return;
        }
        let speed = steps_per_sec.clamp(self.config.min_speed, self.config.max_speed);
        self.start(Motion::Until { action, dir, speed }, dir);
    }

    fn release_switch(&mut self, action: PositionAction, _dir: Direction) {
        self.user_switch = false;
        self.switch_action(action);
    }

    fn go_home(&mut self) {
        self.goto(0, None);
    }

    fn go_mark(&mut self) {
        self.goto(self.mark, None);
    }

    fn reset_position(&mut self) {
        self.position = 0;
    }

    fn set_position(&mut self, position: i32) {
        self.position = position;
    }

    fn set_mark(&mut self, mark: i32) {
        self.mark = mark;
    }

    fn status(&mut self) -> MotorStatus {
        let (busy, movement) = match self.motion {
            Motion::Idle => (false, MovementPhase::Stopped),
            Motion::StepClock { .. } => (false, MovementPhase::Stopped),
            Motion::Run { .. } => (false, MovementPhase::ConstantSpeed),
            Motion::Target { .. } | Motion::Until { .. } => (true, MovementPhase::ConstantSpeed),
        };
        MotorStatus {
            busy,
            movement,
            direction: self.direction,
            hiz: self.hiz,
            user_switch: self.user_switch,
            step_clock: matches!(self.motion, Motion::StepClock { .. }),
            alarms: Alarms {
                user_switch: self.user_switch,
                ..Alarms::default()
            },
        }
    }

    fn position(&mut self) -> i32 {
        self.position
    }

    fn mark(&mut self) -> i32 {
        self.mark
    }

    fn speed(&mut self) -> f32 {
        match self.motion {
            Motion::Run { speed, .. } | Motion::Until { speed, .. } => speed,
            Motion::Target { .. } => self.config.max_speed,
            Motion::Idle | Motion::StepClock { .. } => 0.0,
        }
    }

    fn apply_config(&mut self, config: &MotorConfig) {
        debug!("Simulated driver config: {:?}", config);
        self.config = config.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goto_completes_after_advance() {
        let mut sim = SimulatedDriver::new();
        let mut cfg = MotorConfig::default();
        cfg.max_speed = 1000.0;
        sim.apply_config(&cfg);

        sim.goto(500, None);
        assert!(sim.status().busy);

        sim.advance(100);
        assert_eq!(sim.position(), 100);
        assert!(sim.status().busy);

        sim.advance(1000);
        assert_eq!(sim.position(), 500);
        let status = sim.status();
        assert!(!status.busy);
        assert_eq!(status.movement, MovementPhase::Stopped);
    }

    #[test]
    fn test_run_until_stopped() {
        let mut sim = SimulatedDriver::new();
        sim.run(Direction::Reverse, 200.0);
        sim.advance(500);
        assert_eq!(sim.position(), -100);
        assert_eq!(sim.status().movement, MovementPhase::ConstantSpeed);

        sim.soft_stop();
        assert_eq!(sim.status().movement, MovementPhase::Stopped);
        assert!(!sim.status().hiz);
    }

    #[test]
    fn test_go_until_switch_resets_position() {
        let mut sim = SimulatedDriver::new();
        sim.set_position(1234);
        sim.go_until(PositionAction::Reset, Direction::Reverse, 100.0);
        assert!(sim.status().busy);

        sim.set_switch(true);
        assert_eq!(sim.position(), 0);
        assert!(!sim.status().busy);
    }
}
