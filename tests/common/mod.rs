use stepper_chain_runtime::motor::{
    Direction, MotorConfig, MotorDriver, MotorStatus, MovementPhase, PositionAction,
};

/// Driver that records dispatches; any motion keeps it busy until `advance()`
#[derive(Default)]
pub struct MockDriver {
    pub calls: Vec<String>,
    moving: bool,
    position: i32,
    mark: i32,
}

impl MockDriver {
    #[allow(dead_code)]
    pub fn advance(&mut self) {
        self.moving = false;
    }

    fn motion(&mut self, call: String) {
        self.calls.push(call);
        self.moving = true;
    }
}

impl MotorDriver for MockDriver {
    fn soft_stop(&mut self) {
        self.calls.push("soft_stop".into());
        self.moving = false;
    }
    fn hard_stop(&mut self) {
        self.calls.push("hard_stop".into());
        self.moving = false;
    }
    fn soft_hiz(&mut self) {
        self.calls.push("soft_hiz".into());
        self.moving = false;
    }
    fn hard_hiz(&mut self) {
        self.calls.push("hard_hiz".into());
        self.moving = false;
    }
    fn run(&mut self, dir: Direction, steps_per_sec: f32) {
        self.motion(format!("run {:?} {}", dir, steps_per_sec));
    }
    fn step_clock(&mut self, dir: Direction) {
        self.motion(format!("step_clock {:?}", dir));
    }
    fn move_steps(&mut self, dir: Direction, microsteps: u32) {
        self.motion(format!("move {:?} {}", dir, microsteps));
    }
    fn goto(&mut self, position: i32, _dir: Option<Direction>) {
        self.motion(format!("goto {}", position));
        self.position = position;
    }
    fn go_until(&mut self, action: PositionAction, dir: Direction, steps_per_sec: f32) {
        self.motion(format!("go_until {:?} {:?} {}", action, dir, steps_per_sec));
    }
    fn release_switch(&mut self, action: PositionAction, dir: Direction) {
        self.motion(format!("release_switch {:?} {:?}", action, dir));
    }
    fn go_home(&mut self) {
        self.motion("go_home".into());
    }
    fn go_mark(&mut self) {
        self.motion("go_mark".into());
    }
    fn reset_position(&mut self) {
        self.calls.push("reset_position".into());
        self.position = 0;
    }
    fn set_position(&mut self, position: i32) {
        self.calls.push(format!("set_position {}", position));
        self.position = position;
    }
    fn set_mark(&mut self, mark: i32) {
        self.calls.push(format!("set_mark {}", mark));
        self.mark = mark;
    }
    fn status(&mut self) -> MotorStatus {
        MotorStatus {
            busy: self.moving,
            movement: if self.moving {
                MovementPhase::ConstantSpeed
            } else {
                MovementPhase::Stopped
            },
            hiz: false,
            ..MotorStatus::default()
        }
    }
    fn position(&mut self) -> i32 {
        self.position
    }
    fn mark(&mut self) -> i32 {
        self.mark
    }
    fn speed(&mut self) -> f32 {
        0.0
    }
    fn apply_config(&mut self, _config: &MotorConfig) {}
}
