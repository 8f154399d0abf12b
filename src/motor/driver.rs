// Motor-driver collaborator interface
//
// The queue engine only talks to the stepper IC through this trait and only
// inspects the status shape below. The SPI register driver lives outside this
// crate; `SimulatedDriver` stands in for it when no hardware is attached.

use serde::{Deserialize, Serialize};

use super::config::MotorConfig;

/// Motor direction
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Reverse = 0,
    Forward = 1,
}

impl Direction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Reverse),
            1 => Some(Self::Forward),
            _ => None,
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

/// Movement phase reported by the driver
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MovementPhase {
    #[default]
    #[serde(rename = "idle")]
    Stopped = 0,
    #[serde(rename = "accelerating")]
    Accelerating = 1,
    #[serde(rename = "decelerating")]
    Decelerating = 2,
    #[serde(rename = "spinning")]
    ConstantSpeed = 3,
}

/// What to do with the position register when a switch event fires
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionAction {
    Reset = 0,
    CopyMark = 1,
}

impl PositionAction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Reset),
            1 => Some(Self::CopyMark),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Alarms {
    pub command_error: bool,
    pub overcurrent: bool,
    pub undervoltage: bool,
    pub thermal_shutdown: bool,
    pub user_switch: bool,
    pub thermal_warning: bool,
    pub stall_detect: bool,
    pub adc_undervoltage: bool,
}

/// Live status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorStatus {
    pub busy: bool,
    pub movement: MovementPhase,
    pub direction: Direction,
    pub hiz: bool,
    pub user_switch: bool,
    pub step_clock: bool,
    pub alarms: Alarms,
}

impl Default for MotorStatus {
    fn default() -> Self {
        Self {
            busy: false,
            movement: MovementPhase::Stopped,
            direction: Direction::Forward,
            hiz: true,
            user_switch: false,
            step_clock: false,
            alarms: Alarms::default(),
        }
    }
}

/// Imperative interface of the stepper IC
pub trait MotorDriver {
    fn soft_stop(&mut self);
    fn hard_stop(&mut self);
    fn soft_hiz(&mut self);
    fn hard_hiz(&mut self);

    /// Run at constant speed (steps per second)
    fn run(&mut self, dir: Direction, steps_per_sec: f32);
    fn step_clock(&mut self, dir: Direction);
    fn move_steps(&mut self, dir: Direction, microsteps: u32);
    fn goto(&mut self, position: i32, dir: Option<Direction>);
    fn go_until(&mut self, action: PositionAction, dir: Direction, steps_per_sec: f32);
    fn release_switch(&mut self, action: PositionAction, dir: Direction);
    fn go_home(&mut self);
    fn go_mark(&mut self);
    fn reset_position(&mut self);
    fn set_position(&mut self, position: i32);
    fn set_mark(&mut self, mark: i32);

    fn status(&mut self) -> MotorStatus;
    fn position(&mut self) -> i32;
    fn mark(&mut self) -> i32;
    fn speed(&mut self) -> f32;

    /// Push a motor configuration into the driver registers
    fn apply_config(&mut self, config: &MotorConfig);
}
