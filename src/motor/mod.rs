// Motor layer for the stepper board
//
// Provides:
// - The motor-driver collaborator trait and its status shape
// - Live motor configuration (JSON documents, reverse mapping)
// - A simulated driver for running without the stepper IC

pub mod config;
mod driver;
pub mod sim;

pub use config::{ConfigUpdate, DriveMode, MotorConfig};
pub use driver::{Alarms, Direction, MotorDriver, MotorStatus, MovementPhase, PositionAction};
pub use sim::SimulatedDriver;
