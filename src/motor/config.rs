// Live motor configuration
//
// Field names on the JSON side match the documents accepted by the
// set-configuration command and stored under `motorcfg.json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::driver::Direction;
use crate::command::codec::OP_SET_CONFIG;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    Voltage,
    Current,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    pub mode: DriveMode,
    pub stepsize: u8, // microsteps per full step: 1, 2, 4 ... 128
    pub ocd: f32,     // overcurrent threshold, mV
    #[serde(rename = "ocdshutdown")]
    pub ocd_shutdown: bool,
    #[serde(rename = "maxspeed")]
    pub max_speed: f32,
    #[serde(rename = "minspeed")]
    pub min_speed: f32,
    pub accel: f32,
    pub decel: f32,
    #[serde(rename = "kthold")]
    pub kt_hold: f32,
    #[serde(rename = "ktrun")]
    pub kt_run: f32,
    #[serde(rename = "ktaccel")]
    pub kt_accel: f32,
    #[serde(rename = "ktdecel")]
    pub kt_decel: f32,
    #[serde(rename = "fsspeed")]
    pub fs_speed: f32,
    #[serde(rename = "fsboost")]
    pub fs_boost: bool,
    pub reverse: bool,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            mode: DriveMode::Voltage,
            stepsize: 16,
            ocd: 500.0,
            ocd_shutdown: true,
            max_speed: 10000.0,
            min_speed: 0.0,
            accel: 1000.0,
            decel: 1000.0,
            kt_hold: 0.15,
            kt_run: 0.15,
            kt_accel: 0.15,
            kt_decel: 0.15,
            fs_speed: 2000.0,
            fs_boost: false,
            reverse: false,
        }
    }
}

/// Outcome of applying a configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub applied: usize,
    pub save: bool,
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedCommand {
        opcode: OP_SET_CONFIG,
        reason: reason.into(),
    }
}

impl MotorConfig {
    /// Apply the recognized fields of a JSON document; unknown keys are ignored.
    /// `"save": true` asks the caller to persist the result.
    pub fn apply_json(&mut self, doc: &str) -> Result<ConfigUpdate> {
        let patch: Value =
            serde_json::from_str(doc).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;
        let Value::Object(fields) = patch else {
            return Err(malformed("configuration must be a JSON object"));
        };

        let mut current = serde_json::to_value(&*self).map_err(|e| malformed(e.to_string()))?;
        let mut update = ConfigUpdate {
            applied: 0,
            save: false,
        };

        if let Value::Object(map) = &mut current {
            for (key, value) in fields {
                if key == "save" {
                    update.save = value.as_bool().unwrap_or(false);
                } else if map.contains_key(&key) {
                    map.insert(key, value);
                    update.applied += 1;
                }
            }
        }

        let next: MotorConfig = serde_json::from_value(current)
            .map_err(|e| malformed(format!("bad field value: {}", e)))?;
        next.validate()?;
        *self = next;
        Ok(update)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.stepsize.is_power_of_two() || self.stepsize > 128 {
            return Err(malformed(format!("invalid stepsize {}", self.stepsize)));
        }
        if self.max_speed <= 0.0 || self.min_speed < 0.0 || self.min_speed > self.max_speed {
            return Err(malformed("speed limits out of range"));
        }
        Ok(())
    }

    /// Direction as seen by the driver, honouring `reverse`
    pub fn direction(&self, dir: Direction) -> Direction {
        if self.reverse { dir.flip() } else { dir }
    }

    /// Position as seen by the driver, honouring `reverse`
    pub fn position(&self, pos: i32) -> i32 {
        if self.reverse { pos.wrapping_neg() } else { pos }
    }
}
