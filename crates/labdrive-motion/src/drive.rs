//! Motor-drive contract used by the tracker.

use async_trait::async_trait;
use labdrive_core::InstrResult;
use serde::{Deserialize, Serialize};

/// Operating mode reported and commanded in the control/status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Disabled,
    Speed,
    Position,
    Homing,
    Other(u8),
}

impl OperatingMode {
    pub fn code(self) -> u8 {
        match self {
            OperatingMode::Disabled => 0,
            OperatingMode::Speed => 1,
            OperatingMode::Position => 2,
            OperatingMode::Homing => 3,
            OperatingMode::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => OperatingMode::Disabled,
            1 => OperatingMode::Speed,
            2 => OperatingMode::Position,
            3 => OperatingMode::Homing,
            other => OperatingMode::Other(other),
        }
    }
}

/// Level of the master drive's camera-gate output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinLevel {
    High,
    Low,
    Idle,
}

impl PinLevel {
    /// Output voltage for this level.
    pub fn volts(self) -> f64 {
        match self {
            PinLevel::High => 5.0,
            PinLevel::Low => 0.0,
            PinLevel::Idle => 2.5,
        }
    }
}

/// HIGH while moving down (negative speed), LOW while moving up, IDLE inside
/// the dead-band around zero.
pub fn pin_level_for(speed: f64, deadband: f64) -> PinLevel {
    if speed.abs() <= deadband {
        PinLevel::Idle
    } else if speed < 0.0 {
        PinLevel::High
    } else {
        PinLevel::Low
    }
}

/// Snapshot of a drive's cached state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DriveStatus {
    pub mode: OperatingMode,
    pub ready: bool,
    pub enabled: bool,
    pub quick_stopped: bool,
    pub fault: bool,
    pub warning: bool,
    pub target_reached: bool,
    pub fault_code: u32,
    pub warning_code: u32,
    /// Actual speed, m/s.
    pub speed: f64,
    /// Actual position, m.
    pub position: f64,
}

/// A position/velocity-controlled axis in physical units.
#[async_trait]
pub trait MotorDrive: Send + Sync {
    fn name(&self) -> &str;

    /// Measured position in metres.
    async fn position(&self) -> InstrResult<f64>;

    /// Commands a speed (m/s) with an acceleration ramp (m/s²).
    async fn set_speed(&self, speed: f64, accel: f64) -> InstrResult<()>;

    /// Device-level emergency stop.
    async fn quick_stop(&self) -> InstrResult<()>;

    /// Drives the camera-gate output.
    async fn set_pin(&self, level: PinLevel) -> InstrResult<()>;

    async fn status(&self) -> InstrResult<DriveStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_levels() {
        assert_eq!(pin_level_for(-0.1, 1e-3), PinLevel::High);
        assert_eq!(pin_level_for(0.05, 1e-3), PinLevel::Low);
        assert_eq!(pin_level_for(5e-4, 1e-3), PinLevel::Idle);
        assert_eq!(PinLevel::Idle.volts(), 2.5);
    }

    #[test]
    fn mode_codes() {
        for code in 0..6u8 {
            assert_eq!(OperatingMode::from_code(code).code(), code);
        }
    }
}
