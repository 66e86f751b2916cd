//! Trajectory planning and closed-loop tracking for motor drives.
//!
//! - [`trajectory`]: periodic down/up motion planning and sampling
//! - [`scan`]: 13-register output/input scan blocks of a Modbus drive
//! - [`drive`]: the `MotorDrive` contract
//! - [`handle`]: actor-backed handle to a Modbus drive
//! - [`tracker`]: per-drive closed-loop workers with a shared stop flag
//! - [`calibration`], [`log`]: persisted files
//! - [`mock`]: kinematic drive simulator

pub mod calibration;
pub mod drive;
pub mod handle;
pub mod log;
pub mod mock;
pub mod scan;
pub mod tracker;
pub mod trajectory;

pub use drive::{pin_level_for, DriveStatus, MotorDrive, OperatingMode, PinLevel};
pub use handle::{HandleConfig, MotorHandle};
pub use tracker::{DriveSlot, StopFlag, TrackReport, Tracker, TrackerConfig};
pub use trajectory::{KinematicParams, Plan, Trajectory};
