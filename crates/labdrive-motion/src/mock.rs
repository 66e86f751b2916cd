//! Kinematic drive simulator for tests and dry runs.
//!
//! Integrates the commanded speed over tokio time, so tests under a paused
//! clock are deterministic. Every command is recorded.

use crate::drive::{DriveStatus, MotorDrive, OperatingMode, PinLevel};
use async_trait::async_trait;
use labdrive_core::{InstrError, InstrResult};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct SimState {
    position: f64,
    speed: f64,
    updated: Instant,
    quick_stopped: bool,
    speeds: Vec<f64>,
    quick_stops: usize,
    pins: Vec<PinLevel>,
    reads: usize,
}

impl SimState {
    fn advance(&mut self) {
        let now = Instant::now();
        self.position += self.speed * now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
    }
}

/// Simulated speed-controlled axis.
#[derive(Debug)]
pub struct SimulatedDrive {
    name: String,
    /// Added to every reported position, to emulate a sensor offset.
    offset: f64,
    /// Position read (1-based) that fails with a timeout.
    failing_read: Option<usize>,
    state: Mutex<SimState>,
}

impl SimulatedDrive {
    pub fn new(name: impl Into<String>, position: f64) -> Self {
        Self {
            name: name.into(),
            offset: 0.0,
            failing_read: None,
            state: Mutex::new(SimState {
                position,
                speed: 0.0,
                updated: Instant::now(),
                quick_stopped: false,
                speeds: Vec::new(),
                quick_stops: 0,
                pins: Vec::new(),
                reads: 0,
            }),
        }
    }

    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    /// Makes the `nth` position read time out, as a dropped link would.
    pub fn failing_read(mut self, nth: usize) -> Self {
        self.failing_read = Some(nth);
        self
    }

    /// True position, without the sensor offset.
    pub fn true_position(&self) -> f64 {
        let mut state = self.state.lock();
        state.advance();
        state.position
    }

    /// Every speed commanded so far; a quick stop records `0.0`.
    pub fn commanded_speeds(&self) -> Vec<f64> {
        self.state.lock().speeds.clone()
    }

    pub fn quick_stops(&self) -> usize {
        self.state.lock().quick_stops
    }

    pub fn pin_history(&self) -> Vec<PinLevel> {
        self.state.lock().pins.clone()
    }

    pub fn position_reads(&self) -> usize {
        self.state.lock().reads
    }
}

#[async_trait]
impl MotorDrive for SimulatedDrive {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> InstrResult<f64> {
        let mut state = self.state.lock();
        state.advance();
        state.reads += 1;
        if self.failing_read == Some(state.reads) {
            return Err(InstrError::Timeout(Duration::from_millis(100)));
        }
        Ok(state.position + self.offset)
    }

    async fn set_speed(&self, speed: f64, _accel: f64) -> InstrResult<()> {
        let mut state = self.state.lock();
        if state.quick_stopped {
            return Err(InstrError::state(format!("drive '{}' is quick-stopped", self.name)));
        }
        state.advance();
        state.speed = speed;
        state.speeds.push(speed);
        Ok(())
    }

    async fn quick_stop(&self) -> InstrResult<()> {
        let mut state = self.state.lock();
        state.advance();
        state.speed = 0.0;
        state.quick_stopped = true;
        state.quick_stops += 1;
        state.speeds.push(0.0);
        Ok(())
    }

    async fn set_pin(&self, level: PinLevel) -> InstrResult<()> {
        self.state.lock().pins.push(level);
        Ok(())
    }

    async fn status(&self) -> InstrResult<DriveStatus> {
        let mut state = self.state.lock();
        state.advance();
        Ok(DriveStatus {
            mode: OperatingMode::Speed,
            ready: true,
            enabled: !state.quick_stopped,
            quick_stopped: state.quick_stopped,
            speed: state.speed,
            position: state.position + self.offset,
            ..DriveStatus::default()
        })
    }
}
