//! Closed-loop trajectory tracking on one or more drives.
//!
//! Every drive gets its own worker task and its own [`Timer`] on a shared
//! start instant, so all workers tick on the same grid without sharing any
//! state. Per tick a worker reads the measured position, checks the safety
//! envelope, blends the planned speed with the speed that would close the
//! position error in one step, and commands the result.

use crate::drive::{pin_level_for, MotorDrive, PinLevel};
use crate::trajectory::Trajectory;
use labdrive_core::{ErrorKind, InstrError, InstrResult, Timer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Weight `k` of the planned speed against the corrective speed.
    pub smoothing: f64,
    /// Position error (m) above which correction kicks in.
    pub tolerance: f64,
    /// Position error (m) that triggers a quick stop.
    pub envelope: f64,
    /// Lower bound for the commanded acceleration ramp (m/s²).
    pub min_ramp: f64,
    /// Speeds within this band (m/s) put the camera gate at idle.
    pub deadband: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            smoothing: 2.0,
            tolerance: 1e-3,
            envelope: 0.1,
            min_ramp: 1e-3,
            deadband: 1e-4,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> InstrResult<()> {
        let checks = [
            ("smoothing", self.smoothing, self.smoothing >= 0.0),
            ("tolerance", self.tolerance, self.tolerance >= 0.0),
            ("envelope", self.envelope, self.envelope > self.tolerance),
            ("min_ramp", self.min_ramp, self.min_ramp > 0.0),
            ("deadband", self.deadband, self.deadband >= 0.0),
        ];
        for (name, value, ok) in checks {
            if !(value.is_finite() && ok) {
                return Err(InstrError::Configuration(format!(
                    "tracker {} = {} is invalid",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Speed to command given the planned speed, the speed that would reach
    /// the next planned position in one step, and the current error.
    pub fn blend(&self, planned: f64, corrective: f64, error: f64) -> f64 {
        if error >= self.tolerance {
            (self.smoothing * planned + corrective) / (self.smoothing + 1.0)
        } else {
            planned
        }
    }
}

/// Shared cancellation flag, checked by every worker before each tick.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_all(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PinTransition {
    /// Trajectory index at which the level was applied.
    pub index: usize,
    pub level: PinLevel,
}

/// Outcome of tracking on one drive.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackReport {
    pub drive: String,
    pub ticks: usize,
    /// Seconds since the shared start at which the worker finished.
    pub finished_at: f64,
    pub max_error: f64,
    pub pin_transitions: Vec<PinTransition>,
    /// Whether the run was cut short by the stop flag.
    pub stopped: bool,
    /// `(time, measured position)` per tick.
    pub samples: Vec<(f64, f64)>,
}

impl TrackReport {
    fn new(drive: &str) -> Self {
        Self {
            drive: drive.to_string(),
            ticks: 0,
            finished_at: 0.0,
            max_error: 0.0,
            pin_transitions: Vec::new(),
            stopped: false,
            samples: Vec::new(),
        }
    }
}

/// One drive taking part in a run.
#[derive(Clone)]
pub struct DriveSlot {
    pub drive: Arc<dyn MotorDrive>,
    /// The master drive also toggles the camera gate.
    pub master: bool,
}

#[derive(Debug, Clone)]
pub struct Tracker {
    config: TrackerConfig,
    stop: StopFlag,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> InstrResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stop: StopFlag::new(),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Halts every worker at its next tick.
    pub fn stop_all(&self) {
        info!("stop requested for all drives");
        self.stop.stop_all();
    }

    /// Follows `trajectory` on one drive, ticking on `timer`.
    ///
    /// Any failure other than a safety stop leaves the drive commanded to
    /// zero speed (best effort) before the error is returned.
    #[instrument(skip_all, fields(drive = %drive.name(), master = master), err)]
    pub async fn track(
        &self,
        drive: &dyn MotorDrive,
        trajectory: &Trajectory,
        timer: &Timer,
        master: bool,
    ) -> InstrResult<TrackReport> {
        if trajectory.is_empty() {
            return Err(InstrError::domain("trajectory", "no samples to track"));
        }
        let result = self.follow(drive, trajectory, timer, master).await;
        if let Err(e) = &result {
            // A safety stop has already quick-stopped the drive.
            if e.kind() != ErrorKind::Safety {
                warn!(error = %e, "tracking failed, commanding zero speed");
                if let Err(stop) = drive.set_speed(0.0, self.config.min_ramp).await {
                    error!(error = %stop, "zero speed after failure was not accepted");
                }
            }
        }
        result
    }

    async fn follow(
        &self,
        drive: &dyn MotorDrive,
        trajectory: &Trajectory,
        timer: &Timer,
        master: bool,
    ) -> InstrResult<TrackReport> {
        let n = trajectory.len();
        let dt = trajectory.dt;
        let mut report = TrackReport::new(drive.name());
        let mut gate: Option<PinLevel> = None;

        for i in 0..n {
            if self.stop.is_stopped() {
                info!(tick = i, "stop flag set, commanding zero speed");
                drive.set_speed(0.0, self.config.min_ramp).await?;
                report.stopped = true;
                report.finished_at = timer.elapsed_secs();
                return Ok(report);
            }

            let measured = drive.position().await?;
            let planned = trajectory.positions[i];
            let err = (planned - measured).abs();
            report.max_error = report.max_error.max(err);
            report.samples.push((timer.elapsed_secs(), measured));
            if err > self.config.envelope {
                error!(tick = i, planned, measured, "position error outside envelope");
                if let Err(e) = drive.quick_stop().await {
                    error!(error = %e, "quick stop failed");
                }
                return Err(InstrError::Safety {
                    drive: drive.name().to_string(),
                    reason: format!(
                        "position error {:.4} m exceeds {:.4} m at tick {}",
                        err, self.config.envelope, i
                    ),
                });
            }

            let ramp = trajectory.ramp_at(i).max(self.config.min_ramp);
            let command = if i + 1 < n {
                let corrective = (trajectory.positions[i + 1] - measured) / dt;
                self.config.blend(trajectory.speeds[i], corrective, err)
            } else {
                // Close whatever gap remains to the endpoint.
                (trajectory.endpoint() - measured) / dt
            };
            debug!(tick = i, planned, measured, command, "tick");
            drive.set_speed(command, ramp).await?;

            if master {
                let level = pin_level_for(trajectory.speeds[i], self.config.deadband);
                if gate != Some(level) {
                    drive.set_pin(level).await?;
                    report.pin_transitions.push(PinTransition { index: i, level });
                    gate = Some(level);
                }
            }

            report.ticks += 1;
            timer.wait_tick().await;
        }

        drive.set_speed(0.0, self.config.min_ramp).await?;
        report.finished_at = timer.elapsed_secs();
        info!(ticks = report.ticks, max_error = report.max_error, "trajectory finished");
        Ok(report)
    }

    /// Runs one worker per drive from a common start and joins them all.
    ///
    /// A failing worker raises the stop flag so the others halt at their
    /// next tick; the first error is returned.
    pub async fn run(
        &self,
        drives: Vec<DriveSlot>,
        trajectory: Arc<Trajectory>,
    ) -> InstrResult<Vec<TrackReport>> {
        if drives.is_empty() {
            return Err(InstrError::Configuration("no drives to track".into()));
        }
        if drives.iter().filter(|slot| slot.master).count() > 1 {
            return Err(InstrError::Configuration(
                "at most one drive may be the master".into(),
            ));
        }
        let period = Duration::from_secs_f64(trajectory.dt);
        let start = Instant::now();
        info!(
            drives = drives.len(),
            samples = trajectory.len(),
            dt = trajectory.dt,
            "starting trajectory"
        );

        let mut workers = Vec::with_capacity(drives.len());
        for slot in drives {
            let tracker = self.clone();
            let trajectory = Arc::clone(&trajectory);
            let timer = Timer::starting_at(start, period)?;
            workers.push(tokio::spawn(async move {
                let result = tracker
                    .track(slot.drive.as_ref(), &trajectory, &timer, slot.master)
                    .await;
                if result.is_err() {
                    tracker.stop.stop_all();
                }
                result
            }));
        }

        let mut reports = Vec::new();
        let mut first_error = None;
        for joined in futures::future::join_all(workers).await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error
                        .get_or_insert(InstrError::state(format!("tracking worker failed: {}", e)));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blending_only_above_tolerance() {
        let config = TrackerConfig::default();
        assert_eq!(config.blend(0.1, 0.4, 5e-4), 0.1);
        assert!((config.blend(0.1, 0.4, 2e-3) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            min_ramp: 0.0,
            ..TrackerConfig::default()
        };
        assert!(Tracker::new(bad).is_err());
    }

    #[test]
    fn stop_flag_is_shared() {
        let tracker = Tracker::new(TrackerConfig::default()).unwrap();
        let flag = tracker.stop_flag();
        assert!(!flag.is_stopped());
        tracker.stop_all();
        assert!(flag.is_stopped());
    }
}
