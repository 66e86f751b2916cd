//! One configured tracking run: plan, connect, track, log, close.

use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use labdrive_motion::calibration::Calibration;
use labdrive_motion::log::TrajectoryLog;
use labdrive_motion::mock::SimulatedDrive;
use labdrive_motion::{DriveSlot, MotorDrive, MotorHandle, TrackReport, Tracker, Trajectory};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of [`run`].
#[derive(Debug)]
pub struct RunOutcome {
    pub reports: Vec<TrackReport>,
    /// CSV log of the master drive's measured positions.
    pub log_path: Option<PathBuf>,
}

/// Plans the configured trajectory, repeated `cycles` times.
pub fn plan(config: &AppConfig) -> Result<Trajectory> {
    let one = Trajectory::plan(config.trajectory.params).context("planning trajectory")?;
    Ok(one.repeat(config.trajectory.cycles.max(1)))
}

/// Runs the configured trajectory on every enabled drive.
///
/// With `simulate`, each drive is replaced by a [`SimulatedDrive`] starting
/// at the trajectory's first position. `tracker` is created by the caller so
/// it can keep a handle for stop-all (Ctrl-C).
pub async fn run(config: &AppConfig, tracker: &Tracker, simulate: bool) -> Result<RunOutcome> {
    let trajectory = Arc::new(plan(config)?);
    let start = trajectory.positions.first().copied().unwrap_or_default();

    let calibration = match &config.application.calibration {
        Some(path) => Some(
            Calibration::load(path)
                .with_context(|| format!("loading calibration {}", path.display()))?,
        ),
        None => None,
    };

    let mut handles: Vec<Arc<MotorHandle>> = Vec::new();
    let mut slots = Vec::new();
    for def in config.enabled_drives() {
        let drive: Arc<dyn MotorDrive> = if simulate {
            Arc::new(SimulatedDrive::new(def.name.clone(), start))
        } else {
            let mut handle_config = def.handle.clone();
            if let Some(cal) = calibration {
                handle_config.scaling.meter_per_rot = cal.meter_per_rot;
            }
            let opened = MotorHandle::connect_tcp(&def.name, &def.address, def.unit, handle_config)
                .await
                .with_context(|| format!("opening drive '{}' at {}", def.name, def.address));
            let handle = match opened {
                Ok(handle) => Arc::new(handle),
                Err(e) => {
                    close_all(&handles).await;
                    return Err(e);
                }
            };
            handles.push(handle.clone());
            handle
        };
        slots.push(DriveSlot {
            drive,
            master: def.master,
        });
    }
    if slots.is_empty() {
        bail!("no enabled drives in configuration");
    }

    let result = tracker.run(slots, trajectory).await;
    close_all(&handles).await;
    let reports = result.context("tracking trajectory")?;

    let master = config
        .enabled_drives()
        .position(|d| d.master)
        .and_then(|i| reports.get(i));
    let log_path = match master {
        Some(report) => {
            let mut log =
                TrajectoryLog::create(&config.application.log_dir, &config.application.log_prefix)
                    .context("creating trajectory log")?;
            log.extend(&report.samples)
                .context("writing trajectory log")?;
            Some(log.path().to_path_buf())
        }
        None => None,
    };
    Ok(RunOutcome { reports, log_path })
}

async fn close_all(handles: &[Arc<MotorHandle>]) {
    for handle in handles {
        if let Err(e) = handle.close().await {
            warn!(drive = %handle.name(), error = %e, "closing drive failed");
        }
    }
    if !handles.is_empty() {
        info!(count = handles.len(), "drives closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApplicationConfig, DriveDefinition, TrajectoryConfig};
    use labdrive_motion::{HandleConfig, TrackerConfig};

    fn config(dir: &std::path::Path) -> AppConfig {
        let drive = |name: &str, master: bool| DriveDefinition {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            unit: 1,
            master,
            enabled: true,
            handle: HandleConfig::default(),
        };
        AppConfig {
            application: ApplicationConfig {
                log_dir: dir.to_path_buf(),
                ..ApplicationConfig::default()
            },
            tracker: TrackerConfig::default(),
            trajectory: TrajectoryConfig::default(),
            drives: vec![drive("left", false), drive("right", true)],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_run_logs_master() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let tracker = Tracker::new(config.tracker).unwrap();

        let outcome = run(&config, &tracker, true).await.unwrap();
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(outcome.reports[1].drive, "right");
        assert!(!outcome.reports[1].pin_transitions.is_empty());
        assert!(outcome.reports[0].pin_transitions.is_empty());

        let path = outcome.log_path.unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().next(), Some("time,position"));
        assert_eq!(text.lines().count(), outcome.reports[1].ticks + 1);
    }

    #[test]
    fn cycles_repeat_the_plan() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        let one = plan(&config).unwrap();
        config.trajectory.cycles = 3;
        assert_eq!(plan(&config).unwrap().len(), one.len() * 3);
    }
}
