//! Persisted traverse calibration and position-sensor state.
//!
//! Calibration file, one line:
//!
//! ```text
//! coef_meter_per_rot = 0.0100250
//! ```
//!
//! Position state file, a date comment and the absolute and relative
//! positions:
//!
//! ```text
//! # 2026-10-18 14:03:11
//! -0.412500 0.012000
//! ```

use chrono::{Local, NaiveDateTime};
use labdrive_core::{InstrError, InstrResult};
use std::path::Path;
use tracing::info;

const COEF_KEY: &str = "coef_meter_per_rot";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Traverse travel per motor rotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub meter_per_rot: f64,
}

impl Calibration {
    pub fn parse(text: &str) -> InstrResult<Self> {
        let line = text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| InstrError::Configuration("calibration file is empty".into()))?;
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| InstrError::Configuration(format!("malformed calibration '{}'", line)))?;
        if key.trim() != COEF_KEY {
            return Err(InstrError::Configuration(format!(
                "expected '{}', found '{}'",
                COEF_KEY,
                key.trim()
            )));
        }
        let meter_per_rot: f64 = value.trim().parse().map_err(|_| {
            InstrError::Configuration(format!("calibration value '{}' is not a number", value.trim()))
        })?;
        if !(meter_per_rot.is_finite() && meter_per_rot > 0.0) {
            return Err(InstrError::Configuration(format!(
                "calibration {} must be > 0",
                meter_per_rot
            )));
        }
        Ok(Self { meter_per_rot })
    }

    pub fn render(&self) -> String {
        format!("{} = {}\n", COEF_KEY, self.meter_per_rot)
    }

    pub fn load(path: &Path) -> InstrResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> InstrResult<()> {
        std::fs::write(path, self.render())?;
        info!(path = %path.display(), meter_per_rot = self.meter_per_rot, "calibration saved");
        Ok(())
    }
}

/// Last known absolute and relative traverse positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionState {
    pub absolute: f64,
    pub relative: f64,
    pub saved_at: Option<NaiveDateTime>,
}

impl PositionState {
    pub fn new(absolute: f64, relative: f64) -> Self {
        Self {
            absolute,
            relative,
            saved_at: None,
        }
    }

    pub fn parse(text: &str) -> InstrResult<Self> {
        let mut saved_at = None;
        let mut values = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(comment) = line.strip_prefix('#') {
                saved_at = NaiveDateTime::parse_from_str(comment.trim(), DATE_FORMAT).ok();
                continue;
            }
            for field in line.split_whitespace() {
                let value: f64 = field.parse().map_err(|_| {
                    InstrError::Configuration(format!("position '{}' is not a number", field))
                })?;
                values.push(value);
            }
        }
        match values.as_slice() {
            [absolute, relative] => Ok(Self {
                absolute: *absolute,
                relative: *relative,
                saved_at,
            }),
            _ => Err(InstrError::Configuration(format!(
                "position state needs 2 values, found {}",
                values.len()
            ))),
        }
    }

    /// Renders the state stamped with the current local time.
    pub fn render(&self) -> String {
        format!(
            "# {}\n{:.6} {:.6}\n",
            Local::now().format(DATE_FORMAT),
            self.absolute,
            self.relative
        )
    }

    pub fn load(path: &Path) -> InstrResult<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> InstrResult<()> {
        std::fs::write(path, self.render())?;
        Ok(())
    }
}
