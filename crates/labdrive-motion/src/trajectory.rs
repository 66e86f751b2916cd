//! Periodic down/up trajectory planning.
//!
//! One period runs from the top position `z0` down to `z3` and back:
//!
//! ```text
//! z0 ─acc─> z1 ─cruise─> z2 ─dacc─> z3 (dwell) ─acc─> z4 ─cruise─> z5 ─dacc─> z0 (dwell)
//! ```
//!
//! Speeds are signed: negative on the way down, positive on the way up.
//! Positions are in metres, speeds in m/s, times in seconds.

use labdrive_core::{InstrError, InstrResult};
use serde::{Deserialize, Serialize};

/// Kinematic description of one down/up period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinematicParams {
    /// Top position `z0`.
    pub z_max: f64,
    /// Bottom position `z3`.
    pub z_min: f64,
    /// Cruise speed upwards (magnitude).
    pub v_up: f64,
    /// Cruise speed downwards (magnitude).
    pub v_down: f64,
    /// Acceleration magnitude when leaving a dwell.
    pub acc: f64,
    /// Deceleration magnitude when approaching a dwell.
    pub dacc: f64,
    /// Sampling step.
    pub dt: f64,
    /// Dwell at the bottom.
    pub t_bottom: f64,
    /// Dwell at the top.
    pub t_top: f64,
    /// Pinned period; the top dwell absorbs any slack.
    pub t_period: Option<f64>,
}

impl Default for KinematicParams {
    fn default() -> Self {
        Self {
            z_max: 0.0,
            z_min: -0.8,
            v_up: 0.05,
            v_down: 0.1,
            acc: 0.025,
            dacc: 0.009,
            dt: 0.25,
            t_bottom: 2.0,
            t_top: 0.0,
            t_period: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    AccelerateDown,
    CruiseDown,
    DecelerateDown,
    BottomDwell,
    AccelerateUp,
    CruiseUp,
    DecelerateUp,
    TopDwell,
}

/// Constant-acceleration piece of the profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub start: f64,
    pub duration: f64,
    pub from: f64,
    pub v_start: f64,
    pub v_end: f64,
}

impl Segment {
    fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Position and speed at absolute time `t` inside this segment.
    fn evaluate(&self, t: f64) -> (f64, f64) {
        let tau = (t - self.start).clamp(0.0, self.duration);
        if self.duration <= 0.0 {
            return (self.from, self.v_end);
        }
        let a = (self.v_end - self.v_start) / self.duration;
        let position = self.from + self.v_start * tau + 0.5 * a * tau * tau;
        (position, self.v_start + a * tau)
    }
}

/// A validated single-period plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub params: KinematicParams,
    /// Segment boundaries `z0..=z5`.
    pub z: [f64; 6],
    pub segments: Vec<Segment>,
}

fn positive(name: &str, value: f64) -> InstrResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(InstrError::domain(name, format!("{} must be > 0", value)))
    }
}

fn non_negative(name: &str, value: f64) -> InstrResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(InstrError::domain(name, format!("{} must be >= 0", value)))
    }
}

impl Plan {
    /// Segments the period and validates its geometry.
    pub fn new(params: KinematicParams) -> InstrResult<Self> {
        let p = params;
        positive("v_up", p.v_up)?;
        positive("v_down", p.v_down)?;
        positive("acc", p.acc)?;
        positive("dacc", p.dacc)?;
        positive("dt", p.dt)?;
        non_negative("t_bottom", p.t_bottom)?;
        non_negative("t_top", p.t_top)?;
        if !(p.z_max.is_finite() && p.z_min.is_finite()) {
            return Err(InstrError::domain("z_max", "positions must be finite"));
        }

        let z0 = p.z_max;
        let z3 = p.z_min;
        let z1 = z0 - p.v_down * p.v_down / (2.0 * p.acc);
        let z2 = z3 + p.v_down * p.v_down / (2.0 * p.dacc);
        let z4 = z3 + p.v_up * p.v_up / (2.0 * p.acc);
        let z5 = z0 - p.v_up * p.v_up / (2.0 * p.dacc);
        let z = [z0, z1, z2, z3, z4, z5];

        if !(z0 > z1 && z1 > z2 && z2 > z3) {
            return Err(InstrError::domain(
                "trajectory",
                format!(
                    "downward segments overlap (z0={:.4}, z1={:.4}, z2={:.4}, z3={:.4}); \
                     increase acc/dacc or lower v_down",
                    z0, z1, z2, z3
                ),
            ));
        }
        if !(z3 < z4 && z4 < z5 && z5 < z0) {
            return Err(InstrError::domain(
                "trajectory",
                format!(
                    "upward segments overlap (z3={:.4}, z4={:.4}, z5={:.4}, z0={:.4}); \
                     increase acc/dacc or lower v_up",
                    z3, z4, z5, z0
                ),
            ));
        }

        let pieces = [
            (SegmentKind::AccelerateDown, p.v_down / p.acc, z0, 0.0, -p.v_down),
            (SegmentKind::CruiseDown, (z1 - z2) / p.v_down, z1, -p.v_down, -p.v_down),
            (SegmentKind::DecelerateDown, p.v_down / p.dacc, z2, -p.v_down, 0.0),
            (SegmentKind::BottomDwell, p.t_bottom, z3, 0.0, 0.0),
            (SegmentKind::AccelerateUp, p.v_up / p.acc, z3, 0.0, p.v_up),
            (SegmentKind::CruiseUp, (z5 - z4) / p.v_up, z4, p.v_up, p.v_up),
            (SegmentKind::DecelerateUp, p.v_up / p.dacc, z5, p.v_up, 0.0),
        ];
        let mut segments = Vec::with_capacity(8);
        let mut clock = 0.0;
        for (kind, duration, from, v_start, v_end) in pieces {
            segments.push(Segment {
                kind,
                start: clock,
                duration,
                from,
                v_start,
                v_end,
            });
            clock += duration;
        }

        let mut top = p.t_top;
        if let Some(pinned) = p.t_period {
            let required = clock + p.t_top;
            if !(pinned.is_finite() && pinned >= required) {
                return Err(InstrError::domain(
                    "t_period",
                    format!("{} s is shorter than the segment sum {:.4} s", pinned, required),
                ));
            }
            top = pinned - clock;
        }
        segments.push(Segment {
            kind: SegmentKind::TopDwell,
            start: clock,
            duration: top,
            from: z0,
            v_start: 0.0,
            v_end: 0.0,
        });

        Ok(Self {
            params,
            z,
            segments,
        })
    }

    /// Sum of all segment durations.
    pub fn duration(&self) -> f64 {
        self.segments.last().map(Segment::end).unwrap_or(0.0)
    }

    pub fn segment(&self, kind: SegmentKind) -> Option<&Segment> {
        self.segments.iter().find(|s| s.kind == kind)
    }

    /// Position and speed at time `t` (clamped to the period).
    pub fn evaluate(&self, t: f64) -> (f64, f64) {
        let segment = self
            .segments
            .iter()
            .find(|s| t < s.end())
            .or(self.segments.last());
        match segment {
            Some(s) => s.evaluate(t),
            None => (self.params.z_max, 0.0),
        }
    }

    /// Samples one period on the `dt` grid. The period is rounded up to a
    /// whole number of steps; the extra time extends the top dwell.
    pub fn sample(&self) -> Trajectory {
        let dt = self.params.dt;
        let steps = (self.duration() / dt - 1e-9).ceil().max(1.0) as usize;
        let mut times = Vec::with_capacity(steps);
        let mut speeds = Vec::with_capacity(steps);
        let mut positions = Vec::with_capacity(steps);
        for i in 0..steps {
            let t = i as f64 * dt;
            let (x, v) = self.evaluate(t);
            times.push(t);
            speeds.push(v);
            positions.push(x);
        }
        Trajectory {
            dt,
            period: steps as f64 * dt,
            times,
            speeds,
            positions,
            periodic: true,
        }
    }
}

/// Uniformly sampled (time, speed, position) sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    pub dt: f64,
    /// Duration of one period, `len · dt` for a single period.
    pub period: f64,
    pub times: Vec<f64>,
    pub speeds: Vec<f64>,
    pub positions: Vec<f64>,
    /// Whether the motion returns to its first point after the last sample.
    pub periodic: bool,
}

impl Trajectory {
    /// Plans and samples one period.
    pub fn plan(params: KinematicParams) -> InstrResult<Self> {
        Ok(Plan::new(params)?.sample())
    }

    /// An open (non-periodic) trajectory from explicit samples.
    pub fn from_samples(dt: f64, speeds: Vec<f64>, positions: Vec<f64>) -> InstrResult<Self> {
        positive("dt", dt)?;
        if speeds.len() != positions.len() || speeds.is_empty() {
            return Err(InstrError::domain(
                "trajectory",
                "speeds and positions must be non-empty and of equal length",
            ));
        }
        let times = (0..speeds.len()).map(|i| i as f64 * dt).collect();
        Ok(Self {
            dt,
            period: speeds.len() as f64 * dt,
            times,
            speeds,
            positions,
            periodic: false,
        })
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Concatenates `k` copies, shifting copy `j` by `j · period`.
    pub fn repeat(&self, k: usize) -> Self {
        let k = k.max(1);
        let n = self.len();
        let mut times = Vec::with_capacity(n * k);
        for j in 0..k {
            let shift = j as f64 * self.period;
            times.extend(self.times.iter().map(|t| t + shift));
        }
        Self {
            dt: self.dt,
            period: self.period,
            times,
            speeds: self.speeds.repeat(k),
            positions: self.positions.repeat(k),
            periodic: self.periodic,
        }
    }

    /// Where the motion must end: the first point for a periodic
    /// trajectory, the last one otherwise.
    pub fn endpoint(&self) -> f64 {
        let point = if self.periodic {
            self.positions.first()
        } else {
            self.positions.last()
        };
        point.copied().unwrap_or(0.0)
    }

    /// Acceleration ramp at index `i`: central difference of the speeds,
    /// wrapping around for periodic trajectories.
    pub fn ramp_at(&self, i: usize) -> f64 {
        let n = self.len();
        if n < 2 {
            return 0.0;
        }
        let (prev, next) = if self.periodic {
            ((i + n - 1) % n, (i + 1) % n)
        } else {
            (i.saturating_sub(1), (i + 1).min(n - 1))
        };
        (self.speeds[next] - self.speeds[prev]).abs() / (2.0 * self.dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labdrive_core::ErrorKind;

    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn segment_boundaries() {
        let plan = Plan::new(KinematicParams::default()).unwrap();
        let [z0, z1, z2, z3, z4, z5] = plan.z;
        assert!(close(z0 - z1, 0.2, 1e-12));
        assert!(close(z2 - z3, 0.5556, 1e-4));
        assert!(close(z1 - z2, 0.0444, 1e-4));
        assert!(close(z4 - z3, 0.05, 1e-12));
        assert!(close(z0 - z5, 0.1389, 1e-4));

        let cruise = plan.segment(SegmentKind::CruiseDown).unwrap();
        assert!(close(cruise.duration, 0.4444, 1e-4));
        assert!(close(plan.duration(), 36.3333, 1e-3));
    }

    #[test]
    fn profile_is_continuous() {
        let plan = Plan::new(KinematicParams::default()).unwrap();
        for pair in plan.segments.windows(2) {
            let (x_end, v_end) = pair[0].evaluate(pair[0].end());
            assert!(close(x_end, pair[1].from, 1e-9), "{:?}", pair[1].kind);
            assert!(close(v_end, pair[1].v_start, 1e-12));
        }
    }

    #[test]
    fn speeds_are_signed_by_direction() {
        let traj = Trajectory::plan(KinematicParams::default()).unwrap();
        let plan = Plan::new(KinematicParams::default()).unwrap();
        let bottom = plan.segment(SegmentKind::BottomDwell).unwrap().start;
        for (t, v) in traj.times.iter().zip(&traj.speeds) {
            if *t < bottom {
                assert!(*v <= 0.0);
            } else {
                assert!(*v >= 0.0);
            }
        }
    }

    #[test]
    fn pinned_period_extends_top_dwell() {
        let params = KinematicParams {
            t_period: Some(40.0),
            ..KinematicParams::default()
        };
        let plan = Plan::new(params).unwrap();
        assert!(close(plan.duration(), 40.0, 1e-9));
        let top = plan.segment(SegmentKind::TopDwell).unwrap();
        assert!(close(top.duration, 40.0 - 36.3333, 1e-3));

        let too_short = KinematicParams {
            t_period: Some(30.0),
            ..KinematicParams::default()
        };
        assert_eq!(Plan::new(too_short).unwrap_err().kind(), ErrorKind::Domain);
    }

    #[test]
    fn invalid_parameters_are_domain_errors() {
        let no_speed = KinematicParams {
            v_down: 0.0,
            ..KinematicParams::default()
        };
        assert_eq!(Plan::new(no_speed).unwrap_err().kind(), ErrorKind::Domain);
    }

    #[test]
    fn ramps_wrap_for_periodic_motion() {
        let traj = Trajectory::from_samples(0.5, vec![0.0, 1.0, 3.0], vec![0.0; 3]).unwrap();
        assert!(close(traj.ramp_at(1), 3.0, 1e-12));
        assert!(close(traj.ramp_at(0), 1.0, 1e-12));
        assert_eq!(traj.endpoint(), 0.0);
    }
}
