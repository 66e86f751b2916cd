//! Drift-free periodic timer.
//!
//! Tick *i* is scheduled at `start + i·Δt`, computed from the start instant
//! rather than from the previous release, so scheduling jitter never
//! accumulates. A caller that falls behind skips to the next future boundary
//! instead of receiving a burst of catch-up ticks.

use crate::error::{InstrError, InstrResult};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

#[derive(Debug)]
pub struct Timer {
    start: Instant,
    period: Duration,
    /// Index of the last scheduled tick.
    index: Mutex<u64>,
    skipped: Mutex<u64>,
}

impl Timer {
    /// A timer starting now.
    pub fn new(period: Duration) -> InstrResult<Self> {
        Self::starting_at(Instant::now(), period)
    }

    /// A timer with `period` given in seconds.
    pub fn from_secs_f64(period: f64) -> InstrResult<Self> {
        if !(period.is_finite() && period > 0.0) {
            return Err(InstrError::domain("period", format!("{} s is not > 0", period)));
        }
        Self::new(Duration::from_secs_f64(period))
    }

    /// A timer sharing an externally chosen start instant, so several
    /// workers tick on the same grid.
    pub fn starting_at(start: Instant, period: Duration) -> InstrResult<Self> {
        if period.is_zero() {
            return Err(InstrError::domain("period", "tick period must be > 0"));
        }
        Ok(Self {
            start,
            period,
            index: Mutex::new(0),
            skipped: Mutex::new(0),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Index of the most recently scheduled tick.
    pub fn ticks(&self) -> u64 {
        *self.index.lock()
    }

    /// Ticks dropped because the caller was late.
    pub fn skipped(&self) -> u64 {
        *self.skipped.lock()
    }

    /// Scheduled instant of tick `index`.
    pub fn target(&self, index: u64) -> Instant {
        let nanos = self.period.as_nanos().saturating_mul(index as u128);
        self.start + Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Seconds since start, without blocking.
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Sleeps until the next tick boundary and returns the seconds elapsed
    /// since start at release.
    pub async fn wait_tick(&self) -> f64 {
        let now = Instant::now();
        let target = {
            let mut index = self.index.lock();
            let mut next = *index + 1;
            if self.target(next) < now {
                let behind = now.duration_since(self.start).as_nanos();
                let boundary = (behind / self.period.as_nanos()) as u64 + 1;
                let skipped = boundary - next;
                *self.skipped.lock() += skipped;
                tracing::warn!(
                    target: "labdrive::timer",
                    tick = next,
                    skipped,
                    period_ms = self.period.as_secs_f64() * 1e3,
                    "timer is late, skipping to next boundary"
                );
                next = boundary;
            }
            *index = next;
            self.target(next)
        };
        sleep_until(target).await;
        self.elapsed_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_land_on_the_grid() {
        let timer = Timer::new(Duration::from_millis(10)).unwrap();
        for i in 1..=20u64 {
            let t = timer.wait_tick().await;
            assert!((t - i as f64 * 0.01).abs() < 1e-6, "tick {} at {}", i, t);
        }
        assert_eq!(timer.ticks(), 20);
        assert_eq!(timer.skipped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_caller_skips_instead_of_bursting() {
        let timer = Timer::new(Duration::from_millis(10)).unwrap();
        tokio::time::advance(Duration::from_millis(35)).await;
        let t = timer.wait_tick().await;
        assert!((t - 0.040).abs() < 1e-6, "released at {}", t);
        assert_eq!(timer.ticks(), 4);
        assert_eq!(timer.skipped(), 3);
        let t = timer.wait_tick().await;
        assert!((t - 0.050).abs() < 1e-6);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(Timer::from_secs_f64(0.0).is_err());
        assert!(Timer::from_secs_f64(f64::NAN).is_err());
    }
}
