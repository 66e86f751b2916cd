//! Cyclic scan blocks exchanged with a Modbus motor drive.
//!
//! The output block is 13 holding registers starting at the drive's output
//! base; the input block mirrors it with the actual values.
//!
//! | Register | Output | Input |
//! |---|---|---|
//! | 0 | framing word `0x0200` | framing word |
//! | 4 | control word (mode, enable, quick-stop, toggle) | status word |
//! | 5–6 | target rotation rate | actual rotation rate |
//! | 7–8 | target position | actual position |
//! | 9–10 | acceleration ramp | fault code |
//! | 11–12 | deceleration ramp | warning code |
//!
//! 32-bit values are split high word first.

use crate::drive::{DriveStatus, OperatingMode};
use labdrive_core::feature::{compose_i32, split_i32};
use labdrive_core::{InstrError, InstrResult};

pub const SCAN_LEN: usize = 13;
pub const FRAMING_WORD: u16 = 0x0200;

pub const CONTROL_ENABLE: u16 = 1 << 0;
pub const CONTROL_QUICK_STOP: u16 = 1 << 2;
pub const CONTROL_FAULT_RESET: u16 = 1 << 3;
/// Flipped whenever anything else in the block changes so the drive
/// re-reads the block.
pub const CONTROL_TOGGLE: u16 = 1 << 7;
const MODE_SHIFT: u16 = 8;

pub const STATUS_READY: u16 = 1 << 0;
pub const STATUS_ENABLED: u16 = 1 << 1;
pub const STATUS_QUICK_STOP: u16 = 1 << 2;
pub const STATUS_FAULT: u16 = 1 << 3;
pub const STATUS_WARNING: u16 = 1 << 4;
pub const STATUS_TARGET_REACHED: u16 = 1 << 5;

/// Device encoding of a negative 32-bit value.
///
/// Sets bit 31, inverts the low 31 bits, sets bit 31 again and adds one,
/// which yields the two's complement of the value. The magnitude 2³¹ has no
/// 31-bit representation, so `i32::MIN` is rejected.
pub fn encode_device_i32(value: i32) -> InstrResult<u32> {
    if value >= 0 {
        return Ok(value as u32);
    }
    if value == i32::MIN {
        return Err(InstrError::domain(
            "scan value",
            "-2147483648 cannot be sign-encoded for the drive",
        ));
    }
    let magnitude = value.unsigned_abs();
    let mut raw = magnitude | 0x8000_0000;
    raw = (raw & 0x8000_0000) | ((raw & 0x7FFF_FFFF) ^ 0x7FFF_FFFF);
    raw |= 0x8000_0000;
    Ok(raw.wrapping_add(1))
}

pub fn decode_device_i32(raw: u32) -> i32 {
    raw as i32
}

fn put_i32(block: &mut [u16; SCAN_LEN], index: usize, value: i32) -> InstrResult<()> {
    let raw = encode_device_i32(value)?;
    let [high, low] = split_i32(raw as i32);
    block[index] = high;
    block[index + 1] = low;
    Ok(())
}

fn get_i32(words: &[u16], index: usize) -> i32 {
    decode_device_i32(compose_i32(words[index], words[index + 1]) as u32)
}

fn clamp_i32(value: f64) -> i32 {
    value.round().clamp(-(i32::MAX as f64), i32::MAX as f64) as i32
}

/// Commanded state of the output block, in drive units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputScan {
    pub mode: OperatingMode,
    pub enable: bool,
    pub quick_stop: bool,
    pub fault_reset: bool,
    /// Target rotation rate, drive rate units.
    pub rate: i32,
    /// Target position, encoder counts.
    pub position: i32,
    pub accel_ramp: u32,
    pub decel_ramp: u32,
}

impl OutputScan {
    fn control_word(&self) -> u16 {
        let mut word = (self.mode.code() as u16) << MODE_SHIFT;
        if self.enable {
            word |= CONTROL_ENABLE;
        }
        if self.quick_stop {
            word |= CONTROL_QUICK_STOP;
        }
        if self.fault_reset {
            word |= CONTROL_FAULT_RESET;
        }
        word
    }

    /// Encodes the block. The toggle bit is carried over from `previous`
    /// and flipped when any other bit of the block differs from it.
    pub fn encode(&self, previous: Option<&[u16; SCAN_LEN]>) -> InstrResult<[u16; SCAN_LEN]> {
        let mut block = [0u16; SCAN_LEN];
        block[0] = FRAMING_WORD;
        block[4] = self.control_word();
        put_i32(&mut block, 5, self.rate)?;
        put_i32(&mut block, 7, self.position)?;
        let [ah, al] = split_i32(self.accel_ramp as i32);
        let [dh, dl] = split_i32(self.decel_ramp as i32);
        block[9..13].copy_from_slice(&[ah, al, dh, dl]);

        if let Some(previous) = previous {
            let toggle = previous[4] & CONTROL_TOGGLE;
            let mut unchanged = *previous;
            unchanged[4] &= !CONTROL_TOGGLE;
            block[4] |= if unchanged == block {
                toggle
            } else {
                toggle ^ CONTROL_TOGGLE
            };
        }
        Ok(block)
    }
}

/// Actual state reported by the input block, in drive units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputScan {
    pub status: u16,
    pub mode: OperatingMode,
    pub rate: i32,
    pub position: i32,
    pub fault_code: u32,
    pub warning_code: u32,
}

impl InputScan {
    pub fn decode(words: &[u16]) -> InstrResult<Self> {
        if words.len() != SCAN_LEN {
            return Err(InstrError::protocol(format!(
                "input scan has {} registers, expected {}",
                words.len(),
                SCAN_LEN
            )));
        }
        let status = words[4];
        Ok(Self {
            status,
            mode: OperatingMode::from_code((status >> MODE_SHIFT) as u8),
            rate: get_i32(words, 5),
            position: get_i32(words, 7),
            fault_code: compose_i32(words[9], words[10]) as u32,
            warning_code: compose_i32(words[11], words[12]) as u32,
        })
    }

    pub fn has(&self, flag: u16) -> bool {
        self.status & flag != 0
    }
}

/// Conversion between physical units (m, m/s, m/s²) and drive units.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DriveScaling {
    /// Traverse travel per motor rotation, from the calibration file.
    pub meter_per_rot: f64,
    /// Encoder counts per rotation.
    pub counts_per_rot: f64,
    /// Drive rate units per rotation per minute.
    pub rate_per_rpm: f64,
}

impl Default for DriveScaling {
    fn default() -> Self {
        Self {
            meter_per_rot: 0.01,
            counts_per_rot: 10_000.0,
            rate_per_rpm: 10.0,
        }
    }
}

impl DriveScaling {
    pub fn validate(&self) -> InstrResult<()> {
        for (name, value) in [
            ("meter_per_rot", self.meter_per_rot),
            ("counts_per_rot", self.counts_per_rot),
            ("rate_per_rpm", self.rate_per_rpm),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(InstrError::Configuration(format!(
                    "drive scaling {} must be > 0, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    fn rate_units_per_mps(&self) -> f64 {
        60.0 / self.meter_per_rot * self.rate_per_rpm
    }

    pub fn rate_from_speed(&self, speed: f64) -> i32 {
        clamp_i32(speed * self.rate_units_per_mps())
    }

    pub fn speed_from_rate(&self, rate: i32) -> f64 {
        f64::from(rate) / self.rate_units_per_mps()
    }

    pub fn counts_from_position(&self, position: f64) -> i32 {
        clamp_i32(position / self.meter_per_rot * self.counts_per_rot)
    }

    pub fn position_from_counts(&self, counts: i32) -> f64 {
        f64::from(counts) / self.counts_per_rot * self.meter_per_rot
    }

    /// Ramp magnitude in rate units per second.
    pub fn ramp_from_accel(&self, accel: f64) -> u32 {
        (accel.abs() * self.rate_units_per_mps())
            .round()
            .min(f64::from(i32::MAX)) as u32
    }
}

impl From<&InputScan> for DriveStatus {
    fn from(scan: &InputScan) -> Self {
        DriveStatus {
            mode: scan.mode,
            ready: scan.has(STATUS_READY),
            enabled: scan.has(STATUS_ENABLED),
            quick_stopped: scan.has(STATUS_QUICK_STOP),
            fault: scan.has(STATUS_FAULT),
            warning: scan.has(STATUS_WARNING),
            target_reached: scan.has(STATUS_TARGET_REACHED),
            fault_code: scan.fault_code,
            warning_code: scan.warning_code,
            speed: 0.0,
            position: 0.0,
        }
    }
}
