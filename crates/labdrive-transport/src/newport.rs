//! Newport XPS-style controller status tables.
//!
//! Every API call returns an integer status: `0` is success, negative values
//! are errors from a closed table, and `2` is a warning callers ignore.

use crate::composite::StatusTable;

/// Status code callers treat as a warning and otherwise ignore.
pub const WARNING: i32 = 2;

const ERRORS: &[(i32, &str)] = &[
    (0, "Successful command"),
    (-1, "Busy socket: previous command not yet finished"),
    (-2, "TCP timeout"),
    (-3, "String command too long"),
    (-4, "Unknown command"),
    (-5, "Not allowed due to a positioner error or hardware status"),
    (-7, "Wrong format in the command string"),
    (-8, "Wrong object type for this command"),
    (-9, "Wrong number of parameters in the command"),
    (-10, "Wrong parameter type in the command string"),
    (-17, "Parameter out of range or incorrect"),
    (-18, "Positioner name does not exist or unknown command"),
    (-19, "Group name does not exist or unknown command"),
    (-21, "Not allowed action due to group state"),
    (-22, "Not allowed action"),
    (-24, "Not available in this configuration"),
    (-25, "Following error"),
    (-26, "Emergency signal"),
    (-27, "Move aborted"),
    (-28, "Home search timeout"),
    (-33, "Motion done timeout"),
    (-35, "Position is outside of travel limits"),
    (-108, "TCP/IP connection was closed by an administrator"),
];

/// Description of a controller status code.
pub fn describe_error(code: i32) -> &'static str {
    if code == WARNING {
        return "Warning";
    }
    ERRORS
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, description)| *description)
        .unwrap_or("Unknown error")
}

/// Status table for the composite-reply socket.
pub fn status_table() -> StatusTable {
    StatusTable::new(describe_error).ignoring(&[WARNING])
}

/// Decoded controller status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerStatus {
    pub initialization_failed: bool,
    pub socket_limit_reached: bool,
    pub cpu_overloaded: bool,
    pub interrupt_lost: bool,
    pub interferometer_present: bool,
    pub velocity_limited: bool,
    pub lift_pin_up: bool,
}

impl ControllerStatus {
    pub const INITIALIZATION_FAILED: u32 = 1 << 0;
    pub const SOCKET_LIMIT_REACHED: u32 = 1 << 1;
    pub const CPU_OVERLOADED: u32 = 1 << 2;
    pub const INTERRUPT_LOST: u32 = 1 << 3;
    pub const INTERFEROMETER_PRESENT: u32 = 1 << 4;
    pub const VELOCITY_LIMITED: u32 = 1 << 5;
    pub const LIFT_PIN_UP: u32 = 1 << 6;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            initialization_failed: bits & Self::INITIALIZATION_FAILED != 0,
            socket_limit_reached: bits & Self::SOCKET_LIMIT_REACHED != 0,
            cpu_overloaded: bits & Self::CPU_OVERLOADED != 0,
            interrupt_lost: bits & Self::INTERRUPT_LOST != 0,
            interferometer_present: bits & Self::INTERFEROMETER_PRESENT != 0,
            velocity_limited: bits & Self::VELOCITY_LIMITED != 0,
            lift_pin_up: bits & Self::LIFT_PIN_UP != 0,
        }
    }

    /// True when any condition other than informational flags is set.
    pub fn has_fault(&self) -> bool {
        self.initialization_failed
            || self.socket_limit_reached
            || self.cpu_overloaded
            || self.interrupt_lost
    }

    /// Human-readable list of set conditions.
    pub fn conditions(&self) -> Vec<&'static str> {
        [
            (self.initialization_failed, "controller initialization failed"),
            (self.socket_limit_reached, "number of open sockets reached the limit"),
            (self.cpu_overloaded, "controller CPU overloaded"),
            (self.interrupt_lost, "servo interrupt lost"),
            (self.interferometer_present, "interferometer present"),
            (self.velocity_limited, "velocity limited"),
            (self.lift_pin_up, "lift pin up"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
        .collect()
    }
}
