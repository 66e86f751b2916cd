//! Modbus register transports.
//!
//! Both framings carry the same PDUs ([`pdu`]) and expose
//! [`RegisterAccess`](labdrive_core::RegisterAccess):
//!
//! - [`rtu::ModbusRtu`]: unit id + PDU + CRC-16, delimited by line silence
//! - [`tcp::ModbusTcp`]: MBAP header + PDU, matched by transaction id

pub mod pdu;
pub mod rtu;
pub mod tcp;

pub use rtu::ModbusRtu;
pub use tcp::ModbusTcp;

use labdrive_core::InstrError;
use thiserror::Error;

/// Framing-level decode failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    Crc { computed: u16, received: u16 },

    #[error("frame truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("function code mismatch: expected {expected:#04x}, got {got:#04x}")]
    FunctionMismatch { expected: u8, got: u8 },

    #[error("reply from unit {got}, expected unit {expected}")]
    UnitMismatch { expected: u8, got: u8 },

    #[error("transaction id mismatch: expected {expected}, got {got}")]
    TransactionMismatch { expected: u16, got: u16 },

    #[error("protocol id {0} is not Modbus")]
    ProtocolId(u16),

    #[error("MBAP length {0} is invalid")]
    Length(u16),
}

impl From<FrameError> for InstrError {
    fn from(err: FrameError) -> Self {
        InstrError::Protocol(err.to_string())
    }
}
