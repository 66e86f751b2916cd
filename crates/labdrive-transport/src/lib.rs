//! Transport adapters for labdrive instruments.
//!
//! Every adapter implements [`labdrive_core::Transport`]:
//!
//! | Adapter | Framing |
//! |---|---|
//! | [`LineTransport`] (serial, TCP, USB-TMC) | terminator-delimited text |
//! | [`visa::VisaTransport`] (feature `visa`) | VISA message session, GPIB |
//! | [`ModbusRtu`] | unit id + PDU + CRC-16, silence-delimited |
//! | [`ModbusTcp`] | MBAP header + PDU |
//! | [`CompositeSocket`] | `<status>,<body>,EndOfAPI` replies |

pub mod composite;
pub mod line;
pub mod modbus;
pub mod newport;
pub mod stream;
#[cfg(feature = "visa")]
pub mod visa;

pub use composite::{CompositeSocket, StatusTable};
pub use line::{LineConfig, LineTransport, StreamTransport, TcpTransport, UsbTmcTransport};
pub use modbus::{ModbusRtu, ModbusTcp};
pub use stream::{Connector, DynStream, Parity, SerialSettings};

#[cfg(feature = "serial")]
pub use line::SerialTransport;
