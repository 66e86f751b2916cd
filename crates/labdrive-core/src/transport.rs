//! Byte-level transport contract shared by every adapter.
//!
//! A transport is a stateful connection (*closed → open → closed*) that moves
//! raw bytes. Adapters own their connection behind a per-connection lock, so
//! `query` is an atomic write-then-read with respect to other callers of the
//! same transport. Distinct transports never share state.
//!
//! Register-oriented transports (Modbus RTU and TCP) additionally expose
//! [`RegisterAccess`] through [`Transport::registers`].

use crate::error::{InstrError, InstrResult};
use crate::error_recovery::Recoverable;
use async_trait::async_trait;
use std::sync::Arc;

/// How much to read in [`Transport::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadMode {
    /// Exactly this many bytes.
    Exact(usize),
    /// Up to and including the given delimiter. The delimiter is stripped.
    Until(Vec<u8>),
    /// One frame as defined by the adapter (line terminator, Modbus ADU, ...).
    Frame,
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Open,
}

/// Uniform byte-level I/O to one device.
///
/// All methods take `&self`; implementations serialise access internally.
/// `close` must be idempotent. Underlying failures map to the transport kind
/// ([`InstrError::Io`], [`InstrError::Timeout`], [`InstrError::Transport`]),
/// undecodable replies to [`InstrError::Protocol`], and device failure codes to
/// [`InstrError::Remote`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable address, e.g. `tcp://192.168.0.254:5001`.
    fn describe(&self) -> String;

    fn state(&self) -> LinkState;

    fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    async fn open(&self) -> InstrResult<()>;

    async fn close(&self) -> InstrResult<()>;

    async fn write(&self, payload: &[u8]) -> InstrResult<()>;

    async fn read(&self, mode: ReadMode) -> InstrResult<Vec<u8>>;

    /// Write `payload` and read one frame back, holding the connection lock
    /// for the whole exchange.
    async fn query(&self, payload: &[u8]) -> InstrResult<Vec<u8>>;

    /// Register-level access, for transports that speak Modbus.
    fn registers(&self) -> Option<&dyn RegisterAccess> {
        None
    }
}

/// Word-addressed access to 16-bit device registers.
#[async_trait]
pub trait RegisterAccess: Send + Sync {
    /// Function 0x03.
    async fn read_holding_registers(&self, address: u16, count: u16) -> InstrResult<Vec<u16>>;

    /// Function 0x04.
    async fn read_input_registers(&self, address: u16, count: u16) -> InstrResult<Vec<u16>>;

    /// Function 0x06 for a single word, 0x10 otherwise.
    async fn write_registers(&self, address: u16, values: &[u16]) -> InstrResult<()>;
}

/// A transport shared between a driver and its retry hook.
pub type SharedTransport = Arc<dyn Transport>;

/// Recovers a transport by closing and re-opening it.
pub struct Reconnect<'a>(pub &'a dyn Transport);

#[async_trait]
impl Recoverable for Reconnect<'_> {
    async fn recover(&self) -> InstrResult<()> {
        self.0.close().await?;
        self.0.open().await
    }
}

/// Fails with a state error when the transport is not open.
pub fn ensure_open(transport: &dyn Transport) -> InstrResult<()> {
    if transport.is_open() {
        Ok(())
    } else {
        Err(InstrError::state(format!(
            "transport {} is not open",
            transport.describe()
        )))
    }
}

/// Decodes a text reply, dropping surrounding whitespace and terminators.
pub fn reply_text(bytes: &[u8]) -> InstrResult<String> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| InstrError::protocol(format!("reply is not valid UTF-8: {}", e)))?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_text_trims_terminators() {
        assert_eq!(reply_text(b" 1.250\r\n").unwrap(), "1.250");
        assert!(reply_text(&[0xff, 0xfe]).is_err());
    }
}
