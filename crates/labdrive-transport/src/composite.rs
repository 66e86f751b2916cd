//! Socket transport whose replies are `<status>,<body>,EndOfAPI`.
//!
//! Requests are written bare; each reply runs up to the `EndOfAPI` marker.
//! A non-zero status becomes a remote error described through a
//! [`StatusTable`], unless the table lists it as ignorable.

use crate::line::{LineConfig, LineTransport};
use crate::stream::{Connector, DynStream, StreamConnector, TcpConnector};
use async_trait::async_trait;
use labdrive_core::transport::{reply_text, LinkState, ReadMode, Transport};
use labdrive_core::{InstrError, InstrResult};
use std::time::Duration;
use tracing::warn;

pub const END_MARKER: &str = "EndOfAPI";

/// Maps status codes to descriptions and names the codes that are warnings.
#[derive(Debug, Clone)]
pub struct StatusTable {
    describe: fn(i32) -> &'static str,
    ignored: Vec<i32>,
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new(|_| "Unknown error")
    }
}

impl StatusTable {
    pub fn new(describe: fn(i32) -> &'static str) -> Self {
        Self {
            describe,
            ignored: Vec::new(),
        }
    }

    pub fn ignoring(mut self, codes: &[i32]) -> Self {
        self.ignored.extend_from_slice(codes);
        self
    }

    pub fn describe(&self, code: i32) -> &'static str {
        (self.describe)(code)
    }

    pub fn check(&self, status: i32, context: &str) -> InstrResult<()> {
        if status == 0 {
            return Ok(());
        }
        if self.ignored.contains(&status) {
            warn!(status, context, "ignoring controller warning");
            return Ok(());
        }
        Err(InstrError::Remote {
            code: status,
            description: self.describe(status).to_string(),
        })
    }
}

/// Status and body of one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeReply {
    pub status: i32,
    pub body: String,
}

impl CompositeReply {
    /// Comma-separated body fields.
    pub fn fields(&self) -> Vec<String> {
        if self.body.is_empty() {
            return Vec::new();
        }
        self.body.split(',').map(|f| f.trim().to_string()).collect()
    }
}

/// Parses `<status>,<body>,` (marker already stripped) or the full reply.
pub fn parse_reply(raw: &str) -> InstrResult<CompositeReply> {
    let raw = raw.trim();
    let raw = raw.strip_suffix(END_MARKER).unwrap_or(raw);
    let raw = raw.strip_suffix(',').unwrap_or(raw);
    let (status, body) = raw.split_once(',').unwrap_or((raw, ""));
    let status = status
        .trim()
        .parse::<i32>()
        .map_err(|_| InstrError::protocol(format!("reply status '{}' is not an integer", status)))?;
    Ok(CompositeReply {
        status,
        body: body.to_string(),
    })
}

/// Request/reply socket with status-coded replies.
pub struct CompositeSocket<C: Connector> {
    line: LineTransport<C>,
    table: StatusTable,
}

fn framing(timeout: Duration) -> LineConfig {
    LineConfig {
        write_terminator: Vec::new(),
        read_terminator: END_MARKER.as_bytes().to_vec(),
        timeout,
    }
}

impl CompositeSocket<TcpConnector> {
    pub fn tcp(address: impl Into<String>, table: StatusTable, timeout: Duration) -> Self {
        Self {
            line: LineTransport::tcp(address, framing(timeout)),
            table,
        }
    }
}

impl CompositeSocket<StreamConnector> {
    pub fn from_stream(label: &str, stream: DynStream, table: StatusTable) -> Self {
        Self {
            line: LineTransport::from_stream(label, stream, framing(Duration::from_secs(2))),
            table,
        }
    }
}

impl<C: Connector> CompositeSocket<C> {
    pub fn table(&self) -> &StatusTable {
        &self.table
    }

    /// Sends one API call and returns its checked reply.
    pub async fn call(&self, command: &str) -> InstrResult<CompositeReply> {
        let raw = self.line.query(command.as_bytes()).await?;
        self.checked(&raw, command)
    }

    fn checked(&self, raw: &[u8], context: &str) -> InstrResult<CompositeReply> {
        let reply = parse_reply(&reply_text(raw)?)?;
        self.table.check(reply.status, context)?;
        Ok(reply)
    }
}

#[async_trait]
impl<C: Connector> Transport for CompositeSocket<C> {
    fn describe(&self) -> String {
        self.line.describe()
    }

    fn state(&self) -> LinkState {
        self.line.state()
    }

    async fn open(&self) -> InstrResult<()> {
        self.line.open().await
    }

    async fn close(&self) -> InstrResult<()> {
        self.line.close().await
    }

    async fn write(&self, payload: &[u8]) -> InstrResult<()> {
        self.line.write(payload).await
    }

    async fn read(&self, mode: ReadMode) -> InstrResult<Vec<u8>> {
        let raw = self.line.read(mode.clone()).await?;
        if mode != ReadMode::Frame {
            return Ok(raw);
        }
        Ok(self.checked(&raw, "read")?.body.into_bytes())
    }

    /// Returns only the body of a successful reply.
    async fn query(&self, payload: &[u8]) -> InstrResult<Vec<u8>> {
        let raw = self.line.query(payload).await?;
        let context = String::from_utf8_lossy(payload);
        Ok(self.checked(&raw, &context)?.body.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_replies() {
        let reply = parse_reply("0,1.2500,-0.5,EndOfAPI").unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(reply.fields(), vec!["1.2500", "-0.5"]);

        let bare = parse_reply("0,").unwrap();
        assert!(bare.fields().is_empty());

        assert!(parse_reply("OK,EndOfAPI").is_err());
    }

    #[test]
    fn status_table_ignores_warnings() {
        let table = StatusTable::new(|c| if c == -4 { "Unknown command" } else { "?" })
            .ignoring(&[2]);
        assert!(table.check(0, "x").is_ok());
        assert!(table.check(2, "x").is_ok());
        let err = table.check(-4, "x").unwrap_err();
        assert!(matches!(err, InstrError::Remote { code: -4, .. }));
        assert!(err.to_string().contains("Unknown command"));
    }
}
