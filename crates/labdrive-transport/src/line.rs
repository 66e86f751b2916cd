//! Message-terminated text transport.
//!
//! Covers raw serial ASCII, socket ASCII and USB-TMC: every frame ends with a
//! configurable terminator. The connection lives behind a tokio mutex, so a
//! `query` holds the lock across its write and its read and two callers can
//! never interleave half-transactions.

use crate::stream::{Connector, DynStream, StreamConnector, TcpConnector, UsbTmcConnector};
use async_trait::async_trait;
use labdrive_core::transport::{LinkState, ReadMode, Transport};
use labdrive_core::{InstrError, InstrResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace};

/// Framing and timing of a [`LineTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineConfig {
    /// Appended to every written frame unless already present.
    pub write_terminator: Vec<u8>,
    /// Marks the end of every read frame; stripped from replies.
    pub read_terminator: Vec<u8>,
    /// Per-operation I/O timeout.
    pub timeout: Duration,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            write_terminator: b"\n".to_vec(),
            read_terminator: b"\n".to_vec(),
            timeout: Duration::from_secs(2),
        }
    }
}

impl LineConfig {
    /// `\r\n` in both directions, common for RS-232 controllers.
    pub fn crlf() -> Self {
        Self {
            write_terminator: b"\r\n".to_vec(),
            read_terminator: b"\r\n".to_vec(),
            ..Self::default()
        }
    }
}

type Port = BufReader<DynStream>;

/// Terminator-delimited transport over any [`Connector`].
pub struct LineTransport<C: Connector> {
    connector: C,
    config: LineConfig,
    port: Mutex<Option<Port>>,
    open: AtomicBool,
}

pub type TcpTransport = LineTransport<TcpConnector>;
pub type UsbTmcTransport = LineTransport<UsbTmcConnector>;
pub type StreamTransport = LineTransport<StreamConnector>;
#[cfg(feature = "serial")]
pub type SerialTransport = LineTransport<crate::stream::SerialConnector>;

impl LineTransport<TcpConnector> {
    pub fn tcp(address: impl Into<String>, config: LineConfig) -> Self {
        Self::new(TcpConnector::new(address), config)
    }
}

impl LineTransport<UsbTmcConnector> {
    pub fn usbtmc(path: impl Into<String>, config: LineConfig) -> Self {
        Self::new(UsbTmcConnector { path: path.into() }, config)
    }
}

#[cfg(feature = "serial")]
impl LineTransport<crate::stream::SerialConnector> {
    pub fn serial(settings: crate::stream::SerialSettings, config: LineConfig) -> Self {
        Self::new(crate::stream::SerialConnector { settings }, config)
    }
}

impl LineTransport<StreamConnector> {
    /// Wraps an already-connected stream (tests, pipes).
    pub fn from_stream(label: &str, stream: DynStream, config: LineConfig) -> Self {
        Self::new(StreamConnector::new(label, stream), config)
    }
}

impl<C: Connector> LineTransport<C> {
    pub fn new(connector: C, config: LineConfig) -> Self {
        Self {
            connector,
            config,
            port: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    fn closed_error(&self) -> InstrError {
        InstrError::state(format!("{} is not open", self.connector.describe()))
    }

    async fn write_frame(&self, port: &mut Port, payload: &[u8]) -> InstrResult<()> {
        let mut frame = payload.to_vec();
        let term = &self.config.write_terminator;
        if !term.is_empty() && !frame.ends_with(term) {
            frame.extend_from_slice(term);
        }
        trace!(frame = ?String::from_utf8_lossy(&frame), "write");
        let stream = port.get_mut();
        tokio::time::timeout(self.config.timeout, async {
            stream.write_all(&frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| InstrError::Timeout(self.config.timeout))??;
        Ok(())
    }

    async fn read_frame(&self, port: &mut Port, mode: ReadMode) -> InstrResult<Vec<u8>> {
        let read = async {
            match mode {
                ReadMode::Exact(n) => read_exact(port, n).await,
                ReadMode::Until(delimiter) => read_until(port, &delimiter).await,
                ReadMode::Frame => read_until(port, &self.config.read_terminator).await,
            }
        };
        let frame = tokio::time::timeout(self.config.timeout, read)
            .await
            .map_err(|_| InstrError::Timeout(self.config.timeout))??;
        trace!(frame = ?String::from_utf8_lossy(&frame), "read");
        Ok(frame)
    }
}

async fn read_exact(port: &mut Port, n: usize) -> InstrResult<Vec<u8>> {
    let mut buf = vec![0u8; n];
    port.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads until `delimiter` and strips it. EOF before the delimiter is a
/// transport error.
async fn read_until(port: &mut Port, delimiter: &[u8]) -> InstrResult<Vec<u8>> {
    let Some(&last) = delimiter.last() else {
        return Err(InstrError::Configuration("empty read terminator".into()));
    };
    let mut buf = Vec::new();
    loop {
        let n = port.read_until(last, &mut buf).await?;
        if n == 0 {
            return Err(InstrError::transport("connection closed by peer"));
        }
        if buf.ends_with(delimiter) {
            buf.truncate(buf.len() - delimiter.len());
            return Ok(buf);
        }
    }
}

#[async_trait]
impl<C: Connector> Transport for LineTransport<C> {
    fn describe(&self) -> String {
        self.connector.describe()
    }

    fn state(&self) -> LinkState {
        if self.open.load(Ordering::SeqCst) {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    #[instrument(skip(self), fields(address = %self.connector.describe()), err)]
    async fn open(&self) -> InstrResult<()> {
        let mut port = self.port.lock().await;
        if port.is_some() {
            return Ok(());
        }
        let stream = self.connector.connect().await?;
        *port = Some(BufReader::new(stream));
        self.open.store(true, Ordering::SeqCst);
        info!("transport opened");
        Ok(())
    }

    async fn close(&self) -> InstrResult<()> {
        let mut port = self.port.lock().await;
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut stream) = port.take() {
            // Peer may already be gone; closing must still succeed.
            if let Err(e) = stream.get_mut().shutdown().await {
                debug!(error = %e, "shutdown on close failed");
            }
            info!(address = %self.connector.describe(), "transport closed");
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> InstrResult<()> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.write_frame(port, payload).await
    }

    async fn read(&self, mode: ReadMode) -> InstrResult<Vec<u8>> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.read_frame(port, mode).await
    }

    async fn query(&self, payload: &[u8]) -> InstrResult<Vec<u8>> {
        let mut guard = self.port.lock().await;
        let port = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.write_frame(port, payload).await?;
        self.read_frame(port, ReadMode::Frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labdrive_core::ErrorKind;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn pair(config: LineConfig) -> (tokio::io::DuplexStream, StreamTransport) {
        let (host, device) = tokio::io::duplex(256);
        (host, LineTransport::from_stream("test", Box::new(device), config))
    }

    #[tokio::test]
    async fn query_appends_and_strips_terminators() {
        let (host, transport) = pair(LineConfig::crlf());
        transport.open().await.unwrap();

        let instrument = tokio::spawn(async move {
            let mut reader = BufReader::new(host);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "*IDN?\r\n");
            reader.get_mut().write_all(b"ACME,X1,0,1.0\r\n").await.unwrap();
        });

        let reply = transport.query(b"*IDN?").await.unwrap();
        assert_eq!(reply, b"ACME,X1,0,1.0".to_vec());
        instrument.await.unwrap();
    }

    #[tokio::test]
    async fn multi_byte_terminator_ignores_lone_newline() {
        let (mut host, transport) = pair(LineConfig::crlf());
        transport.open().await.unwrap();
        host.write_all(b"a\nb\r\n").await.unwrap();
        assert_eq!(transport.read(ReadMode::Frame).await.unwrap(), b"a\nb".to_vec());
    }

    #[tokio::test]
    async fn exact_reads() {
        let (mut host, transport) = pair(LineConfig::default());
        transport.open().await.unwrap();
        host.write_all(&[1, 2, 3, 4]).await.unwrap();
        assert_eq!(
            transport.read(ReadMode::Exact(3)).await.unwrap(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (_host, transport) = pair(LineConfig {
            timeout: Duration::from_millis(100),
            ..LineConfig::default()
        });
        transport.open().await.unwrap();
        let err = transport.query(b"MEAS?").await.unwrap_err();
        assert!(matches!(err, InstrError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn closed_transport_and_idempotent_close() {
        let (host, transport) = pair(LineConfig::default());
        assert_eq!(
            transport.write(b"*CLS").await.unwrap_err().kind(),
            ErrorKind::State
        );
        transport.open().await.unwrap();
        transport.open().await.unwrap();
        assert!(transport.is_open());
        drop(host);
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn peer_hangup_is_transport_error() {
        let (host, transport) = pair(LineConfig::default());
        transport.open().await.unwrap();
        drop(host);
        let err = transport.read(ReadMode::Frame).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
