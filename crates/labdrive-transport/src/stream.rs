//! Byte streams underneath the transports.
//!
//! Serial ports, TCP sockets, USB-TMC device nodes and in-memory duplex pipes
//! all reduce to an `AsyncRead + AsyncWrite` stream. A [`Connector`] knows how
//! to (re)establish one, which is what lets transports be closed and re-opened
//! by the retry machinery.

use async_trait::async_trait;
use labdrive_core::{InstrError, InstrResult};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async stream I/O.
///
/// Implemented by `tokio_serial::SerialStream`, `tokio::net::TcpStream`,
/// `tokio::fs::File` and `tokio::io::DuplexStream` (tests).
pub trait StreamIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIO for T {}

/// Type-erased boxed stream.
pub type DynStream = Box<dyn StreamIO>;

/// Establishes a fresh stream to a device.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Address shown in logs and errors.
    fn describe(&self) -> String;

    async fn connect(&self) -> InstrResult<DynStream>;
}

/// TCP socket connector (`host:port`).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub address: String,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }

    async fn connect(&self) -> InstrResult<DynStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(&self.address),
        )
        .await
        .map_err(|_| InstrError::Timeout(self.connect_timeout))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// USB Test & Measurement Class device node, e.g. `/dev/usbtmc0`.
#[derive(Debug, Clone)]
pub struct UsbTmcConnector {
    pub path: String,
}

#[async_trait]
impl Connector for UsbTmcConnector {
    fn describe(&self) -> String {
        format!("usbtmc://{}", self.path)
    }

    async fn connect(&self) -> InstrResult<DynStream> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| InstrError::transport(format!("cannot open {}: {}", self.path, e)))?;
        Ok(Box::new(file))
    }
}

/// Parity setting for serial links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings; defaults to 9600 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }

    /// Bits on the wire per character: start + data + parity + stop.
    pub fn bits_per_char(&self) -> u32 {
        let parity = u32::from(self.parity != Parity::None);
        1 + u32::from(self.data_bits) + parity + u32::from(self.stop_bits)
    }
}

/// Serial port connector.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub settings: SerialSettings,
}

#[cfg(feature = "serial")]
#[async_trait]
impl Connector for SerialConnector {
    fn describe(&self) -> String {
        format!("serial://{}@{}", self.settings.path, self.settings.baud_rate)
    }

    async fn connect(&self) -> InstrResult<DynStream> {
        let port = open_serial_async(&self.settings).await?;
        Ok(Box::new(port))
    }
}

/// Opens a serial port on a blocking thread.
#[cfg(feature = "serial")]
pub async fn open_serial_async(settings: &SerialSettings) -> InstrResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let settings = settings.clone();
    tokio::task::spawn_blocking(move || {
        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = if settings.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        tokio_serial::new(&settings.path, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                InstrError::transport(format!("failed to open serial port {}: {}", settings.path, e))
            })
    })
    .await
    .map_err(|e| InstrError::transport(format!("serial open task failed: {}", e)))?
}

/// Hands out one pre-established stream, e.g. one end of `tokio::io::duplex`.
///
/// A second `connect` fails, since the stream cannot be recreated.
pub struct StreamConnector {
    label: String,
    stream: Mutex<Option<DynStream>>,
}

impl StreamConnector {
    pub fn new(label: impl Into<String>, stream: DynStream) -> Self {
        Self {
            label: label.into(),
            stream: Mutex::new(Some(stream)),
        }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    fn describe(&self) -> String {
        format!("stream://{}", self.label)
    }

    async fn connect(&self) -> InstrResult<DynStream> {
        self.stream
            .lock()
            .take()
            .ok_or_else(|| InstrError::transport(format!("stream {} already consumed", self.label)))
    }
}

/// Reads and discards whatever is immediately available.
///
/// Returns the number of bytes discarded.
pub async fn drain_stream<R: AsyncRead + Unpin + ?Sized>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }
    total
}
