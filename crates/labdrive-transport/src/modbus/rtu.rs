//! Modbus RTU over a serial line.
//!
//! ADU = unit id + PDU + CRC-16/MODBUS (low byte first). Frames are delimited
//! by at least 3.5 character times of line silence; above 19200 baud the gap
//! is fixed at 1.75 ms.

use super::pdu::Request;
use super::FrameError;
use crate::stream::{Connector, DynStream, StreamConnector};
use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use labdrive_core::transport::{LinkState, ReadMode, RegisterAccess, Transport};
use labdrive_core::{InstrError, InstrResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const MIN_GAP: Duration = Duration::from_micros(1750);

/// Inter-frame silence for a line speed.
pub fn silence_gap(baud_rate: u32, bits_per_char: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return MIN_GAP;
    }
    Duration::from_secs_f64(3.5 * f64::from(bits_per_char) / f64::from(baud_rate)).max(MIN_GAP)
}

/// Wraps a PDU into an RTU ADU.
pub fn encode_adu(unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut adu = Vec::with_capacity(pdu.len() + 3);
    adu.push(unit);
    adu.extend_from_slice(pdu);
    let crc = MODBUS_CRC.checksum(&adu);
    adu.extend_from_slice(&crc.to_le_bytes());
    adu
}

/// Checks CRC and unit id and returns the PDU.
pub fn decode_adu(unit: u8, adu: &[u8]) -> Result<Vec<u8>, FrameError> {
    if adu.len() < 4 {
        return Err(FrameError::Truncated {
            expected: 4,
            got: adu.len(),
        });
    }
    let (body, tail) = adu.split_at(adu.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = MODBUS_CRC.checksum(body);
    if computed != received {
        return Err(FrameError::Crc { computed, received });
    }
    if body[0] != unit {
        return Err(FrameError::UnitMismatch {
            expected: unit,
            got: body[0],
        });
    }
    Ok(body[1..].to_vec())
}

struct Link {
    stream: DynStream,
    quiet_since: Instant,
}

/// Modbus RTU master for one unit on a serial line.
pub struct ModbusRtu<C: Connector> {
    connector: C,
    unit: u8,
    gap: Duration,
    timeout: Duration,
    link: Mutex<Option<Link>>,
    open: AtomicBool,
}

#[cfg(feature = "serial")]
impl ModbusRtu<crate::stream::SerialConnector> {
    pub fn serial(settings: crate::stream::SerialSettings, unit: u8) -> Self {
        let gap = silence_gap(settings.baud_rate, settings.bits_per_char());
        Self::new(crate::stream::SerialConnector { settings }, unit, gap)
    }
}

impl ModbusRtu<StreamConnector> {
    pub fn from_stream(label: &str, stream: DynStream, unit: u8, gap: Duration) -> Self {
        Self::new(StreamConnector::new(label, stream), unit, gap)
    }
}

impl<C: Connector> ModbusRtu<C> {
    pub fn new(connector: C, unit: u8, gap: Duration) -> Self {
        Self {
            connector,
            unit,
            gap: gap.max(MIN_GAP),
            timeout: Duration::from_secs(1),
            link: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    pub fn gap(&self) -> Duration {
        self.gap
    }

    fn closed_error(&self) -> InstrError {
        InstrError::state(format!("{} is not open", self.connector.describe()))
    }

    async fn send(&self, link: &mut Link, pdu: &[u8]) -> InstrResult<()> {
        tokio::time::sleep_until(link.quiet_since + self.gap).await;
        let adu = encode_adu(self.unit, pdu);
        trace!(adu = ?adu, "rtu write");
        tokio::time::timeout(self.timeout, async {
            link.stream.write_all(&adu).await?;
            link.stream.flush().await
        })
        .await
        .map_err(|_| InstrError::Timeout(self.timeout))??;
        link.quiet_since = Instant::now();
        Ok(())
    }

    /// Reads one ADU: everything up to the first silence of one gap.
    async fn receive(&self, link: &mut Link) -> InstrResult<Vec<u8>> {
        let mut buf = [0u8; 256];
        let mut adu = Vec::new();
        let n = tokio::time::timeout(self.timeout, link.stream.read(&mut buf))
            .await
            .map_err(|_| InstrError::Timeout(self.timeout))??;
        if n == 0 {
            return Err(InstrError::transport("connection closed by peer"));
        }
        adu.extend_from_slice(&buf[..n]);
        loop {
            match tokio::time::timeout(self.gap, link.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => adu.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        link.quiet_since = Instant::now();
        trace!(adu = ?adu, "rtu read");
        Ok(decode_adu(self.unit, &adu)?)
    }

    async fn transact(&self, request: Request<'_>) -> InstrResult<Vec<u16>> {
        let pdu = request.encode()?;
        let reply = self.query(&pdu).await?;
        request.parse_response(&reply)
    }
}

#[async_trait]
impl<C: Connector> Transport for ModbusRtu<C> {
    fn describe(&self) -> String {
        format!("modbus-rtu:{}#{}", self.connector.describe(), self.unit)
    }

    fn state(&self) -> LinkState {
        if self.open.load(Ordering::SeqCst) {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    #[instrument(skip(self), fields(unit = self.unit), err)]
    async fn open(&self) -> InstrResult<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }
        let stream = self.connector.connect().await?;
        *link = Some(Link {
            stream,
            quiet_since: Instant::now(),
        });
        self.open.store(true, Ordering::SeqCst);
        info!(gap_us = self.gap.as_micros() as u64, "modbus rtu opened");
        Ok(())
    }

    async fn close(&self) -> InstrResult<()> {
        let mut link = self.link.lock().await;
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut link) = link.take() {
            if let Err(e) = link.stream.shutdown().await {
                debug!(error = %e, "shutdown on close failed");
            }
            info!(unit = self.unit, "modbus rtu closed");
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> InstrResult<()> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.send(link, payload).await
    }

    async fn read(&self, mode: ReadMode) -> InstrResult<Vec<u8>> {
        if mode != ReadMode::Frame {
            return Err(InstrError::Configuration(
                "modbus transports only read whole frames".into(),
            ));
        }
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.receive(link).await
    }

    async fn query(&self, payload: &[u8]) -> InstrResult<Vec<u8>> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| self.closed_error())?;
        self.send(link, payload).await?;
        self.receive(link).await
    }

    fn registers(&self) -> Option<&dyn RegisterAccess> {
        Some(self)
    }
}

#[async_trait]
impl<C: Connector> RegisterAccess for ModbusRtu<C> {
    async fn read_holding_registers(&self, address: u16, count: u16) -> InstrResult<Vec<u16>> {
        self.transact(Request::ReadHolding { address, count }).await
    }

    async fn read_input_registers(&self, address: u16, count: u16) -> InstrResult<Vec<u16>> {
        self.transact(Request::ReadInput { address, count }).await
    }

    async fn write_registers(&self, address: u16, values: &[u16]) -> InstrResult<()> {
        self.transact(Request::write(address, values)).await?;
        Ok(())
    }
}
