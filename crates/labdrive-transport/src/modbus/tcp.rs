//! Modbus TCP.
//!
//! ADU = MBAP header (transaction id, protocol id 0, length, unit id) + PDU.
//! Every request gets the next transaction id. Received bytes are buffered
//! across calls, so a reply that arrives after its request timed out is
//! recognised by its older id and skipped; a reply carrying any newer id is
//! rejected.

use super::pdu::Request;
use super::FrameError;
use crate::stream::{Connector, DynStream, StreamConnector, TcpConnector};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use labdrive_core::transport::{LinkState, ReadMode, RegisterAccess, Transport};
use labdrive_core::{InstrError, InstrResult};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace};

pub const DEFAULT_PORT: u16 = 502;

const MBAP_LEN: usize = 7;

/// Decoded MBAP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction: u16,
    pub protocol: u16,
    /// Byte count of unit id + PDU.
    pub length: u16,
    pub unit: u8,
}

impl MbapHeader {
    pub fn for_pdu(transaction: u16, unit: u8, pdu_len: usize) -> Self {
        Self {
            transaction,
            protocol: 0,
            length: (pdu_len + 1) as u16,
            unit,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction);
        buf.put_u16(self.protocol);
        buf.put_u16(self.length);
        buf.put_u8(self.unit);
    }

    pub fn decode(mut raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < MBAP_LEN {
            return Err(FrameError::Truncated {
                expected: MBAP_LEN,
                got: raw.len(),
            });
        }
        let header = Self {
            transaction: raw.get_u16(),
            protocol: raw.get_u16(),
            length: raw.get_u16(),
            unit: raw.get_u8(),
        };
        if header.protocol != 0 {
            return Err(FrameError::ProtocolId(header.protocol));
        }
        if !(2..=254).contains(&header.length) {
            return Err(FrameError::Length(header.length));
        }
        Ok(header)
    }
}

struct Link {
    stream: DynStream,
    /// Bytes read but not yet consumed as a whole frame.
    rx: BytesMut,
    /// Transaction id of the last request written.
    pending: Option<u16>,
}

impl Link {
    fn new(stream: DynStream) -> Self {
        Self {
            stream,
            rx: BytesMut::with_capacity(260),
            pending: None,
        }
    }

    /// Splits one complete frame off the receive buffer.
    fn take_frame(&mut self) -> Result<Option<(MbapHeader, Vec<u8>)>, FrameError> {
        if self.rx.len() < MBAP_LEN {
            return Ok(None);
        }
        let header = match MbapHeader::decode(&self.rx[..MBAP_LEN]) {
            Ok(header) => header,
            Err(e) => {
                // No way to find the next frame boundary in garbage.
                self.rx.clear();
                return Err(e);
            }
        };
        let total = MBAP_LEN + usize::from(header.length) - 1;
        if self.rx.len() < total {
            return Ok(None);
        }
        let frame = self.rx.split_to(total);
        Ok(Some((header, frame[MBAP_LEN..].to_vec())))
    }
}

/// True when `got` was issued before `expected` (modulo id wrap-around).
fn is_stale(expected: u16, got: u16) -> bool {
    (1..0x8000).contains(&expected.wrapping_sub(got))
}

/// Modbus TCP client for one unit id.
pub struct ModbusTcp<C: Connector> {
    connector: C,
    unit: u8,
    timeout: Duration,
    next_transaction: AtomicU16,
    link: Mutex<Option<Link>>,
    open: AtomicBool,
}

impl ModbusTcp<TcpConnector> {
    /// `address` without a port gets the standard port 502.
    pub fn connect_to(address: &str, unit: u8) -> Self {
        let address = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_PORT)
        };
        Self::new(TcpConnector::new(address), unit)
    }
}

impl ModbusTcp<StreamConnector> {
    pub fn from_stream(label: &str, stream: DynStream, unit: u8) -> Self {
        Self::new(StreamConnector::new(label, stream), unit)
    }
}

impl<C: Connector> ModbusTcp<C> {
    pub fn new(connector: C, unit: u8) -> Self {
        Self {
            connector,
            unit,
            timeout: Duration::from_secs(1),
            next_transaction: AtomicU16::new(1),
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

    fn closed_error(&self) -> InstrError {
        InstrError::state(format!("{} is not open", self.connector.describe()))
    }

    async fn send(&self, link: &mut Link, pdu: &[u8]) -> InstrResult<()> {
        let transaction = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        let mut adu = BytesMut::with_capacity(MBAP_LEN + pdu.len());
        MbapHeader::for_pdu(transaction, self.unit, pdu.len()).encode(&mut adu);
        adu.put_slice(pdu);
        trace!(transaction, adu = ?&adu[..], "mbap write");
        tokio::time::timeout(self.timeout, async {
            link.stream.write_all(&adu).await?;
            link.stream.flush().await
        })
        .await
        .map_err(|_| InstrError::Timeout(self.timeout))??;
        link.pending = Some(transaction);
        Ok(())
    }

    async fn receive(&self, link: &mut Link) -> InstrResult<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            while let Some((header, pdu)) = link.take_frame()? {
                trace!(transaction = header.transaction, pdu = ?pdu, "mbap read");
                if let Some(expected) = link.pending {
                    if is_stale(expected, header.transaction) {
                        debug!(
                            expected,
                            got = header.transaction,
                            "discarding late reply to an earlier request"
                        );
                        continue;
                    }
                    link.pending = None;
                    if header.transaction != expected {
                        return Err(FrameError::TransactionMismatch {
                            expected,
                            got: header.transaction,
                        }
                        .into());
                    }
                }
                if header.unit != self.unit {
                    return Err(FrameError::UnitMismatch {
                        expected: self.unit,
                        got: header.unit,
                    }
                    .into());
                }
                return Ok(pdu);
            }

            // `read_buf` loses nothing when the deadline cancels it; a partial
            // frame stays in `rx` for the next call.
            let read = tokio::time::timeout_at(deadline, link.stream.read_buf(&mut link.rx))
                .await
                .map_err(|_| InstrError::Timeout(self.timeout))??;
            if read == 0 {
                return Err(InstrError::transport(format!(
                    "{} closed by peer",
                    self.connector.describe()
                )));
            }
        }
    }

    async fn transact(&self, request: Request<'_>) -> InstrResult<Vec<u16>> {
        let pdu = request.encode()?;
        let reply = self.query(&pdu).await?;
        request.parse_response(&reply)
    }
}

#[async_trait]
impl<C: Connector> Transport for ModbusTcp<C> {
    fn describe(&self) -> String {
        format!("modbus-tcp:{}#{}", self.connector.describe(), self.unit)
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
        *link = Some(Link::new(stream));
        self.open.store(true, Ordering::SeqCst);
        info!("modbus tcp opened");
        Ok(())
    }

    async fn close(&self) -> InstrResult<()> {
        let mut link = self.link.lock().await;
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut link) = link.take() {
            if let Err(e) = link.stream.shutdown().await {
                debug!(error = %e, "shutdown on close failed");
            }
            info!(unit = self.unit, "modbus tcp closed");
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
impl<C: Connector> RegisterAccess for ModbusTcp<C> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut buf = BytesMut::new();
        MbapHeader::for_pdu(0x1234, 7, 5).encode(&mut buf);
        assert_eq!(&buf[..], &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x07]);
        let decoded = MbapHeader::decode(&buf).unwrap();
        assert_eq!(decoded.transaction, 0x1234);
        assert_eq!(decoded.length, 6);
    }

    #[test]
    fn foreign_protocol_id_is_rejected() {
        let raw = [0x00, 0x01, 0x00, 0x05, 0x00, 0x06, 0x01];
        assert_eq!(MbapHeader::decode(&raw), Err(FrameError::ProtocolId(5)));
    }

    #[test]
    fn older_ids_are_stale_across_wrap() {
        assert!(is_stale(5, 4));
        assert!(is_stale(1, u16::MAX));
        assert!(!is_stale(5, 5));
        assert!(!is_stale(5, 6));
    }

    #[test]
    fn partial_frame_waits_for_the_rest() {
        let mut buf = BytesMut::new();
        MbapHeader::for_pdu(9, 1, 3).encode(&mut buf);
        buf.put_slice(&[0x03, 0x02]);
        let (device, _host) = tokio::io::duplex(64);
        let mut link = Link::new(Box::new(device));
        link.rx.put_slice(&buf);
        assert_eq!(link.take_frame(), Ok(None));
        link.rx.put_u8(0x01);
        let (header, pdu) = link.take_frame().unwrap().unwrap();
        assert_eq!(header.transaction, 9);
        assert_eq!(pdu, vec![0x03, 0x02, 0x01]);
        assert!(link.rx.is_empty());
    }

    #[test]
    fn default_port_is_added() {
        let client = ModbusTcp::connect_to("10.0.0.5", 1);
        assert_eq!(client.describe(), "modbus-tcp:tcp://10.0.0.5:502#1");
    }
}
