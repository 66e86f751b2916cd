//! VISA / GPIB transport (feature `visa`).
//!
//! The VISA library is blocking, so every session call runs on the blocking
//! pool. The resource manager lives alongside the instrument session; dropping
//! it would invalidate the session.

use crate::line::LineConfig;
use async_trait::async_trait;
use labdrive_core::transport::{LinkState, ReadMode, Transport};
use labdrive_core::{InstrError, InstrResult};
use parking_lot::Mutex;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, trace};
use visa_rs::prelude::*;

struct Session {
    _rm: DefaultRM,
    instrument: Instrument,
}

/// Resource string for a GPIB primary address on a board.
pub fn gpib_resource(board: u8, address: u8) -> String {
    format!("GPIB{}::{}::INSTR", board, address)
}

/// Message-based VISA session (GPIB, USB, TCPIP, ASRL resources).
pub struct VisaTransport {
    resource: String,
    config: LineConfig,
    session: Arc<Mutex<Option<Session>>>,
    open: AtomicBool,
}

fn visa_error(context: &str, err: impl std::fmt::Display) -> InstrError {
    InstrError::transport(format!("VISA {}: {}", context, err))
}

impl VisaTransport {
    pub fn new(resource: impl Into<String>, config: LineConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            session: Arc::new(Mutex::new(None)),
            open: AtomicBool::new(false),
        }
    }

    pub fn gpib(board: u8, address: u8, config: LineConfig) -> Self {
        Self::new(gpib_resource(board, address), config)
    }

    /// Runs `f` against the open session on the blocking pool.
    async fn with_session<T, F>(&self, f: F) -> InstrResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Instrument, &LineConfig) -> InstrResult<T> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let config = self.config.clone();
        let resource = self.resource.clone();
        tokio::task::spawn_blocking(move || {
            let guard = session.lock();
            let session = guard
                .as_ref()
                .ok_or_else(|| InstrError::state(format!("visa://{} is not open", resource)))?;
            f(&session.instrument, &config)
        })
        .await
        .map_err(|e| InstrError::transport(format!("VISA task failed: {}", e)))?
    }
}

fn write_frame(instrument: &Instrument, config: &LineConfig, payload: &[u8]) -> InstrResult<()> {
    let mut frame = payload.to_vec();
    if !frame.ends_with(&config.write_terminator) {
        frame.extend_from_slice(&config.write_terminator);
    }
    let mut writer = instrument;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

fn read_frame(instrument: &Instrument, config: &LineConfig, mode: &ReadMode) -> InstrResult<Vec<u8>> {
    let mut reader = instrument;
    let delimiter = match mode {
        ReadMode::Exact(n) => {
            let mut buf = vec![0u8; *n];
            reader.read_exact(&mut buf)?;
            return Ok(buf);
        }
        ReadMode::Until(delimiter) => delimiter.as_slice(),
        ReadMode::Frame => config.read_terminator.as_slice(),
    };
    let mut out = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(InstrError::transport("VISA read returned no data"));
        }
        out.extend_from_slice(&chunk[..n]);
        if out.ends_with(delimiter) {
            out.truncate(out.len() - delimiter.len());
            return Ok(out);
        }
    }
}

#[async_trait]
impl Transport for VisaTransport {
    fn describe(&self) -> String {
        format!("visa://{}", self.resource)
    }

    fn state(&self) -> LinkState {
        if self.open.load(Ordering::SeqCst) {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    #[instrument(skip(self), fields(resource = %self.resource), err)]
    async fn open(&self) -> InstrResult<()> {
        let session = Arc::clone(&self.session);
        let resource = self.resource.clone();
        let timeout = self.config.timeout;
        tokio::task::spawn_blocking(move || {
            let mut guard = session.lock();
            if guard.is_some() {
                return Ok(());
            }
            let rm = DefaultRM::new().map_err(|e| visa_error("resource manager", e))?;
            let name = CString::new(resource.as_str())
                .map_err(|_| InstrError::Configuration(format!("bad resource '{}'", resource)))?;
            let instrument = rm
                .open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| visa_error("open", e))?;
            *guard = Some(Session {
                _rm: rm,
                instrument,
            });
            Ok::<_, InstrError>(())
        })
        .await
        .map_err(|e| InstrError::transport(format!("VISA task failed: {}", e)))??;
        self.open.store(true, Ordering::SeqCst);
        info!("visa session opened");
        Ok(())
    }

    async fn close(&self) -> InstrResult<()> {
        self.open.store(false, Ordering::SeqCst);
        let session = Arc::clone(&self.session);
        let dropped = tokio::task::spawn_blocking(move || session.lock().take().is_some())
            .await
            .map_err(|e| InstrError::transport(format!("VISA task failed: {}", e)))?;
        if dropped {
            info!(resource = %self.resource, "visa session closed");
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> InstrResult<()> {
        trace!(frame = ?String::from_utf8_lossy(payload), "visa write");
        let payload = payload.to_vec();
        self.with_session(move |instrument, config| write_frame(instrument, config, &payload))
            .await
    }

    async fn read(&self, mode: ReadMode) -> InstrResult<Vec<u8>> {
        self.with_session(move |instrument, config| read_frame(instrument, config, &mode))
            .await
    }

    async fn query(&self, payload: &[u8]) -> InstrResult<Vec<u8>> {
        trace!(frame = ?String::from_utf8_lossy(payload), "visa query");
        let payload = payload.to_vec();
        self.with_session(move |instrument, config| {
            write_frame(instrument, config, &payload)?;
            read_frame(instrument, config, &ReadMode::Frame)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpib_resource_strings() {
        assert_eq!(gpib_resource(0, 22), "GPIB0::22::INSTR");
        let transport = VisaTransport::gpib(1, 5, LineConfig::default());
        assert_eq!(transport.describe(), "visa://GPIB1::5::INSTR");
        assert!(!transport.is_open());
    }
}
