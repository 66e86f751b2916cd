//! In-memory transport for tests and demos.
//!
//! [`MockTransport`] behaves like a forgiving SCPI instrument with a Modbus
//! register bank attached:
//!
//! - `HEADER ARG` stores `ARG` under `HEADER`
//! - `HEADER?` answers with the stored value (or a scripted reply)
//! - register reads and writes hit a sparse 16-bit bank
//!
//! Every operation is counted so tests can assert that validation failures
//! perform no I/O.

use crate::error::{InstrError, InstrResult};
use crate::transport::{LinkState, ReadMode, RegisterAccess, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

#[derive(Default)]
struct MockState {
    settings: HashMap<String, String>,
    scripted: HashMap<String, VecDeque<String>>,
    pending: VecDeque<Vec<u8>>,
    registers: HashMap<u16, u16>,
    log: Vec<String>,
}

/// Counting mock transport.
#[derive(Default)]
pub struct MockTransport {
    open: AtomicBool,
    state: Mutex<MockState>,
    writes: AtomicUsize,
    queries: AtomicUsize,
    register_reads: AtomicUsize,
    register_writes: AtomicUsize,
    opens: AtomicUsize,
    fail_next: AtomicU32,
}

impl MockTransport {
    /// A closed mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that is already open.
    pub fn opened() -> Self {
        let mock = Self::default();
        mock.open.store(true, Ordering::SeqCst);
        mock
    }

    /// Presets the value returned by `HEADER?`.
    pub fn set_state(&self, header: &str, value: &str) {
        self.state
            .lock()
            .settings
            .insert(normalize(header), value.to_string());
    }

    pub fn state_of(&self, header: &str) -> Option<String> {
        self.state.lock().settings.get(&normalize(header)).cloned()
    }

    /// Queues a one-shot reply for `command`, taking precedence over the
    /// stored setting.
    pub fn script(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .scripted
            .entry(command.trim().to_string())
            .or_default()
            .push_back(reply.to_string());
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next `n` I/O operations fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Every command written so far, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn register_reads(&self) -> usize {
        self.register_reads.load(Ordering::SeqCst)
    }

    pub fn register_writes(&self) -> usize {
        self.register_writes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Total number of transactions of any kind.
    pub fn io_count(&self) -> usize {
        self.writes() + self.queries() + self.register_reads() + self.register_writes()
    }

    fn precheck(&self) -> InstrResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(InstrError::state("mock transport is not open"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(InstrError::transport("injected failure"));
        }
        Ok(())
    }

    /// Applies one command and returns the reply, if it was a query.
    fn execute(&self, payload: &[u8]) -> InstrResult<Option<Vec<u8>>> {
        let text = String::from_utf8_lossy(payload).trim().to_string();
        let mut state = self.state.lock();
        state.log.push(text.clone());
        if let Some(reply) = state.scripted.get_mut(&text).and_then(VecDeque::pop_front) {
            return Ok(Some(reply.into_bytes()));
        }
        if let Some(header) = text.strip_suffix('?') {
            let value = state
                .settings
                .get(&normalize(header))
                .cloned()
                .ok_or_else(|| InstrError::Timeout(std::time::Duration::ZERO))?;
            return Ok(Some(value.into_bytes()));
        }
        if let Some((header, arg)) = text.split_once(char::is_whitespace) {
            state
                .settings
                .insert(normalize(header), arg.trim().to_string());
        }
        Ok(None)
    }
}

fn normalize(header: &str) -> String {
    header.trim().to_ascii_uppercase()
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        "mock://".to_string()
    }

    fn state(&self) -> LinkState {
        if self.open.load(Ordering::SeqCst) {
            LinkState::Open
        } else {
            LinkState::Closed
        }
    }

    async fn open(&self) -> InstrResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> InstrResult<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> InstrResult<()> {
        self.precheck()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(reply) = self.execute(payload)? {
            self.state.lock().pending.push_back(reply);
        }
        Ok(())
    }

    async fn read(&self, mode: ReadMode) -> InstrResult<Vec<u8>> {
        self.precheck()?;
        let mut reply = self
            .state
            .lock()
            .pending
            .pop_front()
            .ok_or(InstrError::Timeout(std::time::Duration::ZERO))?;
        if let ReadMode::Exact(n) = mode {
            reply.truncate(n);
        }
        Ok(reply)
    }

    async fn query(&self, payload: &[u8]) -> InstrResult<Vec<u8>> {
        self.precheck()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.execute(payload)?
            .ok_or_else(|| InstrError::protocol("command produced no reply"))
    }

    fn registers(&self) -> Option<&dyn RegisterAccess> {
        Some(self)
    }
}

#[async_trait]
impl RegisterAccess for MockTransport {
    async fn read_holding_registers(&self, address: u16, count: u16) -> InstrResult<Vec<u16>> {
        self.precheck()?;
        self.register_reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok((0..count)
            .map(|i| {
                state
                    .registers
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn read_input_registers(&self, address: u16, count: u16) -> InstrResult<Vec<u16>> {
        self.read_holding_registers(address, count).await
    }

    async fn write_registers(&self, address: u16, values: &[u16]) -> InstrResult<()> {
        self.precheck()?;
        self.register_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        for (i, value) in values.iter().enumerate() {
            state.registers.insert(address.wrapping_add(i as u16), *value);
        }
        state.log.push(format!("W{}={:?}", address, values));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scpi_echo() {
        let mock = MockTransport::opened();
        mock.write(b"VOLT 3\n").await.unwrap();
        assert_eq!(mock.query(b"volt?").await.unwrap(), b"3".to_vec());
        assert_eq!(mock.writes(), 1);
        assert_eq!(mock.queries(), 1);
        assert_eq!(mock.log(), vec!["VOLT 3".to_string(), "volt?".to_string()]);
    }

    #[tokio::test]
    async fn scripted_replies_win_once() {
        let mock = MockTransport::opened();
        mock.set_state("FREQ", "100");
        mock.script("FREQ?", "200");
        assert_eq!(mock.query(b"FREQ?").await.unwrap(), b"200".to_vec());
        assert_eq!(mock.query(b"FREQ?").await.unwrap(), b"100".to_vec());
    }

    #[tokio::test]
    async fn closed_and_injected_failures() {
        let mock = MockTransport::new();
        assert!(mock.write(b"*CLS").await.is_err());
        mock.open().await.unwrap();
        mock.fail_next(1);
        assert!(mock.write(b"*CLS").await.unwrap_err().is_transient());
        assert!(mock.write(b"*CLS").await.is_ok());
    }
}
