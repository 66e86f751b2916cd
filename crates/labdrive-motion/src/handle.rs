//! Actor owning one Modbus motor drive.
//!
//! A single task owns the register transport and the cached drive state.
//! Callers talk to it through a command queue with one-shot replies; between
//! commands the task refreshes the input scan on a heartbeat interval, so the
//! cached [`DriveStatus`] stays current without any caller polling.

use crate::drive::{DriveStatus, MotorDrive, OperatingMode, PinLevel};
use crate::scan::{DriveScaling, InputScan, OutputScan, SCAN_LEN};
use async_trait::async_trait;
use labdrive_core::transport::RegisterAccess;
use labdrive_core::{InstrError, InstrResult, SharedTransport};
use labdrive_transport::ModbusTcp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Register layout and timing of a drive handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// First holding register of the output scan block.
    pub output_base: u16,
    /// First input register of the input scan block.
    pub input_base: u16,
    /// Holding register of the camera-gate output, in millivolts.
    pub pin_register: u16,
    pub heartbeat_ms: u64,
    /// Upper bound on waiting for the actor to finish on close.
    pub close_timeout_ms: u64,
    pub scaling: DriveScaling,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            output_base: 0,
            input_base: 0,
            pin_register: 13,
            heartbeat_ms: 50,
            close_timeout_ms: 1000,
            scaling: DriveScaling::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<InstrResult<T>>;

enum Command {
    Position(Reply<f64>),
    Status(Reply<DriveStatus>),
    SetSpeed { speed: f64, accel: f64, reply: Reply<()> },
    QuickStop(Reply<()>),
    ResetFault(Reply<()>),
    SetPin(PinLevel, Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

struct DriveActor {
    name: String,
    transport: SharedTransport,
    config: HandleConfig,
    output: OutputScan,
    last_block: Option<[u16; SCAN_LEN]>,
    status: DriveStatus,
}

impl DriveActor {
    fn registers(&self) -> InstrResult<&dyn RegisterAccess> {
        self.transport.registers().ok_or_else(|| {
            InstrError::Configuration(format!(
                "transport {} has no register access",
                self.transport.describe()
            ))
        })
    }

    async fn refresh(&mut self) -> InstrResult<()> {
        let words = self
            .registers()?
            .read_input_registers(self.config.input_base, SCAN_LEN as u16)
            .await?;
        let scan = InputScan::decode(&words)?;
        let scaling = self.config.scaling;
        self.status = DriveStatus {
            speed: scaling.speed_from_rate(scan.rate),
            position: scaling.position_from_counts(scan.position),
            ..DriveStatus::from(&scan)
        };
        Ok(())
    }

    async fn push(&mut self) -> InstrResult<()> {
        let block = self.output.encode(self.last_block.as_ref())?;
        self.registers()?
            .write_registers(self.config.output_base, &block)
            .await?;
        self.last_block = Some(block);
        Ok(())
    }

    async fn set_speed(&mut self, speed: f64, accel: f64) -> InstrResult<()> {
        if self.output.quick_stop || self.status.fault {
            return Err(InstrError::state(format!(
                "drive '{}' is stopped or faulted; reset the fault first",
                self.name
            )));
        }
        let scaling = self.config.scaling;
        let ramp = scaling.ramp_from_accel(accel);
        self.output.mode = OperatingMode::Speed;
        self.output.enable = true;
        self.output.rate = scaling.rate_from_speed(speed);
        self.output.accel_ramp = ramp;
        self.output.decel_ramp = ramp;
        self.push().await
    }

    async fn quick_stop(&mut self) -> InstrResult<()> {
        warn!(drive = %self.name, "quick stop");
        self.output.quick_stop = true;
        self.output.rate = 0;
        self.push().await
    }

    /// Pulses the fault-reset bit and releases a latched quick stop.
    async fn reset_fault(&mut self) -> InstrResult<()> {
        self.output.quick_stop = false;
        self.output.fault_reset = true;
        self.push().await?;
        self.output.fault_reset = false;
        self.push().await?;
        self.refresh().await
    }

    async fn set_pin(&mut self, level: PinLevel) -> InstrResult<()> {
        let millivolts = (level.volts() * 1000.0).round() as u16;
        self.registers()?
            .write_registers(self.config.pin_register, &[millivolts])
            .await
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Position(reply) => {
                let result = self.refresh().await.map(|_| self.status.position);
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(Ok(self.status));
            }
            Command::SetSpeed {
                speed,
                accel,
                reply,
            } => {
                let _ = reply.send(self.set_speed(speed, accel).await);
            }
            Command::QuickStop(reply) => {
                let _ = reply.send(self.quick_stop().await);
            }
            Command::ResetFault(reply) => {
                let _ = reply.send(self.reset_fault().await);
            }
            Command::SetPin(level, reply) => {
                let _ = reply.send(self.set_pin(level).await);
            }
            Command::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_ms.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.output.rate = 0;
                        if let Err(e) = self.push().await {
                            warn!(drive = %self.name, error = %e, "zero speed on shutdown failed");
                        }
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(drive = %self.name, error = %e, "heartbeat refresh failed");
                    }
                }
            }
        }
        debug!(drive = %self.name, "drive actor stopped");
    }
}

/// Handle to a motor drive served by a background actor.
///
/// Call [`MotorHandle::close`] when done. Dropping an open handle only asks
/// the detached actor to command zero speed; the transport is left to the
/// actor's own drop and no error is reported.
pub struct MotorHandle {
    name: String,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
    transport: SharedTransport,
    closed: AtomicBool,
    close_timeout: Duration,
}

impl std::fmt::Debug for MotorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotorHandle")
            .field("name", &self.name)
            .field("transport", &self.transport.describe())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MotorHandle {
    /// Opens the transport, reads the drive once, enables it at zero speed
    /// and starts the actor.
    #[instrument(skip(transport, config), err)]
    pub async fn open(
        name: &str,
        transport: SharedTransport,
        config: HandleConfig,
    ) -> InstrResult<Self> {
        config.scaling.validate()?;
        transport.open().await?;
        let close_timeout = Duration::from_millis(config.close_timeout_ms);
        let mut actor = DriveActor {
            name: name.to_string(),
            transport: transport.clone(),
            config,
            output: OutputScan {
                mode: OperatingMode::Speed,
                enable: true,
                ..OutputScan::default()
            },
            last_block: None,
            status: DriveStatus::default(),
        };
        actor.refresh().await?;
        actor.push().await?;

        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(actor.run(rx));
        info!(drive = name, "motor handle opened");
        Ok(Self {
            name: name.to_string(),
            commands: tx,
            task: Mutex::new(Some(task)),
            transport,
            closed: AtomicBool::new(false),
            close_timeout,
        })
    }

    /// Opens a handle on a Modbus TCP drive (`host` or `host:port`).
    pub async fn connect_tcp(
        name: &str,
        address: &str,
        unit: u8,
        config: HandleConfig,
    ) -> InstrResult<Self> {
        let transport: SharedTransport = Arc::new(ModbusTcp::connect_to(address, unit));
        Self::open(name, transport, config).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> InstrResult<T> {
        if self.is_closed() {
            return Err(InstrError::state(format!("drive '{}' is closed", self.name)));
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| InstrError::state(format!("drive '{}' actor has stopped", self.name)))?;
        rx.await
            .map_err(|_| InstrError::state(format!("drive '{}' actor dropped the request", self.name)))?
    }

    /// Clears a drive fault and a latched quick stop.
    pub async fn reset_fault(&self) -> InstrResult<()> {
        self.request(Command::ResetFault).await
    }

    /// Stops the actor (commanding zero speed), waits a bounded time for it
    /// and closes the transport. Calling it again is a no-op.
    pub async fn close(&self) -> InstrResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = tokio::time::timeout(self.close_timeout, rx).await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.close_timeout, task).await.is_err() {
                warn!(drive = %self.name, "actor did not stop in time, aborting");
                abort.abort();
            }
        }
        self.transport.close().await?;
        info!(drive = %self.name, "motor handle closed");
        Ok(())
    }
}

impl Drop for MotorHandle {
    fn drop(&mut self) {
        let Some(task) = self.task.get_mut().take() else {
            return;
        };
        if *self.closed.get_mut() {
            task.abort();
            return;
        }
        warn!(drive = %self.name, "motor handle dropped without close");
        let (done, _) = oneshot::channel();
        if self.commands.try_send(Command::Shutdown(done)).is_err() {
            // Actor is wedged or gone; nothing more can be done without awaiting.
            task.abort();
        }
    }
}

#[async_trait]
impl MotorDrive for MotorHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> InstrResult<f64> {
        self.request(Command::Position).await
    }

    async fn set_speed(&self, speed: f64, accel: f64) -> InstrResult<()> {
        self.request(|reply| Command::SetSpeed {
            speed,
            accel,
            reply,
        })
        .await
    }

    async fn quick_stop(&self) -> InstrResult<()> {
        self.request(Command::QuickStop).await
    }

    async fn set_pin(&self, level: PinLevel) -> InstrResult<()> {
        self.request(|reply| Command::SetPin(level, reply)).await
    }

    async fn status(&self) -> InstrResult<DriveStatus> {
        self.request(Command::Status).await
    }
}
