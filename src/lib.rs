//! # labdrive
//!
//! Application layer over the labdrive crates:
//!
//! - [`config`]: Figment-loaded run configuration (TOML + `LABDRIVE_` env)
//! - [`logging`]: tracing subscriber setup
//! - [`run`]: plan, connect, track and log one configured run
//!
//! The building blocks live in their own crates and are re-exported here:
//! [`core`] (errors, transports, features, drivers, timer),
//! [`transport`] (serial, TCP, USB-TMC, VISA, Modbus, composite socket) and
//! [`motion`] (trajectory planning, motor drives, tracking).

pub mod config;
pub mod logging;
pub mod run;

pub use labdrive_core as core;
pub use labdrive_motion as motion;
pub use labdrive_transport as transport;
