//! Core abstractions for labdrive instrument drivers.
//!
//! - [`error`]: the `InstrError` taxonomy shared by every crate
//! - [`error_recovery`]: bounded retry for transport failures
//! - [`transport`]: the byte-level `Transport` contract and register access
//! - [`feature`]: typed, validated remote attributes
//! - [`driver`]: feature registration, lookup and I/O routing
//! - [`capabilities`]: standard-status and trigger mixins
//! - [`timer`]: drift-free periodic ticks
//! - [`mock`]: counting in-memory transport

pub mod capabilities;
pub mod driver;
pub mod error;
pub mod error_recovery;
pub mod feature;
pub mod mock;
pub mod timer;
pub mod transport;

pub use capabilities::{Capability, StandardStatus, Triggerable};
pub use driver::{Driver, DriverBuilder, FeatureHandle};
pub use error::{ErrorKind, InstrError, InstrResult};
pub use feature::{Access, Domain, Feature, Value};
pub use timer::Timer;
pub use transport::{ReadMode, RegisterAccess, SharedTransport, Transport};
