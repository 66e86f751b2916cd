//! Error types for instrument drivers.
//!
//! This module defines `InstrError`, the single error type used across the
//! feature model, the transports and the motion tracker. Every variant belongs
//! to exactly one [`ErrorKind`], so callers can decide policy (retry, abort,
//! report) on the kind without matching every variant.
//!
//! ## Error Kinds
//!
//! - **`Domain`**: the caller supplied an illegal value (out of range, wrong
//!   shape, reserved name). Raised before any I/O.
//! - **`Lookup`**: the caller named a feature the driver does not have.
//! - **`State`**: the operation is not allowed right now (transport closed,
//!   wrong operating mode, capability not composed).
//! - **`Transport`**: byte-level I/O failed (timeout, disconnect, framing).
//!   The only kind that [`crate::error_recovery::with_retry`] retries.
//! - **`Protocol`**: a reply arrived but could not be decoded, did not match
//!   its request, or failed a verify-after-write.
//! - **`Remote`**: the device answered with a well-formed failure code.
//! - **`Safety`**: a tracker detected an envelope breach.
//! - **`Fatal`**: retries were exhausted; wraps the last error.
//! - **`Configuration`**: a driver or run description is inconsistent.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the instrument error type.
pub type InstrResult<T> = std::result::Result<T, InstrError>;

/// Classification of an [`InstrError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Domain,
    Lookup,
    State,
    Transport,
    Protocol,
    Remote,
    Safety,
    Fatal,
    Configuration,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Domain => "domain",
            ErrorKind::Lookup => "lookup",
            ErrorKind::State => "state",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Remote => "remote",
            ErrorKind::Safety => "safety",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for drivers, transports and trackers.
#[derive(Error, Debug)]
pub enum InstrError {
    /// A value was rejected by a feature's domain or validators.
    ///
    /// **Kind**: Domain. No I/O has been performed.
    #[error("Invalid value for '{feature}': {reason}")]
    Domain { feature: String, reason: String },

    /// Assignment attempted on a read-only feature (or a read of a write-only one).
    ///
    /// **Kind**: Domain.
    #[error("Feature '{feature}' does not support {operation}")]
    Direction {
        feature: String,
        operation: &'static str,
    },

    /// A reserved attribute name was used as a feature name.
    ///
    /// **Kind**: Domain.
    #[error("'{0}' is a reserved name and cannot be accessed as a feature")]
    ReservedName(String),

    /// Two features (or two capability mixins) declared the same name.
    ///
    /// **Kind**: Domain. Raised while building a driver.
    #[error("Feature '{0}' is declared more than once")]
    DuplicateFeature(String),

    /// No feature with this name exists on the driver.
    ///
    /// **Kind**: Lookup.
    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),

    /// Operation not allowed in the current device or driver state.
    ///
    /// **Kind**: State. Recoverable by the caller (open the transport,
    /// switch the operating mode, ...).
    #[error("State error: {0}")]
    State(String),

    /// Byte-level transport failure.
    ///
    /// **Kind**: Transport. Retry is the caller's choice.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Standard I/O failure from the underlying stream.
    ///
    /// **Kind**: Transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the transport timeout.
    ///
    /// **Kind**: Transport.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Reply received but undecodable or mismatched.
    ///
    /// **Kind**: Protocol. Not retried automatically.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Device returned a well-formed failure code.
    ///
    /// **Kind**: Remote. `description` comes from the per-driver code table.
    #[error("Device reported error {code}: {description}")]
    Remote { code: i32, description: String },

    /// Position error exceeded the tracker's safety envelope.
    ///
    /// **Kind**: Safety. The drive has already been quick-stopped.
    #[error("Safety envelope breached on '{drive}': {reason}")]
    Safety { drive: String, reason: String },

    /// Retries exhausted.
    ///
    /// **Kind**: Fatal. Carries the last error for diagnostics.
    #[error("'{operation}' failed after {attempts} attempts: {last}")]
    Fatal {
        operation: String,
        attempts: u32,
        last: Box<InstrError>,
    },

    /// Inconsistent driver, feature or run description.
    ///
    /// **Kind**: Configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl InstrError {
    /// Shorthand for a domain error on `feature`.
    pub fn domain(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        InstrError::Domain {
            feature: feature.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        InstrError::Protocol(message.into())
    }

    /// Shorthand for a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        InstrError::Transport(message.into())
    }

    /// Shorthand for a state error.
    pub fn state(message: impl Into<String>) -> Self {
        InstrError::State(message.into())
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InstrError::Domain { .. }
            | InstrError::Direction { .. }
            | InstrError::ReservedName(_)
            | InstrError::DuplicateFeature(_) => ErrorKind::Domain,
            InstrError::UnknownFeature(_) => ErrorKind::Lookup,
            InstrError::State(_) => ErrorKind::State,
            InstrError::Transport(_) | InstrError::Io(_) | InstrError::Timeout(_) => {
                ErrorKind::Transport
            }
            InstrError::Protocol(_) => ErrorKind::Protocol,
            InstrError::Remote { .. } => ErrorKind::Remote,
            InstrError::Safety { .. } => ErrorKind::Safety,
            InstrError::Fatal { .. } => ErrorKind::Fatal,
            InstrError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// True for errors worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstrError::domain("voltage", "12 is above 10");
        assert_eq!(err.to_string(), "Invalid value for 'voltage': 12 is above 10");
        assert_eq!(err.kind(), ErrorKind::Domain);
    }

    #[test]
    fn test_io_errors_are_transport_kind() {
        let err: InstrError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_transient());
        assert!(InstrError::Timeout(Duration::from_millis(5)).is_transient());
    }

    #[test]
    fn test_fatal_wraps_last_error() {
        let err = InstrError::Fatal {
            operation: "query VOLT?".into(),
            attempts: 3,
            last: Box::new(InstrError::Timeout(Duration::from_secs(1))),
        };
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::Lookup.to_string(), "lookup");
        assert_eq!(
            InstrError::UnknownFeature("nope".into()).kind(),
            ErrorKind::Lookup
        );
        assert_eq!(
            InstrError::Remote {
                code: -17,
                description: "Parameter out of range".into()
            }
            .kind(),
            ErrorKind::Remote
        );
    }
}
