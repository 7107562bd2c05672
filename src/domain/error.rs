//! Error taxonomy of the device core.
//!
//! None of these are fatal: each one degrades to a reported state and either
//! an automatic (reconciliation, sync retry) or a user-triggered recovery.

use crate::domain::models::{AdapterState, PeripheralId};
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a transport backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,
    #[error("unknown peripheral {0}")]
    UnknownPeripheral(PeripheralId),
    #[error("unknown service {0}")]
    UnknownService(Uuid),
    #[error("unknown characteristic {0}")]
    UnknownCharacteristic(Uuid),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Adapter powered off, unsupported or unauthorized. Not retried automatically.
    #[error("Bluetooth unavailable ({0:?}), check the system settings")]
    TransportUnavailable(AdapterState),
    #[error("connection to {peripheral} failed: {reason}")]
    ConnectionFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    #[error("no write characteristic bound")]
    WriteCharacteristicMissing,
    #[error("no device connected")]
    NotConnected,
    #[error("service discovery failed: {0}")]
    Discovery(String),
    #[error("link closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("session duration of {seconds}s does not fit in one byte")]
    DurationOutOfRange { seconds: u32 },
    #[error("invalid duration {0:?}, expected M:SS")]
    InvalidDuration(String),
    #[error("temperature index {0} does not fit in one byte")]
    TempIndexOutOfRange(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{table} index {index} out of range 1..={max}")]
    IndexOutOfRange {
        table: &'static str,
        index: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to persist selection: {0}")]
    Persistence(String),
}
