use std::fmt;

use axiom_core::CoreError;
use serde::Serialize;

use crate::registry::ConnectionId;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalError {
    /// The connection id is not registered.
    NotFound(ConnectionId),
    /// The connection id is already registered.
    AlreadyExists(ConnectionId),
    Core(CoreError),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::NotFound(id) => write!(f, "connection not found: {id}"),
            SignalError::AlreadyExists(id) => write!(f, "connection already registered: {id}"),
            SignalError::Core(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Core(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CoreError> for SignalError {
    fn from(e: CoreError) -> Self {
        SignalError::Core(e)
    }
}

impl SignalError {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalError::NotFound(_) => "not_found",
            SignalError::AlreadyExists(_) => "already_exists",
            SignalError::Core(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

/// Why one subscriber missed one message. Recorded, never returned to the
/// broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryError {
    /// The subscriber's buffer stayed full past the delivery timeout.
    Timeout,
    /// The subscriber's receiving end is gone.
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Timeout => write!(f, "delivery timed out"),
            DeliveryError::Closed => write!(f, "subscriber closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// One failed delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryFailure {
    pub connection: ConnectionId,
    pub channel: String,
    pub sequence: u64,
    pub error: DeliveryError,
    /// Unix seconds.
    pub at: u64,
}
