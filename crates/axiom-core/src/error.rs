use std::fmt;

use crate::identity::TokenId;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// No live token carries this id.
    NotFound(TokenId),
    /// A float attribute or setting fell outside its declared bound.
    OutOfRange { field: &'static str, value: f64 },
    /// An integer identity component does not fit its bit width.
    InvalidRange {
        field: &'static str,
        value: u64,
        max: u64,
    },
    /// A range query deadline expired before the scan finished.
    Timeout,
    /// A snapshot could not be parsed or does not match this store.
    InvalidSnapshot(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::NotFound(id) => write!(f, "token not found: {id}"),
            CoreError::OutOfRange { field, value } => {
                write!(f, "{field} out of range: {value}")
            }
            CoreError::InvalidRange { field, value, max } => {
                write!(f, "{field} = {value} exceeds maximum {max}")
            }
            CoreError::Timeout => write!(f, "range query deadline exceeded"),
            CoreError::InvalidSnapshot(msg) => write!(f, "invalid snapshot: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    /// Stable machine-readable name, used by transports.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::OutOfRange { .. } => "out_of_range",
            CoreError::InvalidRange { .. } => "invalid_range",
            CoreError::Timeout => "timeout",
            CoreError::InvalidSnapshot(_) => "invalid_snapshot",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
