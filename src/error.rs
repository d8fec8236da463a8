use crate::kv::KvError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("operation `{op}` failed: {message}")]
pub struct MarketError {
    op: &'static str,
    message: String,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Conflict,
    Forbidden,
    NotFound,
    Unavailable,
    Internal,
}

impl MarketError {
    pub fn invalid_input(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, ErrorKind::InvalidInput)
    }

    pub fn conflict(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, ErrorKind::Conflict)
    }

    pub fn forbidden(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, ErrorKind::Forbidden)
    }

    pub fn not_found(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, ErrorKind::NotFound)
    }

    pub fn unavailable(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, ErrorKind::Unavailable)
    }

    pub fn internal(op: &'static str, message: impl Into<String>) -> Self {
        Self::new(op, message, ErrorKind::Internal)
    }

    fn new(op: &'static str, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            op,
            message: message.into(),
            kind,
        }
    }

    /// Maps a persistence failure onto the public taxonomy. Unique-constraint
    /// conflicts stay conflicts; everything else is an infra failure.
    pub fn from_store(op: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => Self::conflict(op, message),
            StoreError::NotFound(message) => Self::not_found(op, message),
            StoreError::Unavailable(message) => Self::unavailable(op, message),
            StoreError::Fault(message) => Self::internal(op, message),
        }
    }

    pub fn from_kv(op: &'static str, err: KvError) -> Self {
        Self::unavailable(op, err.to_string())
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
