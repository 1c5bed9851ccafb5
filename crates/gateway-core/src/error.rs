//! Shared error taxonomy
//!
//! Every subsystem boundary reports failures with one of these kinds;
//! wire status codes are produced from them only at the transport edge.

use thiserror::Error;

/// Uniform failure kinds used across the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgs,
    NotReady,
    NotFound,
    Unsupported,
    Timeout,
    Busy,
    NoMem,
    CrcError,
    FormatError,
    Internal,
}

/// A gateway error: a kind plus a short human-readable message
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }

    #[must_use]
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotReady, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    #[must_use]
    pub fn no_mem(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoMem, message)
    }

    #[must_use]
    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FormatError, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}
