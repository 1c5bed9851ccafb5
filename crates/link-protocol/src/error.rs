//! Link protocol errors

use thiserror::Error;

use crate::message::Status;

/// Errors produced by the link layer
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Version mismatch: got {0:#04X}")]
    VersionMismatch(u8),

    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Unknown message type: {0:#04X}")]
    UnknownMsgType(u8),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Serial port error: {0}")]
    SerialError(#[from] std::io::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Peer returned error status: {0:?}")]
    PeerError(Status),
}
