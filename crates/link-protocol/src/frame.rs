//! Link frame structure and CRC handling

use crate::error::LinkError;
use crate::message::MsgType;

/// Protocol version carried in the first byte of every frame.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum payload size per frame (build-time cap).
pub const MAX_PAYLOAD: usize = 1024;

/// Header size: ver(1) + `msg_type(1)` + flags(1) + seq(2) + `payload_len(2)`
pub const HEADER_SIZE: usize = 7;

/// Minimum frame size: header + crc(2)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 2;

/// Maximum total frame size on the wire.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD + 2;

/// A single link frame
///
/// Wire format (little-endian):
/// ```text
/// [Version: 1 byte] (0x01)
/// [Message type: 1 byte]
/// [Flags: 1 byte]
/// [Sequence: 2 bytes LE]
/// [Payload length: 2 bytes LE]
/// [Payload: variable]
/// [CRC: 2 bytes LE] (over header + payload)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub flags: u8,
    pub seq: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame with no flags set.
    #[must_use]
    pub fn new(msg_type: MsgType, seq: u16, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            flags: 0,
            seq,
            payload,
        }
    }

    /// Serialize the frame to wire bytes.
    ///
    /// # Errors
    /// Returns `LinkError::PayloadTooLarge` if the payload exceeds [`MAX_PAYLOAD`].
    pub fn encode(&self) -> Result<Vec<u8>, LinkError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(LinkError::PayloadTooLarge(self.payload.len()));
        }

        let mut data = Vec::with_capacity(HEADER_SIZE + self.payload.len() + 2);
        data.push(PROTOCOL_VERSION);
        data.push(self.msg_type as u8);
        data.push(self.flags);
        data.extend_from_slice(&self.seq.to_le_bytes());
        data.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        data.extend_from_slice(&self.payload);

        let crc = calculate_crc(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// 16-bit CRC: two's complement of the byte sum.
#[must_use]
pub fn calculate_crc(data: &[u8]) -> u16 {
    let sum: u16 = data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    (!sum).wrapping_add(1)
}
