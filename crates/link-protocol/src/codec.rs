//! Resumable frame decoder
//!
//! Bytes arrive in arbitrary chunks from the serial driver; the decoder
//! accumulates them in a single reassembly buffer and emits whole
//! frames. On CRC or framing errors the current attempt is dropped and
//! the decoder resyncs on the next start-of-frame (version) byte.

use crate::error::LinkError;
use crate::frame::{calculate_crc, Frame, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD, PROTOCOL_VERSION};
use crate::message::MsgType;

/// Outcome of one `feed` call
#[derive(Debug)]
pub enum Decoded {
    /// Not enough buffered bytes for a whole frame yet.
    NeedMore,
    /// A complete, CRC-valid frame.
    Frame(Frame),
    /// A framing error; the offending bytes were discarded.
    Error(LinkError),
}

/// Streaming decoder with a bounded reassembly buffer
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Feed bytes into the decoder.
    ///
    /// Returns how many input bytes were consumed and the decode
    /// outcome. Call again with the remaining bytes (and then with an
    /// empty slice) until `NeedMore` is returned.
    pub fn feed(&mut self, data: &[u8]) -> (usize, Decoded) {
        // Take just enough to complete the next frame attempt; the rest
        // stays with the caller so one feed yields at most one frame.
        let want = self.bytes_wanted();
        let take = want.min(data.len());
        self.buffer.extend_from_slice(&data[..take]);

        (take, self.try_decode())
    }

    /// Reset all parser state.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// How many more bytes the decoder can use right now.
    fn bytes_wanted(&self) -> usize {
        if self.buffer.len() < HEADER_SIZE {
            return HEADER_SIZE - self.buffer.len();
        }
        let payload_len = u16::from_le_bytes([self.buffer[5], self.buffer[6]]) as usize;
        let total = HEADER_SIZE + payload_len.min(MAX_PAYLOAD) + 2;
        total.saturating_sub(self.buffer.len()).max(1)
    }

    fn try_decode(&mut self) -> Decoded {
        // Resync: drop garbage before the next start-of-frame byte.
        if let Some(&first) = self.buffer.first() {
            if first != PROTOCOL_VERSION {
                let err = LinkError::VersionMismatch(first);
                self.resync();
                return Decoded::Error(err);
            }
        }

        if self.buffer.len() < HEADER_SIZE {
            return Decoded::NeedMore;
        }

        let payload_len = u16::from_le_bytes([self.buffer[5], self.buffer[6]]) as usize;
        if payload_len > MAX_PAYLOAD {
            let err = LinkError::PayloadTooLarge(payload_len);
            self.resync();
            return Decoded::Error(err);
        }

        let total = HEADER_SIZE + payload_len + 2;
        if self.buffer.len() < total {
            return Decoded::NeedMore;
        }

        let crc_offset = total - 2;
        let received = u16::from_le_bytes([self.buffer[crc_offset], self.buffer[crc_offset + 1]]);
        let expected = calculate_crc(&self.buffer[..crc_offset]);
        if received != expected {
            let err = LinkError::CrcMismatch {
                expected,
                actual: received,
            };
            self.resync();
            return Decoded::Error(err);
        }

        let msg_raw = self.buffer[1];
        let Some(msg_type) = MsgType::from_u8(msg_raw) else {
            self.buffer.drain(..total);
            return Decoded::Error(LinkError::UnknownMsgType(msg_raw));
        };

        let frame = Frame {
            msg_type,
            flags: self.buffer[2],
            seq: u16::from_le_bytes([self.buffer[3], self.buffer[4]]),
            payload: self.buffer[HEADER_SIZE..crc_offset].to_vec(),
        };
        self.buffer.drain(..total);
        Decoded::Frame(frame)
    }

    /// Drop the failed attempt up to the next candidate start byte.
    fn resync(&mut self) {
        let skip = self
            .buffer
            .iter()
            .skip(1)
            .position(|&b| b == PROTOCOL_VERSION)
            .map_or(self.buffer.len(), |p| p + 1);
        self.buffer.drain(..skip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MsgType;

    fn drive(decoder: &mut FrameDecoder, mut data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            let (consumed, decoded) = decoder.feed(data);
            data = &data[consumed..];
            match decoded {
                Decoded::Frame(f) => frames.push(f),
                Decoded::NeedMore if data.is_empty() => break,
                _ => {}
            }
        }
        frames
    }

    #[test]
    fn test_roundtrip() {
        let frame = Frame::new(MsgType::Event, 7, vec![1, 2, 3, 4]);
        let bytes = frame.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = drive(&mut decoder, &bytes);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_chunked_feed() {
        let frame = Frame::new(MsgType::CmdReq, 0x0102, vec![0xAA; 40]);
        let bytes = frame.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        // one byte at a time
        for &b in &bytes {
            let (consumed, decoded) = decoder.feed(&[b]);
            assert_eq!(consumed, 1);
            if let Decoded::Frame(f) = decoded {
                frames.push(f);
            }
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_two_frames_one_buffer() {
        let a = Frame::new(MsgType::Ping, 1, vec![]);
        let b = Frame::new(MsgType::Pong, 2, vec![9]);
        let mut bytes = a.encode().unwrap();
        bytes.extend(b.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = drive(&mut decoder, &bytes);
        assert_eq!(frames, vec![a, b]);
    }

    #[test]
    fn test_crc_error_then_resync() {
        let good = Frame::new(MsgType::Event, 3, vec![5, 6]);
        let mut corrupted = good.encode().unwrap();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        corrupted.extend(good.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let mut data: &[u8] = &corrupted;
        let mut frames = Vec::new();
        let mut crc_errors = 0;
        loop {
            let (consumed, decoded) = decoder.feed(data);
            data = &data[consumed..];
            match decoded {
                Decoded::Frame(f) => frames.push(f),
                Decoded::Error(LinkError::CrcMismatch { .. }) => crc_errors += 1,
                Decoded::NeedMore if data.is_empty() => break,
                _ => {}
            }
        }
        assert_eq!(crc_errors, 1);
        assert_eq!(frames, vec![good]);
    }

    #[test]
    fn test_garbage_before_frame() {
        let frame = Frame::new(MsgType::Hello, 1, vec![]);
        let mut bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        bytes.extend(frame.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = drive(&mut decoder, &bytes);
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_oversize_payload_rejected() {
        // Hand-build a header claiming a payload over the cap.
        let mut bytes = vec![PROTOCOL_VERSION, MsgType::Event as u8, 0, 0, 0];
        bytes.extend_from_slice(&(MAX_PAYLOAD as u16 + 1).to_le_bytes());

        let mut decoder = FrameDecoder::new();
        let mut data: &[u8] = &bytes;
        let mut saw_error = false;
        loop {
            let (consumed, decoded) = decoder.feed(data);
            data = &data[consumed..];
            if let Decoded::Error(LinkError::PayloadTooLarge(_)) = decoded {
                saw_error = true;
            }
            if data.is_empty() {
                break;
            }
        }
        assert!(saw_error);
    }
}
