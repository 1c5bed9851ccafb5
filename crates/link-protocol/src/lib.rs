//! Inter-node serial link protocol
//!
//! This crate implements the framed binary protocol spoken between the
//! radio node and the host node: length-delimited CRC-checked frames, a
//! request/response layer, an event stream, and a snapshot stream.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod transport;

pub use codec::{Decoded, FrameDecoder};
pub use error::LinkError;
pub use frame::{Frame, MAX_PAYLOAD, PROTOCOL_VERSION};
pub use message::{
    CmdId, CmdRequest, CmdResponse, EventKind, EventRecord, MsgType, SnapshotRecord, Status,
    WireValue,
};
pub use transport::{LinkEvent, LinkTransport};
