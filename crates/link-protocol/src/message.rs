//! Wire message schemas carried in frame payloads
//!
//! All multi-byte integers are little-endian. Strings travel as
//! fixed-width NUL-padded ASCII fields so every record has a bounded,
//! self-describing layout.

use bytes::{Buf, BufMut};

use crate::error::LinkError;

/// Device UID field width on the wire: "0x" + 16 hex digits + NUL.
pub const UID_FIELD: usize = 19;
/// Width of name / event-type / cmd / message fields.
pub const TEXT_FIELD: usize = 32;
/// Width of the short value-text field.
pub const VALUE_TEXT_FIELD: usize = 24;
/// Maximum clusters per list inside a snapshot endpoint entry.
pub const SNAPSHOT_MAX_CLUSTERS: usize = 16;

/// Frame message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    HelloAck = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    CmdReq = 0x05,
    CmdRsp = 0x06,
    Event = 0x07,
    Snapshot = 0x08,
}

impl MsgType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::HelloAck),
            0x03 => Some(Self::Ping),
            0x04 => Some(Self::Pong),
            0x05 => Some(Self::CmdReq),
            0x06 => Some(Self::CmdRsp),
            0x07 => Some(Self::Event),
            0x08 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

/// Status codes carried in `CMD_RSP`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    InvalidArgs = 1,
    NotReady = 2,
    NotFound = 3,
    Unsupported = 4,
    Timeout = 5,
    Busy = 6,
    NoMem = 7,
    CrcError = 8,
    FormatError = 9,
    Internal = 10,
}

impl Status {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::InvalidArgs,
            2 => Self::NotReady,
            3 => Self::NotFound,
            4 => Self::Unsupported,
            5 => Self::Timeout,
            6 => Self::Busy,
            7 => Self::NoMem,
            8 => Self::CrcError,
            9 => Self::FormatError,
            _ => Self::Internal,
        }
    }
}

/// Command identifiers for `CMD_REQ`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmdId {
    PermitJoin = 1,
    OnOff = 2,
    LevelMoveToLevel = 3,
    ColorMoveToXy = 4,
    ColorMoveToTemp = 5,
    GroupOnOff = 6,
    GroupLevel = 7,
    GroupColorXy = 8,
    GroupColorTemp = 9,
    SceneStore = 10,
    SceneRecall = 11,
    ReadAttr = 12,
    Bind = 13,
    Unbind = 14,
    DeviceLeave = 15,
    SyncSnapshot = 16,
}

impl CmdId {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::PermitJoin),
            2 => Some(Self::OnOff),
            3 => Some(Self::LevelMoveToLevel),
            4 => Some(Self::ColorMoveToXy),
            5 => Some(Self::ColorMoveToTemp),
            6 => Some(Self::GroupOnOff),
            7 => Some(Self::GroupLevel),
            8 => Some(Self::GroupColorXy),
            9 => Some(Self::GroupColorTemp),
            10 => Some(Self::SceneStore),
            11 => Some(Self::SceneRecall),
            12 => Some(Self::ReadAttr),
            13 => Some(Self::Bind),
            14 => Some(Self::Unbind),
            15 => Some(Self::DeviceLeave),
            16 => Some(Self::SyncSnapshot),
            _ => None,
        }
    }
}

/// Write a string into a fixed-width NUL-padded field.
fn put_fixed_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width.saturating_sub(1));
    buf.put_slice(&bytes[..n]);
    for _ in n..width {
        buf.put_u8(0);
    }
}

/// Read a fixed-width NUL-padded field back into an owned string.
fn get_fixed_str(buf: &mut &[u8], width: usize) -> Result<String, LinkError> {
    if buf.remaining() < width {
        return Err(LinkError::FrameTooShort(buf.remaining()));
    }
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let s = std::str::from_utf8(&raw[..end])
        .map_err(|_| LinkError::MalformedPayload("non-utf8 text field".into()))?
        .to_string();
    buf.advance(width);
    Ok(s)
}

fn need(buf: &&[u8], n: usize) -> Result<(), LinkError> {
    if buf.remaining() < n {
        return Err(LinkError::FrameTooShort(buf.remaining()));
    }
    Ok(())
}

/// Tagged scalar value carried in events and snapshot state entries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireValue {
    None,
    Bool(bool),
    I64(i64),
    F32(f32),
    Text, // text lives in the record's value_text field
}

impl WireValue {
    fn kind(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Bool(_) => 1,
            Self::I64(_) => 2,
            Self::F32(_) => 3,
            Self::Text => 4,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.kind());
        buf.put_u8(u8::from(matches!(self, Self::Bool(true))));
        buf.put_i64_le(if let Self::I64(v) = self { *v } else { 0 });
        buf.put_f32_le(if let Self::F32(v) = self { *v } else { 0.0 });
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, LinkError> {
        need(buf, 1 + 1 + 8 + 4)?;
        let kind = buf.get_u8();
        let b = buf.get_u8() != 0;
        let i = buf.get_i64_le();
        let f = buf.get_f32_le();
        Ok(match kind {
            0 => Self::None,
            1 => Self::Bool(b),
            2 => Self::I64(i),
            3 => Self::F32(f),
            4 => Self::Text,
            other => {
                return Err(LinkError::MalformedPayload(format!(
                    "unknown value kind {other}"
                )))
            }
        })
    }
}

/// `CMD_REQ` payload: a fixed-width request record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdRequest {
    pub req_id: u32,
    pub cmd: CmdId,
    /// Target device UID as formatted string; empty when not device-addressed.
    pub device_uid: String,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attr_id: u16,
    pub group_id: u16,
    pub scene_id: u8,
    /// Bit 0: rejoin flag for `DeviceLeave`.
    pub flags: u8,
    pub param0: u32,
    pub param1: u32,
    pub param2: u32,
    /// Secondary UID for bind/unbind; empty otherwise.
    pub dst_uid: String,
    pub dst_endpoint: u8,
}

impl CmdRequest {
    /// Create a request with all optional fields zeroed.
    #[must_use]
    pub fn new(req_id: u32, cmd: CmdId) -> Self {
        Self {
            req_id,
            cmd,
            device_uid: String::new(),
            endpoint: 0,
            cluster_id: 0,
            attr_id: 0,
            group_id: 0,
            scene_id: 0,
            flags: 0,
            param0: 0,
            param1: 0,
            param2: 0,
            dst_uid: String::new(),
            dst_endpoint: 0,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u32_le(self.req_id);
        buf.put_u8(self.cmd as u8);
        put_fixed_str(&mut buf, &self.device_uid, UID_FIELD);
        buf.put_u8(self.endpoint);
        buf.put_u16_le(self.cluster_id);
        buf.put_u16_le(self.attr_id);
        buf.put_u16_le(self.group_id);
        buf.put_u8(self.scene_id);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.param0);
        buf.put_u32_le(self.param1);
        buf.put_u32_le(self.param2);
        put_fixed_str(&mut buf, &self.dst_uid, UID_FIELD);
        buf.put_u8(self.dst_endpoint);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, LinkError> {
        need(&buf, 5)?;
        let req_id = buf.get_u32_le();
        let cmd_raw = buf.get_u8();
        let cmd = CmdId::from_u8(cmd_raw).ok_or(LinkError::UnknownMsgType(cmd_raw))?;
        let device_uid = get_fixed_str(&mut buf, UID_FIELD)?;
        need(&buf, 1 + 2 + 2 + 2 + 1 + 1 + 12)?;
        let endpoint = buf.get_u8();
        let cluster_id = buf.get_u16_le();
        let attr_id = buf.get_u16_le();
        let group_id = buf.get_u16_le();
        let scene_id = buf.get_u8();
        let flags = buf.get_u8();
        let param0 = buf.get_u32_le();
        let param1 = buf.get_u32_le();
        let param2 = buf.get_u32_le();
        let dst_uid = get_fixed_str(&mut buf, UID_FIELD)?;
        need(&buf, 1)?;
        let dst_endpoint = buf.get_u8();
        Ok(Self {
            req_id,
            cmd,
            device_uid,
            endpoint,
            cluster_id,
            attr_id,
            group_id,
            scene_id,
            flags,
            param0,
            param1,
            param2,
            dst_uid,
            dst_endpoint,
        })
    }
}

/// `CMD_RSP` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdResponse {
    pub req_id: u32,
    pub status: Status,
    /// Raw ZCL status when the failure came from the stack; 0 otherwise.
    pub zcl_status: u8,
    /// Short human-readable message.
    pub message: String,
}

impl CmdResponse {
    #[must_use]
    pub fn ok(req_id: u32) -> Self {
        Self {
            req_id,
            status: Status::Ok,
            zcl_status: 0,
            message: "ok".to_string(),
        }
    }

    #[must_use]
    pub fn failed(req_id: u32, status: Status, message: impl Into<String>) -> Self {
        Self {
            req_id,
            status,
            zcl_status: 0,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 + TEXT_FIELD);
        buf.put_u32_le(self.req_id);
        buf.put_u8(self.status as u8);
        buf.put_u8(self.zcl_status);
        put_fixed_str(&mut buf, &self.message, TEXT_FIELD);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, LinkError> {
        need(&buf, 6)?;
        let req_id = buf.get_u32_le();
        let status = Status::from_u8(buf.get_u8());
        let zcl_status = buf.get_u8();
        let message = get_fixed_str(&mut buf, TEXT_FIELD)?;
        Ok(Self {
            req_id,
            status,
            zcl_status,
            message,
        })
    }
}

/// Event kind tag on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    AttrReport = 1,
    Command = 2,
    DeviceJoin = 3,
    DeviceLeave = 4,
    NetState = 5,
}

impl EventKind {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::AttrReport,
            2 => Self::Command,
            3 => Self::DeviceJoin,
            4 => Self::DeviceLeave,
            _ => Self::NetState,
        }
    }
}

/// `EVT` payload: a normalized gateway event, streamed R -> H
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: u32,
    pub ts_ms: u64,
    pub kind: EventKind,
    pub event_type: String,
    pub cmd: String,
    pub device_uid: String,
    pub short_addr: u16,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attr_id: u16,
    pub value: WireValue,
    pub value_text: String,
}

impl EventRecord {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(160);
        buf.put_u32_le(self.event_id);
        buf.put_u64_le(self.ts_ms);
        buf.put_u8(self.kind as u8);
        put_fixed_str(&mut buf, &self.event_type, TEXT_FIELD);
        put_fixed_str(&mut buf, &self.cmd, TEXT_FIELD);
        put_fixed_str(&mut buf, &self.device_uid, UID_FIELD);
        buf.put_u16_le(self.short_addr);
        buf.put_u8(self.endpoint);
        buf.put_u16_le(self.cluster_id);
        buf.put_u16_le(self.attr_id);
        self.value.encode(&mut buf);
        put_fixed_str(&mut buf, &self.value_text, VALUE_TEXT_FIELD);
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, LinkError> {
        need(&buf, 13)?;
        let event_id = buf.get_u32_le();
        let ts_ms = buf.get_u64_le();
        let kind = EventKind::from_u8(buf.get_u8());
        let event_type = get_fixed_str(&mut buf, TEXT_FIELD)?;
        let cmd = get_fixed_str(&mut buf, TEXT_FIELD)?;
        let device_uid = get_fixed_str(&mut buf, UID_FIELD)?;
        need(&buf, 2 + 1 + 2 + 2)?;
        let short_addr = buf.get_u16_le();
        let endpoint = buf.get_u8();
        let cluster_id = buf.get_u16_le();
        let attr_id = buf.get_u16_le();
        let value = WireValue::decode(&mut buf)?;
        let value_text = get_fixed_str(&mut buf, VALUE_TEXT_FIELD)?;
        Ok(Self {
            event_id,
            ts_ms,
            kind,
            event_type,
            cmd,
            device_uid,
            short_addr,
            endpoint,
            cluster_id,
            attr_id,
            value,
            value_text,
        })
    }
}

/// `SNAPSHOT` payload: one entry of the full-state stream
///
/// Every entry is fully self-describing; out-of-order application of
/// DEVICE/ENDPOINT/STATE entries is therefore impossible to get wrong.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotRecord {
    Begin {
        snap_seq: u32,
        total_devices: u16,
    },
    Device {
        snap_seq: u32,
        device_uid: String,
        name: String,
        short_addr: u16,
        last_seen_ms: u64,
        has_onoff: bool,
        has_button: bool,
    },
    Endpoint {
        snap_seq: u32,
        device_uid: String,
        short_addr: u16,
        endpoint: u8,
        profile_id: u16,
        device_id: u16,
        in_clusters: Vec<u16>,
        out_clusters: Vec<u16>,
    },
    State {
        snap_seq: u32,
        device_uid: String,
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
        value: WireValue,
        ts_ms: u64,
    },
    Remove {
        snap_seq: u32,
        device_uid: String,
        short_addr: u16,
    },
    End {
        snap_seq: u32,
        total_devices: u16,
    },
}

const SNAP_BEGIN: u8 = 1;
const SNAP_DEVICE: u8 = 2;
const SNAP_ENDPOINT: u8 = 3;
const SNAP_STATE: u8 = 4;
const SNAP_REMOVE: u8 = 5;
const SNAP_END: u8 = 6;

impl SnapshotRecord {
    /// In-snapshot sequence number of this entry.
    #[must_use]
    pub fn snap_seq(&self) -> u32 {
        match self {
            Self::Begin { snap_seq, .. }
            | Self::Device { snap_seq, .. }
            | Self::Endpoint { snap_seq, .. }
            | Self::State { snap_seq, .. }
            | Self::Remove { snap_seq, .. }
            | Self::End { snap_seq, .. } => *snap_seq,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        match self {
            Self::Begin {
                snap_seq,
                total_devices,
            } => {
                buf.put_u8(SNAP_BEGIN);
                buf.put_u32_le(*snap_seq);
                buf.put_u16_le(*total_devices);
            }
            Self::Device {
                snap_seq,
                device_uid,
                name,
                short_addr,
                last_seen_ms,
                has_onoff,
                has_button,
            } => {
                buf.put_u8(SNAP_DEVICE);
                buf.put_u32_le(*snap_seq);
                put_fixed_str(&mut buf, device_uid, UID_FIELD);
                put_fixed_str(&mut buf, name, TEXT_FIELD);
                buf.put_u16_le(*short_addr);
                buf.put_u64_le(*last_seen_ms);
                buf.put_u8(u8::from(*has_onoff));
                buf.put_u8(u8::from(*has_button));
            }
            Self::Endpoint {
                snap_seq,
                device_uid,
                short_addr,
                endpoint,
                profile_id,
                device_id,
                in_clusters,
                out_clusters,
            } => {
                buf.put_u8(SNAP_ENDPOINT);
                buf.put_u32_le(*snap_seq);
                put_fixed_str(&mut buf, device_uid, UID_FIELD);
                buf.put_u16_le(*short_addr);
                buf.put_u8(*endpoint);
                buf.put_u16_le(*profile_id);
                buf.put_u16_le(*device_id);
                let in_n = in_clusters.len().min(SNAPSHOT_MAX_CLUSTERS);
                let out_n = out_clusters.len().min(SNAPSHOT_MAX_CLUSTERS);
                buf.put_u8(in_n as u8);
                buf.put_u8(out_n as u8);
                for c in &in_clusters[..in_n] {
                    buf.put_u16_le(*c);
                }
                for c in &out_clusters[..out_n] {
                    buf.put_u16_le(*c);
                }
            }
            Self::State {
                snap_seq,
                device_uid,
                short_addr,
                endpoint,
                cluster_id,
                attr_id,
                value,
                ts_ms,
            } => {
                buf.put_u8(SNAP_STATE);
                buf.put_u32_le(*snap_seq);
                put_fixed_str(&mut buf, device_uid, UID_FIELD);
                buf.put_u16_le(*short_addr);
                buf.put_u8(*endpoint);
                buf.put_u16_le(*cluster_id);
                buf.put_u16_le(*attr_id);
                value.encode(&mut buf);
                buf.put_u64_le(*ts_ms);
            }
            Self::Remove {
                snap_seq,
                device_uid,
                short_addr,
            } => {
                buf.put_u8(SNAP_REMOVE);
                buf.put_u32_le(*snap_seq);
                put_fixed_str(&mut buf, device_uid, UID_FIELD);
                buf.put_u16_le(*short_addr);
            }
            Self::End {
                snap_seq,
                total_devices,
            } => {
                buf.put_u8(SNAP_END);
                buf.put_u32_le(*snap_seq);
                buf.put_u16_le(*total_devices);
            }
        }
        buf
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, LinkError> {
        need(&buf, 5)?;
        let kind = buf.get_u8();
        let snap_seq = buf.get_u32_le();
        match kind {
            SNAP_BEGIN => {
                need(&buf, 2)?;
                Ok(Self::Begin {
                    snap_seq,
                    total_devices: buf.get_u16_le(),
                })
            }
            SNAP_DEVICE => {
                let device_uid = get_fixed_str(&mut buf, UID_FIELD)?;
                let name = get_fixed_str(&mut buf, TEXT_FIELD)?;
                need(&buf, 2 + 8 + 2)?;
                Ok(Self::Device {
                    snap_seq,
                    device_uid,
                    name,
                    short_addr: buf.get_u16_le(),
                    last_seen_ms: buf.get_u64_le(),
                    has_onoff: buf.get_u8() != 0,
                    has_button: buf.get_u8() != 0,
                })
            }
            SNAP_ENDPOINT => {
                let device_uid = get_fixed_str(&mut buf, UID_FIELD)?;
                need(&buf, 2 + 1 + 2 + 2 + 2)?;
                let short_addr = buf.get_u16_le();
                let endpoint = buf.get_u8();
                let profile_id = buf.get_u16_le();
                let device_id = buf.get_u16_le();
                let in_n = buf.get_u8() as usize;
                let out_n = buf.get_u8() as usize;
                if in_n > SNAPSHOT_MAX_CLUSTERS || out_n > SNAPSHOT_MAX_CLUSTERS {
                    return Err(LinkError::MalformedPayload(
                        "cluster count over cap".into(),
                    ));
                }
                need(&buf, (in_n + out_n) * 2)?;
                let mut in_clusters = Vec::with_capacity(in_n);
                for _ in 0..in_n {
                    in_clusters.push(buf.get_u16_le());
                }
                let mut out_clusters = Vec::with_capacity(out_n);
                for _ in 0..out_n {
                    out_clusters.push(buf.get_u16_le());
                }
                Ok(Self::Endpoint {
                    snap_seq,
                    device_uid,
                    short_addr,
                    endpoint,
                    profile_id,
                    device_id,
                    in_clusters,
                    out_clusters,
                })
            }
            SNAP_STATE => {
                let device_uid = get_fixed_str(&mut buf, UID_FIELD)?;
                need(&buf, 2 + 1 + 2 + 2)?;
                let short_addr = buf.get_u16_le();
                let endpoint = buf.get_u8();
                let cluster_id = buf.get_u16_le();
                let attr_id = buf.get_u16_le();
                let value = WireValue::decode(&mut buf)?;
                need(&buf, 8)?;
                Ok(Self::State {
                    snap_seq,
                    device_uid,
                    short_addr,
                    endpoint,
                    cluster_id,
                    attr_id,
                    value,
                    ts_ms: buf.get_u64_le(),
                })
            }
            SNAP_REMOVE => {
                let device_uid = get_fixed_str(&mut buf, UID_FIELD)?;
                need(&buf, 2)?;
                Ok(Self::Remove {
                    snap_seq,
                    device_uid,
                    short_addr: buf.get_u16_le(),
                })
            }
            SNAP_END => {
                need(&buf, 2)?;
                Ok(Self::End {
                    snap_seq,
                    total_devices: buf.get_u16_le(),
                })
            }
            other => Err(LinkError::MalformedPayload(format!(
                "unknown snapshot kind {other}"
            ))),
        }
    }
}
