//! Binary persistence for the device registry
//!
//! A simple fixed-record array with a small header and a trailing
//! checksum. Layout version 1; any other version refuses to load and
//! the registry starts empty.

use std::path::Path;

use bytes::{Buf, BufMut};
use tokio::fs;

use crate::device::{
    DeviceRecord, EndpointRecord, MAX_CLUSTERS_PER_LIST, MAX_ENDPOINTS_PER_DEVICE, MAX_NAME_LEN,
};
use crate::error::GatewayError;
use crate::uid::DeviceUid;

/// File magic: "GWDR" little-endian.
pub const REGISTRY_MAGIC: u32 = 0x5244_5747;
/// Supported layout version.
pub const REGISTRY_VERSION: u16 = 1;

const NAME_FIELD: usize = MAX_NAME_LEN + 1;

/// Checksum: two's complement of the byte sum (same family as the
/// link frame CRC), widened to 32 bits.
fn checksum(data: &[u8]) -> u32 {
    let sum: u32 = data
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    (!sum).wrapping_add(1)
}

fn put_name(buf: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_FIELD - 1);
    buf.put_slice(&bytes[..n]);
    for _ in n..NAME_FIELD {
        buf.put_u8(0);
    }
}

fn get_name(buf: &mut &[u8]) -> Result<String, GatewayError> {
    if buf.remaining() < NAME_FIELD {
        return Err(GatewayError::format("registry record truncated"));
    }
    let raw = &buf[..NAME_FIELD];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD);
    let name = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(NAME_FIELD);
    Ok(name)
}

fn encode_record(buf: &mut Vec<u8>, device: &DeviceRecord) {
    buf.put_u64_le(device.uid.as_u64());
    buf.put_u16_le(device.short_addr);
    put_name(buf, &device.name);
    buf.put_u64_le(device.last_seen_ms);
    let flags = u8::from(device.has_onoff) | (u8::from(device.has_button) << 1);
    buf.put_u8(flags);
    let ep_count = device.endpoints.len().min(MAX_ENDPOINTS_PER_DEVICE);
    buf.put_u8(ep_count as u8);
    for slot in 0..MAX_ENDPOINTS_PER_DEVICE {
        let ep = device.endpoints.get(slot);
        buf.put_u8(ep.map_or(0, |e| e.endpoint));
        buf.put_u16_le(ep.map_or(0, |e| e.profile_id));
        buf.put_u16_le(ep.map_or(0, |e| e.device_id));
        let in_n = ep.map_or(0, |e| e.in_clusters.len().min(MAX_CLUSTERS_PER_LIST));
        let out_n = ep.map_or(0, |e| e.out_clusters.len().min(MAX_CLUSTERS_PER_LIST));
        buf.put_u8(in_n as u8);
        buf.put_u8(out_n as u8);
        for i in 0..MAX_CLUSTERS_PER_LIST {
            buf.put_u16_le(ep.and_then(|e| e.in_clusters.get(i)).copied().unwrap_or(0));
        }
        for i in 0..MAX_CLUSTERS_PER_LIST {
            buf.put_u16_le(ep.and_then(|e| e.out_clusters.get(i)).copied().unwrap_or(0));
        }
    }
}

fn decode_record(buf: &mut &[u8]) -> Result<DeviceRecord, GatewayError> {
    if buf.remaining() < 8 + 2 {
        return Err(GatewayError::format("registry record truncated"));
    }
    let uid = DeviceUid::new(buf.get_u64_le());
    let short_addr = buf.get_u16_le();
    let name = get_name(buf)?;
    if buf.remaining() < 8 + 1 + 1 {
        return Err(GatewayError::format("registry record truncated"));
    }
    let last_seen_ms = buf.get_u64_le();
    let flags = buf.get_u8();
    let ep_count = (buf.get_u8() as usize).min(MAX_ENDPOINTS_PER_DEVICE);

    let mut device = DeviceRecord::new(uid, short_addr);
    device.name = name;
    device.last_seen_ms = last_seen_ms;
    device.has_onoff = flags & 0x01 != 0;
    device.has_button = flags & 0x02 != 0;

    for slot in 0..MAX_ENDPOINTS_PER_DEVICE {
        if buf.remaining() < 1 + 2 + 2 + 1 + 1 + MAX_CLUSTERS_PER_LIST * 4 {
            return Err(GatewayError::format("registry record truncated"));
        }
        let endpoint = buf.get_u8();
        let profile_id = buf.get_u16_le();
        let device_id = buf.get_u16_le();
        let in_n = (buf.get_u8() as usize).min(MAX_CLUSTERS_PER_LIST);
        let out_n = (buf.get_u8() as usize).min(MAX_CLUSTERS_PER_LIST);
        let mut record = EndpointRecord::new(endpoint, profile_id, device_id);
        for i in 0..MAX_CLUSTERS_PER_LIST {
            let c = buf.get_u16_le();
            if i < in_n {
                record.in_clusters.push(c);
            }
        }
        for i in 0..MAX_CLUSTERS_PER_LIST {
            let c = buf.get_u16_le();
            if i < out_n {
                record.out_clusters.push(c);
            }
        }
        if slot < ep_count && endpoint != 0 {
            device.endpoints.push(record);
        }
    }
    Ok(device)
}

/// Serialize the registry contents to the file image.
#[must_use]
pub fn encode_registry(devices: &[DeviceRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32_le(REGISTRY_MAGIC);
    buf.put_u16_le(REGISTRY_VERSION);
    buf.put_u16_le(devices.len() as u16);
    for device in devices {
        encode_record(&mut buf, device);
    }
    let sum = checksum(&buf);
    buf.put_u32_le(sum);
    buf
}

/// Parse a registry file image.
///
/// # Errors
/// `FormatError` on bad magic, unsupported version, bad checksum, or a
/// truncated record array.
pub fn decode_registry(data: &[u8]) -> Result<Vec<DeviceRecord>, GatewayError> {
    if data.len() < 4 + 2 + 2 + 4 {
        return Err(GatewayError::format("registry file too short"));
    }
    let body = &data[..data.len() - 4];
    let stored = u32::from_le_bytes(data[data.len() - 4..].try_into().expect("4 bytes"));
    if checksum(body) != stored {
        return Err(GatewayError::new(
            crate::error::ErrorKind::CrcError,
            "registry checksum mismatch",
        ));
    }

    let mut buf = body;
    let magic = buf.get_u32_le();
    if magic != REGISTRY_MAGIC {
        return Err(GatewayError::format("registry bad magic"));
    }
    let version = buf.get_u16_le();
    if version != REGISTRY_VERSION {
        return Err(GatewayError::format(format!(
            "registry version {version} unsupported"
        )));
    }
    let count = buf.get_u16_le() as usize;
    let mut devices = Vec::with_capacity(count);
    for _ in 0..count {
        devices.push(decode_record(&mut buf)?);
    }
    Ok(devices)
}

/// Load the registry file; a missing or damaged file yields an empty list.
pub async fn load_registry(path: &Path) -> Vec<DeviceRecord> {
    match fs::read(path).await {
        Ok(data) => match decode_registry(&data) {
            Ok(devices) => {
                tracing::info!("Loaded {} devices from {:?}", devices.len(), path);
                devices
            }
            Err(e) => {
                tracing::warn!("Failed to parse registry file {:?}: {}", path, e);
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No registry file at {:?}, starting fresh", path);
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("Failed to read registry file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Save the registry atomically: write to a temp file, then rename.
pub async fn save_registry(path: &Path, devices: &[DeviceRecord]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let data = encode_registry(devices);
    let tmp_path = path.with_extension("bin.tmp");
    fs::write(&tmp_path, &data).await?;
    fs::rename(&tmp_path, path).await?;
    tracing::debug!("Saved {} devices to {:?}", devices.len(), path);
    Ok(())
}
