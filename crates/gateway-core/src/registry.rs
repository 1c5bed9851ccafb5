//! Device registry
//!
//! Authoritative map from device UID to device record. Bounded
//! capacity, numeric-UID deduplication on load, default naming for
//! freshly joined devices, write-through binary persistence.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::device::DeviceRecord;
use crate::error::GatewayError;
use crate::storage;
use crate::uid::DeviceUid;

/// Default registry capacity.
pub const MAX_DEVICES: usize = 32;

/// Bounded persistent device table
pub struct DeviceRegistry {
    devices: Arc<DashMap<DeviceUid, DeviceRecord>>,
    capacity: usize,
    data_path: Option<PathBuf>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// In-memory registry (no persistence), default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            capacity: MAX_DEVICES,
            data_path: None,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            devices: Arc::new(DashMap::new()),
            capacity,
            data_path: None,
        }
    }

    /// Open a registry backed by the given file, loading and
    /// deduplicating its contents.
    pub async fn open(path: PathBuf) -> Self {
        let registry = Self {
            devices: Arc::new(DashMap::new()),
            capacity: MAX_DEVICES,
            data_path: Some(path.clone()),
        };
        let loaded = storage::load_registry(&path).await;
        for device in loaded {
            // Duplicates in the file collapse into one merged record.
            match registry.devices.get_mut(&device.uid) {
                Some(mut existing) => existing.merge(&device),
                None => {
                    if registry.devices.len() < registry.capacity {
                        registry.devices.insert(device.uid, device);
                    } else {
                        tracing::warn!(uid = %device.uid, "registry full on load, device dropped");
                    }
                }
            }
        }
        registry
    }

    /// Insert or merge a device record.
    ///
    /// An existing record keeps its slot and merges the new data. A
    /// record arriving with no name gets a default one.
    pub fn upsert(&self, device: DeviceRecord) -> Result<(), GatewayError> {
        if let Some(mut existing) = self.devices.get_mut(&device.uid) {
            existing.merge(&device);
            // A direct upsert is fresher than merge-by-timestamp alone.
            if device.is_ready() {
                existing.short_addr = device.short_addr;
            }
            if device.last_seen_ms > 0 {
                existing.last_seen_ms = existing.last_seen_ms.max(device.last_seen_ms);
            }
            drop(existing);
            self.save();
            return Ok(());
        }

        if self.devices.len() >= self.capacity {
            return Err(GatewayError::no_mem("device registry full"));
        }

        let mut device = device;
        if device.name.is_empty() {
            device.name = self.default_name(&device);
        }
        self.devices.insert(device.uid, device);
        self.save();
        Ok(())
    }

    /// Default name: `<prefix><N>` with N one past the highest taken.
    fn default_name(&self, device: &DeviceRecord) -> String {
        let prefix = if device.has_button {
            "switch"
        } else if device.has_onoff {
            "relay"
        } else {
            "device"
        };

        let mut max_num = 0u32;
        for entry in self.devices.iter() {
            if let Some(rest) = entry.name.strip_prefix(prefix) {
                if let Ok(n) = rest.parse::<u32>() {
                    max_num = max_num.max(n);
                }
            }
        }
        format!("{}{}", prefix, max_num + 1)
    }

    #[must_use]
    pub fn get(&self, uid: DeviceUid) -> Option<DeviceRecord> {
        self.devices.get(&uid).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn find_by_short(&self, short_addr: u16) -> Option<DeviceRecord> {
        self.devices
            .iter()
            .find(|r| r.short_addr == short_addr)
            .map(|r| r.value().clone())
    }

    /// Rename a device.
    pub fn set_name(&self, uid: DeviceUid, name: &str) -> Result<(), GatewayError> {
        let mut device = self
            .devices
            .get_mut(&uid)
            .ok_or_else(|| GatewayError::not_found("device not in registry"))?;
        device.set_name(name);
        drop(device);
        self.save();
        Ok(())
    }

    /// Update `last_seen_ms` (and short address when it moved).
    pub fn touch(&self, uid: DeviceUid, short_addr: u16, ts_ms: u64) {
        if let Some(mut device) = self.devices.get_mut(&uid) {
            device.last_seen_ms = device.last_seen_ms.max(ts_ms);
            if short_addr != 0 && short_addr != crate::device::SHORT_ADDR_UNKNOWN {
                device.short_addr = short_addr;
            }
            drop(device);
            self.save();
        }
    }

    /// Remove a device; returns the removed record.
    pub fn remove(&self, uid: DeviceUid) -> Option<DeviceRecord> {
        let removed = self.devices.remove(&uid).map(|(_, v)| v);
        if removed.is_some() {
            self.save();
        }
        removed
    }

    /// All records, sorted by UID for stable output.
    #[must_use]
    pub fn list(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> =
            self.devices.iter().map(|r| r.value().clone()).collect();
        devices.sort_by_key(|d| d.uid);
        devices
    }

    #[must_use]
    pub fn uids(&self) -> Vec<DeviceUid> {
        self.devices.iter().map(|r| *r.key()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Write through to storage in the background.
    fn save(&self) {
        if let Some(path) = &self.data_path {
            let devices = self.list();
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(e) = storage::save_registry(&path, &devices).await {
                    tracing::warn!("Failed to save registry: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EndpointRecord;

    fn device(v: u64) -> DeviceRecord {
        DeviceRecord::new(DeviceUid::new(v), 0x1000 + v as u16)
    }

    #[test]
    fn test_upsert_merges_existing() {
        let registry = DeviceRegistry::new();
        let mut first = device(1);
        first.last_seen_ms = 10;
        registry.upsert(first).unwrap();

        let mut second = device(1);
        second.short_addr = 0x2222;
        second.last_seen_ms = 20;
        second.has_onoff = true;
        second.upsert_endpoint(EndpointRecord::new(1, 0x0104, 0));
        registry.upsert(second).unwrap();

        assert_eq!(registry.len(), 1);
        let merged = registry.get(DeviceUid::new(1)).unwrap();
        assert_eq!(merged.short_addr, 0x2222);
        assert_eq!(merged.last_seen_ms, 20);
        assert!(merged.has_onoff);
        assert_eq!(merged.endpoints.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let registry = DeviceRegistry::with_capacity(2);
        registry.upsert(device(1)).unwrap();
        registry.upsert(device(2)).unwrap();
        let err = registry.upsert(device(3)).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NoMem);
        // updates of known devices still pass
        registry.upsert(device(1)).unwrap();
    }

    #[test]
    fn test_default_naming_by_capability() {
        let registry = DeviceRegistry::new();

        let mut button = device(1);
        button.has_button = true;
        registry.upsert(button).unwrap();
        assert_eq!(registry.get(DeviceUid::new(1)).unwrap().name, "switch1");

        let mut relay = device(2);
        relay.has_onoff = true;
        registry.upsert(relay).unwrap();
        assert_eq!(registry.get(DeviceUid::new(2)).unwrap().name, "relay1");

        registry.upsert(device(3)).unwrap();
        assert_eq!(registry.get(DeviceUid::new(3)).unwrap().name, "device1");
    }

    #[test]
    fn test_default_naming_counts_past_highest() {
        let registry = DeviceRegistry::new();
        let mut named = device(1);
        named.has_onoff = true;
        named.set_name("relay7");
        registry.upsert(named).unwrap();

        let mut fresh = device(2);
        fresh.has_onoff = true;
        registry.upsert(fresh).unwrap();
        assert_eq!(registry.get(DeviceUid::new(2)).unwrap().name, "relay8");
    }

    #[test]
    fn test_find_by_short_and_remove() {
        let registry = DeviceRegistry::new();
        registry.upsert(device(5)).unwrap();
        let found = registry.find_by_short(0x1005).unwrap();
        assert_eq!(found.uid, DeviceUid::new(5));

        assert!(registry.remove(DeviceUid::new(5)).is_some());
        assert!(registry.get(DeviceUid::new(5)).is_none());
    }

    #[tokio::test]
    async fn test_open_dedupes_file_contents() {
        let dir = std::env::temp_dir().join("gw-registry-dedup-test");
        let path = dir.join("devices.bin");

        // Write a file with two records for the same UID.
        let mut a = device(9);
        a.last_seen_ms = 100;
        a.set_name("older");
        let mut b = device(9);
        b.short_addr = 0x4242;
        b.last_seen_ms = 200;
        b.has_button = true;
        storage::save_registry(&path, &[a, b]).await.unwrap();

        let registry = DeviceRegistry::open(path).await;
        assert_eq!(registry.len(), 1);
        let merged = registry.get(DeviceUid::new(9)).unwrap();
        assert_eq!(merged.last_seen_ms, 200);
        assert_eq!(merged.short_addr, 0x4242);
        assert_eq!(merged.name, "older");
        assert!(merged.has_button);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
