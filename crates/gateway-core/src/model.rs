//! Volatile Zigbee endpoint model
//!
//! Endpoints and clusters discovered via ActiveEP/SimpleDesc, keyed by
//! (uid, endpoint). Used for classification and command routing; lost
//! on restart and rebuilt by discovery.

use std::sync::Mutex;

use crate::device::EndpointRecord;
use crate::uid::DeviceUid;

/// Maximum endpoints tracked across all devices.
pub const MODEL_MAX_ENDPOINTS: usize = 64;

/// One modeled endpoint with its owning device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEndpoint {
    pub uid: DeviceUid,
    pub short_addr: u16,
    pub record: EndpointRecord,
}

/// Volatile endpoint table
pub struct ZigbeeModel {
    inner: Mutex<Vec<ModelEndpoint>>,
}

impl Default for ZigbeeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ZigbeeModel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Replace-or-insert by (uid, endpoint). Insertion order is kept.
    pub fn upsert_endpoint(&self, ep: ModelEndpoint) {
        let mut inner = self.inner.lock().expect("zigbee model poisoned");
        if let Some(existing) = inner
            .iter_mut()
            .find(|e| e.uid == ep.uid && e.record.endpoint == ep.record.endpoint)
        {
            *existing = ep;
            return;
        }
        if inner.len() < MODEL_MAX_ENDPOINTS {
            inner.push(ep);
        } else {
            tracing::warn!("zigbee model full, endpoint dropped");
        }
    }

    /// All endpoints of one device, in insertion order.
    #[must_use]
    pub fn list_endpoints(&self, uid: DeviceUid) -> Vec<ModelEndpoint> {
        let inner = self.inner.lock().expect("zigbee model poisoned");
        inner.iter().filter(|e| e.uid == uid).cloned().collect()
    }

    /// Every modeled endpoint.
    #[must_use]
    pub fn list_all(&self) -> Vec<ModelEndpoint> {
        self.inner.lock().expect("zigbee model poisoned").clone()
    }

    /// First device bearing the given short address.
    #[must_use]
    pub fn find_uid_by_short(&self, short_addr: u16) -> Option<DeviceUid> {
        let inner = self.inner.lock().expect("zigbee model poisoned");
        inner
            .iter()
            .find(|e| e.short_addr == short_addr)
            .map(|e| e.uid)
    }

    /// Drop every endpoint belonging to a device.
    pub fn remove_device(&self, uid: DeviceUid) {
        let mut inner = self.inner.lock().expect("zigbee model poisoned");
        inner.retain(|e| e.uid != uid);
    }

    /// Replace the whole endpoint list of a device (snapshot apply).
    pub fn replace_device(&self, uid: DeviceUid, endpoints: Vec<ModelEndpoint>) {
        let mut inner = self.inner.lock().expect("zigbee model poisoned");
        inner.retain(|e| e.uid != uid);
        for ep in endpoints {
            if ep.uid == uid && inner.len() < MODEL_MAX_ENDPOINTS {
                inner.push(ep);
            }
        }
    }
}
