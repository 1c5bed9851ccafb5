//! Raw sensor value store
//!
//! Last raw ZCL reading per (device, endpoint, cluster, attribute),
//! kept for audit and the UI. Values stay in raw ZCL units. The store
//! is bounded; unlike the state store, overflow rejects the insert.

use std::sync::Mutex;

use crate::error::GatewayError;
use crate::uid::DeviceUid;

/// Capacity of the store.
pub const SENSOR_STORE_CAP: usize = 64;

/// Raw reading scalar, as carried by the ZCL attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawValue {
    I32(i32),
    U32(u32),
}

/// One stored raw reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorValue {
    pub uid: DeviceUid,
    pub short_addr: u16,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attr_id: u16,
    pub value: RawValue,
    pub ts_ms: u64,
}

/// Bounded store of last raw readings
pub struct SensorStore {
    inner: Mutex<Vec<SensorValue>>,
    capacity: usize,
}

impl Default for SensorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(SENSOR_STORE_CAP)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Upsert by the (uid, endpoint, cluster, attr) tuple.
    ///
    /// A new tuple over capacity is rejected with `NoMem`.
    pub fn upsert(&self, value: SensorValue) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().expect("sensor store poisoned");
        if let Some(existing) = inner.iter_mut().find(|v| {
            v.uid == value.uid
                && v.endpoint == value.endpoint
                && v.cluster_id == value.cluster_id
                && v.attr_id == value.attr_id
        }) {
            *existing = value;
            return Ok(());
        }
        if inner.len() >= self.capacity {
            return Err(GatewayError::no_mem("sensor store full"));
        }
        inner.push(value);
        Ok(())
    }

    /// All readings for one device, in insertion order.
    #[must_use]
    pub fn list(&self, uid: DeviceUid) -> Vec<SensorValue> {
        let inner = self.inner.lock().expect("sensor store poisoned");
        inner.iter().filter(|v| v.uid == uid).cloned().collect()
    }

    /// Drop every reading belonging to a device.
    pub fn remove_device(&self, uid: DeviceUid) {
        let mut inner = self.inner.lock().expect("sensor store poisoned");
        inner.retain(|v| v.uid != uid);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("sensor store poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
