//! Normalized device state store
//!
//! Bounded map from (device, key) to a typed scalar with a timestamp.
//! This is the single source of truth for automation conditions and
//! optimistic UI reconciliation. When full, the entry with the
//! smallest timestamp is evicted.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::GatewayError;
use crate::uid::DeviceUid;

/// Default capacity of the store.
pub const STATE_STORE_CAP: usize = 128;
/// Maximum state-key length (bytes).
pub const STATE_KEY_MAX: usize = 23;

/// Typed state scalar
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateValue {
    Bool(bool),
    F32(f32),
    U32(u32),
    U64(u64),
}

/// One stored state entry
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub value: StateValue,
    pub ts_ms: u64,
}

/// Bounded, timestamp-evicting state store
pub struct StateStore {
    inner: Mutex<HashMap<(DeviceUid, String), StateEntry>>,
    capacity: usize,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(STATE_STORE_CAP)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Insert or overwrite a state key.
    ///
    /// Capacity overflow evicts the globally oldest entry instead of
    /// failing; an empty or over-long key is an argument error.
    pub fn set(
        &self,
        uid: DeviceUid,
        key: &str,
        value: StateValue,
        ts_ms: u64,
    ) -> Result<(), GatewayError> {
        if key.is_empty() || key.len() > STATE_KEY_MAX {
            return Err(GatewayError::invalid_args("bad state key"));
        }

        let mut inner = self.inner.lock().expect("state store poisoned");
        let map_key = (uid, key.to_string());
        if let Some(entry) = inner.get_mut(&map_key) {
            entry.value = value;
            entry.ts_ms = ts_ms;
            return Ok(());
        }

        if inner.len() >= self.capacity {
            if let Some(oldest) = inner
                .iter()
                .min_by_key(|(_, e)| e.ts_ms)
                .map(|(k, _)| k.clone())
            {
                tracing::debug!(uid = %oldest.0, key = %oldest.1, "state store full, evicting oldest");
                inner.remove(&oldest);
            }
        }

        inner.insert(map_key, StateEntry { value, ts_ms });
        Ok(())
    }

    pub fn set_bool(&self, uid: DeviceUid, key: &str, v: bool, ts_ms: u64) -> Result<(), GatewayError> {
        self.set(uid, key, StateValue::Bool(v), ts_ms)
    }

    pub fn set_f32(&self, uid: DeviceUid, key: &str, v: f32, ts_ms: u64) -> Result<(), GatewayError> {
        self.set(uid, key, StateValue::F32(v), ts_ms)
    }

    pub fn set_u32(&self, uid: DeviceUid, key: &str, v: u32, ts_ms: u64) -> Result<(), GatewayError> {
        self.set(uid, key, StateValue::U32(v), ts_ms)
    }

    pub fn set_u64(&self, uid: DeviceUid, key: &str, v: u64, ts_ms: u64) -> Result<(), GatewayError> {
        self.set(uid, key, StateValue::U64(v), ts_ms)
    }

    /// Look up one state key.
    #[must_use]
    pub fn get(&self, uid: DeviceUid, key: &str) -> Option<StateEntry> {
        let inner = self.inner.lock().expect("state store poisoned");
        inner.get(&(uid, key.to_string())).cloned()
    }

    /// All entries for one device, as (key, entry) pairs.
    #[must_use]
    pub fn list(&self, uid: DeviceUid) -> Vec<(String, StateEntry)> {
        let inner = self.inner.lock().expect("state store poisoned");
        inner
            .iter()
            .filter(|((u, _), _)| *u == uid)
            .map(|((_, k), e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Drop every entry belonging to a device.
    pub fn remove_device(&self, uid: DeviceUid) {
        let mut inner = self.inner.lock().expect("state store poisoned");
        inner.retain(|(u, _), _| *u != uid);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("state store poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(v: u64) -> DeviceUid {
        DeviceUid::new(v)
    }

    #[test]
    fn test_set_get_overwrite() {
        let store = StateStore::new();
        store.set_bool(uid(1), "onoff", true, 10).unwrap();
        store.set_bool(uid(1), "onoff", false, 20).unwrap();

        let entry = store.get(uid(1), "onoff").unwrap();
        assert_eq!(entry.value, StateValue::Bool(false));
        assert_eq!(entry.ts_ms, 20);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bad_key_rejected() {
        let store = StateStore::new();
        assert!(store.set_bool(uid(1), "", true, 1).is_err());
        let long = "k".repeat(STATE_KEY_MAX + 1);
        assert!(store.set_bool(uid(1), &long, true, 1).is_err());
    }

    #[test]
    fn test_lru_eviction_of_oldest() {
        let store = StateStore::with_capacity(4);
        store.set_u32(uid(1), "a", 1, 40).unwrap();
        store.set_u32(uid(1), "b", 2, 10).unwrap(); // oldest
        store.set_u32(uid(2), "c", 3, 30).unwrap();
        store.set_u32(uid(2), "d", 4, 20).unwrap();

        store.set_u32(uid(3), "e", 5, 50).unwrap();
        assert_eq!(store.len(), 4);
        assert!(store.get(uid(1), "b").is_none());
        assert!(store.get(uid(3), "e").is_some());
    }

    #[test]
    fn test_size_never_exceeds_cap() {
        let store = StateStore::with_capacity(8);
        let mut x = 0x9E37_79B9u64;
        for i in 0..200u64 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let device = uid(x % 5);
            let key = format!("k{}", x % 12);
            store.set_u64(device, &key, i, x % 1000).unwrap();
            assert!(store.len() <= 8);
        }
    }

    #[test]
    fn test_remove_device() {
        let store = StateStore::new();
        store.set_bool(uid(1), "onoff", true, 1).unwrap();
        store.set_u32(uid(1), "level", 10, 2).unwrap();
        store.set_bool(uid(2), "onoff", false, 3).unwrap();

        store.remove_device(uid(1));
        assert!(store.get(uid(1), "onoff").is_none());
        assert!(store.get(uid(2), "onoff").is_some());
    }
}
