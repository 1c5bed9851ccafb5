//! Host-side state mirror and snapshot applier
//!
//! The host keeps a mirror of the radio's device model, fed by the
//! event stream and reconciled by full snapshots with stale-sweep
//! semantics: devices not mentioned between BEGIN and END are gone.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use gateway_core::device::{DeviceRecord, EndpointRecord};
use gateway_core::event::{EventBus, EventValue, GwEvent};
use gateway_core::model::{ModelEndpoint, ZigbeeModel};
use gateway_core::projection::{self, AttrReport};
use gateway_core::registry::DeviceRegistry;
use gateway_core::sensor::{RawValue, SensorStore};
use gateway_core::state::{StateStore, StateValue};
use gateway_core::uid::DeviceUid;
use link_protocol::message::{EventKind, EventRecord, SnapshotRecord, WireValue};

/// Shared stores of the host node
#[derive(Clone)]
pub struct HostStores {
    pub registry: Arc<DeviceRegistry>,
    pub model: Arc<ZigbeeModel>,
    pub states: Arc<StateStore>,
    pub sensors: Arc<SensorStore>,
    pub bus: Arc<EventBus>,
}

impl HostStores {
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::new()),
            model: Arc::new(ZigbeeModel::new()),
            states: Arc::new(StateStore::new()),
            sensors: Arc::new(SensorStore::new()),
            bus,
        }
    }

    fn drop_device(&self, uid: DeviceUid) {
        self.registry.remove(uid);
        self.model.remove_device(uid);
        self.states.remove_device(uid);
        self.sensors.remove_device(uid);
    }
}

/// Normalized state key for a (cluster, attr) pair.
#[must_use]
pub fn state_key_for(cluster_id: u16, attr_id: u16) -> String {
    projection::normalize(&AttrReport {
        short_addr: 0,
        endpoint: 0,
        cluster_id,
        attr_id,
        raw: RawValue::I32(0),
        ts_ms: 0,
    })
    .key
}

/// Applies the snapshot stream to the host stores
pub struct SnapshotApplier {
    stores: HostStores,
    /// UIDs considered stale until the running snapshot mentions them.
    stale: Mutex<Option<HashSet<DeviceUid>>>,
}

impl SnapshotApplier {
    #[must_use]
    pub fn new(stores: HostStores) -> Self {
        Self {
            stores,
            stale: Mutex::new(None),
        }
    }

    /// Apply one snapshot record.
    pub fn apply(&self, record: &SnapshotRecord) {
        match record {
            SnapshotRecord::Begin { total_devices, .. } => {
                let current: HashSet<DeviceUid> = self.stores.registry.uids().into_iter().collect();
                tracing::info!(
                    "snapshot begin: {} devices expected, {} currently known",
                    total_devices,
                    current.len()
                );
                *self.stale.lock().expect("stale set poisoned") = Some(current);
            }

            SnapshotRecord::Device {
                device_uid,
                name,
                short_addr,
                last_seen_ms,
                has_onoff,
                has_button,
                ..
            } => {
                let Ok(uid) = device_uid.parse::<DeviceUid>() else {
                    tracing::warn!("snapshot device with bad uid {device_uid:?}");
                    return;
                };
                if let Some(stale) = self.stale.lock().expect("stale set poisoned").as_mut() {
                    stale.remove(&uid);
                }

                let mut device = DeviceRecord::new(uid, *short_addr);
                device.set_name(name);
                device.last_seen_ms = *last_seen_ms;
                device.has_onoff = *has_onoff;
                device.has_button = *has_button;
                // The endpoint list restarts here; ENDPOINT entries follow.
                self.stores.registry.remove(uid);
                self.stores.model.replace_device(uid, Vec::new());
                if let Err(e) = self.stores.registry.upsert(device) {
                    tracing::warn!(uid = %uid, "mirror registry rejected device: {}", e);
                }
            }

            SnapshotRecord::Endpoint {
                device_uid,
                short_addr,
                endpoint,
                profile_id,
                device_id,
                in_clusters,
                out_clusters,
                ..
            } => {
                let Ok(uid) = device_uid.parse::<DeviceUid>() else {
                    return;
                };
                let mut record = EndpointRecord::new(*endpoint, *profile_id, *device_id);
                record.in_clusters.clone_from(in_clusters);
                record.out_clusters.clone_from(out_clusters);

                self.stores.model.upsert_endpoint(ModelEndpoint {
                    uid,
                    short_addr: *short_addr,
                    record: record.clone(),
                });
                if let Some(mut device) = self.stores.registry.get(uid) {
                    device.upsert_endpoint(record);
                    let _ = self.stores.registry.upsert(device);
                }
            }

            SnapshotRecord::State {
                device_uid,
                short_addr,
                endpoint,
                cluster_id,
                attr_id,
                value,
                ts_ms,
                ..
            } => {
                let Ok(uid) = device_uid.parse::<DeviceUid>() else {
                    return;
                };
                let raw = match value {
                    WireValue::I64(v) => RawValue::I32(*v as i32),
                    WireValue::Bool(b) => RawValue::I32(i32::from(*b)),
                    WireValue::F32(v) => RawValue::I32(*v as i32),
                    WireValue::None | WireValue::Text => return,
                };
                projection::project_attr_report(
                    uid,
                    &AttrReport {
                        short_addr: *short_addr,
                        endpoint: *endpoint,
                        cluster_id: *cluster_id,
                        attr_id: *attr_id,
                        raw,
                        ts_ms: *ts_ms,
                    },
                    &self.stores.registry,
                    &self.stores.sensors,
                    &self.stores.states,
                    &self.stores.bus,
                );
            }

            SnapshotRecord::Remove { device_uid, .. } => {
                if let Ok(uid) = device_uid.parse::<DeviceUid>() {
                    tracing::info!("snapshot remove: {}", uid);
                    self.stores.drop_device(uid);
                    if let Some(stale) = self.stale.lock().expect("stale set poisoned").as_mut() {
                        stale.remove(&uid);
                    }
                }
            }

            SnapshotRecord::End { total_devices, .. } => {
                let stale = self
                    .stale
                    .lock()
                    .expect("stale set poisoned")
                    .take()
                    .unwrap_or_default();
                for uid in &stale {
                    tracing::info!("snapshot sweep: removing stale device {}", uid);
                    self.stores.drop_device(*uid);
                }
                tracing::info!(
                    "snapshot end: {} devices, {} stale removed",
                    total_devices,
                    stale.len()
                );
            }
        }
    }
}

/// Convert a wire event back into a bus event for the host side.
#[must_use]
pub fn record_to_event(record: &EventRecord) -> GwEvent {
    let mut event = GwEvent::new(record.event_type.clone(), "link");
    event.ts_ms = record.ts_ms;
    if let Ok(uid) = record.device_uid.parse::<DeviceUid>() {
        event = event.with_device(uid, record.short_addr);
    }
    if record.endpoint != 0 {
        event = event.with_endpoint(record.endpoint);
    }
    if !record.cmd.is_empty() {
        event = event.with_cmd(record.cmd.clone());
    }
    if record.cluster_id != 0 || record.attr_id != 0 {
        event = event.with_cluster_attr(record.cluster_id, record.attr_id);
    }
    event = event.with_value(match &record.value {
        WireValue::None => EventValue::None,
        WireValue::Bool(b) => EventValue::Bool(*b),
        WireValue::I64(v) => EventValue::I64(*v),
        WireValue::F32(v) => EventValue::F64(f64::from(*v)),
        WireValue::Text => EventValue::Text(record.value_text.clone()),
    });
    event
}

/// Fold an incoming event into the host mirror, returning the state
/// key it updated (for the UI stream), if any.
pub fn apply_event(stores: &HostStores, record: &EventRecord) -> Option<String> {
    let uid = record.device_uid.parse::<DeviceUid>().ok()?;

    match record.kind {
        EventKind::AttrReport => {
            let key = state_key_for(record.cluster_id, record.attr_id);
            let value = match &record.value {
                WireValue::Bool(b) => StateValue::Bool(*b),
                WireValue::F32(v) => StateValue::F32(*v),
                WireValue::I64(v) => StateValue::F32(*v as f32),
                WireValue::None | WireValue::Text => return None,
            };
            if let Err(e) = stores.states.set(uid, &key, value, record.ts_ms) {
                tracing::warn!(uid = %uid, key = %key, "mirror state set failed: {}", e);
                return None;
            }
            stores.registry.touch(uid, record.short_addr, record.ts_ms);
            Some(key)
        }
        EventKind::Command | EventKind::DeviceJoin => {
            stores.registry.touch(uid, record.short_addr, record.ts_ms);
            None
        }
        EventKind::DeviceLeave | EventKind::NetState => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> HostStores {
        HostStores::new(Arc::new(EventBus::new()))
    }

    fn device_frame(seq: u32, uid: &str) -> SnapshotRecord {
        SnapshotRecord::Device {
            snap_seq: seq,
            device_uid: uid.to_string(),
            name: "lamp".to_string(),
            short_addr: 0x10,
            last_seen_ms: 100,
            has_onoff: true,
            has_button: false,
        }
    }

    fn endpoint_frame(seq: u32, uid: &str) -> SnapshotRecord {
        SnapshotRecord::Endpoint {
            snap_seq: seq,
            device_uid: uid.to_string(),
            short_addr: 0x10,
            endpoint: 1,
            profile_id: 0x0104,
            device_id: 0x0100,
            in_clusters: vec![0x0000, 0x0006],
            out_clusters: vec![],
        }
    }

    const U1: &str = "0x00124b0000000001";
    const U2: &str = "0x00124b0000000002";
    const U3: &str = "0x00124b0000000003";

    fn seed(stores: &HostStores, uid: &str) {
        let parsed: DeviceUid = uid.parse().unwrap();
        stores
            .registry
            .upsert(DeviceRecord::new(parsed, 0x99))
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_reconcile_after_leave() {
        let stores = stores();
        for uid in [U1, U2, U3] {
            seed(&stores, uid);
        }
        assert_eq!(stores.registry.len(), 3);

        let applier = SnapshotApplier::new(stores.clone());
        applier.apply(&SnapshotRecord::Begin {
            snap_seq: 0,
            total_devices: 2,
        });
        applier.apply(&device_frame(1, U1));
        applier.apply(&endpoint_frame(2, U1));
        applier.apply(&device_frame(3, U2));
        applier.apply(&endpoint_frame(4, U2));
        applier.apply(&SnapshotRecord::End {
            snap_seq: 5,
            total_devices: 2,
        });

        let uids: HashSet<String> = stores
            .registry
            .list()
            .iter()
            .map(|d| d.uid.to_string())
            .collect();
        assert_eq!(uids, HashSet::from([U1.to_string(), U2.to_string()]));
        let u3: DeviceUid = U3.parse().unwrap();
        assert!(stores.registry.get(u3).is_none());
    }

    #[tokio::test]
    async fn test_device_frame_replaces_endpoint_list() {
        let stores = stores();
        let uid: DeviceUid = U1.parse().unwrap();

        let applier = SnapshotApplier::new(stores.clone());
        applier.apply(&SnapshotRecord::Begin {
            snap_seq: 0,
            total_devices: 1,
        });
        applier.apply(&device_frame(1, U1));
        applier.apply(&endpoint_frame(2, U1));
        applier.apply(&SnapshotRecord::End {
            snap_seq: 3,
            total_devices: 1,
        });
        assert_eq!(stores.model.list_endpoints(uid).len(), 1);

        // next snapshot: device now has no endpoints
        applier.apply(&SnapshotRecord::Begin {
            snap_seq: 0,
            total_devices: 1,
        });
        applier.apply(&device_frame(1, U1));
        applier.apply(&SnapshotRecord::End {
            snap_seq: 2,
            total_devices: 1,
        });
        assert!(stores.model.list_endpoints(uid).is_empty());
        assert!(stores.registry.get(uid).unwrap().endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_state_frame_projects() {
        let stores = stores();
        let uid: DeviceUid = U1.parse().unwrap();
        let applier = SnapshotApplier::new(stores.clone());

        applier.apply(&device_frame(0, U1));
        applier.apply(&SnapshotRecord::State {
            snap_seq: 1,
            device_uid: U1.to_string(),
            short_addr: 0x10,
            endpoint: 1,
            cluster_id: 0x0402,
            attr_id: 0,
            value: WireValue::I64(2345),
            ts_ms: 42,
        });

        let entry = stores.states.get(uid, "temperature_c").unwrap();
        assert_eq!(entry.value, StateValue::F32(23.45));
        assert_eq!(entry.ts_ms, 42);
    }

    #[tokio::test]
    async fn test_remove_frame_outside_snapshot() {
        let stores = stores();
        seed(&stores, U1);
        let uid: DeviceUid = U1.parse().unwrap();
        let applier = SnapshotApplier::new(stores.clone());

        applier.apply(&SnapshotRecord::Remove {
            snap_seq: 0,
            device_uid: U1.to_string(),
            short_addr: 0x99,
        });
        assert!(stores.registry.get(uid).is_none());
    }

    #[tokio::test]
    async fn test_apply_attr_report_event() {
        let stores = stores();
        seed(&stores, U1);
        let uid: DeviceUid = U1.parse().unwrap();

        let record = EventRecord {
            event_id: 1,
            ts_ms: 500,
            kind: EventKind::AttrReport,
            event_type: "zigbee.attr_report".to_string(),
            cmd: String::new(),
            device_uid: U1.to_string(),
            short_addr: 0x10,
            endpoint: 1,
            cluster_id: 0x0006,
            attr_id: 0,
            value: WireValue::Bool(true),
            value_text: String::new(),
        };
        let key = apply_event(&stores, &record).unwrap();
        assert_eq!(key, "onoff");
        assert_eq!(
            stores.states.get(uid, "onoff").unwrap().value,
            StateValue::Bool(true)
        );
        // short address learned from the event
        assert_eq!(stores.registry.get(uid).unwrap().short_addr, 0x10);
    }

    #[test]
    fn test_record_event_conversion() {
        let record = EventRecord {
            event_id: 9,
            ts_ms: 123,
            kind: EventKind::Command,
            event_type: "zigbee.command".to_string(),
            cmd: "toggle".to_string(),
            device_uid: U1.to_string(),
            short_addr: 0x22,
            endpoint: 1,
            cluster_id: 0x0006,
            attr_id: 0,
            value: WireValue::None,
            value_text: String::new(),
        };
        let event = record_to_event(&record);
        assert_eq!(event.event_type, "zigbee.command");
        assert_eq!(event.cmd.as_deref(), Some("toggle"));
        assert_eq!(event.device_uid, Some(U1.parse().unwrap()));
        assert_eq!(event.endpoint, Some(1));
    }
}
