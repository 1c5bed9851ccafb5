//! ZCL attribute report projection
//!
//! Turns incoming attribute reports and read responses into raw sensor
//! entries, normalized state keys, and `zigbee.attr_report` events.

use crate::cluster::{attr, id};
use crate::event::{EventBus, EventValue, GwEvent};
use crate::registry::DeviceRegistry;
use crate::sensor::{RawValue, SensorStore, SensorValue};
use crate::state::{StateStore, StateValue};
use crate::uid::DeviceUid;

/// One parsed attribute report from the stack
#[derive(Debug, Clone, Copy)]
pub struct AttrReport {
    pub short_addr: u16,
    pub endpoint: u8,
    pub cluster_id: u16,
    pub attr_id: u16,
    pub raw: RawValue,
    pub ts_ms: u64,
}

impl AttrReport {
    fn raw_i64(&self) -> i64 {
        match self.raw {
            RawValue::I32(v) => i64::from(v),
            RawValue::U32(v) => i64::from(v),
        }
    }
}

/// Normalized projection of one report
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub key: String,
    pub value: StateValue,
    pub event_value: EventValue,
}

/// Map a (cluster, attr, raw) triple to its state key and value.
#[must_use]
pub fn normalize(report: &AttrReport) -> Projection {
    let raw = report.raw_i64();
    let (key, value): (String, StateValue) = match (report.cluster_id, report.attr_id) {
        (id::ON_OFF, attr::ON_OFF_STATE) => ("onoff".into(), StateValue::Bool(raw != 0)),
        (id::LEVEL_CONTROL, attr::LEVEL_CURRENT) => {
            ("level".into(), StateValue::U32(raw.max(0) as u32))
        }
        (id::TEMPERATURE_MEASUREMENT, attr::TEMP_MEASURED) => {
            ("temperature_c".into(), StateValue::F32(raw as f32 / 100.0))
        }
        (id::HUMIDITY_MEASUREMENT, attr::HUMIDITY_MEASURED) => {
            ("humidity_pct".into(), StateValue::F32(raw as f32 / 100.0))
        }
        (id::POWER_CONFIG, attr::BATTERY_PCT_REMAINING) => {
            ("battery_pct".into(), StateValue::U32((raw.max(0) / 2) as u32))
        }
        (id::POWER_CONFIG, attr::BATTERY_VOLTAGE) => {
            ("battery_mv".into(), StateValue::U32((raw.max(0) * 100) as u32))
        }
        (id::OCCUPANCY_SENSING, attr::OCCUPANCY_STATE) => {
            ("occupancy".into(), StateValue::Bool(raw & 0x01 != 0))
        }
        (id::ILLUMINANCE_MEASUREMENT, attr::ILLUMINANCE_MEASURED) => {
            ("illuminance_raw".into(), StateValue::U32(raw.max(0) as u32))
        }
        (id::PRESSURE_MEASUREMENT, attr::PRESSURE_MEASURED) => {
            ("pressure_raw".into(), StateValue::F32(raw as f32))
        }
        (id::COLOR_CONTROL, attr::COLOR_CURRENT_X) => {
            ("color_x".into(), StateValue::U32(raw.max(0) as u32))
        }
        (id::COLOR_CONTROL, attr::COLOR_CURRENT_Y) => {
            ("color_y".into(), StateValue::U32(raw.max(0) as u32))
        }
        (id::COLOR_CONTROL, attr::COLOR_TEMP_MIREDS) => {
            ("color_temp_mireds".into(), StateValue::U32(raw.max(0) as u32))
        }
        (cluster, attribute) => (
            format!("cluster_{cluster:04x}_attr_{attribute:04x}"),
            StateValue::U32(raw as u32),
        ),
    };

    let event_value = match value {
        StateValue::Bool(b) => EventValue::Bool(b),
        StateValue::F32(f) => EventValue::F64(f64::from(f)),
        StateValue::U32(v) => EventValue::F64(f64::from(v)),
        StateValue::U64(v) => EventValue::F64(v as f64),
    };

    Projection {
        key,
        value,
        event_value,
    }
}

/// Apply one report: sensor store, state store, last-seen, event bus.
///
/// The caller has already resolved the device UID from the short
/// address (and kicked off discovery when it could not).
pub fn project_attr_report(
    uid: DeviceUid,
    report: &AttrReport,
    registry: &DeviceRegistry,
    sensors: &SensorStore,
    states: &StateStore,
    bus: &EventBus,
) {
    if let Err(e) = sensors.upsert(SensorValue {
        uid,
        short_addr: report.short_addr,
        endpoint: report.endpoint,
        cluster_id: report.cluster_id,
        attr_id: report.attr_id,
        value: report.raw,
        ts_ms: report.ts_ms,
    }) {
        tracing::warn!(uid = %uid, "sensor store rejected reading: {}", e);
    }

    let projection = normalize(report);
    if let Err(e) = states.set(uid, &projection.key, projection.value, report.ts_ms) {
        tracing::warn!(uid = %uid, key = %projection.key, "state store rejected: {}", e);
    }

    registry.touch(uid, report.short_addr, report.ts_ms);
    let _ = states.set_u64(uid, "last_seen_ms", report.ts_ms, report.ts_ms);

    let mut event = GwEvent::new("zigbee.attr_report", "zigbee")
        .with_device(uid, report.short_addr)
        .with_endpoint(report.endpoint)
        .with_cluster_attr(report.cluster_id, report.attr_id)
        .with_value(projection.event_value)
        .with_msg(projection.key.clone());
    event.ts_ms = report.ts_ms;
    bus.publish(event);
}
