//! Endpoint auto-provisioning
//!
//! When a Simple Descriptor arrives, the endpoint is classified and the
//! gateway sets itself up to hear from it: attribute reporting is
//! configured with conservative intervals, sensor clusters are bound to
//! the gateway endpoint, actuators and controllers join their fixed
//! type group, and an initial read primes the stores.

use std::sync::Arc;

use gateway_core::classify::{self, EndpointKind};
use gateway_core::cluster::{attr, group, id};
use gateway_core::device::{DeviceRecord, EndpointRecord};
use gateway_core::event::{now_ms, GwEvent};
use gateway_core::model::ModelEndpoint;
use gateway_core::uid::DeviceUid;

use crate::runtime::RadioContext;
use crate::scheduler::{Scheduler, SchedulerOp};

/// One row of the reporting configuration table
struct ReportSpec {
    cluster_id: u16,
    attr_id: u16,
    min_interval_s: u16,
    max_interval_s: u16,
    /// Reportable change in raw ZCL units; 0 for discrete types.
    change: u16,
}

/// Conservative reporting intervals per gateway-relevant attribute.
const REPORT_TABLE: &[ReportSpec] = &[
    ReportSpec {
        cluster_id: id::ON_OFF,
        attr_id: attr::ON_OFF_STATE,
        min_interval_s: 0,
        max_interval_s: 300,
        change: 0,
    },
    ReportSpec {
        cluster_id: id::TEMPERATURE_MEASUREMENT,
        attr_id: attr::TEMP_MEASURED,
        min_interval_s: 5,
        max_interval_s: 60,
        change: 10, // 0.10 degC in raw units
    },
    ReportSpec {
        cluster_id: id::HUMIDITY_MEASUREMENT,
        attr_id: attr::HUMIDITY_MEASURED,
        min_interval_s: 5,
        max_interval_s: 60,
        change: 100, // 1.00 %
    },
    ReportSpec {
        cluster_id: id::POWER_CONFIG,
        attr_id: attr::BATTERY_PCT_REMAINING,
        min_interval_s: 300,
        max_interval_s: 3600,
        change: 2, // 1 % (battery is half-percent units)
    },
    ReportSpec {
        cluster_id: id::LEVEL_CONTROL,
        attr_id: attr::LEVEL_CURRENT,
        min_interval_s: 1,
        max_interval_s: 60,
        change: 1,
    },
    ReportSpec {
        cluster_id: id::COLOR_CONTROL,
        attr_id: attr::COLOR_CURRENT_X,
        min_interval_s: 1,
        max_interval_s: 60,
        change: 16,
    },
    ReportSpec {
        cluster_id: id::COLOR_CONTROL,
        attr_id: attr::COLOR_CURRENT_Y,
        min_interval_s: 1,
        max_interval_s: 60,
        change: 16,
    },
    ReportSpec {
        cluster_id: id::COLOR_CONTROL,
        attr_id: attr::COLOR_TEMP_MIREDS,
        min_interval_s: 1,
        max_interval_s: 60,
        change: 10,
    },
];

/// Sensor-style server clusters bound to the gateway endpoint.
const SENSOR_CLUSTERS: &[u16] = &[
    id::POWER_CONFIG,
    id::ILLUMINANCE_MEASUREMENT,
    id::TEMPERATURE_MEASUREMENT,
    id::PRESSURE_MEASUREMENT,
    id::FLOW_MEASUREMENT,
    id::HUMIDITY_MEASUREMENT,
    id::OCCUPANCY_SENSING,
];

/// Apply the full provisioning flow for one discovered endpoint.
pub fn provision_endpoint(
    scheduler: &Arc<Scheduler>,
    ctx: &RadioContext,
    uid: DeviceUid,
    short_addr: u16,
    record: &EndpointRecord,
) {
    ctx.model.upsert_endpoint(ModelEndpoint {
        uid,
        short_addr,
        record: record.clone(),
    });

    let kind = classify::classify(record);

    // Fold the endpoint into the registry record; a fresh device gets
    // its default name from the capability bits set here.
    let mut device = ctx
        .registry
        .get(uid)
        .unwrap_or_else(|| DeviceRecord::new(uid, short_addr));
    device.short_addr = short_addr;
    device.last_seen_ms = now_ms();
    device.has_onoff |= record.has_in_cluster(id::ON_OFF);
    device.has_button |= record.has_out_cluster(id::ON_OFF);
    device.upsert_endpoint(record.clone());
    if let Err(e) = ctx.registry.upsert(device) {
        tracing::warn!(uid = %uid, "registry rejected discovered device: {}", e);
    }

    ctx.bus.publish(
        GwEvent::new("zigbee_endpoint", "zigbee")
            .with_device(uid, short_addr)
            .with_endpoint(record.endpoint)
            .with_msg(kind.as_str()),
    );

    // Reporting configuration plus an initial read for every
    // gateway-relevant attribute the endpoint serves.
    for spec in REPORT_TABLE {
        if !record.has_in_cluster(spec.cluster_id) {
            continue;
        }
        let _ = scheduler.schedule_raw(SchedulerOp::ConfigureReport {
            short_addr,
            endpoint: record.endpoint,
            cluster_id: spec.cluster_id,
            attr_id: spec.attr_id,
            min_interval_s: spec.min_interval_s,
            max_interval_s: spec.max_interval_s,
            reportable_change: spec.change,
        });
        let _ = scheduler.schedule_raw(SchedulerOp::ReadAttr {
            short_addr,
            endpoint: record.endpoint,
            cluster_id: spec.cluster_id,
            attr_id: spec.attr_id,
        });
    }

    // Bind sensor clusters back to the gateway so reports reach us.
    for &cluster_id in SENSOR_CLUSTERS {
        if record.has_in_cluster(cluster_id) {
            let _ = scheduler.schedule_raw(SchedulerOp::BindToGateway {
                uid,
                endpoint: record.endpoint,
                cluster_id,
            });
        }
    }

    // Fixed type groups for controllers and actuators.
    if record.has_in_cluster(id::GROUPS) {
        let group_id = match kind {
            EndpointKind::Switch | EndpointKind::DimmerSwitch => Some(group::SWITCHES),
            EndpointKind::ColorLight | EndpointKind::DimmableLight | EndpointKind::Relay => {
                Some(group::LIGHTS)
            }
            _ => None,
        };
        if let Some(group_id) = group_id {
            let _ = scheduler.schedule_raw(SchedulerOp::AddGroup {
                short_addr,
                endpoint: record.endpoint,
                group_id,
            });
        }
    }
}
