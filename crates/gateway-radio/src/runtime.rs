//! Stack event ingest
//!
//! Consumes incoming traffic from the stack seam and drives the device
//! model: announcements create registry entries and kick discovery,
//! descriptors provision endpoints, reports project into the stores,
//! commands and membership changes become bus events.

use std::sync::Arc;

use gateway_core::device::DeviceRecord;
use gateway_core::event::{now_ms, EventBus, GwEvent};
use gateway_core::model::ZigbeeModel;
use gateway_core::projection;
use gateway_core::registry::DeviceRegistry;
use gateway_core::sensor::SensorStore;
use gateway_core::state::StateStore;
use gateway_core::uid::DeviceUid;
use tokio::sync::mpsc;

use crate::provision::provision_endpoint;
use crate::radio::StackEvent;
use crate::scheduler::{Scheduler, SchedulerOp};

/// Shared stores of the radio node
#[derive(Clone)]
pub struct RadioContext {
    pub registry: Arc<DeviceRegistry>,
    pub model: Arc<ZigbeeModel>,
    pub states: Arc<StateStore>,
    pub sensors: Arc<SensorStore>,
    pub bus: Arc<EventBus>,
}

impl RadioContext {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            model: Arc::new(ZigbeeModel::new()),
            states: Arc::new(StateStore::new()),
            sensors: Arc::new(SensorStore::new()),
            bus,
        }
    }

    /// Resolve a device identity from its volatile short address.
    #[must_use]
    pub fn uid_by_short(&self, short_addr: u16) -> Option<DeviceUid> {
        self.model
            .find_uid_by_short(short_addr)
            .or_else(|| self.registry.find_by_short(short_addr).map(|d| d.uid))
    }
}

/// Spawn the ingest loop over the stack event channel.
pub fn spawn_ingest(
    ctx: RadioContext,
    scheduler: Arc<Scheduler>,
    mut rx: mpsc::Receiver<StackEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_stack_event(&ctx, &scheduler, event);
        }
        tracing::info!("stack event channel closed, ingest stopping");
    });
}

/// Apply one stack event to the device model.
pub fn handle_stack_event(ctx: &RadioContext, scheduler: &Arc<Scheduler>, event: StackEvent) {
    match event {
        StackEvent::DeviceAnnounced {
            uid,
            short_addr,
            capability,
        } => {
            tracing::info!(
                "device announced: {} short={:#06x} cap={:#04x}",
                uid,
                short_addr,
                capability
            );
            let mut device = ctx
                .registry
                .get(uid)
                .unwrap_or_else(|| DeviceRecord::new(uid, short_addr));
            device.short_addr = short_addr;
            device.last_seen_ms = now_ms();
            if let Err(e) = ctx.registry.upsert(device) {
                tracing::warn!(uid = %uid, "registry rejected announce: {}", e);
                return;
            }
            ctx.bus.publish(
                GwEvent::new("device.join", "zigbee")
                    .with_device(uid, short_addr)
                    .with_msg("announced"),
            );
            let _ = scheduler.schedule_raw(SchedulerOp::ActiveEpRequest { short_addr });
        }

        StackEvent::IeeeResolved { uid, short_addr } => {
            let mut device = ctx
                .registry
                .get(uid)
                .unwrap_or_else(|| DeviceRecord::new(uid, short_addr));
            device.short_addr = short_addr;
            device.last_seen_ms = now_ms();
            let _ = ctx.registry.upsert(device);
            ctx.bus.publish(
                GwEvent::new("zigbee_ieee_lookup_ok", "zigbee")
                    .with_device(uid, short_addr)
                    .with_msg("ieee resolved, starting discovery"),
            );
            let _ = scheduler.schedule_raw(SchedulerOp::ActiveEpRequest { short_addr });
        }

        StackEvent::ActiveEndpoints {
            short_addr,
            endpoints,
        } => {
            tracing::info!("active endpoints for {:#06x}: {:?}", short_addr, endpoints);
            for endpoint in endpoints {
                let _ = scheduler.schedule_raw(SchedulerOp::SimpleDescRequest {
                    short_addr,
                    endpoint,
                });
            }
        }

        StackEvent::SimpleDescriptor { short_addr, record } => {
            let Some(uid) = ctx.uid_by_short(short_addr) else {
                tracing::warn!(
                    "simple descriptor from unknown short {:#06x}, discovering",
                    short_addr
                );
                let _ = scheduler.discover_by_short(short_addr);
                return;
            };
            provision_endpoint(scheduler, ctx, uid, short_addr, &record);
        }

        StackEvent::AttrReport(report) => {
            let Some(uid) = ctx.uid_by_short(report.short_addr) else {
                // Unknown sender; resolve it (throttled) and drop the report.
                let _ = scheduler.discover_by_short(report.short_addr);
                return;
            };
            projection::project_attr_report(
                uid,
                &report,
                &ctx.registry,
                &ctx.sensors,
                &ctx.states,
                &ctx.bus,
            );
        }

        StackEvent::CommandReceived {
            short_addr,
            endpoint,
            cluster_id,
            cmd,
        } => {
            let Some(uid) = ctx.uid_by_short(short_addr) else {
                let _ = scheduler.discover_by_short(short_addr);
                return;
            };
            let ts = now_ms();
            ctx.registry.touch(uid, short_addr, ts);
            let _ = ctx.states.set_u64(uid, "last_seen_ms", ts, ts);
            ctx.bus.publish(
                GwEvent::new("zigbee.command", "zigbee")
                    .with_device(uid, short_addr)
                    .with_endpoint(endpoint)
                    .with_cmd(cmd)
                    .with_cluster_attr(cluster_id, 0),
            );
        }

        StackEvent::DeviceLeft { uid, short_addr } => {
            tracing::info!("device left: {}", uid);
            ctx.registry.remove(uid);
            ctx.model.remove_device(uid);
            ctx.states.remove_device(uid);
            ctx.sensors.remove_device(uid);
            ctx.bus.publish(
                GwEvent::new("device.leave", "zigbee")
                    .with_device(uid, short_addr)
                    .with_msg("left network"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::LoopbackRadio;

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn test_announce_discovers_and_provisions() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new());
        let ctx = RadioContext::new(registry.clone(), bus.clone());

        let (stack_tx, stack_rx) = mpsc::channel(64);
        let radio = LoopbackRadio::new(stack_tx.clone());
        let scheduler = Scheduler::start(radio, registry.clone(), bus.clone());
        spawn_ingest(ctx.clone(), scheduler.clone(), stack_rx);

        let uid = DeviceUid::new(0x0012_4B00_0000_0042);
        stack_tx
            .send(StackEvent::DeviceAnnounced {
                uid,
                short_addr: 0x2001,
                capability: 0x04,
            })
            .await
            .unwrap();
        settle().await;

        // The loopback walks announce -> active endpoints -> simple
        // descriptor; provisioning classifies the On/Off server and the
        // initial read projects an `onoff` state.
        let device = registry.get(uid).expect("device registered");
        assert!(device.has_onoff);
        // named at announce time, before capabilities are known
        assert_eq!(device.name, "device1");
        assert_eq!(device.endpoints.len(), 1);
        assert_eq!(ctx.model.list_endpoints(uid).len(), 1);
        assert!(ctx.states.get(uid, "onoff").is_some());
    }

    #[tokio::test]
    async fn test_report_from_unknown_short_triggers_discovery() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new());
        let ctx = RadioContext::new(registry.clone(), bus.clone());

        let (stack_tx, stack_rx) = mpsc::channel(64);
        let radio = LoopbackRadio::new(stack_tx.clone());
        let scheduler = Scheduler::start(radio, registry.clone(), bus.clone());
        spawn_ingest(ctx.clone(), scheduler.clone(), stack_rx);

        stack_tx
            .send(StackEvent::AttrReport(gateway_core::projection::AttrReport {
                short_addr: 0x3001,
                endpoint: 1,
                cluster_id: 0x0006,
                attr_id: 0,
                raw: gateway_core::sensor::RawValue::I32(1),
                ts_ms: 1,
            }))
            .await
            .unwrap();
        settle().await;

        // Discovery resolved a synthetic identity for the short address.
        let uid = DeviceUid::new(0x0012_4B00_0000_3001);
        assert!(registry.get(uid).is_some());
    }

    #[tokio::test]
    async fn test_device_leave_cleans_stores() {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new());
        let ctx = RadioContext::new(registry.clone(), bus.clone());

        let (stack_tx, stack_rx) = mpsc::channel(64);
        let radio = LoopbackRadio::new(stack_tx.clone());
        let scheduler = Scheduler::start(radio, registry.clone(), bus.clone());
        spawn_ingest(ctx.clone(), scheduler.clone(), stack_rx);

        let uid = DeviceUid::new(0x0012_4B00_0000_0099);
        stack_tx
            .send(StackEvent::DeviceAnnounced {
                uid,
                short_addr: 0x2002,
                capability: 0,
            })
            .await
            .unwrap();
        settle().await;
        assert!(registry.get(uid).is_some());

        let mut rx = bus.subscribe();
        stack_tx
            .send(StackEvent::DeviceLeft {
                uid,
                short_addr: 0x2002,
            })
            .await
            .unwrap();
        settle().await;

        assert!(registry.get(uid).is_none());
        assert!(ctx.model.list_endpoints(uid).is_empty());
        assert!(ctx.states.get(uid, "onoff").is_none());
        let mut saw_leave = false;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == "device.leave" {
                saw_leave = true;
            }
        }
        assert!(saw_leave);
    }
}
