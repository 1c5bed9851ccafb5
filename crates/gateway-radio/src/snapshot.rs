//! Snapshot producer
//!
//! Streams the radio node's full state over the link: BEGIN, one DEVICE
//! frame per device with its ENDPOINT and STATE entries, then END.
//! Before streaming, recent values are refreshed with a bounded burst
//! of attribute reads. Concurrent requests coalesce into one stream.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use gateway_core::cluster::{attr, id};
use gateway_core::sensor::RawValue;
use gateway_core::state::StateValue;
use link_protocol::message::{MsgType, SnapshotRecord, WireValue};
use tokio::sync::Notify;

use crate::runtime::RadioContext;
use crate::scheduler::{Scheduler, SchedulerOp};

/// Sink for outgoing frames; the serial writer in production, a
/// collecting buffer in tests.
pub trait FrameSink: Send + Sync + 'static {
    fn send(&self, msg_type: MsgType, seq: u16, payload: Vec<u8>);
}

/// Per-direction frame sequence allocator (0 reserved).
pub struct SeqAlloc(AtomicU16);

impl Default for SeqAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl SeqAlloc {
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU16::new(1))
    }

    pub fn next(&self) -> u16 {
        loop {
            let seq = self.0.fetch_add(1, Ordering::SeqCst);
            if seq != 0 {
                return seq;
            }
        }
    }
}

/// Attributes refreshed before a snapshot so it carries live values.
const REFRESH_ATTRS: &[(u16, u16)] = &[
    (id::ON_OFF, attr::ON_OFF_STATE),
    (id::LEVEL_CONTROL, attr::LEVEL_CURRENT),
    (id::COLOR_CONTROL, attr::COLOR_CURRENT_X),
    (id::COLOR_CONTROL, attr::COLOR_CURRENT_Y),
    (id::COLOR_CONTROL, attr::COLOR_TEMP_MIREDS),
];

/// The snapshot producer task handle
pub struct SnapshotProducer {
    ctx: RadioContext,
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn FrameSink>,
    seq: Arc<SeqAlloc>,
    requested: AtomicBool,
    notify: Notify,
}

impl SnapshotProducer {
    #[must_use]
    pub fn new(
        ctx: RadioContext,
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn FrameSink>,
        seq: Arc<SeqAlloc>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            scheduler,
            sink,
            seq,
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Ask for a snapshot; overlapping requests coalesce.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Run the streamer loop.
    pub fn spawn(self: &Arc<Self>) {
        let producer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                producer.notify.notified().await;
                while producer.requested.swap(false, Ordering::SeqCst) {
                    producer.refresh_before_snapshot().await;
                    producer.stream_snapshot();
                }
            }
        });
    }

    /// Queue reads for on/off, level, and color attributes, then wait a
    /// bounded window so fresh values land in the stores.
    pub async fn refresh_before_snapshot(&self) {
        let mut request_count: u32 = 0;
        for ep in self.ctx.model.list_all() {
            for &(cluster_id, attr_id) in REFRESH_ATTRS {
                if !ep.record.has_in_cluster(cluster_id) {
                    continue;
                }
                let ok = self
                    .scheduler
                    .schedule_raw(SchedulerOp::ReadAttr {
                        short_addr: ep.short_addr,
                        endpoint: ep.record.endpoint,
                        cluster_id,
                        attr_id,
                    })
                    .is_ok();
                if ok {
                    request_count += 1;
                }
            }
        }

        if request_count > 0 {
            let wait_ms = (200 + 20 * u64::from(request_count)).min(1_500);
            tracing::info!(
                "snapshot refresh queued {} reads, waiting {} ms",
                request_count,
                wait_ms
            );
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
        }
    }

    /// Emit the full snapshot stream.
    pub fn stream_snapshot(&self) {
        let devices = self.ctx.registry.list();
        let total_devices = devices.len() as u16;
        let mut snap_seq: u32 = 0;

        self.send(SnapshotRecord::Begin {
            snap_seq: next(&mut snap_seq),
            total_devices,
        });

        for device in &devices {
            self.stream_device(device.uid, &mut snap_seq);
        }

        self.send(SnapshotRecord::End {
            snap_seq: next(&mut snap_seq),
            total_devices,
        });
        tracing::info!(
            "snapshot sent: devices={} frames={}",
            total_devices,
            snap_seq
        );
    }

    /// Stream DEVICE/ENDPOINT/STATE frames for a single device (also
    /// used as the join delta).
    pub fn stream_device(&self, uid: gateway_core::uid::DeviceUid, snap_seq: &mut u32) {
        let Some(device) = self.ctx.registry.get(uid) else {
            return;
        };

        self.send(SnapshotRecord::Device {
            snap_seq: next(snap_seq),
            device_uid: device.uid.to_string(),
            name: device.name.clone(),
            short_addr: device.short_addr,
            last_seen_ms: device.last_seen_ms,
            has_onoff: device.has_onoff,
            has_button: device.has_button,
        });

        // Endpoints from the live model, falling back to the persisted
        // registry record when discovery has not run yet.
        let model_eps = self.ctx.model.list_endpoints(uid);
        let endpoint_records: Vec<_> = if model_eps.is_empty() {
            device.endpoints.clone()
        } else {
            model_eps.into_iter().map(|e| e.record).collect()
        };
        for record in endpoint_records {
            self.send(SnapshotRecord::Endpoint {
                snap_seq: next(snap_seq),
                device_uid: device.uid.to_string(),
                short_addr: device.short_addr,
                endpoint: record.endpoint,
                profile_id: record.profile_id,
                device_id: record.device_id,
                in_clusters: record.in_clusters.clone(),
                out_clusters: record.out_clusters.clone(),
            });
        }

        // Raw sensor entries are the primary state source.
        for sensor in self.ctx.sensors.list(uid) {
            let value = match sensor.value {
                RawValue::I32(v) => WireValue::I64(i64::from(v)),
                RawValue::U32(v) => WireValue::I64(i64::from(v)),
            };
            self.send(SnapshotRecord::State {
                snap_seq: next(snap_seq),
                device_uid: device.uid.to_string(),
                short_addr: if sensor.short_addr != 0 {
                    sensor.short_addr
                } else {
                    device.short_addr
                },
                endpoint: sensor.endpoint,
                cluster_id: sensor.cluster_id,
                attr_id: sensor.attr_id,
                value,
                ts_ms: sensor.ts_ms,
            });
        }

        // Normalized onoff may exist without a raw sensor entry.
        if let Some(entry) = self.ctx.states.get(uid, "onoff") {
            if let StateValue::Bool(on) = entry.value {
                let endpoint = self.endpoint_with_cluster(uid, id::ON_OFF);
                self.send(SnapshotRecord::State {
                    snap_seq: next(snap_seq),
                    device_uid: device.uid.to_string(),
                    short_addr: device.short_addr,
                    endpoint,
                    cluster_id: id::ON_OFF,
                    attr_id: attr::ON_OFF_STATE,
                    value: WireValue::Bool(on),
                    ts_ms: entry.ts_ms,
                });
            }
        }
    }

    /// REMOVE frame pushed when a device leaves.
    pub fn send_remove(&self, uid: gateway_core::uid::DeviceUid, short_addr: u16) {
        self.send(SnapshotRecord::Remove {
            snap_seq: 0,
            device_uid: uid.to_string(),
            short_addr,
        });
    }

    fn endpoint_with_cluster(&self, uid: gateway_core::uid::DeviceUid, cluster_id: u16) -> u8 {
        let eps = self.ctx.model.list_endpoints(uid);
        eps.iter()
            .find(|e| e.record.has_in_cluster(cluster_id))
            .or_else(|| eps.first())
            .map_or(0, |e| e.record.endpoint)
    }

    fn send(&self, record: SnapshotRecord) {
        self.sink
            .send(MsgType::Snapshot, self.seq.next(), record.encode());
    }
}

fn next(snap_seq: &mut u32) -> u32 {
    let current = *snap_seq;
    *snap_seq += 1;
    current
}
