//! In-process event bus
//!
//! Typed publish/subscribe shared by every subsystem. The bus assigns
//! monotonically increasing event ids and stamps each event with the
//! monotonic clock. Subscribers get a bounded broadcast receiver;
//! slow consumers observe lag, never block publishers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::uid::DeviceUid;

/// Bounded depth of each subscriber's queue.
pub const EVENT_BUS_DEPTH: usize = 64;

/// Monotonic milliseconds since process start.
#[must_use]
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Tagged scalar carried by an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    None,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
}

impl EventValue {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// One normalized gateway event
#[derive(Debug, Clone, PartialEq)]
pub struct GwEvent {
    /// Monotonic id assigned by the bus (0 until published)
    pub id: u32,
    /// Monotonic ms since boot, stamped by the bus
    pub ts_ms: u64,
    /// Event type, e.g. `zigbee.attr_report`
    pub event_type: String,
    /// Originating subsystem, e.g. `zigbee`, `rules`
    pub source: String,
    pub device_uid: Option<DeviceUid>,
    pub short_addr: u16,
    pub endpoint: Option<u8>,
    pub cmd: Option<String>,
    pub cluster_id: Option<u16>,
    pub attr_id: Option<u16>,
    pub value: EventValue,
    /// Short human-readable message
    pub msg: String,
}

impl GwEvent {
    #[must_use]
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: 0,
            ts_ms: 0,
            event_type: event_type.into(),
            source: source.into(),
            device_uid: None,
            short_addr: 0,
            endpoint: None,
            cmd: None,
            cluster_id: None,
            attr_id: None,
            value: EventValue::None,
            msg: String::new(),
        }
    }

    #[must_use]
    pub fn with_device(mut self, uid: DeviceUid, short_addr: u16) -> Self {
        self.device_uid = Some(uid);
        self.short_addr = short_addr;
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: u8) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn with_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = Some(cmd.into());
        self
    }

    #[must_use]
    pub fn with_cluster_attr(mut self, cluster_id: u16, attr_id: u16) -> Self {
        self.cluster_id = Some(cluster_id);
        self.attr_id = Some(attr_id);
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: EventValue) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }
}

/// Process-wide event bus
pub struct EventBus {
    tx: broadcast::Sender<GwEvent>,
    next_id: AtomicU32,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_DEPTH);
        Self {
            tx,
            next_id: AtomicU32::new(1),
        }
    }

    /// Publish an event; assigns its id and timestamp. Returns the id.
    pub fn publish(&self, mut event: GwEvent) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        event.id = id;
        if event.ts_ms == 0 {
            event.ts_ms = now_ms();
        }
        tracing::trace!(event_type = %event.event_type, id, "event published");
        let _ = self.tx.send(event);
        id
    }

    /// Id of the most recently published event.
    #[must_use]
    pub fn last_id(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GwEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_monotonic() {
        let bus = EventBus::new();
        let _keep = bus.subscribe();
        let a = bus.publish(GwEvent::new("zigbee.command", "zigbee"));
        let b = bus.publish(GwEvent::new("zigbee.command", "zigbee"));
        assert!(b > a);
        assert_eq!(bus.last_id(), b);
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let uid = DeviceUid::new(0x1234);
        bus.publish(
            GwEvent::new("device.join", "zigbee")
                .with_device(uid, 0x22)
                .with_msg("joined"),
        );
        let evt = rx.recv().await.unwrap();
        assert_eq!(evt.event_type, "device.join");
        assert_eq!(evt.device_uid, Some(uid));
        assert!(evt.id > 0);
    }
}
