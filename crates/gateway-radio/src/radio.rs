//! Vendor Zigbee stack seam
//!
//! The real stack is an external collaborator; the gateway talks to it
//! only through [`RadioStack`] (outgoing calls, made exclusively from
//! the scheduler's worker task) and [`StackEvent`] (incoming traffic).

use gateway_core::cluster::OnOffCommand;
use gateway_core::device::EndpointRecord;
use gateway_core::error::GatewayError;
use gateway_core::projection::AttrReport;
use gateway_core::sensor::RawValue;
use gateway_core::uid::DeviceUid;
use tokio::sync::mpsc;

/// Addressing for outgoing ZCL commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioAddr {
    Device { short_addr: u16, endpoint: u8 },
    Group(u16),
}

/// Incoming traffic from the stack
#[derive(Debug, Clone)]
pub enum StackEvent {
    /// Device announced itself (join or rejoin)
    DeviceAnnounced {
        uid: DeviceUid,
        short_addr: u16,
        capability: u8,
    },
    /// Device left the network
    DeviceLeft { uid: DeviceUid, short_addr: u16 },
    /// ZCL attribute report or read response
    AttrReport(AttrReport),
    /// Cluster-specific command received from a device (button press)
    CommandReceived {
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        cmd: String,
    },
    /// ZDO Active Endpoints response
    ActiveEndpoints { short_addr: u16, endpoints: Vec<u8> },
    /// ZDO Simple Descriptor response
    SimpleDescriptor {
        short_addr: u16,
        record: EndpointRecord,
    },
    /// IEEE address resolved for a short address
    IeeeResolved { uid: DeviceUid, short_addr: u16 },
}

/// Outgoing calls into the vendor stack
///
/// Implementations are not thread-safe; every call happens on the
/// scheduler's worker task and nowhere else.
pub trait RadioStack: Send + 'static {
    /// IEEE identity of the gateway itself (bind destination).
    fn local_uid(&self) -> DeviceUid;
    /// Endpoint the gateway exposes for bindings and reports.
    fn local_endpoint(&self) -> u8;

    fn permit_join(&mut self, seconds: u8) -> Result<(), GatewayError>;
    fn send_onoff(&mut self, addr: RadioAddr, cmd: OnOffCommand) -> Result<(), GatewayError>;
    fn send_move_to_level(
        &mut self,
        addr: RadioAddr,
        level: u8,
        transition_ds: u16,
    ) -> Result<(), GatewayError>;
    fn send_move_to_color_xy(
        &mut self,
        addr: RadioAddr,
        x: u16,
        y: u16,
        transition_ds: u16,
    ) -> Result<(), GatewayError>;
    fn send_move_to_color_temp(
        &mut self,
        addr: RadioAddr,
        mireds: u16,
        transition_ds: u16,
    ) -> Result<(), GatewayError>;
    fn scene_store(&mut self, group_id: u16, scene_id: u8) -> Result<(), GatewayError>;
    fn scene_recall(&mut self, group_id: u16, scene_id: u8) -> Result<(), GatewayError>;
    fn read_attr(
        &mut self,
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
    ) -> Result<(), GatewayError>;
    #[allow(clippy::too_many_arguments)]
    fn configure_reporting(
        &mut self,
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
        min_interval_s: u16,
        max_interval_s: u16,
        reportable_change: u16,
    ) -> Result<(), GatewayError>;
    fn bind(
        &mut self,
        src_uid: DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst_uid: DeviceUid,
        dst_endpoint: u8,
        unbind: bool,
    ) -> Result<(), GatewayError>;
    fn add_group(
        &mut self,
        short_addr: u16,
        endpoint: u8,
        group_id: u16,
    ) -> Result<(), GatewayError>;
    fn mgmt_leave(
        &mut self,
        uid: DeviceUid,
        short_addr: u16,
        rejoin: bool,
    ) -> Result<(), GatewayError>;
    fn ieee_addr_req(&mut self, short_addr: u16) -> Result<(), GatewayError>;
    fn active_ep_req(&mut self, short_addr: u16) -> Result<(), GatewayError>;
    fn simple_desc_req(&mut self, short_addr: u16, endpoint: u8) -> Result<(), GatewayError>;
}

/// Stack stand-in for development and the end-to-end pipeline tests
///
/// Logs every outgoing call and synthesizes the responses a real stack
/// would deliver, so the full command/discovery/projection path can run
/// without radio hardware.
pub struct LoopbackRadio {
    uid: DeviceUid,
    events: mpsc::Sender<StackEvent>,
}

impl LoopbackRadio {
    #[must_use]
    pub fn new(events: mpsc::Sender<StackEvent>) -> Self {
        Self {
            uid: DeviceUid::new(0x0012_4B00_0000_0001),
            events,
        }
    }

    fn emit(&self, event: StackEvent) {
        if self.events.try_send(event).is_err() {
            tracing::warn!("loopback event channel full, event dropped");
        }
    }
}

impl RadioStack for LoopbackRadio {
    fn local_uid(&self) -> DeviceUid {
        self.uid
    }

    fn local_endpoint(&self) -> u8 {
        1
    }

    fn permit_join(&mut self, seconds: u8) -> Result<(), GatewayError> {
        tracing::info!("loopback: permit_join {}s", seconds);
        Ok(())
    }

    fn send_onoff(&mut self, addr: RadioAddr, cmd: OnOffCommand) -> Result<(), GatewayError> {
        tracing::info!("loopback: onoff {:?} -> {:?}", cmd, addr);
        Ok(())
    }

    fn send_move_to_level(
        &mut self,
        addr: RadioAddr,
        level: u8,
        transition_ds: u16,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: move_to_level {} ds={} -> {:?}",
            level,
            transition_ds,
            addr
        );
        Ok(())
    }

    fn send_move_to_color_xy(
        &mut self,
        addr: RadioAddr,
        x: u16,
        y: u16,
        transition_ds: u16,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: move_to_color_xy ({}, {}) ds={} -> {:?}",
            x,
            y,
            transition_ds,
            addr
        );
        Ok(())
    }

    fn send_move_to_color_temp(
        &mut self,
        addr: RadioAddr,
        mireds: u16,
        transition_ds: u16,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: move_to_color_temp {} ds={} -> {:?}",
            mireds,
            transition_ds,
            addr
        );
        Ok(())
    }

    fn scene_store(&mut self, group_id: u16, scene_id: u8) -> Result<(), GatewayError> {
        tracing::info!("loopback: scene_store group={:#06x} scene={}", group_id, scene_id);
        Ok(())
    }

    fn scene_recall(&mut self, group_id: u16, scene_id: u8) -> Result<(), GatewayError> {
        tracing::info!("loopback: scene_recall group={:#06x} scene={}", group_id, scene_id);
        Ok(())
    }

    fn read_attr(
        &mut self,
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: read_attr {:#06x}:{} cluster={:#06x} attr={:#06x}",
            short_addr,
            endpoint,
            cluster_id,
            attr_id
        );
        // Answer with a canned reading so projection has something to chew on.
        self.emit(StackEvent::AttrReport(AttrReport {
            short_addr,
            endpoint,
            cluster_id,
            attr_id,
            raw: RawValue::I32(1),
            ts_ms: gateway_core::event::now_ms(),
        }));
        Ok(())
    }

    fn configure_reporting(
        &mut self,
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
        min_interval_s: u16,
        max_interval_s: u16,
        reportable_change: u16,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: config_report {:#06x}:{} cluster={:#06x} attr={:#06x} min={} max={} change={}",
            short_addr,
            endpoint,
            cluster_id,
            attr_id,
            min_interval_s,
            max_interval_s,
            reportable_change
        );
        Ok(())
    }

    fn bind(
        &mut self,
        src_uid: DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst_uid: DeviceUid,
        dst_endpoint: u8,
        unbind: bool,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: {} {}:{} cluster={:#06x} -> {}:{}",
            if unbind { "unbind" } else { "bind" },
            src_uid,
            src_endpoint,
            cluster_id,
            dst_uid,
            dst_endpoint
        );
        Ok(())
    }

    fn add_group(
        &mut self,
        short_addr: u16,
        endpoint: u8,
        group_id: u16,
    ) -> Result<(), GatewayError> {
        tracing::info!(
            "loopback: add_group {:#06x}:{} group={:#06x}",
            short_addr,
            endpoint,
            group_id
        );
        Ok(())
    }

    fn mgmt_leave(
        &mut self,
        uid: DeviceUid,
        short_addr: u16,
        rejoin: bool,
    ) -> Result<(), GatewayError> {
        tracing::info!("loopback: mgmt_leave {} rejoin={}", uid, rejoin);
        self.emit(StackEvent::DeviceLeft { uid, short_addr });
        Ok(())
    }

    fn ieee_addr_req(&mut self, short_addr: u16) -> Result<(), GatewayError> {
        // A real stack resolves over the air; synthesize an identity
        // derived from the short address.
        self.emit(StackEvent::IeeeResolved {
            uid: DeviceUid::new(0x0012_4B00_0000_0000 | u64::from(short_addr)),
            short_addr,
        });
        Ok(())
    }

    fn active_ep_req(&mut self, short_addr: u16) -> Result<(), GatewayError> {
        self.emit(StackEvent::ActiveEndpoints {
            short_addr,
            endpoints: vec![1],
        });
        Ok(())
    }

    fn simple_desc_req(&mut self, short_addr: u16, endpoint: u8) -> Result<(), GatewayError> {
        let mut record = EndpointRecord::new(endpoint, 0x0104, 0x0100);
        record.push_in_cluster(gateway_core::cluster::id::BASIC);
        record.push_in_cluster(gateway_core::cluster::id::ON_OFF);
        record.push_in_cluster(gateway_core::cluster::id::GROUPS);
        self.emit(StackEvent::SimpleDescriptor { short_addr, record });
        Ok(())
    }
}
