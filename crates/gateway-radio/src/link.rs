//! Radio side of the serial link
//!
//! Three tasks: an RX parser dispatching incoming frames, a TX pump
//! draining a bounded event queue, and the snapshot streamer. Command
//! requests are validated, forwarded into the scheduler, and answered
//! with a status-mapped `CMD_RSP`.

use std::sync::Arc;
use std::time::Duration;

use gateway_core::cluster::OnOffCommand;
use gateway_core::error::{ErrorKind, GatewayError};
use gateway_core::event::{EventValue, GwEvent};
use gateway_core::uid::DeviceUid;
use link_protocol::codec::{Decoded, FrameDecoder};
use link_protocol::frame::Frame;
use link_protocol::message::{
    CmdId, CmdRequest, CmdResponse, EventKind, EventRecord, MsgType, Status, WireValue,
};
use automation_engine::executor::{Target, ZigbeeCommand};
use serial2::SerialPort;
use tokio::sync::mpsc;

use crate::runtime::RadioContext;
use crate::scheduler::Scheduler;
use crate::snapshot::{FrameSink, SeqAlloc, SnapshotProducer};

/// Bounded TX queue; overflow drops the frame with a warning.
pub const EVT_TX_QUEUE: usize = 24;

/// Frame sink backed by the serial writer task
pub struct SerialSink {
    write_tx: mpsc::Sender<Vec<u8>>,
}

impl FrameSink for SerialSink {
    fn send(&self, msg_type: MsgType, seq: u16, payload: Vec<u8>) {
        let frame = Frame::new(msg_type, seq, payload);
        match frame.encode() {
            Ok(bytes) => {
                if self.write_tx.try_send(bytes).is_err() {
                    tracing::warn!("link TX queue full, {:?} seq={} dropped", msg_type, seq);
                }
            }
            Err(e) => tracing::warn!("frame encode failed: {}", e),
        }
    }
}

/// Map the internal error taxonomy to wire status codes.
#[must_use]
pub fn status_of(kind: ErrorKind) -> Status {
    match kind {
        ErrorKind::InvalidArgs => Status::InvalidArgs,
        ErrorKind::NotReady => Status::NotReady,
        ErrorKind::NotFound => Status::NotFound,
        ErrorKind::Unsupported => Status::Unsupported,
        ErrorKind::Timeout => Status::Timeout,
        ErrorKind::Busy => Status::Busy,
        ErrorKind::NoMem => Status::NoMem,
        ErrorKind::CrcError => Status::CrcError,
        ErrorKind::FormatError => Status::FormatError,
        ErrorKind::Internal => Status::Internal,
    }
}

/// Only Zigbee traffic and membership changes cross the link.
#[must_use]
pub fn is_forwardable(event_type: &str) -> bool {
    event_type.starts_with("zigbee.")
        || event_type.starts_with("zigbee_")
        || event_type == "device.join"
        || event_type == "device.leave"
}

/// Convert a bus event into its wire record.
#[must_use]
pub fn event_to_record(event: &GwEvent) -> EventRecord {
    let kind = if event.event_type == "zigbee.attr_report" {
        EventKind::AttrReport
    } else if event.event_type == "zigbee.command" {
        EventKind::Command
    } else if event.event_type.contains("join") {
        EventKind::DeviceJoin
    } else if event.event_type.contains("leave") {
        EventKind::DeviceLeave
    } else {
        EventKind::NetState
    };

    let (value, value_text) = match &event.value {
        EventValue::None => (WireValue::None, String::new()),
        EventValue::Bool(b) => (WireValue::Bool(*b), String::new()),
        EventValue::I64(v) => (WireValue::I64(*v), String::new()),
        EventValue::F64(v) => (WireValue::F32(*v as f32), String::new()),
        EventValue::Text(t) => (WireValue::Text, t.clone()),
    };

    EventRecord {
        event_id: event.id,
        ts_ms: event.ts_ms,
        kind,
        event_type: event.event_type.clone(),
        cmd: event.cmd.clone().unwrap_or_default(),
        device_uid: event.device_uid.map(|u| u.to_string()).unwrap_or_default(),
        short_addr: event.short_addr,
        endpoint: event.endpoint.unwrap_or(0),
        cluster_id: event.cluster_id.unwrap_or(0),
        attr_id: event.attr_id.unwrap_or(0),
        value,
        value_text,
    }
}

fn parse_req_uid(raw: &str) -> Result<DeviceUid, GatewayError> {
    if raw.is_empty() {
        return Err(GatewayError::invalid_args("missing device_uid"));
    }
    raw.parse()
        .map_err(|_| GatewayError::invalid_args("bad device_uid"))
}

fn onoff_of(param: u32) -> Result<OnOffCommand, GatewayError> {
    OnOffCommand::from_u8(param as u8)
        .filter(|_| param <= 2)
        .ok_or_else(|| GatewayError::invalid_args("bad onoff cmd"))
}

/// Execute one command request against the scheduler.
pub fn exec_cmd(
    scheduler: &Scheduler,
    ctx: &RadioContext,
    req: &CmdRequest,
) -> Result<(), GatewayError> {
    match req.cmd {
        CmdId::PermitJoin => {
            if req.param0 > 255 {
                return Err(GatewayError::invalid_args("bad window"));
            }
            scheduler.permit_join(req.param0 as u8)
        }
        CmdId::OnOff => {
            let uid = parse_req_uid(&req.device_uid)?;
            scheduler.onoff_cmd(uid, req.endpoint, onoff_of(req.param0)?)
        }
        CmdId::LevelMoveToLevel => {
            let uid = parse_req_uid(&req.device_uid)?;
            if req.param0 > 254 {
                return Err(GatewayError::invalid_args("bad level"));
            }
            scheduler.level_move_to_level(uid, req.endpoint, req.param0 as u8, req.param1)
        }
        CmdId::ColorMoveToXy => {
            let uid = parse_req_uid(&req.device_uid)?;
            if req.param0 > 65_535 || req.param1 > 65_535 {
                return Err(GatewayError::invalid_args("bad color xy"));
            }
            scheduler.color_move_to_xy(
                uid,
                req.endpoint,
                req.param0 as u16,
                req.param1 as u16,
                req.param2,
            )
        }
        CmdId::ColorMoveToTemp => {
            let uid = parse_req_uid(&req.device_uid)?;
            if req.param0 > 65_535 {
                return Err(GatewayError::invalid_args("bad mireds"));
            }
            scheduler.color_move_to_temp(uid, req.endpoint, req.param0 as u16, req.param1)
        }
        CmdId::GroupOnOff => scheduler.schedule_group_action(
            req.group_id,
            ZigbeeCommand::OnOff {
                target: Target::Group(req.group_id),
                cmd: onoff_of(req.param0)?,
            },
        ),
        CmdId::GroupLevel => {
            if req.param0 > 254 {
                return Err(GatewayError::invalid_args("bad level"));
            }
            scheduler.schedule_group_action(
                req.group_id,
                ZigbeeCommand::MoveToLevel {
                    target: Target::Group(req.group_id),
                    level: req.param0 as u8,
                    transition_ms: req.param1,
                },
            )
        }
        CmdId::GroupColorXy => {
            if req.param0 > 65_535 || req.param1 > 65_535 {
                return Err(GatewayError::invalid_args("bad color xy"));
            }
            scheduler.schedule_group_action(
                req.group_id,
                ZigbeeCommand::MoveToColorXy {
                    target: Target::Group(req.group_id),
                    x: req.param0 as u16,
                    y: req.param1 as u16,
                    transition_ms: req.param2,
                },
            )
        }
        CmdId::GroupColorTemp => {
            if req.param0 == 0 || req.param0 > 1000 {
                return Err(GatewayError::invalid_args("bad mireds"));
            }
            scheduler.schedule_group_action(
                req.group_id,
                ZigbeeCommand::MoveToColorTemp {
                    target: Target::Group(req.group_id),
                    mireds: req.param0 as u16,
                    transition_ms: req.param1,
                },
            )
        }
        CmdId::SceneStore => scheduler.scene_store(req.group_id, req.scene_id),
        CmdId::SceneRecall => scheduler.scene_recall(req.group_id, req.scene_id),
        CmdId::ReadAttr => {
            let uid = parse_req_uid(&req.device_uid)?;
            if req.cluster_id == 0 {
                return Err(GatewayError::invalid_args("bad cluster_id"));
            }
            scheduler.read_attr(uid, req.endpoint, req.cluster_id, req.attr_id)
        }
        CmdId::Bind | CmdId::Unbind => {
            let src = parse_req_uid(&req.device_uid)?;
            let dst = parse_req_uid(&req.dst_uid)?;
            scheduler.bind(
                src,
                req.endpoint,
                req.cluster_id,
                dst,
                req.dst_endpoint,
                req.cmd == CmdId::Unbind,
            )
        }
        CmdId::DeviceLeave => {
            let uid = parse_req_uid(&req.device_uid)?;
            let short_addr = ctx.registry.get(uid).map_or(0xFFFF, |d| d.short_addr);
            scheduler.device_leave(uid, short_addr, req.flags & 0x01 != 0)
        }
        CmdId::SyncSnapshot => Ok(()), // handled before dispatch
    }
}

/// Process one `CMD_REQ` frame and produce the response.
pub fn handle_cmd_request(
    scheduler: &Scheduler,
    ctx: &RadioContext,
    producer: &SnapshotProducer,
    req: &CmdRequest,
) -> CmdResponse {
    if req.cmd == CmdId::SyncSnapshot {
        tracing::info!("SYNC_SNAPSHOT requested (req_id={})", req.req_id);
        // Quick ack first, then the stream follows asynchronously.
        producer.request();
        return CmdResponse::ok(req.req_id);
    }

    match exec_cmd(scheduler, ctx, req) {
        Ok(()) => CmdResponse::ok(req.req_id),
        Err(e) => CmdResponse::failed(req.req_id, status_of(e.kind), e.message),
    }
}

/// Start the serial link: writer task, RX parser thread, dispatcher,
/// event forwarder, and the snapshot streamer.
pub fn start_link(
    ctx: RadioContext,
    scheduler: Arc<Scheduler>,
    port: SerialPort,
) -> Result<Arc<SnapshotProducer>, GatewayError> {
    let reader_port = port
        .try_clone()
        .map_err(|e| GatewayError::internal(format!("serial clone failed: {e}")))?;

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(EVT_TX_QUEUE);
    let sink = Arc::new(SerialSink { write_tx });
    let seq = Arc::new(SeqAlloc::new());
    let producer = SnapshotProducer::new(ctx.clone(), scheduler.clone(), sink.clone(), seq.clone());
    producer.spawn();

    // Writer task
    tokio::spawn(async move {
        while let Some(bytes) = write_rx.recv().await {
            if let Err(e) = port.write_all(&bytes) {
                tracing::error!("serial write error: {}", e);
            }
            let _ = port.flush();
        }
    });

    // RX parser thread feeding the dispatcher
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(64);
    std::thread::spawn(move || {
        let mut buffer = [0u8; 256];
        let mut decoder = FrameDecoder::new();
        loop {
            match reader_port.read(&mut buffer) {
                Ok(0) => {
                    tracing::warn!("serial port closed");
                    break;
                }
                Ok(n) => {
                    let mut data = &buffer[..n];
                    loop {
                        let (consumed, decoded) = decoder.feed(data);
                        data = &data[consumed..];
                        match decoded {
                            Decoded::Frame(frame) => {
                                if frame_tx.blocking_send(frame).is_err() {
                                    return;
                                }
                            }
                            Decoded::Error(e) => tracing::warn!("link frame error: {}", e),
                            Decoded::NeedMore => {
                                if data.is_empty() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(ref e) if e.raw_os_error() == Some(libc_eagain()) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::error!("serial read error: {}", e);
                    break;
                }
            }
        }
    });

    // Dispatcher task
    {
        let sink = sink.clone();
        let seq = seq.clone();
        let producer = producer.clone();
        let scheduler = scheduler.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                match frame.msg_type {
                    MsgType::Ping => sink.send(MsgType::Pong, frame.seq, Vec::new()),
                    MsgType::Hello => sink.send(MsgType::HelloAck, frame.seq, Vec::new()),
                    MsgType::CmdReq => match CmdRequest::decode(&frame.payload) {
                        Ok(req) => {
                            let rsp = handle_cmd_request(&scheduler, &ctx, &producer, &req);
                            sink.send(MsgType::CmdRsp, seq.next(), rsp.encode());
                        }
                        Err(e) => tracing::warn!("bad CMD_REQ payload: {}", e),
                    },
                    other => tracing::debug!("unexpected frame on radio side: {:?}", other),
                }
            }
        });
    }

    // Event forwarder with join/leave snapshot deltas
    {
        let sink = sink.clone();
        let seq = seq.clone();
        let producer = producer.clone();
        let mut rx = ctx.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !is_forwardable(&event.event_type) {
                            continue;
                        }
                        if event.event_type == "device.join" {
                            if let Some(uid) = event.device_uid {
                                let mut snap_seq = 0;
                                producer.stream_device(uid, &mut snap_seq);
                            }
                        }
                        if event.event_type == "device.leave" {
                            if let Some(uid) = event.device_uid {
                                producer.send_remove(uid, event.short_addr);
                            }
                        }
                        let record = event_to_record(&event);
                        sink.send(MsgType::Event, seq.next(), record.encode());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("link event forwarder lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    Ok(producer)
}

fn libc_eagain() -> i32 {
    libc::EAGAIN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::LoopbackRadio;
    use gateway_core::device::DeviceRecord;
    use gateway_core::event::EventBus;
    use gateway_core::registry::DeviceRegistry;

    struct NullSink;
    impl FrameSink for NullSink {
        fn send(&self, _msg_type: MsgType, _seq: u16, _payload: Vec<u8>) {}
    }

    struct Fixture {
        scheduler: Arc<Scheduler>,
        ctx: RadioContext,
        producer: Arc<SnapshotProducer>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(DeviceRegistry::new());
        let ctx = RadioContext::new(registry.clone(), bus.clone());
        let (stack_tx, _stack_rx) = tokio::sync::mpsc::channel(8);
        let scheduler = Scheduler::start(LoopbackRadio::new(stack_tx), registry, bus);
        let producer = SnapshotProducer::new(
            ctx.clone(),
            scheduler.clone(),
            Arc::new(NullSink),
            Arc::new(SeqAlloc::new()),
        );
        Fixture {
            scheduler,
            ctx,
            producer,
        }
    }

    #[tokio::test]
    async fn test_group_validation_over_link() {
        let f = fixture();

        let mut req = CmdRequest::new(1, CmdId::GroupOnOff);
        req.group_id = 0;
        req.param0 = 1;
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::InvalidArgs);

        req.group_id = 0xFFFF;
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::InvalidArgs);

        req.group_id = 0x0002;
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_scene_recall_validation() {
        let f = fixture();

        let mut req = CmdRequest::new(2, CmdId::SceneRecall);
        req.group_id = 0x0002;
        req.scene_id = 0;
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::InvalidArgs);

        req.scene_id = 1;
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::Ok);
    }

    #[tokio::test]
    async fn test_onoff_requires_known_uid() {
        let f = fixture();

        let mut req = CmdRequest::new(3, CmdId::OnOff);
        req.param0 = 1;
        req.endpoint = 1;
        // missing uid
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::InvalidArgs);

        // garbage uid
        req.device_uid = "not-a-uid".to_string();
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::InvalidArgs);

        // well-formed request is accepted; resolution happens async
        let uid = DeviceUid::new(0x77);
        f.ctx
            .registry
            .upsert(DeviceRecord::new(uid, 0x1234))
            .unwrap();
        req.device_uid = uid.to_string();
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::Ok);
        assert_eq!(rsp.message, "ok");
    }

    #[tokio::test]
    async fn test_sync_snapshot_acks_immediately() {
        let f = fixture();
        let req = CmdRequest::new(9, CmdId::SyncSnapshot);
        let rsp = handle_cmd_request(&f.scheduler, &f.ctx, &f.producer, &req);
        assert_eq!(rsp.status, Status::Ok);
        assert_eq!(rsp.req_id, 9);
    }

    #[test]
    fn test_forwardable_filter() {
        assert!(is_forwardable("zigbee.attr_report"));
        assert!(is_forwardable("zigbee_bind_failed"));
        assert!(is_forwardable("device.join"));
        assert!(is_forwardable("device.leave"));
        assert!(!is_forwardable("rules.fired"));
        assert!(!is_forwardable("automation_saved"));
    }

    #[test]
    fn test_event_record_conversion() {
        let uid = DeviceUid::new(0x42);
        let mut event = GwEvent::new("zigbee.attr_report", "zigbee")
            .with_device(uid, 0x10)
            .with_endpoint(1)
            .with_cluster_attr(0x0402, 0)
            .with_value(EventValue::F64(23.45));
        event.id = 7;
        event.ts_ms = 1000;

        let record = event_to_record(&event);
        assert_eq!(record.kind, EventKind::AttrReport);
        assert_eq!(record.device_uid, uid.to_string());
        assert_eq!(record.cluster_id, 0x0402);
        match record.value {
            WireValue::F32(v) => assert!((v - 23.45).abs() < 1e-3),
            other => panic!("unexpected value {other:?}"),
        }
    }
}
