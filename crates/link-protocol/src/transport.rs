//! Async serial transport for the inter-node link (host side)

use crate::codec::{Decoded, FrameDecoder};
use crate::error::LinkError;
use crate::frame::Frame;
use crate::message::{CmdId, CmdRequest, CmdResponse, EventRecord, MsgType, SnapshotRecord, Status};

use serial2::SerialPort;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Default baud rate for the inter-node link.
pub const BAUD_RATE: u32 = 460_800;

/// Default per-command response deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Events from the radio node
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Link opened (HELLO acknowledged by the peer).
    HelloAck { seq: u16 },
    /// Liveness reply.
    Pong { seq: u16 },
    /// Normalized gateway event streamed from the radio.
    Event(EventRecord),
    /// One entry of the snapshot stream.
    Snapshot(SnapshotRecord),
}

/// Pending request waiting for a `CMD_RSP`
struct PendingRequest {
    response_tx: oneshot::Sender<CmdResponse>,
}

/// Command to send to the writer task
enum WriteCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// Received frame from the reader thread
struct ReceivedFrame {
    frame: Frame,
}

/// Async transport speaking the link protocol over a serial port
pub struct LinkTransport {
    /// Channel to the writer task
    write_tx: mpsc::Sender<WriteCommand>,
    /// Per-direction frame sequence (0 reserved as "unknown")
    sequence: AtomicU16,
    /// Request-id allocator (0 reserved)
    next_req_id: AtomicU32,
    /// Pending requests awaiting responses, keyed by `req_id`
    pending: Arc<Mutex<HashMap<u32, PendingRequest>>>,
    /// Event sender for unsolicited frames
    event_tx: broadcast::Sender<LinkEvent>,
}

impl LinkTransport {
    /// Connect to the radio node at the given serial port path.
    pub async fn connect(path: &str) -> Result<Self, LinkError> {
        tracing::info!("Connecting to radio node at {}", path);

        let mut port = SerialPort::open(path, BAUD_RATE).map_err(LinkError::SerialError)?;
        port.set_read_timeout(Duration::from_millis(100))
            .map_err(LinkError::SerialError)?;

        let reader_port = port.try_clone().map_err(LinkError::SerialError)?;

        let pending: Arc<Mutex<HashMap<u32, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _) = broadcast::channel(64);
        let (write_tx, write_rx) = mpsc::channel(32);
        let (frame_tx, frame_rx) = mpsc::channel::<ReceivedFrame>(64);

        tokio::spawn(Self::writer_task(port, write_rx));

        std::thread::spawn(move || {
            Self::reader_thread(reader_port, frame_tx);
        });

        let pending_clone = pending.clone();
        let event_tx_clone = event_tx.clone();
        tokio::spawn(Self::frame_handler_task(
            frame_rx,
            pending_clone,
            event_tx_clone,
        ));

        tracing::info!("Connected to radio node");

        Ok(Self {
            write_tx,
            sequence: AtomicU16::new(1),
            next_req_id: AtomicU32::new(1),
            pending,
            event_tx,
        })
    }

    /// Writer task - owns the serial port for TX
    async fn writer_task(port: SerialPort, mut rx: mpsc::Receiver<WriteCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCommand::Send(data) => {
                    tracing::trace!("Writing {} bytes to serial port", data.len());
                    if let Err(e) = port.write_all(&data) {
                        tracing::error!("Write error: {}", e);
                    }
                    if let Err(e) = port.flush() {
                        tracing::error!("Flush error: {}", e);
                    }
                }
                WriteCommand::Shutdown => break,
            }
        }
        tracing::debug!("Writer task shutting down");
    }

    /// Reader thread - blocking serial reads, resumable frame decoding
    fn reader_thread(port: SerialPort, frame_tx: mpsc::Sender<ReceivedFrame>) {
        tracing::debug!("Reader thread started");
        let mut buffer = [0u8; 256];
        let mut decoder = FrameDecoder::new();

        loop {
            match port.read(&mut buffer) {
                Ok(0) => {
                    tracing::warn!("Serial port closed");
                    break;
                }
                Ok(n) => {
                    let mut data = &buffer[..n];
                    loop {
                        let (consumed, decoded) = decoder.feed(data);
                        data = &data[consumed..];
                        match decoded {
                            Decoded::Frame(frame) => {
                                if frame_tx.blocking_send(ReceivedFrame { frame }).is_err() {
                                    tracing::warn!("Frame channel closed");
                                    return;
                                }
                            }
                            Decoded::Error(e) => {
                                tracing::warn!("Link frame error: {}", e);
                            }
                            Decoded::NeedMore => {
                                if data.is_empty() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                    continue;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                Err(e) => {
                    tracing::error!("Serial read error: {}", e);
                    break;
                }
            }
        }
        tracing::debug!("Reader thread shutting down");
    }

    /// Frame handler task - routes frames from the reader thread
    async fn frame_handler_task(
        mut frame_rx: mpsc::Receiver<ReceivedFrame>,
        pending: Arc<Mutex<HashMap<u32, PendingRequest>>>,
        event_tx: broadcast::Sender<LinkEvent>,
    ) {
        while let Some(received) = frame_rx.recv().await {
            if let Err(e) = Self::handle_frame(received.frame, &pending, &event_tx).await {
                tracing::warn!("Error handling frame: {}", e);
            }
        }
        tracing::debug!("Frame handler task shutting down");
    }

    /// Route a decoded frame
    async fn handle_frame(
        frame: Frame,
        pending: &Arc<Mutex<HashMap<u32, PendingRequest>>>,
        event_tx: &broadcast::Sender<LinkEvent>,
    ) -> Result<(), LinkError> {
        tracing::trace!(
            "Received frame: type={:?} seq={} payload_len={}",
            frame.msg_type,
            frame.seq,
            frame.payload.len()
        );

        match frame.msg_type {
            MsgType::CmdRsp => {
                let rsp = CmdResponse::decode(&frame.payload)?;
                let mut pending_guard = pending.lock().await;
                if let Some(req) = pending_guard.remove(&rsp.req_id) {
                    drop(pending_guard);
                    let _ = req.response_tx.send(rsp);
                } else {
                    drop(pending_guard);
                    // Late response for an already-timed-out request.
                    tracing::warn!(
                        "Dropping late CMD_RSP req_id={} status={:?}",
                        rsp.req_id,
                        rsp.status
                    );
                }
            }
            MsgType::Event => {
                let evt = EventRecord::decode(&frame.payload)?;
                let _ = event_tx.send(LinkEvent::Event(evt));
            }
            MsgType::Snapshot => {
                let snap = SnapshotRecord::decode(&frame.payload)?;
                let _ = event_tx.send(LinkEvent::Snapshot(snap));
            }
            MsgType::HelloAck => {
                let _ = event_tx.send(LinkEvent::HelloAck { seq: frame.seq });
            }
            MsgType::Pong => {
                let _ = event_tx.send(LinkEvent::Pong { seq: frame.seq });
            }
            MsgType::Hello | MsgType::Ping | MsgType::CmdReq => {
                tracing::debug!("Unexpected peer frame on host side: {:?}", frame.msg_type);
            }
        }

        Ok(())
    }

    fn next_seq(&self) -> u16 {
        loop {
            let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
            if seq != 0 {
                return seq;
            }
        }
    }

    async fn send_frame(&self, msg_type: MsgType, payload: Vec<u8>) -> Result<u16, LinkError> {
        let seq = self.next_seq();
        let frame = Frame::new(msg_type, seq, payload);
        let data = frame.encode()?;
        self.write_tx
            .send(WriteCommand::Send(data))
            .await
            .map_err(|_| LinkError::NotConnected)?;
        Ok(seq)
    }

    /// Open the session. The HELLO_ACK arrives on the event stream.
    pub async fn send_hello(&self) -> Result<u16, LinkError> {
        self.send_frame(MsgType::Hello, Vec::new()).await
    }

    /// Liveness probe. The PONG echoes the returned `seq`.
    pub async fn send_ping(&self) -> Result<u16, LinkError> {
        self.send_frame(MsgType::Ping, Vec::new()).await
    }

    /// Allocate a fresh request id.
    pub fn alloc_req_id(&self) -> u32 {
        loop {
            let id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Send a `CMD_REQ` and wait for the matching `CMD_RSP`.
    pub async fn request(&self, request: CmdRequest) -> Result<CmdResponse, LinkError> {
        self.request_timeout(request, DEFAULT_TIMEOUT).await
    }

    /// Send a `CMD_REQ` with a custom deadline.
    ///
    /// On timeout the pending entry is forgotten; a later `CMD_RSP`
    /// carrying this `req_id` is logged and dropped by the handler.
    pub async fn request_timeout(
        &self,
        request: CmdRequest,
        timeout: Duration,
    ) -> Result<CmdResponse, LinkError> {
        let req_id = request.req_id;
        let (response_tx, response_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(req_id, PendingRequest { response_tx });
        }

        let payload = request.encode();
        if let Err(e) = self.send_frame(MsgType::CmdReq, payload).await {
            let mut pending = self.pending.lock().await;
            pending.remove(&req_id);
            return Err(e);
        }

        tracing::debug!("Sent CMD_REQ req_id={} cmd={:?}", req_id, request.cmd);

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(rsp)) => Ok(rsp),
            Ok(Err(_)) => Err(LinkError::Timeout),
            Err(_) => {
                let mut pending = self.pending.lock().await;
                pending.remove(&req_id);
                tracing::warn!("CMD_REQ req_id={} timed out", req_id);
                Err(LinkError::Timeout)
            }
        }
    }

    /// Send a request and map a non-OK status into an error.
    pub async fn request_ok(&self, request: CmdRequest) -> Result<(), LinkError> {
        let rsp = self.request(request).await?;
        if rsp.status == Status::Ok {
            Ok(())
        } else {
            Err(LinkError::PeerError(rsp.status))
        }
    }

    /// Ask the radio to stream a full snapshot. The radio acks
    /// immediately; the snapshot entries arrive on the event stream.
    pub async fn request_snapshot(&self) -> Result<(), LinkError> {
        let req = CmdRequest::new(self.alloc_req_id(), CmdId::SyncSnapshot);
        self.request_ok(req).await
    }

    /// Subscribe to link events (events, snapshot entries, acks).
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for LinkTransport {
    fn drop(&mut self) {
        let _ = self.write_tx.try_send(WriteCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport wired to a sink channel instead of a serial port.
    fn detached_transport() -> (LinkTransport, mpsc::Receiver<WriteCommand>) {
        let (write_tx, write_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(8);
        (
            LinkTransport {
                write_tx,
                sequence: AtomicU16::new(1),
                next_req_id: AtomicU32::new(1),
                pending: Arc::new(Mutex::new(HashMap::new())),
                event_tx,
            },
            write_rx,
        )
    }

    #[tokio::test]
    async fn test_request_timeout_forgets_pending() {
        let (transport, mut write_rx) = detached_transport();

        let req = CmdRequest::new(transport.alloc_req_id(), CmdId::OnOff);
        let req_id = req.req_id;
        let result = transport
            .request_timeout(req, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(LinkError::Timeout)));

        // the request went out exactly once
        assert!(matches!(write_rx.try_recv(), Ok(WriteCommand::Send(_))));
        assert!(write_rx.try_recv().is_err());

        // and the pending entry is gone, so a late response is dropped
        assert!(transport.pending.lock().await.is_empty());
        LinkTransport::handle_frame(rsp_frame(req_id), &transport.pending, &transport.event_tx)
            .await
            .unwrap();
        assert!(transport.pending.lock().await.is_empty());
    }

    fn rsp_frame(req_id: u32) -> Frame {
        let rsp = CmdResponse::ok(req_id);
        Frame::new(MsgType::CmdRsp, 1, rsp.encode())
    }

    #[tokio::test]
    async fn test_pending_request_resolved() {
        let pending: Arc<Mutex<HashMap<u32, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, _keep) = broadcast::channel(8);

        let (tx, rx) = oneshot::channel();
        pending
            .lock()
            .await
            .insert(77, PendingRequest { response_tx: tx });

        LinkTransport::handle_frame(rsp_frame(77), &pending, &event_tx)
            .await
            .unwrap();

        let rsp = rx.await.unwrap();
        assert_eq!(rsp.req_id, 77);
        assert_eq!(rsp.status, Status::Ok);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_late_response_dropped() {
        let pending: Arc<Mutex<HashMap<u32, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, mut event_rx) = broadcast::channel(8);

        // No pending entry for req_id 99: the response must be swallowed
        // without surfacing anywhere.
        LinkTransport::handle_frame(rsp_frame(99), &pending, &event_tx)
            .await
            .unwrap();

        assert!(pending.lock().await.is_empty());
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_frame_broadcast() {
        let pending: Arc<Mutex<HashMap<u32, PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, mut event_rx) = broadcast::channel(8);

        let evt = EventRecord {
            event_id: 5,
            ts_ms: 1000,
            kind: crate::message::EventKind::DeviceJoin,
            event_type: "device.join".to_string(),
            cmd: String::new(),
            device_uid: "0x00124b0012345678".to_string(),
            short_addr: 0x33,
            endpoint: 0,
            cluster_id: 0,
            attr_id: 0,
            value: crate::message::WireValue::None,
            value_text: String::new(),
        };
        let frame = Frame::new(MsgType::Event, 2, evt.encode());

        LinkTransport::handle_frame(frame, &pending, &event_tx)
            .await
            .unwrap();

        match event_rx.try_recv().unwrap() {
            LinkEvent::Event(decoded) => assert_eq!(decoded, evt),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
