//! Command execution over the link
//!
//! The host's action executor hands validated commands to this port,
//! which encodes them as `CMD_REQ` records, sends them to the radio,
//! and maps the response status back into the error taxonomy.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use automation_engine::executor::{CommandPort, Target, ZigbeeCommand};
use gateway_core::cluster::OnOffCommand;
use gateway_core::error::{ErrorKind, GatewayError};
use link_protocol::message::{CmdId, CmdRequest, CmdResponse, Status};
use link_protocol::transport::LinkTransport;
use link_protocol::LinkError;

/// Request/response channel to the radio node
pub trait RequestSender: Send + Sync + 'static {
    fn send_request(
        &self,
        request: CmdRequest,
    ) -> impl Future<Output = Result<CmdResponse, LinkError>> + Send;
}

impl RequestSender for LinkTransport {
    fn send_request(
        &self,
        request: CmdRequest,
    ) -> impl Future<Output = Result<CmdResponse, LinkError>> + Send {
        self.request(request)
    }
}

/// Map wire status codes back to error kinds.
#[must_use]
pub fn kind_of(status: Status) -> ErrorKind {
    match status {
        Status::Ok | Status::Internal => ErrorKind::Internal,
        Status::InvalidArgs => ErrorKind::InvalidArgs,
        Status::NotReady => ErrorKind::NotReady,
        Status::NotFound => ErrorKind::NotFound,
        Status::Unsupported => ErrorKind::Unsupported,
        Status::Timeout => ErrorKind::Timeout,
        Status::Busy => ErrorKind::Busy,
        Status::NoMem => ErrorKind::NoMem,
        Status::CrcError => ErrorKind::CrcError,
        Status::FormatError => ErrorKind::FormatError,
    }
}

fn onoff_param(cmd: OnOffCommand) -> u32 {
    cmd as u32
}

/// Encode a command into its wire request.
#[must_use]
pub fn encode_command(req_id: u32, cmd: &ZigbeeCommand) -> CmdRequest {
    match cmd {
        ZigbeeCommand::OnOff { target, cmd } => match target {
            Target::Device { uid, endpoint } => {
                let mut req = CmdRequest::new(req_id, CmdId::OnOff);
                req.device_uid = uid.to_string();
                req.endpoint = *endpoint;
                req.param0 = onoff_param(*cmd);
                req
            }
            Target::Group(group_id) => {
                let mut req = CmdRequest::new(req_id, CmdId::GroupOnOff);
                req.group_id = *group_id;
                req.param0 = onoff_param(*cmd);
                req
            }
        },
        ZigbeeCommand::MoveToLevel {
            target,
            level,
            transition_ms,
        } => {
            let mut req = match target {
                Target::Device { uid, endpoint } => {
                    let mut req = CmdRequest::new(req_id, CmdId::LevelMoveToLevel);
                    req.device_uid = uid.to_string();
                    req.endpoint = *endpoint;
                    req
                }
                Target::Group(group_id) => {
                    let mut req = CmdRequest::new(req_id, CmdId::GroupLevel);
                    req.group_id = *group_id;
                    req
                }
            };
            req.param0 = u32::from(*level);
            req.param1 = *transition_ms;
            req
        }
        ZigbeeCommand::MoveToColorXy {
            target,
            x,
            y,
            transition_ms,
        } => {
            let mut req = match target {
                Target::Device { uid, endpoint } => {
                    let mut req = CmdRequest::new(req_id, CmdId::ColorMoveToXy);
                    req.device_uid = uid.to_string();
                    req.endpoint = *endpoint;
                    req
                }
                Target::Group(group_id) => {
                    let mut req = CmdRequest::new(req_id, CmdId::GroupColorXy);
                    req.group_id = *group_id;
                    req
                }
            };
            req.param0 = u32::from(*x);
            req.param1 = u32::from(*y);
            req.param2 = *transition_ms;
            req
        }
        ZigbeeCommand::MoveToColorTemp {
            target,
            mireds,
            transition_ms,
        } => {
            let mut req = match target {
                Target::Device { uid, endpoint } => {
                    let mut req = CmdRequest::new(req_id, CmdId::ColorMoveToTemp);
                    req.device_uid = uid.to_string();
                    req.endpoint = *endpoint;
                    req
                }
                Target::Group(group_id) => {
                    let mut req = CmdRequest::new(req_id, CmdId::GroupColorTemp);
                    req.group_id = *group_id;
                    req
                }
            };
            req.param0 = u32::from(*mireds);
            req.param1 = *transition_ms;
            req
        }
        ZigbeeCommand::SceneStore { group_id, scene_id } => {
            let mut req = CmdRequest::new(req_id, CmdId::SceneStore);
            req.group_id = *group_id;
            req.scene_id = *scene_id;
            req
        }
        ZigbeeCommand::SceneRecall { group_id, scene_id } => {
            let mut req = CmdRequest::new(req_id, CmdId::SceneRecall);
            req.group_id = *group_id;
            req.scene_id = *scene_id;
            req
        }
        ZigbeeCommand::Bind {
            src_uid,
            src_endpoint,
            cluster_id,
            dst_uid,
            dst_endpoint,
            unbind,
        } => {
            let mut req = CmdRequest::new(
                req_id,
                if *unbind { CmdId::Unbind } else { CmdId::Bind },
            );
            req.device_uid = src_uid.to_string();
            req.endpoint = *src_endpoint;
            req.cluster_id = *cluster_id;
            req.dst_uid = dst_uid.to_string();
            req.dst_endpoint = *dst_endpoint;
            req
        }
    }
}

/// Host command port: RPC over the link
pub struct LinkPort<S: RequestSender> {
    sender: Arc<S>,
    next_req_id: AtomicU32,
}

impl<S: RequestSender> LinkPort<S> {
    #[must_use]
    pub fn new(sender: Arc<S>) -> Self {
        Self {
            sender,
            next_req_id: AtomicU32::new(1),
        }
    }

    fn alloc_req_id(&self) -> u32 {
        loop {
            let id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }
}

impl<S: RequestSender> CommandPort for LinkPort<S> {
    fn submit(
        &self,
        cmd: ZigbeeCommand,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send {
        let request = encode_command(self.alloc_req_id(), &cmd);
        let sender = self.sender.clone();
        async move {
            match sender.send_request(request).await {
                Ok(rsp) if rsp.status == Status::Ok => Ok(()),
                Ok(rsp) => Err(GatewayError::new(kind_of(rsp.status), rsp.message)),
                Err(LinkError::Timeout) => Err(GatewayError::new(ErrorKind::Timeout, "link timeout")),
                Err(e) => Err(GatewayError::internal(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::uid::DeviceUid;
    use std::sync::Mutex;

    struct StubSender {
        requests: Mutex<Vec<CmdRequest>>,
        response: Mutex<Option<Result<CmdResponse, LinkError>>>,
    }

    impl StubSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                response: Mutex::new(None),
            })
        }
    }

    impl RequestSender for StubSender {
        fn send_request(
            &self,
            request: CmdRequest,
        ) -> impl Future<Output = Result<CmdResponse, LinkError>> + Send {
            let req_id = request.req_id;
            self.requests.lock().unwrap().push(request);
            let canned = self.response.lock().unwrap().take();
            async move {
                match canned {
                    Some(result) => result,
                    None => Ok(CmdResponse::ok(req_id)),
                }
            }
        }
    }

    fn uid() -> DeviceUid {
        DeviceUid::new(0x0012_4B00_1234_5678)
    }

    #[tokio::test]
    async fn test_submit_encodes_and_resolves() {
        let sender = StubSender::new();
        let port = LinkPort::new(sender.clone());

        port.submit(ZigbeeCommand::MoveToLevel {
            target: Target::Device {
                uid: uid(),
                endpoint: 1,
            },
            level: 200,
            transition_ms: 1500,
        })
        .await
        .unwrap();

        let requests = sender.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].cmd, CmdId::LevelMoveToLevel);
        assert_eq!(requests[0].device_uid, uid().to_string());
        assert_eq!(requests[0].param0, 200);
        assert_eq!(requests[0].param1, 1500);
        assert_ne!(requests[0].req_id, 0);
    }

    #[tokio::test]
    async fn test_group_commands_use_group_ids() {
        let sender = StubSender::new();
        let port = LinkPort::new(sender.clone());

        port.submit(ZigbeeCommand::OnOff {
            target: Target::Group(3),
            cmd: OnOffCommand::Off,
        })
        .await
        .unwrap();

        let requests = sender.requests.lock().unwrap();
        assert_eq!(requests[0].cmd, CmdId::GroupOnOff);
        assert_eq!(requests[0].group_id, 3);
        assert_eq!(requests[0].param0, 0);
    }

    #[tokio::test]
    async fn test_error_status_mapped() {
        let sender = StubSender::new();
        *sender.response.lock().unwrap() = Some(Ok(CmdResponse::failed(
            1,
            Status::NotReady,
            "short addr unknown",
        )));
        let port = LinkPort::new(sender.clone());

        let err = port
            .submit(ZigbeeCommand::OnOff {
                target: Target::Device {
                    uid: uid(),
                    endpoint: 1,
                },
                cmd: OnOffCommand::On,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotReady);
        assert_eq!(err.message, "short addr unknown");
    }

    #[tokio::test]
    async fn test_timeout_surfaces() {
        let sender = StubSender::new();
        *sender.response.lock().unwrap() = Some(Err(LinkError::Timeout));
        let port = LinkPort::new(sender.clone());

        let err = port
            .submit(ZigbeeCommand::SceneRecall {
                group_id: 2,
                scene_id: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_bind_roundtrip_fields() {
        let sender = StubSender::new();
        let port = LinkPort::new(sender.clone());
        let dst = DeviceUid::new(0x0012_4B00_1111_1111);

        port.submit(ZigbeeCommand::Bind {
            src_uid: uid(),
            src_endpoint: 1,
            cluster_id: 0x0006,
            dst_uid: dst,
            dst_endpoint: 1,
            unbind: true,
        })
        .await
        .unwrap();

        let requests = sender.requests.lock().unwrap();
        assert_eq!(requests[0].cmd, CmdId::Unbind);
        assert_eq!(requests[0].dst_uid, dst.to_string());
        assert_eq!(requests[0].cluster_id, 0x0006);
    }
}
