//! Action executor
//!
//! Turns a portable action or a compiled action record into a concrete
//! Zigbee command, validating ranges and routing unicast vs groupcast
//! vs scene/bind. The command leaves through a [`CommandPort`]: the
//! radio node implements it against its scheduler, the host node
//! implements it as an RPC over the link.

use std::future::Future;
use std::sync::Arc;

use gateway_core::cluster::OnOffCommand;
use gateway_core::error::GatewayError;
use gateway_core::uid::DeviceUid;

use crate::compile::compile_action_record;
use crate::compiled::{
    ActionKind, ActionRecord, CompiledAutomations, ACTION_FLAG_UNBIND,
};
use crate::model::ActionSpec;

/// Command addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Device { uid: DeviceUid, endpoint: u8 },
    Group(u16),
}

/// A validated, concrete Zigbee command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZigbeeCommand {
    OnOff {
        target: Target,
        cmd: OnOffCommand,
    },
    MoveToLevel {
        target: Target,
        level: u8,
        transition_ms: u32,
    },
    MoveToColorXy {
        target: Target,
        x: u16,
        y: u16,
        transition_ms: u32,
    },
    MoveToColorTemp {
        target: Target,
        mireds: u16,
        transition_ms: u32,
    },
    SceneStore {
        group_id: u16,
        scene_id: u8,
    },
    SceneRecall {
        group_id: u16,
        scene_id: u8,
    },
    Bind {
        src_uid: DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst_uid: DeviceUid,
        dst_endpoint: u8,
        unbind: bool,
    },
}

/// Sink for validated commands
pub trait CommandPort: Send + Sync + 'static {
    /// Submit one command; resolves when it was accepted (radio) or
    /// acknowledged over the link (host).
    fn submit(
        &self,
        cmd: ZigbeeCommand,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Executor dispatching actions into a command port
pub struct ActionExecutor<P: CommandPort> {
    port: Arc<P>,
}

impl<P: CommandPort> ActionExecutor<P> {
    #[must_use]
    pub fn new(port: Arc<P>) -> Self {
        Self { port }
    }

    /// Execute a portable action map.
    pub async fn execute_portable(&self, spec: &ActionSpec) -> Result<(), GatewayError> {
        // The compiler already enforces every range; reuse it so the
        // two input paths cannot drift apart.
        let mut scratch = CompiledAutomations::new();
        let record = compile_action_record(&mut scratch, spec)
            .map_err(|e| GatewayError::invalid_args(e.to_string()))?;
        self.execute_compiled(&scratch, &record).await
    }

    /// Execute one compiled action record.
    pub async fn execute_compiled(
        &self,
        compiled: &CompiledAutomations,
        action: &ActionRecord,
    ) -> Result<(), GatewayError> {
        let cmd = decode_action(compiled, action)?;
        self.port.submit(cmd).await
    }
}

fn parse_uid(compiled: &CompiledAutomations, off: u32, what: &str) -> Result<DeviceUid, GatewayError> {
    compiled
        .str_at(off)
        .parse()
        .map_err(|_| GatewayError::invalid_args(format!("bad {what}")))
}

fn check_endpoint(endpoint: u8) -> Result<u8, GatewayError> {
    if endpoint == 0 || endpoint > 240 {
        return Err(GatewayError::invalid_args("bad endpoint"));
    }
    Ok(endpoint)
}

fn check_group(group_id: u16) -> Result<u16, GatewayError> {
    if group_id == 0 || group_id == 0xFFFF {
        return Err(GatewayError::invalid_args("bad group_id"));
    }
    Ok(group_id)
}

fn check_transition(transition_ms: u32) -> Result<u32, GatewayError> {
    if transition_ms > 60_000 {
        return Err(GatewayError::invalid_args("bad transition_ms"));
    }
    Ok(transition_ms)
}

fn target_of(
    compiled: &CompiledAutomations,
    action: &ActionRecord,
    kind: ActionKind,
) -> Result<Target, GatewayError> {
    match kind {
        ActionKind::Group => Ok(Target::Group(check_group(action.group_id)?)),
        _ => Ok(Target::Device {
            uid: parse_uid(compiled, action.device_uid_off, "device_uid")?,
            endpoint: check_endpoint(action.endpoint)?,
        }),
    }
}

/// Interpret a compiled action record into a validated command.
pub fn decode_action(
    compiled: &CompiledAutomations,
    action: &ActionRecord,
) -> Result<ZigbeeCommand, GatewayError> {
    let kind = ActionKind::from_u8(action.kind)
        .ok_or_else(|| GatewayError::invalid_args("bad action kind"))?;
    let cmd = compiled.str_at(action.cmd_off);

    match kind {
        ActionKind::Device | ActionKind::Group => {
            let target = target_of(compiled, action, kind)?;
            match cmd {
                "onoff.on" => Ok(ZigbeeCommand::OnOff {
                    target,
                    cmd: OnOffCommand::On,
                }),
                "onoff.off" => Ok(ZigbeeCommand::OnOff {
                    target,
                    cmd: OnOffCommand::Off,
                }),
                "onoff.toggle" => Ok(ZigbeeCommand::OnOff {
                    target,
                    cmd: OnOffCommand::Toggle,
                }),
                "level.move_to_level" => {
                    if action.arg0 > 254 {
                        return Err(GatewayError::invalid_args("bad level"));
                    }
                    Ok(ZigbeeCommand::MoveToLevel {
                        target,
                        level: action.arg0 as u8,
                        transition_ms: check_transition(action.arg1)?,
                    })
                }
                "color.move_to_color_xy" => {
                    if action.arg0 > 65_535 || action.arg1 > 65_535 {
                        return Err(GatewayError::invalid_args("bad color xy"));
                    }
                    Ok(ZigbeeCommand::MoveToColorXy {
                        target,
                        x: action.arg0 as u16,
                        y: action.arg1 as u16,
                        transition_ms: check_transition(action.arg2)?,
                    })
                }
                "color.move_to_color_temperature" => {
                    if action.arg0 < 1 || action.arg0 > 1000 {
                        return Err(GatewayError::invalid_args("bad mireds"));
                    }
                    Ok(ZigbeeCommand::MoveToColorTemp {
                        target,
                        mireds: action.arg0 as u16,
                        transition_ms: check_transition(action.arg1)?,
                    })
                }
                other => Err(GatewayError::invalid_args(format!("unknown cmd {other}"))),
            }
        }
        ActionKind::Scene => {
            let group_id = check_group(action.group_id)?;
            if action.scene_id == 0 {
                return Err(GatewayError::invalid_args("bad scene_id"));
            }
            match cmd {
                "scene.store" => Ok(ZigbeeCommand::SceneStore {
                    group_id,
                    scene_id: action.scene_id,
                }),
                "scene.recall" => Ok(ZigbeeCommand::SceneRecall {
                    group_id,
                    scene_id: action.scene_id,
                }),
                other => Err(GatewayError::invalid_args(format!("unknown cmd {other}"))),
            }
        }
        ActionKind::Bind => {
            if action.cluster_id == 0 {
                return Err(GatewayError::invalid_args("bad cluster_id"));
            }
            Ok(ZigbeeCommand::Bind {
                src_uid: parse_uid(compiled, action.device_uid_off, "device_uid")?,
                src_endpoint: check_endpoint(action.endpoint)?,
                cluster_id: action.cluster_id,
                dst_uid: parse_uid(compiled, action.dst_uid_off, "dst_device_uid")?,
                dst_endpoint: check_endpoint(action.dst_endpoint)?,
                unbind: action.flags & ACTION_FLAG_UNBIND != 0,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every submitted command; optionally fails them all.
    pub struct MockPort {
        pub commands: Mutex<Vec<ZigbeeCommand>>,
        pub fail_with: Mutex<Option<GatewayError>>,
    }

    impl MockPort {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
            })
        }

        pub fn taken(&self) -> Vec<ZigbeeCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandPort for MockPort {
        fn submit(
            &self,
            cmd: ZigbeeCommand,
        ) -> impl Future<Output = Result<(), GatewayError>> + Send {
            let fail = self.fail_with.lock().unwrap().clone();
            self.commands.lock().unwrap().push(cmd);
            async move {
                match fail {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockPort;
    use super::*;
    use gateway_core::error::ErrorKind;

    fn action(json: &str) -> ActionSpec {
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn test_unicast_onoff() {
        let port = MockPort::new();
        let executor = ActionExecutor::new(port.clone());
        executor
            .execute_portable(&action(
                r#"{ "cmd": "onoff.toggle", "device_uid": "0x00124B0011111111", "endpoint": 1 }"#,
            ))
            .await
            .unwrap();

        let cmds = port.taken();
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0],
            ZigbeeCommand::OnOff {
                target: Target::Device {
                    uid: "0x00124b0011111111".parse().unwrap(),
                    endpoint: 1
                },
                cmd: OnOffCommand::Toggle,
            }
        );
    }

    #[tokio::test]
    async fn test_group_dispatch_by_group_id_presence() {
        let port = MockPort::new();
        let executor = ActionExecutor::new(port.clone());
        executor
            .execute_portable(&action(
                r#"{ "cmd": "level.move_to_level", "group_id": 3, "level": 128, "transition_ms": 500 }"#,
            ))
            .await
            .unwrap();

        assert_eq!(
            port.taken()[0],
            ZigbeeCommand::MoveToLevel {
                target: Target::Group(3),
                level: 128,
                transition_ms: 500,
            }
        );
    }

    #[tokio::test]
    async fn test_group_zero_and_broadcast_rejected() {
        let port = MockPort::new();
        let executor = ActionExecutor::new(port.clone());
        for g in [0u16, 0xFFFF] {
            let err = executor
                .execute_portable(&action(&format!(
                    r#"{{ "cmd": "onoff.on", "group_id": {g} }}"#
                )))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgs);
        }
        assert!(port.taken().is_empty());
    }

    #[tokio::test]
    async fn test_scene_validation() {
        let port = MockPort::new();
        let executor = ActionExecutor::new(port.clone());

        let err = executor
            .execute_portable(&action(
                r#"{ "cmd": "scene.recall", "group_id": 2, "scene_id": 0 }"#,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgs);

        executor
            .execute_portable(&action(
                r#"{ "cmd": "scene.recall", "group_id": 2, "scene_id": 1 }"#,
            ))
            .await
            .unwrap();
        assert_eq!(
            port.taken(),
            vec![ZigbeeCommand::SceneRecall {
                group_id: 2,
                scene_id: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_range_validation() {
        let port = MockPort::new();
        let executor = ActionExecutor::new(port.clone());

        let bad = [
            r#"{ "cmd": "level.move_to_level", "device_uid": "0x00124b0011111111", "endpoint": 1, "level": 255 }"#,
            r#"{ "cmd": "level.move_to_level", "device_uid": "0x00124b0011111111", "endpoint": 1, "level": 10, "transition_ms": 60001 }"#,
            r#"{ "cmd": "color.move_to_color_temperature", "device_uid": "0x00124b0011111111", "endpoint": 1, "mireds": 1001 }"#,
            r#"{ "cmd": "color.move_to_color_temperature", "device_uid": "0x00124b0011111111", "endpoint": 1, "mireds": 0 }"#,
            r#"{ "cmd": "onoff.on", "device_uid": "0x00124b0011111111", "endpoint": 0 }"#,
            r#"{ "cmd": "onoff.on", "device_uid": "0x00124b0011111111", "endpoint": 241 }"#,
            r#"{ "cmd": "bind", "device_uid": "0x00124b0011111111", "endpoint": 1, "dst_device_uid": "0x00124b0022222222", "dst_endpoint": 1, "cluster_id": 0 }"#,
        ];
        for json in bad {
            let err = executor.execute_portable(&action(json)).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgs, "accepted: {json}");
        }
        assert!(port.taken().is_empty());
    }

    #[tokio::test]
    async fn test_unbind_flag() {
        let port = MockPort::new();
        let executor = ActionExecutor::new(port.clone());
        executor
            .execute_portable(&action(
                r#"{ "cmd": "unbind", "device_uid": "0x00124b0011111111", "endpoint": 1,
                     "dst_device_uid": "0x00124b0022222222", "dst_endpoint": 1, "cluster_id": "0x0006" }"#,
            ))
            .await
            .unwrap();
        match &port.taken()[0] {
            ZigbeeCommand::Bind { unbind, cluster_id, .. } => {
                assert!(*unbind);
                assert_eq!(*cluster_id, 0x0006);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
