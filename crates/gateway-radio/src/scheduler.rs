//! Zigbee scheduler (command side)
//!
//! Stack APIs are not thread-safe, so every external request becomes a
//! token-keyed context in a 256-slot table and is performed by the one
//! worker task that owns the stack. Scheduling returns immediately;
//! completions and failures flow through the event bus.

use std::sync::{Arc, Mutex};

use automation_engine::executor::{CommandPort, Target, ZigbeeCommand};
use gateway_core::cluster::OnOffCommand;
use gateway_core::error::GatewayError;
use gateway_core::event::{now_ms, EventBus, GwEvent};
use gateway_core::registry::DeviceRegistry;
use gateway_core::uid::DeviceUid;
use tokio::sync::mpsc;

use crate::radio::{RadioAddr, RadioStack};

/// Slots in the token table.
pub const TOKEN_TABLE_SIZE: usize = 256;
/// Default permit-join window when the caller passes zero.
pub const PERMIT_JOIN_DEFAULT_S: u8 = 180;
/// Upper bound on command transitions.
pub const MAX_TRANSITION_MS: u32 = 60_000;
/// Discovery throttle window per short address.
const DISCOVER_THROTTLE_MS: u64 = 30_000;
/// Recently-discovered shorts tracked by the throttle.
const DISCOVER_SLOTS: usize = 8;

/// One scheduled operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerOp {
    PermitJoin {
        seconds: u8,
    },
    Command(ZigbeeCommand),
    ReadAttr {
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
    },
    ConfigureReport {
        short_addr: u16,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
        min_interval_s: u16,
        max_interval_s: u16,
        reportable_change: u16,
    },
    AddGroup {
        short_addr: u16,
        endpoint: u8,
        group_id: u16,
    },
    BindToGateway {
        uid: DeviceUid,
        endpoint: u8,
        cluster_id: u16,
    },
    IeeeLookup {
        short_addr: u16,
    },
    ActiveEpRequest {
        short_addr: u16,
    },
    SimpleDescRequest {
        short_addr: u16,
        endpoint: u8,
    },
    DeviceLeave {
        uid: DeviceUid,
        short_addr: u16,
        rejoin: bool,
    },
}

/// 256-slot token table; token 0 is never used
struct TokenTable {
    slots: Vec<Option<SchedulerOp>>,
    next: u8,
}

impl TokenTable {
    fn new() -> Self {
        Self {
            slots: vec![None; TOKEN_TABLE_SIZE],
            next: 0,
        }
    }

    fn claim(&mut self, op: SchedulerOp) -> Option<u8> {
        for _ in 0..TOKEN_TABLE_SIZE {
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                continue;
            }
            let idx = self.next as usize;
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(op);
                return Some(self.next);
            }
        }
        None
    }

    /// Take the context for a token; at most once per claim.
    fn take(&mut self, token: u8) -> Option<SchedulerOp> {
        self.slots[token as usize].take()
    }
}

/// Per-short throttle: an 8-slot LRU of recently discovered shorts
struct DiscoveryThrottle {
    slots: [(u16, u64); DISCOVER_SLOTS],
    next: usize,
}

impl DiscoveryThrottle {
    fn new() -> Self {
        Self {
            slots: [(0, 0); DISCOVER_SLOTS],
            next: 0,
        }
    }

    fn should_throttle(&mut self, short_addr: u16, now: u64) -> bool {
        for slot in &mut self.slots {
            if slot.0 == short_addr && slot.1 != 0 {
                if now.saturating_sub(slot.1) < DISCOVER_THROTTLE_MS {
                    return true;
                }
                slot.1 = now;
                return false;
            }
        }
        self.slots[self.next] = (short_addr, now);
        self.next = (self.next + 1) % DISCOVER_SLOTS;
        false
    }
}

/// The scheduler front end; cheap to share
pub struct Scheduler {
    tokens: Mutex<TokenTable>,
    throttle: Mutex<DiscoveryThrottle>,
    job_tx: mpsc::Sender<u8>,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
}

impl Scheduler {
    /// Start the scheduler: spawns the worker task that owns the stack.
    pub fn start<R: RadioStack>(
        radio: R,
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(TOKEN_TABLE_SIZE);
        let scheduler = Arc::new(Self {
            tokens: Mutex::new(TokenTable::new()),
            throttle: Mutex::new(DiscoveryThrottle::new()),
            job_tx,
            registry,
            bus,
        });
        tokio::spawn(Self::worker(Arc::clone(&scheduler), radio, job_rx));
        scheduler
    }

    /// Worker: the only place stack calls happen.
    async fn worker<R: RadioStack>(self: Arc<Self>, mut radio: R, mut rx: mpsc::Receiver<u8>) {
        while let Some(token) = rx.recv().await {
            let op = self.tokens.lock().expect("token table poisoned").take(token);
            let Some(op) = op else {
                // Token already consumed or released; never run twice.
                continue;
            };
            self.execute(&mut radio, op);
        }
        tracing::info!("scheduler worker stopping");
    }

    fn execute<R: RadioStack>(&self, radio: &mut R, op: SchedulerOp) {
        let result = match &op {
            SchedulerOp::PermitJoin { seconds } => radio.permit_join(*seconds).map(|()| {
                self.bus.publish(
                    GwEvent::new("zigbee_permit_join", "zigbee")
                        .with_msg(format!("window={}s", seconds)),
                );
            }),
            SchedulerOp::Command(cmd) => self.execute_command(radio, cmd),
            SchedulerOp::ReadAttr {
                short_addr,
                endpoint,
                cluster_id,
                attr_id,
            } => radio.read_attr(*short_addr, *endpoint, *cluster_id, *attr_id),
            SchedulerOp::ConfigureReport {
                short_addr,
                endpoint,
                cluster_id,
                attr_id,
                min_interval_s,
                max_interval_s,
                reportable_change,
            } => radio.configure_reporting(
                *short_addr,
                *endpoint,
                *cluster_id,
                *attr_id,
                *min_interval_s,
                *max_interval_s,
                *reportable_change,
            ),
            SchedulerOp::AddGroup {
                short_addr,
                endpoint,
                group_id,
            } => radio.add_group(*short_addr, *endpoint, *group_id),
            SchedulerOp::BindToGateway {
                uid,
                endpoint,
                cluster_id,
            } => radio.bind(
                *uid,
                *endpoint,
                *cluster_id,
                radio.local_uid(),
                radio.local_endpoint(),
                false,
            ),
            SchedulerOp::IeeeLookup { short_addr } => radio.ieee_addr_req(*short_addr),
            SchedulerOp::ActiveEpRequest { short_addr } => radio.active_ep_req(*short_addr),
            SchedulerOp::SimpleDescRequest {
                short_addr,
                endpoint,
            } => radio.simple_desc_req(*short_addr, *endpoint),
            SchedulerOp::DeviceLeave {
                uid,
                short_addr,
                rejoin,
            } => radio.mgmt_leave(*uid, *short_addr, *rejoin),
        };

        if let Err(e) = result {
            let failure = match &op {
                SchedulerOp::PermitJoin { .. } => "zigbee_permit_join_failed",
                SchedulerOp::BindToGateway { .. } => "zigbee_bind_failed",
                SchedulerOp::ConfigureReport { .. } => "zigbee_config_report_failed",
                _ => "zigbee_cmd_failed",
            };
            tracing::warn!("scheduler op failed: {e}");
            self.bus
                .publish(GwEvent::new(failure, "zigbee").with_msg(e.message.clone()));
        }
    }

    fn execute_command<R: RadioStack>(
        &self,
        radio: &mut R,
        cmd: &ZigbeeCommand,
    ) -> Result<(), GatewayError> {
        let resolve = |target: &Target| -> Result<RadioAddr, GatewayError> {
            match target {
                Target::Group(group_id) => Ok(RadioAddr::Group(*group_id)),
                Target::Device { uid, endpoint } => {
                    let device = self
                        .registry
                        .get(*uid)
                        .ok_or_else(|| GatewayError::not_found("device unknown"))?;
                    if !device.is_ready() {
                        return Err(GatewayError::not_ready("short addr unknown"));
                    }
                    Ok(RadioAddr::Device {
                        short_addr: device.short_addr,
                        endpoint: *endpoint,
                    })
                }
            }
        };

        match cmd {
            ZigbeeCommand::OnOff { target, cmd } => radio.send_onoff(resolve(target)?, *cmd),
            ZigbeeCommand::MoveToLevel {
                target,
                level,
                transition_ms,
            } => radio.send_move_to_level(resolve(target)?, *level, ms_to_tenths(*transition_ms)),
            ZigbeeCommand::MoveToColorXy {
                target,
                x,
                y,
                transition_ms,
            } => radio.send_move_to_color_xy(resolve(target)?, *x, *y, ms_to_tenths(*transition_ms)),
            ZigbeeCommand::MoveToColorTemp {
                target,
                mireds,
                transition_ms,
            } => radio.send_move_to_color_temp(
                resolve(target)?,
                *mireds,
                ms_to_tenths(*transition_ms),
            ),
            ZigbeeCommand::SceneStore { group_id, scene_id } => {
                radio.scene_store(*group_id, *scene_id)
            }
            ZigbeeCommand::SceneRecall { group_id, scene_id } => {
                radio.scene_recall(*group_id, *scene_id)
            }
            ZigbeeCommand::Bind {
                src_uid,
                src_endpoint,
                cluster_id,
                dst_uid,
                dst_endpoint,
                unbind,
            } => radio.bind(
                *src_uid,
                *src_endpoint,
                *cluster_id,
                *dst_uid,
                *dst_endpoint,
                *unbind,
            ),
        }
    }

    /// Claim a token and hand it to the worker.
    fn schedule(&self, op: SchedulerOp) -> Result<(), GatewayError> {
        let token = {
            let mut tokens = self.tokens.lock().expect("token table poisoned");
            tokens
                .claim(op)
                .ok_or_else(|| GatewayError::busy("token table full"))?
        };
        if self.job_tx.try_send(token).is_err() {
            // Release the slot so the token cannot leak.
            self.tokens.lock().expect("token table poisoned").take(token);
            return Err(GatewayError::busy("scheduler queue full"));
        }
        Ok(())
    }

    /// Open the network for association; zero means the 180 s default.
    pub fn permit_join(&self, seconds: u8) -> Result<(), GatewayError> {
        let seconds = if seconds == 0 {
            PERMIT_JOIN_DEFAULT_S
        } else {
            seconds
        };
        self.schedule(SchedulerOp::PermitJoin { seconds })
    }

    /// Resolve IEEE then walk endpoints; throttled per short address.
    pub fn discover_by_short(&self, short_addr: u16) -> Result<(), GatewayError> {
        let now = now_ms();
        if self
            .throttle
            .lock()
            .expect("throttle poisoned")
            .should_throttle(short_addr, now)
        {
            tracing::info!("discover_by_short throttled: {:#06x}", short_addr);
            return Ok(());
        }
        self.schedule(SchedulerOp::IeeeLookup { short_addr })
    }

    /// Unicast ZCL On/Off.
    pub fn onoff_cmd(
        &self,
        uid: DeviceUid,
        endpoint: u8,
        cmd: OnOffCommand,
    ) -> Result<(), GatewayError> {
        check_endpoint(endpoint)?;
        self.schedule(SchedulerOp::Command(ZigbeeCommand::OnOff {
            target: Target::Device { uid, endpoint },
            cmd,
        }))
    }

    pub fn level_move_to_level(
        &self,
        uid: DeviceUid,
        endpoint: u8,
        level: u8,
        transition_ms: u32,
    ) -> Result<(), GatewayError> {
        check_endpoint(endpoint)?;
        check_level(level)?;
        check_transition(transition_ms)?;
        self.schedule(SchedulerOp::Command(ZigbeeCommand::MoveToLevel {
            target: Target::Device { uid, endpoint },
            level,
            transition_ms,
        }))
    }

    pub fn color_move_to_xy(
        &self,
        uid: DeviceUid,
        endpoint: u8,
        x: u16,
        y: u16,
        transition_ms: u32,
    ) -> Result<(), GatewayError> {
        check_endpoint(endpoint)?;
        check_transition(transition_ms)?;
        self.schedule(SchedulerOp::Command(ZigbeeCommand::MoveToColorXy {
            target: Target::Device { uid, endpoint },
            x,
            y,
            transition_ms,
        }))
    }

    pub fn color_move_to_temp(
        &self,
        uid: DeviceUid,
        endpoint: u8,
        mireds: u16,
        transition_ms: u32,
    ) -> Result<(), GatewayError> {
        check_endpoint(endpoint)?;
        check_mireds(mireds)?;
        check_transition(transition_ms)?;
        self.schedule(SchedulerOp::Command(ZigbeeCommand::MoveToColorTemp {
            target: Target::Device { uid, endpoint },
            mireds,
            transition_ms,
        }))
    }

    /// Group-cast variant of on/off, level, and color commands.
    pub fn schedule_group_action(
        &self,
        group_id: u16,
        cmd: ZigbeeCommand,
    ) -> Result<(), GatewayError> {
        check_group(group_id)?;
        self.schedule(SchedulerOp::Command(cmd))
    }

    pub fn scene_store(&self, group_id: u16, scene_id: u8) -> Result<(), GatewayError> {
        check_group(group_id)?;
        check_scene(scene_id)?;
        self.schedule(SchedulerOp::Command(ZigbeeCommand::SceneStore {
            group_id,
            scene_id,
        }))
    }

    pub fn scene_recall(&self, group_id: u16, scene_id: u8) -> Result<(), GatewayError> {
        check_group(group_id)?;
        check_scene(scene_id)?;
        self.schedule(SchedulerOp::Command(ZigbeeCommand::SceneRecall {
            group_id,
            scene_id,
        }))
    }

    pub fn read_attr(
        &self,
        uid: DeviceUid,
        endpoint: u8,
        cluster_id: u16,
        attr_id: u16,
    ) -> Result<(), GatewayError> {
        check_endpoint(endpoint)?;
        let device = self
            .registry
            .get(uid)
            .ok_or_else(|| GatewayError::not_found("device unknown"))?;
        if !device.is_ready() {
            return Err(GatewayError::not_ready("short addr unknown"));
        }
        self.schedule(SchedulerOp::ReadAttr {
            short_addr: device.short_addr,
            endpoint,
            cluster_id,
            attr_id,
        })
    }

    pub fn bind(
        &self,
        src_uid: DeviceUid,
        src_endpoint: u8,
        cluster_id: u16,
        dst_uid: DeviceUid,
        dst_endpoint: u8,
        unbind: bool,
    ) -> Result<(), GatewayError> {
        check_endpoint(src_endpoint)?;
        check_endpoint(dst_endpoint)?;
        if cluster_id == 0 {
            return Err(GatewayError::invalid_args("bad cluster_id"));
        }
        self.schedule(SchedulerOp::Command(ZigbeeCommand::Bind {
            src_uid,
            src_endpoint,
            cluster_id,
            dst_uid,
            dst_endpoint,
            unbind,
        }))
    }

    pub fn device_leave(
        &self,
        uid: DeviceUid,
        short_addr: u16,
        rejoin: bool,
    ) -> Result<(), GatewayError> {
        self.schedule(SchedulerOp::DeviceLeave {
            uid,
            short_addr,
            rejoin,
        })
    }

    /// Raw scheduling for provisioning helpers.
    pub(crate) fn schedule_raw(&self, op: SchedulerOp) -> Result<(), GatewayError> {
        self.schedule(op)
    }

    /// Schedule a command produced by the action executor.
    pub fn schedule_command(&self, cmd: ZigbeeCommand) -> Result<(), GatewayError> {
        if let Some(group_id) = command_group(&cmd) {
            check_group(group_id)?;
        }
        self.schedule(SchedulerOp::Command(cmd))
    }
}

fn command_group(cmd: &ZigbeeCommand) -> Option<u16> {
    match cmd {
        ZigbeeCommand::OnOff {
            target: Target::Group(g),
            ..
        }
        | ZigbeeCommand::MoveToLevel {
            target: Target::Group(g),
            ..
        }
        | ZigbeeCommand::MoveToColorXy {
            target: Target::Group(g),
            ..
        }
        | ZigbeeCommand::MoveToColorTemp {
            target: Target::Group(g),
            ..
        }
        | ZigbeeCommand::SceneStore { group_id: g, .. }
        | ZigbeeCommand::SceneRecall { group_id: g, .. } => Some(*g),
        _ => None,
    }
}

/// ZCL transitions are tenths of a second; round half up, saturate.
#[must_use]
pub fn ms_to_tenths(transition_ms: u32) -> u16 {
    let tenths = (u64::from(transition_ms) + 50) / 100;
    tenths.min(0xFFFF) as u16
}

fn check_endpoint(endpoint: u8) -> Result<(), GatewayError> {
    if endpoint == 0 || endpoint > 240 {
        return Err(GatewayError::invalid_args("bad endpoint"));
    }
    Ok(())
}

fn check_level(level: u8) -> Result<(), GatewayError> {
    if level > 254 {
        return Err(GatewayError::invalid_args("bad level"));
    }
    Ok(())
}

fn check_mireds(mireds: u16) -> Result<(), GatewayError> {
    if mireds == 0 || mireds > 1000 {
        return Err(GatewayError::invalid_args("bad mireds"));
    }
    Ok(())
}

fn check_transition(transition_ms: u32) -> Result<(), GatewayError> {
    if transition_ms > MAX_TRANSITION_MS {
        return Err(GatewayError::invalid_args("bad transition_ms"));
    }
    Ok(())
}

fn check_group(group_id: u16) -> Result<(), GatewayError> {
    if group_id == 0 || group_id == 0xFFFF {
        return Err(GatewayError::invalid_args("bad group_id"));
    }
    Ok(())
}

fn check_scene(scene_id: u8) -> Result<(), GatewayError> {
    if scene_id == 0 {
        return Err(GatewayError::invalid_args("bad scene_id"));
    }
    Ok(())
}

/// Local command port: the action executor on the radio node feeds the
/// scheduler directly.
pub struct SchedulerPort {
    scheduler: Arc<Scheduler>,
}

impl SchedulerPort {
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl CommandPort for SchedulerPort {
    fn submit(
        &self,
        cmd: ZigbeeCommand,
    ) -> impl std::future::Future<Output = Result<(), GatewayError>> + Send {
        let result = self.scheduler.schedule_command(cmd);
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::device::DeviceRecord;
    use gateway_core::error::ErrorKind;
    use std::sync::Mutex as StdMutex;

    /// Records stack calls for assertions.
    struct RecordingRadio {
        calls: Arc<StdMutex<Vec<String>>>,
    }

    impl RecordingRadio {
        fn new() -> (Self, Arc<StdMutex<Vec<String>>>) {
            let calls = Arc::new(StdMutex::new(Vec::new()));
            (
                Self {
                    calls: calls.clone(),
                },
                calls,
            )
        }

        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }
    }

    impl RadioStack for RecordingRadio {
        fn local_uid(&self) -> DeviceUid {
            DeviceUid::new(0xAA)
        }
        fn local_endpoint(&self) -> u8 {
            1
        }
        fn permit_join(&mut self, seconds: u8) -> Result<(), GatewayError> {
            self.log(format!("permit_join {seconds}"));
            Ok(())
        }
        fn send_onoff(&mut self, addr: RadioAddr, cmd: OnOffCommand) -> Result<(), GatewayError> {
            self.log(format!("onoff {addr:?} {cmd:?}"));
            Ok(())
        }
        fn send_move_to_level(
            &mut self,
            addr: RadioAddr,
            level: u8,
            transition_ds: u16,
        ) -> Result<(), GatewayError> {
            self.log(format!("level {addr:?} {level} {transition_ds}"));
            Ok(())
        }
        fn send_move_to_color_xy(
            &mut self,
            addr: RadioAddr,
            x: u16,
            y: u16,
            transition_ds: u16,
        ) -> Result<(), GatewayError> {
            self.log(format!("color_xy {addr:?} {x} {y} {transition_ds}"));
            Ok(())
        }
        fn send_move_to_color_temp(
            &mut self,
            addr: RadioAddr,
            mireds: u16,
            transition_ds: u16,
        ) -> Result<(), GatewayError> {
            self.log(format!("color_temp {addr:?} {mireds} {transition_ds}"));
            Ok(())
        }
        fn scene_store(&mut self, group_id: u16, scene_id: u8) -> Result<(), GatewayError> {
            self.log(format!("scene_store {group_id} {scene_id}"));
            Ok(())
        }
        fn scene_recall(&mut self, group_id: u16, scene_id: u8) -> Result<(), GatewayError> {
            self.log(format!("scene_recall {group_id} {scene_id}"));
            Ok(())
        }
        fn read_attr(
            &mut self,
            short_addr: u16,
            endpoint: u8,
            cluster_id: u16,
            attr_id: u16,
        ) -> Result<(), GatewayError> {
            self.log(format!("read_attr {short_addr:#06x} {endpoint} {cluster_id:#06x} {attr_id:#06x}"));
            Ok(())
        }
        fn configure_reporting(
            &mut self,
            _short_addr: u16,
            _endpoint: u8,
            cluster_id: u16,
            _attr_id: u16,
            min_interval_s: u16,
            max_interval_s: u16,
            reportable_change: u16,
        ) -> Result<(), GatewayError> {
            self.log(format!(
                "config_report {cluster_id:#06x} {min_interval_s} {max_interval_s} {reportable_change}"
            ));
            Ok(())
        }
        fn bind(
            &mut self,
            src_uid: DeviceUid,
            _src_endpoint: u8,
            cluster_id: u16,
            dst_uid: DeviceUid,
            _dst_endpoint: u8,
            unbind: bool,
        ) -> Result<(), GatewayError> {
            self.log(format!("bind {src_uid} {cluster_id:#06x} {dst_uid} unbind={unbind}"));
            Ok(())
        }
        fn add_group(
            &mut self,
            short_addr: u16,
            endpoint: u8,
            group_id: u16,
        ) -> Result<(), GatewayError> {
            self.log(format!("add_group {short_addr:#06x} {endpoint} {group_id:#06x}"));
            Ok(())
        }
        fn mgmt_leave(
            &mut self,
            uid: DeviceUid,
            _short_addr: u16,
            rejoin: bool,
        ) -> Result<(), GatewayError> {
            self.log(format!("mgmt_leave {uid} rejoin={rejoin}"));
            Ok(())
        }
        fn ieee_addr_req(&mut self, short_addr: u16) -> Result<(), GatewayError> {
            self.log(format!("ieee_addr_req {short_addr:#06x}"));
            Ok(())
        }
        fn active_ep_req(&mut self, short_addr: u16) -> Result<(), GatewayError> {
            self.log(format!("active_ep_req {short_addr:#06x}"));
            Ok(())
        }
        fn simple_desc_req(&mut self, short_addr: u16, endpoint: u8) -> Result<(), GatewayError> {
            self.log(format!("simple_desc_req {short_addr:#06x} {endpoint}"));
            Ok(())
        }
    }

    async fn drain() {
        // Let the worker task run the queued jobs.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    fn known_device(registry: &DeviceRegistry, v: u64, short: u16) -> DeviceUid {
        let uid = DeviceUid::new(v);
        registry.upsert(DeviceRecord::new(uid, short)).unwrap();
        uid
    }

    #[tokio::test]
    async fn test_permit_join_default() {
        let (radio, calls) = RecordingRadio::new();
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::start(radio, registry, bus);

        scheduler.permit_join(0).unwrap();
        scheduler.permit_join(60).unwrap();
        drain().await;
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["permit_join 180", "permit_join 60"]
        );
    }

    #[tokio::test]
    async fn test_validation_before_stack() {
        let (radio, calls) = RecordingRadio::new();
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::start(radio, registry.clone(), bus);
        let uid = known_device(&registry, 1, 0x1000);

        assert_eq!(
            scheduler.onoff_cmd(uid, 0, OnOffCommand::On).unwrap_err().kind,
            ErrorKind::InvalidArgs
        );
        assert_eq!(
            scheduler
                .level_move_to_level(uid, 1, 255, 0)
                .unwrap_err()
                .kind,
            ErrorKind::InvalidArgs
        );
        assert_eq!(
            scheduler
                .level_move_to_level(uid, 1, 100, 60_001)
                .unwrap_err()
                .kind,
            ErrorKind::InvalidArgs
        );
        assert_eq!(
            scheduler
                .color_move_to_temp(uid, 1, 1001, 0)
                .unwrap_err()
                .kind,
            ErrorKind::InvalidArgs
        );
        drain().await;
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_and_scene_validation() {
        let (radio, calls) = RecordingRadio::new();
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::start(radio, registry, bus);

        for g in [0u16, 0xFFFF] {
            let err = scheduler
                .schedule_group_action(
                    g,
                    ZigbeeCommand::OnOff {
                        target: Target::Group(g),
                        cmd: OnOffCommand::On,
                    },
                )
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgs);
        }
        assert_eq!(
            scheduler.scene_recall(0x0002, 0).unwrap_err().kind,
            ErrorKind::InvalidArgs
        );

        scheduler.scene_recall(0x0002, 1).unwrap();
        drain().await;
        assert_eq!(calls.lock().unwrap().as_slice(), ["scene_recall 2 1"]);
    }

    #[tokio::test]
    async fn test_unknown_device_not_ready() {
        let (radio, _calls) = RecordingRadio::new();
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::start(radio, registry.clone(), bus);

        // scheduling succeeds immediately, the failure surfaces as an event
        let uid = DeviceUid::new(99);
        scheduler.onoff_cmd(uid, 1, OnOffCommand::On).unwrap();

        // read_attr resolves up front and reports directly
        assert_eq!(
            scheduler.read_attr(uid, 1, 0x0006, 0).unwrap_err().kind,
            ErrorKind::NotFound
        );

        let mut parked = DeviceRecord::new(DeviceUid::new(7), 0xFFFF);
        parked.set_name("ghost");
        registry.upsert(parked).unwrap();
        assert_eq!(
            scheduler
                .read_attr(DeviceUid::new(7), 1, 0x0006, 0)
                .unwrap_err()
                .kind,
            ErrorKind::NotReady
        );
    }

    #[tokio::test]
    async fn test_command_failure_publishes_event() {
        let (radio, _calls) = RecordingRadio::new();
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let scheduler = Scheduler::start(radio, registry, bus);

        // unknown device resolves inside the worker and fails there
        scheduler
            .onoff_cmd(DeviceUid::new(42), 1, OnOffCommand::On)
            .unwrap();
        drain().await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "zigbee_cmd_failed");
    }

    #[tokio::test]
    async fn test_transition_ms_to_tenths() {
        assert_eq!(ms_to_tenths(0), 0);
        assert_eq!(ms_to_tenths(49), 0);
        assert_eq!(ms_to_tenths(50), 1);
        assert_eq!(ms_to_tenths(1500), 15);
        assert_eq!(ms_to_tenths(u32::MAX), 0xFFFF);
    }

    #[tokio::test]
    async fn test_discovery_throttle() {
        let (radio, calls) = RecordingRadio::new();
        let registry = Arc::new(DeviceRegistry::new());
        let bus = Arc::new(EventBus::new());
        let scheduler = Scheduler::start(radio, registry, bus);

        scheduler.discover_by_short(0x1234).unwrap();
        scheduler.discover_by_short(0x1234).unwrap(); // throttled
        scheduler.discover_by_short(0x5678).unwrap(); // different short
        drain().await;
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["ieee_addr_req 0x1234", "ieee_addr_req 0x5678"]
        );
    }

    #[test]
    fn test_token_at_most_once_and_reuse() {
        let mut table = TokenTable::new();
        let token = table
            .claim(SchedulerOp::PermitJoin { seconds: 10 })
            .unwrap();
        assert!(table.take(token).is_some());
        assert!(table.take(token).is_none());

        // slot is free again; claiming eventually reuses it
        for _ in 0..TOKEN_TABLE_SIZE * 2 {
            if let Some(t) = table.claim(SchedulerOp::PermitJoin { seconds: 1 }) {
                table.take(t);
            }
        }
    }

    #[test]
    fn test_token_table_exhaustion() {
        let mut table = TokenTable::new();
        let mut claimed = 0;
        while table.claim(SchedulerOp::PermitJoin { seconds: 1 }).is_some() {
            claimed += 1;
        }
        // token 0 is reserved, so 255 usable slots
        assert_eq!(claimed, TOKEN_TABLE_SIZE - 1);
    }
}
