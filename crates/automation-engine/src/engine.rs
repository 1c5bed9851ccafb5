//! Rules engine
//!
//! Listens on the event bus, keeps a double-buffered cache of the
//! compiled automations plus their trigger index, and evaluates
//! matched automations against conditions before dispatching actions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use gateway_core::event::{EventBus, GwEvent};
use gateway_core::state::{StateStore, StateValue};
use tokio::sync::Notify;

use crate::compiled::{
    AutomationRecord, CompiledAutomations, CondOp, ConditionRecord, TriggerEventType,
    TriggerRecord, COND_VAL_BOOL,
};
use crate::executor::{ActionExecutor, CommandPort};
use crate::index::{candidate_mask, key_for_trigger, EventFields, TriggerIndex, AUTOMATION_CAP};
use crate::store::AutomationStore;

/// Depth of the engine's event queue; overflow drops the oldest.
pub const RULES_EVENT_QUEUE_CAP: usize = 96;

/// Float comparison tolerance for `==` / `!=`.
const F64_EPSILON: f64 = 1e-6;

/// Snapshot of the automations plus their trigger index
struct RulesCache {
    compiled: CompiledAutomations,
    index: TriggerIndex,
}

impl RulesCache {
    fn build(compiled: CompiledAutomations) -> Self {
        let mut index = TriggerIndex::new();
        if compiled.automations.len() > AUTOMATION_CAP {
            tracing::warn!(
                count = compiled.automations.len(),
                cap = AUTOMATION_CAP,
                "automations over index cap are not indexed"
            );
        }
        for (i, auto) in compiled.automations.iter().enumerate().take(AUTOMATION_CAP) {
            if !auto.enabled {
                continue;
            }
            for trigger in compiled.triggers_of(auto) {
                index.insert(&key_for_trigger(&compiled, trigger), i);
            }
        }
        Self { compiled, index }
    }
}

/// Bounded event queue with drop-oldest overflow
struct EventQueue {
    inner: Mutex<VecDeque<GwEvent>>,
    notify: Notify,
    cap: usize,
}

impl EventQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    fn push(&self, event: GwEvent) {
        {
            let mut queue = self.inner.lock().expect("rules queue poisoned");
            if queue.len() >= self.cap {
                queue.pop_front();
                tracing::warn!("rules event queue overflow, oldest dropped");
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> GwEvent {
        loop {
            if let Some(event) = self.inner.lock().expect("rules queue poisoned").pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

/// The rules engine
pub struct RulesEngine<P: CommandPort> {
    store: Arc<AutomationStore>,
    states: Arc<StateStore>,
    bus: Arc<EventBus>,
    executor: ActionExecutor<P>,
    cache: RwLock<Arc<RulesCache>>,
    queue: EventQueue,
}

impl<P: CommandPort> RulesEngine<P> {
    #[must_use]
    pub fn new(
        store: Arc<AutomationStore>,
        states: Arc<StateStore>,
        bus: Arc<EventBus>,
        port: Arc<P>,
    ) -> Arc<Self> {
        let cache = RulesCache::build(store.snapshot());
        Arc::new(Self {
            store,
            states,
            bus,
            executor: ActionExecutor::new(port),
            cache: RwLock::new(Arc::new(cache)),
            queue: EventQueue::new(RULES_EVENT_QUEUE_CAP),
        })
    }

    /// Rebuild the cache from the store and swap it in.
    pub fn reload(&self) {
        let fresh = Arc::new(RulesCache::build(self.store.snapshot()));
        *self.cache.write().expect("rules cache poisoned") = fresh;
        tracing::debug!("rules cache reloaded");
    }

    /// Start the listener and worker tasks.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if matches!(
                            event.event_type.as_str(),
                            "automation_saved" | "automation_removed" | "automation_enabled"
                        ) {
                            engine.reload();
                            continue;
                        }
                        engine.queue.push(event);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("rules engine lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bus closed, rules listener stopping");
                        break;
                    }
                }
            }
        });

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = engine.queue.pop().await;
                engine.process_event(&event).await;
            }
        });
        tracing::info!("rules engine started");
    }

    /// Evaluate one event against the cached automations.
    pub async fn process_event(&self, event: &GwEvent) {
        if event.event_type.is_empty() || event.source == "rules" {
            return;
        }
        let Some(evt_type) = TriggerEventType::from_name(&event.event_type) else {
            return;
        };

        let cache = self.cache.read().expect("rules cache poisoned").clone();
        if cache.compiled.automations.is_empty() {
            return;
        }

        let fields = EventFields {
            uid: event.device_uid.map(|u| u.to_string()),
            endpoint: event.endpoint,
            cmd: event.cmd.clone(),
            cluster_id: event.cluster_id,
            attr_id: event.attr_id,
        };

        let mask = candidate_mask(&cache.index, evt_type, &fields);
        if mask == 0 {
            return;
        }

        for (i, auto) in cache
            .compiled
            .automations
            .iter()
            .enumerate()
            .take(AUTOMATION_CAP)
        {
            if mask & (1 << i) == 0 || !auto.enabled {
                continue;
            }

            let matched = cache
                .compiled
                .triggers_of(auto)
                .iter()
                .any(|t| trigger_matches(&cache.compiled, t, evt_type, &fields));
            if !matched {
                continue;
            }
            if !self.conditions_pass(&cache.compiled, auto) {
                continue;
            }

            let id = cache.compiled.str_at(auto.id_off).to_string();
            self.publish_fired(event, &id);
            self.run_actions(&cache.compiled, auto, &id).await;
        }
    }

    /// Execute the actions of one fired automation, in declared order.
    async fn run_actions(&self, compiled: &CompiledAutomations, auto: &AutomationRecord, id: &str) {
        for (idx, action) in compiled.actions_of(auto).iter().enumerate() {
            match self.executor.execute_compiled(compiled, action).await {
                Ok(()) => self.publish_action(id, idx, None),
                Err(e) => {
                    self.publish_action(id, idx, Some(e.message.as_str()));
                    break;
                }
            }
        }
    }

    /// Conditions are ANDed; a missing state key fails the automation.
    fn conditions_pass(&self, compiled: &CompiledAutomations, auto: &AutomationRecord) -> bool {
        for cond in compiled.conditions_of(auto) {
            if !self.condition_passes(compiled, cond) {
                return false;
            }
        }
        true
    }

    fn condition_passes(&self, compiled: &CompiledAutomations, cond: &ConditionRecord) -> bool {
        let uid_str = compiled.str_at(cond.device_uid_off);
        let key = compiled.str_at(cond.key_off);
        if uid_str.is_empty() || key.is_empty() {
            return false;
        }
        let Ok(uid) = uid_str.parse::<gateway_core::uid::DeviceUid>() else {
            return false;
        };
        let Some(entry) = self.states.get(uid, key) else {
            return false;
        };
        let Some(op) = CondOp::from_u8(cond.op) else {
            return false;
        };

        let (actual_n, actual_b) = coerce(entry.value);
        if cond.val_type == COND_VAL_BOOL {
            let expected = cond.value_bool;
            !matches!(
                (op, actual_b == expected),
                (CondOp::Eq, false) | (CondOp::Ne, true)
            )
        } else {
            let expected = cond.value_f64;
            match op {
                CondOp::Eq => (actual_n - expected).abs() <= F64_EPSILON,
                CondOp::Ne => (actual_n - expected).abs() > F64_EPSILON,
                CondOp::Gt => actual_n > expected,
                CondOp::Lt => actual_n < expected,
                CondOp::Ge => actual_n >= expected,
                CondOp::Le => actual_n <= expected,
            }
        }
    }

    fn publish_fired(&self, event: &GwEvent, id: &str) {
        let mut fired = GwEvent::new("rules.fired", "rules").with_msg(format!("automation_id={id}"));
        if let Some(uid) = event.device_uid {
            fired = fired.with_device(uid, event.short_addr);
        }
        self.bus.publish(fired);
    }

    fn publish_action(&self, id: &str, idx: usize, err: Option<&str>) {
        let msg = match err {
            Some(err) => format!("automation_id={id} idx={idx} ok=0 err={err}"),
            None => format!("automation_id={id} idx={idx} ok=1"),
        };
        self.bus.publish(GwEvent::new("rules.action", "rules").with_msg(msg));
    }
}

/// Full (cheap) trigger match, applied to index candidates.
fn trigger_matches(
    compiled: &CompiledAutomations,
    trigger: &TriggerRecord,
    evt_type: TriggerEventType,
    fields: &EventFields,
) -> bool {
    if trigger.event_type != evt_type as u8 {
        return false;
    }
    if trigger.device_uid_off != 0 {
        let want = compiled.str_at(trigger.device_uid_off);
        if fields.uid.as_deref() != Some(want) {
            return false;
        }
    }
    if trigger.endpoint != 0 && fields.endpoint != Some(trigger.endpoint) {
        return false;
    }

    match evt_type {
        TriggerEventType::ZigbeeCommand => {
            if trigger.cmd_off != 0 {
                let want = compiled.str_at(trigger.cmd_off);
                if fields.cmd.as_deref() != Some(want) {
                    return false;
                }
            }
            if trigger.cluster_id != 0 && fields.cluster_id != Some(trigger.cluster_id) {
                return false;
            }
        }
        TriggerEventType::ZigbeeAttrReport => {
            if trigger.cluster_id != 0 && fields.cluster_id != Some(trigger.cluster_id) {
                return false;
            }
            if trigger.attr_id != 0 && fields.attr_id != Some(trigger.attr_id) {
                return false;
            }
        }
        TriggerEventType::DeviceJoin | TriggerEventType::DeviceLeave => {}
    }
    true
}

/// Coerce a state value to (number, bool) for condition evaluation.
fn coerce(value: StateValue) -> (f64, bool) {
    match value {
        StateValue::Bool(b) => (f64::from(u8::from(b)), b),
        StateValue::F32(f) => (f64::from(f), f64::from(f).abs() > F64_EPSILON),
        StateValue::U32(v) => (f64::from(v), v != 0),
        StateValue::U64(v) => (v as f64, v != 0),
    }
}
