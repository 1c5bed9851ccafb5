//! Binary format for compiled automations (GWAR, version 2)
//!
//! A compiled container is a fixed header followed by four flat record
//! arrays and a string table. All integers are little-endian; records
//! have a fixed wire width so the arrays can be indexed directly.
//!
//! ```text
//! header (48 bytes)
//! automation records (36 bytes each)
//! trigger records    (16 bytes each)
//! condition records  (20 bytes each)
//! action records     (36 bytes each)
//! string table       (NUL-terminated UTF-8, offset 0 = "")
//! ```

use bytes::{Buf, BufMut};

use crate::error::AutomationError;

/// 'GWAR' little-endian.
pub const MAGIC: u32 = 0x5241_5747;
/// Container format version.
pub const VERSION: u16 = 2;
/// The only supported execution mode.
pub const MODE_SINGLE: u8 = 1;

/// Flag bit 0 on a bind-kind action: remove the binding.
pub const ACTION_FLAG_UNBIND: u32 = 1;

const HEADER_SIZE: usize = 48;
const AUTOMATION_SIZE: usize = 36;
const TRIGGER_SIZE: usize = 16;
const CONDITION_SIZE: usize = 20;
const ACTION_SIZE: usize = 36;

/// Event type tag constrained by a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TriggerEventType {
    ZigbeeCommand = 1,
    ZigbeeAttrReport = 2,
    DeviceJoin = 3,
    DeviceLeave = 4,
}

impl TriggerEventType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ZigbeeCommand),
            2 => Some(Self::ZigbeeAttrReport),
            3 => Some(Self::DeviceJoin),
            4 => Some(Self::DeviceLeave),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "zigbee.command" => Some(Self::ZigbeeCommand),
            "zigbee.attr_report" => Some(Self::ZigbeeAttrReport),
            "device.join" => Some(Self::DeviceJoin),
            "device.leave" => Some(Self::DeviceLeave),
            _ => None,
        }
    }
}

/// Condition operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CondOp {
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Lt = 4,
    Ge = 5,
    Le = 6,
}

impl CondOp {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Eq),
            2 => Some(Self::Ne),
            3 => Some(Self::Gt),
            4 => Some(Self::Lt),
            5 => Some(Self::Ge),
            6 => Some(Self::Le),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }
}

/// Condition value type tag
pub const COND_VAL_BOOL: u8 = 1;
pub const COND_VAL_F64: u8 = 2;

/// Action dispatch kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActionKind {
    Device = 1,
    Group = 2,
    Scene = 3,
    Bind = 4,
}

impl ActionKind {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Device),
            2 => Some(Self::Group),
            3 => Some(Self::Scene),
            4 => Some(Self::Bind),
            _ => None,
        }
    }
}

/// One automation: string refs plus index ranges into the flat arrays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomationRecord {
    pub id_off: u32,
    pub name_off: u32,
    pub enabled: bool,
    pub mode: u8,
    pub triggers_index: u32,
    pub triggers_count: u32,
    pub conditions_index: u32,
    pub conditions_count: u32,
    pub actions_index: u32,
    pub actions_count: u32,
}

/// One trigger; zero in a field means "don't constrain on it"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerRecord {
    pub event_type: u8,
    pub endpoint: u8,
    pub device_uid_off: u32,
    pub cmd_off: u32,
    pub cluster_id: u16,
    pub attr_id: u16,
}

/// One condition over a state key
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionRecord {
    pub op: u8,
    pub val_type: u8,
    pub value_bool: bool,
    pub device_uid_off: u32,
    pub key_off: u32,
    pub value_f64: f64,
}

/// One action record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActionRecord {
    pub kind: u8,
    pub endpoint: u8,
    pub group_id: u16,
    pub cmd_off: u32,
    pub device_uid_off: u32,
    pub dst_uid_off: u32,
    pub dst_endpoint: u8,
    pub scene_id: u8,
    pub cluster_id: u16,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub flags: u32,
}

/// In-memory compiled container
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledAutomations {
    pub automations: Vec<AutomationRecord>,
    pub triggers: Vec<TriggerRecord>,
    pub conditions: Vec<ConditionRecord>,
    pub actions: Vec<ActionRecord>,
    /// String table; byte 0 is always NUL so offset 0 reads as "".
    pub strings: Vec<u8>,
}

impl CompiledAutomations {
    #[must_use]
    pub fn new() -> Self {
        Self {
            automations: Vec::new(),
            triggers: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            strings: vec![0],
        }
    }

    /// Resolve a string-table offset; 0 or anything invalid reads as "".
    #[must_use]
    pub fn str_at(&self, off: u32) -> &str {
        let off = off as usize;
        if off == 0 || off >= self.strings.len() {
            return "";
        }
        let tail = &self.strings[off..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(0);
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    /// Triggers of one automation.
    #[must_use]
    pub fn triggers_of(&self, auto: &AutomationRecord) -> &[TriggerRecord] {
        let start = auto.triggers_index as usize;
        let end = start + auto.triggers_count as usize;
        &self.triggers[start..end]
    }

    /// Conditions of one automation.
    #[must_use]
    pub fn conditions_of(&self, auto: &AutomationRecord) -> &[ConditionRecord] {
        let start = auto.conditions_index as usize;
        let end = start + auto.conditions_count as usize;
        &self.conditions[start..end]
    }

    /// Actions of one automation.
    #[must_use]
    pub fn actions_of(&self, auto: &AutomationRecord) -> &[ActionRecord] {
        let start = auto.actions_index as usize;
        let end = start + auto.actions_count as usize;
        &self.actions[start..end]
    }

    /// Find an automation by its id string.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<(usize, &AutomationRecord)> {
        self.automations
            .iter()
            .enumerate()
            .find(|(_, a)| self.str_at(a.id_off) == id)
    }

    /// Intern a string, deduplicating; empty maps to offset 0.
    pub fn add_string(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        // de-dupe: linear scan over existing entries
        let mut off = 0usize;
        while off < self.strings.len() {
            let tail = &self.strings[off..];
            let end = tail.iter().position(|&b| b == 0).unwrap_or(0);
            if &tail[..end] == s.as_bytes() && off != 0 {
                return off as u32;
            }
            off += end + 1;
        }
        let new_off = self.strings.len() as u32;
        self.strings.extend_from_slice(s.as_bytes());
        self.strings.push(0);
        new_off
    }

    /// Append another container, rebasing indices and string offsets.
    pub fn append(&mut self, other: &CompiledAutomations) {
        let trig_base = self.triggers.len() as u32;
        let cond_base = self.conditions.len() as u32;
        let act_base = self.actions.len() as u32;

        let mut remap = |off: u32, this: &mut Self| -> u32 {
            if off == 0 {
                0
            } else {
                this.add_string(other.str_at(off))
            }
        };

        for auto in &other.automations {
            let id_off = remap(auto.id_off, self);
            let name_off = remap(auto.name_off, self);
            self.automations.push(AutomationRecord {
                id_off,
                name_off,
                triggers_index: auto.triggers_index + trig_base,
                conditions_index: auto.conditions_index + cond_base,
                actions_index: auto.actions_index + act_base,
                ..*auto
            });
        }
        for trig in &other.triggers {
            let device_uid_off = remap(trig.device_uid_off, self);
            let cmd_off = remap(trig.cmd_off, self);
            self.triggers.push(TriggerRecord {
                device_uid_off,
                cmd_off,
                ..*trig
            });
        }
        for cond in &other.conditions {
            let device_uid_off = remap(cond.device_uid_off, self);
            let key_off = remap(cond.key_off, self);
            self.conditions.push(ConditionRecord {
                device_uid_off,
                key_off,
                ..*cond
            });
        }
        for act in &other.actions {
            let cmd_off = remap(act.cmd_off, self);
            let device_uid_off = remap(act.device_uid_off, self);
            let dst_uid_off = remap(act.dst_uid_off, self);
            self.actions.push(ActionRecord {
                cmd_off,
                device_uid_off,
                dst_uid_off,
                ..*act
            });
        }
    }

    /// Extract a single automation into its own container.
    #[must_use]
    pub fn extract(&self, index: usize) -> CompiledAutomations {
        let auto = &self.automations[index];
        let mut out = CompiledAutomations::new();

        let id_off = out.add_string(self.str_at(auto.id_off));
        let name_off = out.add_string(self.str_at(auto.name_off));
        out.automations.push(AutomationRecord {
            id_off,
            name_off,
            triggers_index: 0,
            conditions_index: 0,
            actions_index: 0,
            ..*auto
        });

        for trig in self.triggers_of(auto) {
            let device_uid_off = out.add_string(self.str_at(trig.device_uid_off));
            let cmd_off = out.add_string(self.str_at(trig.cmd_off));
            out.triggers.push(TriggerRecord {
                device_uid_off,
                cmd_off,
                ..*trig
            });
        }
        for cond in self.conditions_of(auto) {
            let device_uid_off = out.add_string(self.str_at(cond.device_uid_off));
            let key_off = out.add_string(self.str_at(cond.key_off));
            out.conditions.push(ConditionRecord {
                device_uid_off,
                key_off,
                ..*cond
            });
        }
        for act in self.actions_of(auto) {
            let cmd_off = out.add_string(self.str_at(act.cmd_off));
            let device_uid_off = out.add_string(self.str_at(act.device_uid_off));
            let dst_uid_off = out.add_string(self.str_at(act.dst_uid_off));
            out.actions.push(ActionRecord {
                cmd_off,
                device_uid_off,
                dst_uid_off,
                ..*act
            });
        }
        out
    }

    /// Serialize into the contiguous binary form.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let automations_off = HEADER_SIZE;
        let triggers_off = automations_off + self.automations.len() * AUTOMATION_SIZE;
        let conditions_off = triggers_off + self.triggers.len() * TRIGGER_SIZE;
        let actions_off = conditions_off + self.conditions.len() * CONDITION_SIZE;
        let strings_off = actions_off + self.actions.len() * ACTION_SIZE;

        let mut buf = Vec::with_capacity(strings_off + self.strings.len());
        buf.put_u32_le(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u16_le(0); // reserved
        buf.put_u32_le(self.automations.len() as u32);
        buf.put_u32_le(self.triggers.len() as u32);
        buf.put_u32_le(self.conditions.len() as u32);
        buf.put_u32_le(self.actions.len() as u32);
        buf.put_u32_le(automations_off as u32);
        buf.put_u32_le(triggers_off as u32);
        buf.put_u32_le(conditions_off as u32);
        buf.put_u32_le(actions_off as u32);
        buf.put_u32_le(strings_off as u32);
        buf.put_u32_le(self.strings.len() as u32);

        for a in &self.automations {
            buf.put_u32_le(a.id_off);
            buf.put_u32_le(a.name_off);
            buf.put_u8(u8::from(a.enabled));
            buf.put_u8(a.mode);
            buf.put_u16_le(0); // reserved
            buf.put_u32_le(a.triggers_index);
            buf.put_u32_le(a.triggers_count);
            buf.put_u32_le(a.conditions_index);
            buf.put_u32_le(a.conditions_count);
            buf.put_u32_le(a.actions_index);
            buf.put_u32_le(a.actions_count);
        }
        for t in &self.triggers {
            buf.put_u8(t.event_type);
            buf.put_u8(t.endpoint);
            buf.put_u16_le(0); // reserved
            buf.put_u32_le(t.device_uid_off);
            buf.put_u32_le(t.cmd_off);
            buf.put_u16_le(t.cluster_id);
            buf.put_u16_le(t.attr_id);
        }
        for c in &self.conditions {
            buf.put_u8(c.op);
            buf.put_u8(c.val_type);
            buf.put_u8(u8::from(c.value_bool));
            buf.put_u8(0); // reserved
            buf.put_u32_le(c.device_uid_off);
            buf.put_u32_le(c.key_off);
            buf.put_f64_le(c.value_f64);
        }
        for a in &self.actions {
            buf.put_u8(a.kind);
            buf.put_u8(a.endpoint);
            buf.put_u16_le(a.group_id);
            buf.put_u32_le(a.cmd_off);
            buf.put_u32_le(a.device_uid_off);
            buf.put_u32_le(a.dst_uid_off);
            buf.put_u8(a.dst_endpoint);
            buf.put_u8(a.scene_id);
            buf.put_u16_le(a.cluster_id);
            buf.put_u32_le(a.arg0);
            buf.put_u32_le(a.arg1);
            buf.put_u32_le(a.arg2);
            buf.put_u32_le(a.flags);
        }
        buf.extend_from_slice(&self.strings);
        buf
    }

    /// Deserialize and fully validate a binary container.
    pub fn deserialize(data: &[u8]) -> Result<Self, AutomationError> {
        if data.len() < HEADER_SIZE {
            return Err(AutomationError::Format("header truncated".into()));
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(AutomationError::Format(format!("bad magic {magic:#010x}")));
        }
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(AutomationError::Format(format!(
                "unsupported version {version}"
            )));
        }
        let _reserved = buf.get_u16_le();
        let automation_count = buf.get_u32_le() as usize;
        let trigger_count = buf.get_u32_le() as usize;
        let condition_count = buf.get_u32_le() as usize;
        let action_count = buf.get_u32_le() as usize;
        let automations_off = buf.get_u32_le() as usize;
        let triggers_off = buf.get_u32_le() as usize;
        let conditions_off = buf.get_u32_le() as usize;
        let actions_off = buf.get_u32_le() as usize;
        let strings_off = buf.get_u32_le() as usize;
        let strings_size = buf.get_u32_le() as usize;

        let span = |off: usize, len: usize| -> Result<&[u8], AutomationError> {
            let end = off
                .checked_add(len)
                .ok_or_else(|| AutomationError::Format("offset overflow".into()))?;
            data.get(off..end)
                .ok_or_else(|| AutomationError::Format("array out of bounds".into()))
        };

        let mut automations = Vec::with_capacity(automation_count);
        let mut cursor = span(automations_off, automation_count * AUTOMATION_SIZE)?;
        for _ in 0..automation_count {
            let id_off = cursor.get_u32_le();
            let name_off = cursor.get_u32_le();
            let enabled = cursor.get_u8() != 0;
            let mode = cursor.get_u8();
            let _reserved = cursor.get_u16_le();
            if mode != MODE_SINGLE {
                return Err(AutomationError::Format(format!("unsupported mode {mode}")));
            }
            automations.push(AutomationRecord {
                id_off,
                name_off,
                enabled,
                mode,
                triggers_index: cursor.get_u32_le(),
                triggers_count: cursor.get_u32_le(),
                conditions_index: cursor.get_u32_le(),
                conditions_count: cursor.get_u32_le(),
                actions_index: cursor.get_u32_le(),
                actions_count: cursor.get_u32_le(),
            });
        }

        let mut triggers = Vec::with_capacity(trigger_count);
        let mut cursor = span(triggers_off, trigger_count * TRIGGER_SIZE)?;
        for _ in 0..trigger_count {
            let event_type = cursor.get_u8();
            let endpoint = cursor.get_u8();
            let _reserved = cursor.get_u16_le();
            if TriggerEventType::from_u8(event_type).is_none() {
                return Err(AutomationError::Format(format!(
                    "unknown trigger event type {event_type}"
                )));
            }
            triggers.push(TriggerRecord {
                event_type,
                endpoint,
                device_uid_off: cursor.get_u32_le(),
                cmd_off: cursor.get_u32_le(),
                cluster_id: cursor.get_u16_le(),
                attr_id: cursor.get_u16_le(),
            });
        }

        let mut conditions = Vec::with_capacity(condition_count);
        let mut cursor = span(conditions_off, condition_count * CONDITION_SIZE)?;
        for _ in 0..condition_count {
            let op = cursor.get_u8();
            let val_type = cursor.get_u8();
            let value_bool = cursor.get_u8() != 0;
            let _reserved = cursor.get_u8();
            if CondOp::from_u8(op).is_none() {
                return Err(AutomationError::Format(format!("unknown operator {op}")));
            }
            if val_type != COND_VAL_BOOL && val_type != COND_VAL_F64 {
                return Err(AutomationError::Format(format!(
                    "unknown condition value type {val_type}"
                )));
            }
            conditions.push(ConditionRecord {
                op,
                val_type,
                value_bool,
                device_uid_off: cursor.get_u32_le(),
                key_off: cursor.get_u32_le(),
                value_f64: cursor.get_f64_le(),
            });
        }

        let mut actions = Vec::with_capacity(action_count);
        let mut cursor = span(actions_off, action_count * ACTION_SIZE)?;
        for _ in 0..action_count {
            let kind = cursor.get_u8();
            if ActionKind::from_u8(kind).is_none() {
                return Err(AutomationError::Format(format!("unknown action kind {kind}")));
            }
            actions.push(ActionRecord {
                kind,
                endpoint: cursor.get_u8(),
                group_id: cursor.get_u16_le(),
                cmd_off: cursor.get_u32_le(),
                device_uid_off: cursor.get_u32_le(),
                dst_uid_off: cursor.get_u32_le(),
                dst_endpoint: cursor.get_u8(),
                scene_id: cursor.get_u8(),
                cluster_id: cursor.get_u16_le(),
                arg0: cursor.get_u32_le(),
                arg1: cursor.get_u32_le(),
                arg2: cursor.get_u32_le(),
                flags: cursor.get_u32_le(),
            });
        }

        let strings = span(strings_off, strings_size)?.to_vec();

        let compiled = Self {
            automations,
            triggers,
            conditions,
            actions,
            strings,
        };
        compiled.validate()?;
        Ok(compiled)
    }

    /// Check the container invariants.
    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.strings.is_empty() || self.strings[0] != 0 {
            return Err(AutomationError::Format("string table missing leading NUL".into()));
        }

        let check_str = |off: u32| -> Result<(), AutomationError> {
            let off = off as usize;
            if off == 0 {
                return Ok(());
            }
            if off >= self.strings.len() {
                return Err(AutomationError::Format("string offset out of range".into()));
            }
            let tail = &self.strings[off..];
            let Some(end) = tail.iter().position(|&b| b == 0) else {
                return Err(AutomationError::Format("string not NUL-terminated".into()));
            };
            std::str::from_utf8(&tail[..end])
                .map_err(|_| AutomationError::Format("string not UTF-8".into()))?;
            Ok(())
        };

        let mut trig_sum = 0u64;
        let mut cond_sum = 0u64;
        let mut act_sum = 0u64;
        for auto in &self.automations {
            check_str(auto.id_off)?;
            check_str(auto.name_off)?;
            let trig_end = u64::from(auto.triggers_index) + u64::from(auto.triggers_count);
            let cond_end = u64::from(auto.conditions_index) + u64::from(auto.conditions_count);
            let act_end = u64::from(auto.actions_index) + u64::from(auto.actions_count);
            if trig_end > self.triggers.len() as u64
                || cond_end > self.conditions.len() as u64
                || act_end > self.actions.len() as u64
            {
                return Err(AutomationError::Format("record range out of bounds".into()));
            }
            trig_sum += u64::from(auto.triggers_count);
            cond_sum += u64::from(auto.conditions_count);
            act_sum += u64::from(auto.actions_count);
        }
        if trig_sum != self.triggers.len() as u64
            || cond_sum != self.conditions.len() as u64
            || act_sum != self.actions.len() as u64
        {
            return Err(AutomationError::Format(
                "record counts disagree with automation sums".into(),
            ));
        }

        for trig in &self.triggers {
            check_str(trig.device_uid_off)?;
            check_str(trig.cmd_off)?;
        }
        for cond in &self.conditions {
            check_str(cond.device_uid_off)?;
            check_str(cond.key_off)?;
        }
        for act in &self.actions {
            check_str(act.cmd_off)?;
            check_str(act.device_uid_off)?;
            check_str(act.dst_uid_off)?;
        }
        Ok(())
    }
}
