//! Compiler: portable description -> compiled container
//!
//! Any invalid field aborts the whole compile; nothing partial is ever
//! produced. UID strings are normalized to their canonical lowercase
//! form so later comparisons can stay string-based.

use gateway_core::uid::DeviceUid;

use crate::compiled::{
    ActionKind, ActionRecord, AutomationRecord, CompiledAutomations, CondOp, ConditionRecord,
    TriggerEventType, TriggerRecord, ACTION_FLAG_UNBIND, COND_VAL_BOOL, COND_VAL_F64, MODE_SINGLE,
};
use crate::error::AutomationError;
use crate::model::{parse_flex, ActionSpec, AutomationSpec, ConditionSpec, TriggerSpec};

const MAX_TRANSITION_MS: u64 = 60_000;

fn canonical_uid(raw: &str) -> Result<String, AutomationError> {
    let uid: DeviceUid = raw
        .parse()
        .map_err(|_| AutomationError::Invalid(format!("bad device_uid: {raw}")))?;
    Ok(uid.to_string())
}

fn compile_trigger(
    out: &mut CompiledAutomations,
    spec: &TriggerSpec,
) -> Result<TriggerRecord, AutomationError> {
    if let Some(t) = &spec.trigger_type {
        if t != "event" {
            return Err(AutomationError::Invalid(format!("bad trigger type: {t}")));
        }
    }
    let event_type = TriggerEventType::from_name(&spec.event_type)
        .ok_or_else(|| AutomationError::Invalid(format!("bad event_type: {}", spec.event_type)))?;

    let mut record = TriggerRecord {
        event_type: event_type as u8,
        ..Default::default()
    };

    if let Some(m) = &spec.match_spec {
        if let Some(uid) = &m.device_uid {
            record.device_uid_off = out.add_string(&canonical_uid(uid)?);
        }
        if let Some(p) = &m.payload {
            if let Some(ep) = p.endpoint {
                let ep = ep.get();
                if ep == 0 || ep > 240 {
                    return Err(AutomationError::Invalid(format!("bad endpoint: {ep}")));
                }
                record.endpoint = ep as u8;
            }
            match event_type {
                TriggerEventType::ZigbeeCommand => {
                    if let Some(cmd) = &p.cmd {
                        record.cmd_off = out.add_string(cmd);
                    }
                    if let Some(cluster) = p.cluster {
                        record.cluster_id = u16::try_from(cluster.get())
                            .map_err(|_| AutomationError::Invalid("cluster over u16".into()))?;
                    }
                }
                TriggerEventType::ZigbeeAttrReport => {
                    if let Some(cluster) = p.cluster {
                        record.cluster_id = u16::try_from(cluster.get())
                            .map_err(|_| AutomationError::Invalid("cluster over u16".into()))?;
                    }
                    if let Some(attr) = p.attr {
                        record.attr_id = u16::try_from(attr.get())
                            .map_err(|_| AutomationError::Invalid("attr over u16".into()))?;
                    }
                }
                TriggerEventType::DeviceJoin | TriggerEventType::DeviceLeave => {}
            }
        }
    }
    Ok(record)
}

fn compile_condition(
    out: &mut CompiledAutomations,
    spec: &ConditionSpec,
) -> Result<ConditionRecord, AutomationError> {
    if let Some(t) = &spec.condition_type {
        if t != "state" {
            return Err(AutomationError::Invalid(format!("bad condition type: {t}")));
        }
    }
    let op = CondOp::from_name(&spec.op)
        .ok_or_else(|| AutomationError::Invalid(format!("bad operator: {}", spec.op)))?;
    if spec.state_ref.key.is_empty() {
        return Err(AutomationError::Invalid("empty state key".into()));
    }

    let device_uid_off = out.add_string(&canonical_uid(&spec.state_ref.device_uid)?);
    let key_off = out.add_string(&spec.state_ref.key);

    let mut record = ConditionRecord {
        op: op as u8,
        val_type: COND_VAL_F64,
        value_bool: false,
        device_uid_off,
        key_off,
        value_f64: 0.0,
    };

    match &spec.value {
        serde_json::Value::Bool(b) => {
            record.val_type = COND_VAL_BOOL;
            record.value_bool = *b;
        }
        serde_json::Value::Number(n) => {
            record.value_f64 = n
                .as_f64()
                .ok_or_else(|| AutomationError::Invalid("bad numeric value".into()))?;
        }
        serde_json::Value::String(s) => match s.as_str() {
            "true" => {
                record.val_type = COND_VAL_BOOL;
                record.value_bool = true;
            }
            "false" => {
                record.val_type = COND_VAL_BOOL;
                record.value_bool = false;
            }
            other => {
                record.value_f64 = other
                    .parse::<f64>()
                    .ok()
                    .or_else(|| parse_flex(other).map(|f| f.get() as f64))
                    .ok_or_else(|| {
                        AutomationError::Invalid(format!("bad condition value: {other}"))
                    })?;
            }
        },
        other => {
            return Err(AutomationError::Invalid(format!(
                "bad condition value: {other}"
            )));
        }
    }
    Ok(record)
}

fn require_u16_range(
    value: Option<crate::model::Flex>,
    max: u64,
    min: u64,
    what: &str,
) -> Result<u16, AutomationError> {
    let v = value
        .ok_or_else(|| AutomationError::Invalid(format!("missing {what}")))?
        .get();
    if v < min || v > max {
        return Err(AutomationError::Invalid(format!("bad {what}: {v}")));
    }
    Ok(v as u16)
}

fn group_id_of(spec: &ActionSpec) -> Result<Option<u16>, AutomationError> {
    match spec.group_id {
        None => Ok(None),
        Some(g) => {
            let g = g.get();
            if g == 0 || g >= 0xFFFF {
                return Err(AutomationError::Invalid(format!("bad group_id: {g}")));
            }
            Ok(Some(g as u16))
        }
    }
}

fn endpoint_of(spec: &ActionSpec) -> Result<u8, AutomationError> {
    let ep = spec
        .endpoint
        .ok_or_else(|| AutomationError::Invalid("missing endpoint".into()))?
        .get();
    if ep == 0 || ep > 240 {
        return Err(AutomationError::Invalid(format!("bad endpoint: {ep}")));
    }
    Ok(ep as u8)
}

fn transition_of(spec: &ActionSpec) -> Result<u32, AutomationError> {
    let t = spec.transition_ms.unwrap_or_default().get();
    if t > MAX_TRANSITION_MS {
        return Err(AutomationError::Invalid(format!("bad transition_ms: {t}")));
    }
    Ok(t as u32)
}

pub(crate) fn compile_action_record(
    out: &mut CompiledAutomations,
    spec: &ActionSpec,
) -> Result<ActionRecord, AutomationError> {
    if let Some(t) = &spec.action_type {
        if t != "zigbee" {
            return Err(AutomationError::Invalid(format!("bad action type: {t}")));
        }
    }

    let mut record = ActionRecord {
        cmd_off: out.add_string(&spec.cmd),
        ..Default::default()
    };

    let group = group_id_of(spec)?;

    fn unicast_target(
        out: &mut CompiledAutomations,
        record: &mut ActionRecord,
        spec: &ActionSpec,
    ) -> Result<(), AutomationError> {
        let uid = spec
            .device_uid
            .as_deref()
            .ok_or_else(|| AutomationError::Invalid("missing device_uid".into()))?;
        record.device_uid_off = out.add_string(&canonical_uid(uid)?);
        record.endpoint = endpoint_of(spec)?;
        Ok(())
    }

    match spec.cmd.as_str() {
        "onoff.on" | "onoff.off" | "onoff.toggle" => {
            if let Some(g) = group {
                record.kind = ActionKind::Group as u8;
                record.group_id = g;
            } else {
                record.kind = ActionKind::Device as u8;
                unicast_target(out, &mut record, spec)?;
            }
        }
        "level.move_to_level" => {
            let level = spec
                .level
                .ok_or_else(|| AutomationError::Invalid("missing level".into()))?
                .get();
            if level > 254 {
                return Err(AutomationError::Invalid(format!("bad level: {level}")));
            }
            record.arg0 = level as u32;
            record.arg1 = transition_of(spec)?;
            if let Some(g) = group {
                record.kind = ActionKind::Group as u8;
                record.group_id = g;
            } else {
                record.kind = ActionKind::Device as u8;
                unicast_target(out, &mut record, spec)?;
            }
        }
        "color.move_to_color_xy" => {
            record.arg0 = u32::from(require_u16_range(spec.x, 65_535, 0, "x")?);
            record.arg1 = u32::from(require_u16_range(spec.y, 65_535, 0, "y")?);
            record.arg2 = transition_of(spec)?;
            if let Some(g) = group {
                record.kind = ActionKind::Group as u8;
                record.group_id = g;
            } else {
                record.kind = ActionKind::Device as u8;
                unicast_target(out, &mut record, spec)?;
            }
        }
        "color.move_to_color_temperature" => {
            record.arg0 = u32::from(require_u16_range(spec.mireds, 1000, 1, "mireds")?);
            record.arg1 = transition_of(spec)?;
            if let Some(g) = group {
                record.kind = ActionKind::Group as u8;
                record.group_id = g;
            } else {
                record.kind = ActionKind::Device as u8;
                unicast_target(out, &mut record, spec)?;
            }
        }
        "scene.store" | "scene.recall" => {
            record.kind = ActionKind::Scene as u8;
            record.group_id =
                group.ok_or_else(|| AutomationError::Invalid("missing group_id".into()))?;
            record.scene_id = require_u16_range(spec.scene_id, 255, 1, "scene_id")? as u8;
        }
        "bind" | "unbind" => {
            record.kind = ActionKind::Bind as u8;
            unicast_target(out, &mut record, spec)?;
            let dst = spec
                .dst_device_uid
                .as_deref()
                .ok_or_else(|| AutomationError::Invalid("missing dst_device_uid".into()))?;
            record.dst_uid_off = out.add_string(&canonical_uid(dst)?);
            let dst_ep = spec
                .dst_endpoint
                .ok_or_else(|| AutomationError::Invalid("missing dst_endpoint".into()))?
                .get();
            if dst_ep == 0 || dst_ep > 240 {
                return Err(AutomationError::Invalid(format!("bad dst_endpoint: {dst_ep}")));
            }
            record.dst_endpoint = dst_ep as u8;
            record.cluster_id = require_u16_range(spec.cluster_id, 65_535, 1, "cluster_id")?;
            if spec.cmd == "unbind" {
                record.flags |= ACTION_FLAG_UNBIND;
            }
        }
        other => {
            return Err(AutomationError::Invalid(format!("unknown cmd: {other}")));
        }
    }
    Ok(record)
}

/// Compile one portable automation into a single-entry container.
pub fn compile_automation(spec: &AutomationSpec) -> Result<CompiledAutomations, AutomationError> {
    if spec.triggers.is_empty() {
        return Err(AutomationError::Invalid("automation needs triggers".into()));
    }
    if spec.actions.is_empty() {
        return Err(AutomationError::Invalid("automation needs actions".into()));
    }

    let mut out = CompiledAutomations::new();

    let id = match &spec.id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => uuid::Uuid::new_v4().to_string(),
    };
    let id_off = out.add_string(&id);
    let name_off = out.add_string(spec.name.as_deref().unwrap_or(""));

    for trigger in &spec.triggers {
        let record = compile_trigger(&mut out, trigger)?;
        out.triggers.push(record);
    }
    for condition in &spec.conditions {
        let record = compile_condition(&mut out, condition)?;
        out.conditions.push(record);
    }
    for action in &spec.actions {
        let record = compile_action_record(&mut out, action)?;
        out.actions.push(record);
    }

    out.automations.push(AutomationRecord {
        id_off,
        name_off,
        enabled: spec.enabled,
        mode: MODE_SINGLE,
        triggers_index: 0,
        triggers_count: out.triggers.len() as u32,
        conditions_index: 0,
        conditions_count: out.conditions.len() as u32,
        actions_index: 0,
        actions_count: out.actions.len() as u32,
    });

    out.validate()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> AutomationSpec {
        serde_json::from_str(json).unwrap()
    }

    const DEMO: &str = r#"{
        "id": "demo1",
        "name": "demo",
        "triggers": [{
            "event_type": "zigbee.command",
            "match": {
                "device_uid": "0x00124B0012345678",
                "payload": { "endpoint": 1, "cmd": "toggle", "cluster": "0x0006" }
            }
        }],
        "actions": [{
            "cmd": "onoff.toggle",
            "device_uid": "0x00124b0011111111",
            "endpoint": 1
        }]
    }"#;

    #[test]
    fn test_compile_demo() {
        let compiled = compile_automation(&spec(DEMO)).unwrap();
        assert_eq!(compiled.automations.len(), 1);
        let auto = &compiled.automations[0];
        assert_eq!(compiled.str_at(auto.id_off), "demo1");
        assert!(auto.enabled);

        let trig = &compiled.triggers[0];
        assert_eq!(trig.event_type, TriggerEventType::ZigbeeCommand as u8);
        // UID normalized to lowercase canonical form
        assert_eq!(compiled.str_at(trig.device_uid_off), "0x00124b0012345678");
        assert_eq!(trig.cluster_id, 0x0006);
        assert_eq!(compiled.str_at(trig.cmd_off), "toggle");

        let act = &compiled.actions[0];
        assert_eq!(act.kind, ActionKind::Device as u8);
        assert_eq!(act.endpoint, 1);
    }

    #[test]
    fn test_compile_then_serialize_roundtrip() {
        let compiled = compile_automation(&spec(DEMO)).unwrap();
        let bytes = compiled.serialize();
        let decoded = CompiledAutomations::deserialize(&bytes).unwrap();
        assert_eq!(decoded, compiled);
    }

    #[test]
    fn test_group_action() {
        let compiled = compile_automation(&spec(
            r#"{
                "triggers": [{ "event_type": "device.join" }],
                "actions": [{ "cmd": "onoff.on", "group_id": "0x0003" }]
            }"#,
        ))
        .unwrap();
        let act = &compiled.actions[0];
        assert_eq!(act.kind, ActionKind::Group as u8);
        assert_eq!(act.group_id, 3);
        // generated id is present
        assert_ne!(compiled.automations[0].id_off, 0);
    }

    #[test]
    fn test_bad_group_rejected() {
        for g in ["0", "65535"] {
            let json = format!(
                r#"{{
                    "triggers": [{{ "event_type": "device.join" }}],
                    "actions": [{{ "cmd": "onoff.on", "group_id": {g} }}]
                }}"#
            );
            assert!(compile_automation(&spec(&json)).is_err());
        }
    }

    #[test]
    fn test_bind_action() {
        let compiled = compile_automation(&spec(
            r#"{
                "triggers": [{ "event_type": "device.join" }],
                "actions": [{
                    "cmd": "unbind",
                    "device_uid": "0x00124b0012345678", "endpoint": 1,
                    "dst_device_uid": "0x00124b0011111111", "dst_endpoint": 1,
                    "cluster_id": "0x0006"
                }]
            }"#,
        ))
        .unwrap();
        let act = &compiled.actions[0];
        assert_eq!(act.kind, ActionKind::Bind as u8);
        assert_eq!(act.flags & ACTION_FLAG_UNBIND, ACTION_FLAG_UNBIND);
        assert_eq!(act.cluster_id, 0x0006);
    }

    #[test]
    fn test_condition_value_coercion() {
        let compiled = compile_automation(&spec(
            r#"{
                "triggers": [{ "event_type": "zigbee.attr_report" }],
                "conditions": [
                    { "op": "==", "ref": { "device_uid": "0x00124b0012345678", "key": "onoff" }, "value": true },
                    { "op": ">", "ref": { "device_uid": "0x00124b0012345678", "key": "temperature_c" }, "value": 21.5 },
                    { "op": "<=", "ref": { "device_uid": "0x00124b0012345678", "key": "level" }, "value": "128" }
                ],
                "actions": [{ "cmd": "onoff.off", "device_uid": "0x00124b0011111111", "endpoint": 1 }]
            }"#,
        ))
        .unwrap();
        assert_eq!(compiled.conditions[0].val_type, COND_VAL_BOOL);
        assert!(compiled.conditions[0].value_bool);
        assert_eq!(compiled.conditions[1].val_type, COND_VAL_F64);
        assert!((compiled.conditions[1].value_f64 - 21.5).abs() < 1e-9);
        assert!((compiled.conditions[2].value_f64 - 128.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_aborts_whole_compile() {
        // second action has an out-of-range level: nothing is produced
        let result = compile_automation(&spec(
            r#"{
                "triggers": [{ "event_type": "device.join" }],
                "actions": [
                    { "cmd": "onoff.on", "device_uid": "0x00124b0012345678", "endpoint": 1 },
                    { "cmd": "level.move_to_level", "device_uid": "0x00124b0012345678", "endpoint": 1, "level": 255 }
                ]
            }"#,
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_triggers_rejected() {
        assert!(compile_automation(&spec(
            r#"{ "triggers": [], "actions": [{ "cmd": "onoff.on", "group_id": 2 }] }"#
        ))
        .is_err());
    }
}
