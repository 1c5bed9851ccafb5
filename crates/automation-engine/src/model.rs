//! Portable automation description (authoring shape)
//!
//! The shape callers author and submit over the API. Numeric fields
//! tolerate string encoding (decimal or `0x` hex) on input.

use serde::{Deserialize, Deserializer};

/// A number that also accepts `"42"` and `"0x2A"` on input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flex(pub u64);

impl Flex {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Flex {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl<'de> Deserialize<'de> for Flex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Flex(n)),
            Raw::Text(s) => parse_flex(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("bad number: {s}"))),
        }
    }
}

/// Parse a decimal or `0x`-prefixed string.
#[must_use]
pub fn parse_flex(s: &str) -> Option<Flex> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok().map(Flex)
    } else {
        s.parse::<u64>().ok().map(Flex)
    }
}

/// A complete portable automation
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationSpec {
    /// Unique id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    pub actions: Vec<ActionSpec>,
}

fn default_enabled() -> bool {
    true
}

/// One event trigger
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSpec {
    #[serde(rename = "type", default)]
    pub trigger_type: Option<String>,
    pub event_type: String,
    #[serde(rename = "match", default)]
    pub match_spec: Option<MatchSpec>,
}

/// Optional trigger constraints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchSpec {
    #[serde(default)]
    pub device_uid: Option<String>,
    #[serde(default)]
    pub payload: Option<PayloadMatch>,
}

/// Payload-level trigger constraints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadMatch {
    #[serde(default)]
    pub endpoint: Option<Flex>,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub cluster: Option<Flex>,
    #[serde(default)]
    pub attr: Option<Flex>,
}

/// One state condition
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSpec {
    #[serde(rename = "type", default)]
    pub condition_type: Option<String>,
    pub op: String,
    #[serde(rename = "ref")]
    pub state_ref: StateRef,
    pub value: serde_json::Value,
}

/// Reference to one state key of one device
#[derive(Debug, Clone, Deserialize)]
pub struct StateRef {
    pub device_uid: String,
    pub key: String,
}

/// One action in portable form
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type", default)]
    pub action_type: Option<String>,
    pub cmd: String,
    #[serde(default)]
    pub device_uid: Option<String>,
    #[serde(default)]
    pub endpoint: Option<Flex>,
    #[serde(default)]
    pub group_id: Option<Flex>,
    #[serde(default)]
    pub level: Option<Flex>,
    #[serde(default)]
    pub transition_ms: Option<Flex>,
    #[serde(default)]
    pub x: Option<Flex>,
    #[serde(default)]
    pub y: Option<Flex>,
    #[serde(default)]
    pub mireds: Option<Flex>,
    #[serde(default)]
    pub scene_id: Option<Flex>,
    #[serde(default)]
    pub cluster_id: Option<Flex>,
    #[serde(default)]
    pub dst_device_uid: Option<String>,
    #[serde(default)]
    pub dst_endpoint: Option<Flex>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flex_accepts_number_and_strings() {
        let v: Flex = serde_json::from_str("42").unwrap();
        assert_eq!(v.get(), 42);
        let v: Flex = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(v.get(), 42);
        let v: Flex = serde_json::from_str("\"0x0006\"").unwrap();
        assert_eq!(v.get(), 6);
        assert!(serde_json::from_str::<Flex>("\"nope\"").is_err());
    }

    #[test]
    fn test_spec_parses() {
        let json = r#"{
            "id": "demo1",
            "name": "button toggles light",
            "triggers": [{
                "type": "event",
                "event_type": "zigbee.command",
                "match": {
                    "device_uid": "0x00124B0012345678",
                    "payload": { "endpoint": 1, "cmd": "toggle", "cluster": "0x0006" }
                }
            }],
            "conditions": [{
                "type": "state",
                "op": "==",
                "ref": { "device_uid": "0x00124B0022222222", "key": "onoff" },
                "value": true
            }],
            "actions": [{
                "type": "zigbee",
                "cmd": "onoff.toggle",
                "device_uid": "0x00124B0011111111",
                "endpoint": 1
            }]
        }"#;
        let spec: AutomationSpec = serde_json::from_str(json).unwrap();
        assert!(spec.enabled);
        assert_eq!(spec.triggers.len(), 1);
        let m = spec.triggers[0].match_spec.as_ref().unwrap();
        assert_eq!(
            m.payload.as_ref().unwrap().cluster.unwrap().get(),
            0x0006
        );
        assert_eq!(spec.conditions.len(), 1);
        assert_eq!(spec.actions[0].cmd, "onoff.toggle");
    }
}
