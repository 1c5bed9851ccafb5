//! WebSocket event stream for the UI

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use gateway_core::event::{EventValue, GwEvent};

use crate::sync::state_key_for;
use crate::AppState;

/// Events pushed to UI clients
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum WsEvent {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "automation.fired")]
    AutomationFired { automation_id: String },
    #[serde(rename = "automation.result")]
    AutomationResult {
        automation_id: String,
        index: usize,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "device.event")]
    DeviceEvent {
        device_id: String,
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cmd: Option<String>,
    },
    #[serde(rename = "device.state")]
    DeviceState {
        device_id: String,
        endpoint_id: u8,
        key: String,
        value: serde_json::Value,
    },
}

fn msg_field<'a>(msg: &'a str, key: &str) -> Option<&'a str> {
    msg.split_whitespace()
        .find_map(|part| part.strip_prefix(key))
}

fn value_json(value: &EventValue) -> serde_json::Value {
    match value {
        EventValue::None => serde_json::Value::Null,
        EventValue::Bool(b) => serde_json::json!(b),
        EventValue::I64(v) => serde_json::json!(v),
        EventValue::F64(v) => serde_json::json!(v),
        EventValue::Text(t) => serde_json::json!(t),
    }
}

/// Translate one bus event into its UI form, if it has one.
#[must_use]
pub fn ws_event_for(event: &GwEvent) -> Option<WsEvent> {
    match event.event_type.as_str() {
        "rules.fired" => Some(WsEvent::AutomationFired {
            automation_id: msg_field(&event.msg, "automation_id=")?.to_string(),
        }),
        "rules.action" => {
            let automation_id = msg_field(&event.msg, "automation_id=")?.to_string();
            let index = msg_field(&event.msg, "idx=")?.parse().ok()?;
            let ok = msg_field(&event.msg, "ok=") == Some("1");
            let error = if ok {
                None
            } else {
                event
                    .msg
                    .split_once("err=")
                    .map(|(_, err)| err.to_string())
            };
            Some(WsEvent::AutomationResult {
                automation_id,
                index,
                ok,
                error,
            })
        }
        "zigbee.command" => Some(WsEvent::DeviceEvent {
            device_id: event.device_uid?.to_string(),
            event: "command".to_string(),
            endpoint: event.endpoint,
            cmd: event.cmd.clone(),
        }),
        "device.join" | "device.leave" => Some(WsEvent::DeviceEvent {
            device_id: event.device_uid?.to_string(),
            event: event
                .event_type
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string(),
            endpoint: None,
            cmd: None,
        }),
        "zigbee.attr_report" => Some(WsEvent::DeviceState {
            device_id: event.device_uid?.to_string(),
            endpoint_id: event.endpoint.unwrap_or(0),
            key: state_key_for(event.cluster_id?, event.attr_id.unwrap_or(0)),
            value: value_json(&event.value),
        }),
        _ => None,
    }
}

/// Serve one WebSocket client: forward bus events until it closes.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, mut receiver) = socket.split();
    let sender = std::sync::Arc::new(tokio::sync::Mutex::new(sender));

    let (tx, mut rx) = tokio::sync::mpsc::channel::<WsEvent>(64);
    let _ = tx.send(WsEvent::Connected).await;

    // Forward bus events
    let mut bus_rx = state.stores.bus.subscribe();
    let forward_tx = tx.clone();
    let forward_task = tokio::spawn(async move {
        loop {
            match bus_rx.recv().await {
                Ok(event) => {
                    if let Some(ws_event) = ws_event_for(&event) {
                        if forward_tx.send(ws_event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Serialize and send
    let sender_clone = sender.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            let mut sender = sender_clone.lock().await;
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Drain client messages until close
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    forward_task.abort();
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::uid::DeviceUid;

    #[test]
    fn test_rules_fired_mapping() {
        let event = GwEvent::new("rules.fired", "rules").with_msg("automation_id=demo1");
        assert_eq!(
            ws_event_for(&event),
            Some(WsEvent::AutomationFired {
                automation_id: "demo1".to_string()
            })
        );
    }

    #[test]
    fn test_rules_action_mapping() {
        let ok_event =
            GwEvent::new("rules.action", "rules").with_msg("automation_id=demo1 idx=0 ok=1");
        assert_eq!(
            ws_event_for(&ok_event),
            Some(WsEvent::AutomationResult {
                automation_id: "demo1".to_string(),
                index: 0,
                ok: true,
                error: None,
            })
        );

        let err_event = GwEvent::new("rules.action", "rules")
            .with_msg("automation_id=demo1 idx=2 ok=0 err=short addr unknown");
        assert_eq!(
            ws_event_for(&err_event),
            Some(WsEvent::AutomationResult {
                automation_id: "demo1".to_string(),
                index: 2,
                ok: false,
                error: Some("short addr unknown".to_string()),
            })
        );
    }

    #[test]
    fn test_device_state_mapping() {
        let uid = DeviceUid::new(0x42);
        let event = GwEvent::new("zigbee.attr_report", "link")
            .with_device(uid, 0x10)
            .with_endpoint(1)
            .with_cluster_attr(0x0402, 0)
            .with_value(EventValue::F64(23.45));
        match ws_event_for(&event) {
            Some(WsEvent::DeviceState {
                device_id,
                endpoint_id,
                key,
                value,
            }) => {
                assert_eq!(device_id, uid.to_string());
                assert_eq!(endpoint_id, 1);
                assert_eq!(key, "temperature_c");
                assert_eq!(value, serde_json::json!(23.45));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_join_leave_mapping() {
        let uid = DeviceUid::new(0x42);
        let event = GwEvent::new("device.leave", "link").with_device(uid, 0);
        assert_eq!(
            ws_event_for(&event),
            Some(WsEvent::DeviceEvent {
                device_id: uid.to_string(),
                event: "leave".to_string(),
                endpoint: None,
                cmd: None,
            })
        );
    }

    #[test]
    fn test_internal_events_not_forwarded() {
        assert_eq!(ws_event_for(&GwEvent::new("automation_saved", "automation")), None);
        assert_eq!(ws_event_for(&GwEvent::new("zigbee_bind_failed", "zigbee")), None);
    }
}
