//! Automation store
//!
//! Persistent list of compiled automations. Writes go through the
//! compiler, are persisted as one combined GWAR container, and signal
//! cache invalidation to the rules engine via in-process events.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use gateway_core::event::{EventBus, GwEvent};
use tokio::fs;

use crate::compile::compile_automation;
use crate::compiled::CompiledAutomations;
use crate::error::AutomationError;
use crate::model::AutomationSpec;

/// Summary of one stored automation
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AutomationMeta {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub triggers: u32,
    pub conditions: u32,
    pub actions: u32,
}

/// Store of compiled automations, one unit container per automation
pub struct AutomationStore {
    entries: Mutex<Vec<(String, CompiledAutomations)>>,
    path: Option<PathBuf>,
    bus: Arc<EventBus>,
}

impl AutomationStore {
    /// In-memory store (tests, diskless hosts).
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            path: None,
            bus,
        }
    }

    /// Open a store backed by the given container file.
    pub async fn open(path: PathBuf, bus: Arc<EventBus>) -> Self {
        let mut entries = Vec::new();
        match fs::read(&path).await {
            Ok(data) => match CompiledAutomations::deserialize(&data) {
                Ok(combined) => {
                    for index in 0..combined.automations.len() {
                        let unit = combined.extract(index);
                        let id = unit.str_at(unit.automations[0].id_off).to_string();
                        entries.push((id, unit));
                    }
                    tracing::info!("Loaded {} automations from {:?}", entries.len(), path);
                }
                Err(e) => {
                    tracing::warn!("Failed to parse automations file {:?}: {}", path, e);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No automations file at {:?}, starting fresh", path);
            }
            Err(e) => {
                tracing::warn!("Failed to read automations file {:?}: {}", path, e);
            }
        }
        Self {
            entries: Mutex::new(entries),
            path: Some(path),
            bus,
        }
    }

    /// Combined container with every stored automation.
    #[must_use]
    pub fn snapshot(&self) -> CompiledAutomations {
        let entries = self.entries.lock().expect("automation store poisoned");
        let mut combined = CompiledAutomations::new();
        for (_, unit) in entries.iter() {
            combined.append(unit);
        }
        combined
    }

    /// Metadata for every stored automation.
    #[must_use]
    pub fn list_meta(&self) -> Vec<AutomationMeta> {
        let entries = self.entries.lock().expect("automation store poisoned");
        entries
            .iter()
            .map(|(id, unit)| {
                let auto = &unit.automations[0];
                AutomationMeta {
                    id: id.clone(),
                    name: unit.str_at(auto.name_off).to_string(),
                    enabled: auto.enabled,
                    triggers: auto.triggers_count,
                    conditions: auto.conditions_count,
                    actions: auto.actions_count,
                }
            })
            .collect()
    }

    /// One automation's unit container.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<CompiledAutomations> {
        let entries = self.entries.lock().expect("automation store poisoned");
        entries
            .iter()
            .find(|(entry_id, _)| entry_id == id)
            .map(|(_, unit)| unit.clone())
    }

    /// Compile and store a portable automation; replaces any existing
    /// entry with the same id. Returns the id.
    pub async fn put(&self, spec: &AutomationSpec) -> Result<String, AutomationError> {
        let unit = compile_automation(spec)?;
        let id = unit.str_at(unit.automations[0].id_off).to_string();

        {
            let mut entries = self.entries.lock().expect("automation store poisoned");
            if let Some(existing) = entries.iter_mut().find(|(entry_id, _)| *entry_id == id) {
                existing.1 = unit;
            } else {
                entries.push((id.clone(), unit));
            }
        }

        self.persist().await?;
        self.signal("automation_saved", &id);
        tracing::info!("Stored automation {}", id);
        Ok(id)
    }

    /// Delete an automation by id.
    pub async fn remove(&self, id: &str) -> Result<(), AutomationError> {
        {
            let mut entries = self.entries.lock().expect("automation store poisoned");
            let before = entries.len();
            entries.retain(|(entry_id, _)| entry_id != id);
            if entries.len() == before {
                return Err(AutomationError::NotFound(id.to_string()));
            }
        }
        self.persist().await?;
        self.signal("automation_removed", id);
        tracing::info!("Removed automation {}", id);
        Ok(())
    }

    /// Flip the enabled bit of an automation.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), AutomationError> {
        {
            let mut entries = self.entries.lock().expect("automation store poisoned");
            let entry = entries
                .iter_mut()
                .find(|(entry_id, _)| entry_id == id)
                .ok_or_else(|| AutomationError::NotFound(id.to_string()))?;
            entry.1.automations[0].enabled = enabled;
        }
        self.persist().await?;
        self.signal("automation_enabled", id);
        tracing::info!("Automation {} enabled={}", id, enabled);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("automation store poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the combined container atomically.
    async fn persist(&self) -> Result<(), AutomationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = self.snapshot().serialize();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("gwar.tmp");
        fs::write(&tmp_path, &data).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    fn signal(&self, event_type: &str, id: &str) {
        self.bus
            .publish(GwEvent::new(event_type, "automation").with_msg(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> AutomationSpec {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{id}",
                "name": "test",
                "triggers": [{{ "event_type": "device.join" }}],
                "actions": [{{ "cmd": "onoff.on", "device_uid": "0x00124b0012345678", "endpoint": 1 }}]
            }}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let bus = Arc::new(EventBus::new());
        let store = AutomationStore::new(bus.clone());
        let mut rx = bus.subscribe();

        let id = store.put(&spec("a1")).await.unwrap();
        assert_eq!(id, "a1");
        assert_eq!(store.len(), 1);
        assert!(store.get("a1").is_some());
        assert_eq!(rx.recv().await.unwrap().event_type, "automation_saved");

        store.remove("a1").await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.remove("a1").await,
            Err(AutomationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_replaces_same_id() {
        let bus = Arc::new(EventBus::new());
        let store = AutomationStore::new(bus);
        store.put(&spec("a1")).await.unwrap();
        store.put(&spec("a1")).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_enabled() {
        let bus = Arc::new(EventBus::new());
        let store = AutomationStore::new(bus);
        store.put(&spec("a1")).await.unwrap();
        store.set_enabled("a1", false).await.unwrap();
        let meta = store.list_meta();
        assert!(!meta[0].enabled);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = std::env::temp_dir().join("gw-automation-store-test");
        let path = dir.join("automations.gwar");
        let _ = fs::remove_file(&path).await;

        let bus = Arc::new(EventBus::new());
        let store = AutomationStore::open(path.clone(), bus.clone()).await;
        store.put(&spec("a1")).await.unwrap();
        store.put(&spec("a2")).await.unwrap();
        store.set_enabled("a2", false).await.unwrap();

        let reloaded = AutomationStore::open(path, bus).await;
        assert_eq!(reloaded.len(), 2);
        let meta = reloaded.list_meta();
        assert_eq!(meta[0].id, "a1");
        assert!(meta[0].enabled);
        assert!(!meta[1].enabled);

        let _ = fs::remove_dir_all(&dir).await;
    }
}
