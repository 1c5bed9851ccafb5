//! Gateway device model and shared stores
//!
//! This crate holds the authoritative device model of the gateway: the
//! device registry and its binary persistence, the volatile Zigbee
//! endpoint model, the normalized state store, the raw sensor store,
//! the in-process event bus, endpoint classification, and the
//! ZCL-to-state-key projection.

pub mod classify;
pub mod cluster;
pub mod device;
pub mod error;
pub mod event;
pub mod model;
pub mod projection;
pub mod registry;
pub mod sensor;
pub mod state;
pub mod storage;
pub mod uid;

pub use classify::EndpointKind;
pub use device::{DeviceRecord, EndpointRecord};
pub use error::{ErrorKind, GatewayError};
pub use event::{EventBus, EventValue, GwEvent};
pub use model::ZigbeeModel;
pub use registry::DeviceRegistry;
pub use sensor::{SensorStore, SensorValue};
pub use state::{StateEntry, StateStore, StateValue};
pub use uid::DeviceUid;
