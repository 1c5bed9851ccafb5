//! Radio-node runtime
//!
//! Owns the Zigbee stack seam: the command scheduler with its token
//! table, endpoint auto-provisioning, the snapshot producer, the
//! radio side of the serial link, and the stack event ingest loop.

pub mod link;
pub mod provision;
pub mod radio;
pub mod runtime;
pub mod scheduler;
pub mod snapshot;

pub use radio::{LoopbackRadio, RadioAddr, RadioStack, StackEvent};
pub use runtime::RadioContext;
pub use scheduler::{Scheduler, SchedulerPort};
