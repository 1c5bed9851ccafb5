//! Compiled-automation engine
//!
//! User-authored automations arrive in a portable description, get
//! compiled into a flat binary container, and run through a
//! trigger-indexed evaluator when gateway events arrive.

pub mod compile;
pub mod compiled;
pub mod engine;
pub mod error;
pub mod executor;
pub mod index;
pub mod model;
pub mod store;

pub use compile::compile_automation;
pub use compiled::{
    ActionKind, ActionRecord, AutomationRecord, CompiledAutomations, CondOp, ConditionRecord,
    TriggerEventType, TriggerRecord,
};
pub use engine::RulesEngine;
pub use error::AutomationError;
pub use executor::{ActionExecutor, CommandPort, Target, ZigbeeCommand};
pub use model::AutomationSpec;
pub use store::{AutomationMeta, AutomationStore};
