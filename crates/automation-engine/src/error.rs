//! Error types for the automation engine

use thiserror::Error;

/// Errors that can occur while compiling, storing, or running automations
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Automation not found
    #[error("Automation not found: {0}")]
    NotFound(String),

    /// Invalid portable description
    #[error("Invalid automation: {0}")]
    Invalid(String),

    /// Compiled container is malformed
    #[error("Bad compiled container: {0}")]
    Format(String),

    /// Action execution failed
    #[error("Action failed: {0}")]
    Action(String),

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
