//! Error taxonomy of the trigger engine.

use thiserror::Error;

use crate::page::Root;

#[derive(Debug, Error)]
pub enum TriggerError {
    /// The trigger definition cannot be armed as configured.
    #[error("invalid trigger configuration: {message}")]
    Configuration { message: String },

    #[error("trigger '{0}' is not installed")]
    NotInstalled(String),

    #[error("availability check failed: {error:#}")]
    Availability { error: anyhow::Error },

    /// Reading the context for one root failed; no automation ran for it.
    #[error("failed to read context for {root}: {error:#}")]
    Reader { root: Root, error: anyhow::Error },

    /// One automation's pipeline failed. Siblings are unaffected.
    #[error("automation '{automation_id}' failed: {error:#}")]
    Automation {
        automation_id: String,
        error: anyhow::Error,
    },

    /// A firing task panicked or was cancelled before settling.
    #[error("firing task aborted: {0}")]
    Aborted(String),
}

impl TriggerError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        TriggerError::Configuration {
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, TriggerError::Configuration { .. })
    }
}
