use std::time::SystemTime;

use crate::action::ServiceAction;

/// Results handed from executor tasks to the event loop
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// An `is-active` query finished
    StatusFetched { unit: String, status: String },
    /// A control command finished, or any command failed to run
    CommandFinished {
        unit: String,
        action: ServiceAction,
        success: bool,
        message: String,
    },
}

impl BackendEvent {
    pub fn unit(&self) -> &str {
        match self {
            BackendEvent::StatusFetched { unit, .. } => unit,
            BackendEvent::CommandFinished { unit, .. } => unit,
        }
    }

    pub fn failed(unit: &str, action: ServiceAction, message: impl Into<String>) -> Self {
        BackendEvent::CommandFinished {
            unit: unit.to_string(),
            action,
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventEnvelope {
    /// Completion order as stamped by the producer
    pub id: u64,
    pub at: SystemTime,
    pub event: BackendEvent,
}
