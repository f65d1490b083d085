//! Service-manager actions and their per-action policy.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Label used as the "unit" of a daemon reload, which targets no unit.
pub const DAEMON_LABEL: &str = "daemon";

/// Something the executor can ask the user service manager to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceAction {
    /// Query whether a unit is active
    Status,
    Start,
    Stop,
    Restart,
    /// Reload unit definitions
    DaemonReload,
}

impl ServiceAction {
    pub const ALL: [ServiceAction; 5] = [
        ServiceAction::Status,
        ServiceAction::Start,
        ServiceAction::Stop,
        ServiceAction::Restart,
        ServiceAction::DaemonReload,
    ];

    /// Label carried in events and shown to the user
    pub fn label(&self) -> &'static str {
        match self {
            ServiceAction::Status => "status",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::DaemonReload => "daemon-reload",
        }
    }

    /// Verb passed to the service manager
    pub fn verb(&self) -> &'static str {
        match self {
            ServiceAction::Status => "is-active",
            other => other.label(),
        }
    }

    /// Arguments following the user-scope flag
    pub fn args(&self, unit: &str) -> Vec<String> {
        match self {
            ServiceAction::DaemonReload => vec![self.verb().to_string()],
            _ => vec![self.verb().to_string(), unit.to_string()],
        }
    }

    /// Hard limit on how long the external command may run
    pub fn timeout(&self) -> Duration {
        match self {
            ServiceAction::Status => Duration::from_secs(6),
            ServiceAction::Start | ServiceAction::Stop | ServiceAction::Restart => {
                Duration::from_secs(10)
            }
            ServiceAction::DaemonReload => Duration::from_secs(15),
        }
    }

    /// How long transition notifications stay muted after this action succeeds
    pub fn suppression_window(&self) -> Option<Duration> {
        match self {
            ServiceAction::Start | ServiceAction::Stop => Some(Duration::from_secs(10)),
            ServiceAction::Restart => Some(Duration::from_secs(12)),
            ServiceAction::Status | ServiceAction::DaemonReload => None,
        }
    }

    /// Whether the action targets a single unit
    pub fn is_per_unit(&self) -> bool {
        !matches!(self, ServiceAction::DaemonReload)
    }

    /// Label with the first letter upper-cased ("Start", "Daemon-reload")
    pub fn title(&self) -> String {
        let label = self.label();
        let mut chars = label.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action '{0}' (expected status, start, stop, restart or daemon-reload)")]
pub struct ActionParseError(pub String);

impl FromStr for ServiceAction {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        ServiceAction::ALL
            .into_iter()
            .find(|a| a.label() == lowered || a.verb() == lowered)
            .ok_or_else(|| ActionParseError(s.to_string()))
    }
}
