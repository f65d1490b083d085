//! Status strings as reported by `is-active`, and how to present them.

use serde::{Deserialize, Serialize};

/// Status used whenever nothing better is known
pub const UNKNOWN_STATUS: &str = "unknown";

/// Trim and lowercase a raw status; blank becomes "unknown"
pub fn normalize_status(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        UNKNOWN_STATUS.to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Coarse grouping of a status for indicators
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTone {
    Running,
    Transitioning,
    Stopping,
    Down,
    Unknown,
}

impl StatusTone {
    pub fn of(status: &str) -> Self {
        match normalize_status(status).as_str() {
            "active" => StatusTone::Running,
            "activating" | "reloading" => StatusTone::Transitioning,
            "deactivating" => StatusTone::Stopping,
            "inactive" | "failed" => StatusTone::Down,
            _ => StatusTone::Unknown,
        }
    }

    /// Indicator glyph
    pub fn icon(&self) -> &'static str {
        match self {
            StatusTone::Running => "●",
            StatusTone::Transitioning => "◐",
            StatusTone::Stopping => "◑",
            StatusTone::Down => "○",
            StatusTone::Unknown => "?",
        }
    }
}

/// Whether a toggle on a unit in `status` should stop it (otherwise start it)
pub fn toggle_stops(status: &str) -> bool {
    normalize_status(status) == "active"
}
