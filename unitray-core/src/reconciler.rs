//! Status cache and reconciler
//!
//! Owns the last-known status of every tracked unit, the notification
//! suppression windows, and the logic that folds asynchronous executor
//! results back into one consistent view. All mutation happens on the thread
//! that owns the [`StatusReconciler`]; executor tasks only ever produce
//! [`EventEnvelope`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::action::ServiceAction;
use crate::clock::Clock;
use crate::event::{BackendEvent, EventEnvelope};
use crate::executor::Executor;
use crate::status::{UNKNOWN_STATUS, normalize_status, toggle_stops};

/// Name used for notifications that concern the tray itself
pub const APP_NAME: &str = "Systemd Tray";

/// How long a fetched status short-circuits further fetches
pub const STATUS_TTL: Duration = Duration::from_secs(3);

/// Settle time before the presentation re-renders after a command
pub const REFRESH_DELAY: Duration = Duration::from_millis(800);

const FALLBACK_DETAIL: &str = "Unknown error";

/// A user-visible message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// What the reconciler tells the interactive surface
pub trait Presenter {
    /// A unit's indicator should show `status`
    fn status_changed(&mut self, unit: &str, status: &str);

    fn notify(&mut self, notification: Notification);

    /// Re-render after `delay`
    fn schedule_refresh(&mut self, delay: Duration);

    /// A daemon reload finished, successfully or not
    fn reload_finished(&mut self);
}

/// Cached result of one status fetch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEntry {
    pub at: Instant,
    pub status: String,
}

pub struct StatusReconciler<P: Presenter> {
    executor: Arc<dyn Executor>,
    presenter: P,
    clock: Arc<dyn Clock>,
    cache: BTreeMap<String, StatusEntry>,
    /// Fetches issued but not yet ingested
    in_flight: BTreeMap<String, Instant>,
    last_status: BTreeMap<String, String>,
    suppressed_until: BTreeMap<String, Instant>,
}

impl<P: Presenter> StatusReconciler<P> {
    pub fn new(executor: Arc<dyn Executor>, presenter: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor,
            presenter,
            clock,
            cache: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            last_status: BTreeMap::new(),
            suppressed_until: BTreeMap::new(),
        }
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn presenter_mut(&mut self) -> &mut P {
        &mut self.presenter
    }

    // Reads ---------------------------------------------------------------

    /// Cached status, or "unknown". Never triggers a fetch.
    pub fn query_status(&self, unit: &str) -> &str {
        self.cache
            .get(unit)
            .map(|e| e.status.as_str())
            .unwrap_or(UNKNOWN_STATUS)
    }

    pub fn last_status(&self, unit: &str) -> Option<&str> {
        self.last_status.get(unit).map(String::as_str)
    }

    pub fn suppressed_until(&self, unit: &str) -> Option<Instant> {
        self.suppressed_until.get(unit).copied()
    }

    /// Units that currently hold any state
    pub fn tracked_units(&self) -> BTreeSet<String> {
        self.cache
            .keys()
            .chain(self.last_status.keys())
            .chain(self.suppressed_until.keys())
            .cloned()
            .collect()
    }

    // Refresh requests ----------------------------------------------------

    /// Ask for a status fetch unless a fresh entry or a recent fetch covers
    /// it. Returns whether a fetch was issued.
    pub fn request_status_update(&mut self, unit: &str) -> bool {
        if unit.is_empty() {
            return false;
        }
        let now = self.clock.now();
        if let Some(entry) = self.cache.get(unit) {
            if is_fresh(entry.at, now) {
                debug!(unit, "status cache hit");
                return false;
            }
        }
        if let Some(&issued) = self.in_flight.get(unit) {
            if is_fresh(issued, now) {
                debug!(unit, "status fetch already in flight");
                return false;
            }
        }
        self.fetch_now(unit, now);
        true
    }

    fn fetch_now(&mut self, unit: &str, now: Instant) {
        debug!(unit, "requesting status");
        self.in_flight.insert(unit.to_string(), now);
        self.executor.status(unit);
    }

    // Control -------------------------------------------------------------

    pub fn start(&self, unit: &str) {
        self.executor.start(unit);
    }

    pub fn stop(&self, unit: &str) {
        self.executor.stop(unit);
    }

    pub fn restart(&self, unit: &str) {
        self.executor.restart(unit);
    }

    pub fn reload_daemon(&self) {
        self.executor.reload_daemon();
    }

    /// Start the unit if it is not active, stop it otherwise; returns the
    /// action submitted
    pub fn toggle(&self, unit: &str) -> ServiceAction {
        let action = if toggle_stops(self.query_status(unit)) {
            ServiceAction::Stop
        } else {
            ServiceAction::Start
        };
        self.executor.submit(action, unit);
        action
    }

    // Ingestion -----------------------------------------------------------

    /// Route one event from the executor
    pub fn apply(&mut self, env: &EventEnvelope) {
        match &env.event {
            BackendEvent::StatusFetched { unit, status } => self.on_status_fetched(unit, status),
            BackendEvent::CommandFinished {
                unit,
                action,
                success,
                message,
            } => self.on_command_finished(unit, *action, *success, message),
        }
    }

    pub fn on_status_fetched(&mut self, unit: &str, status: &str) {
        let normalized = normalize_status(status);
        let now = self.clock.now();
        self.in_flight.remove(unit);
        self.cache.insert(
            unit.to_string(),
            StatusEntry {
                at: now,
                status: normalized.clone(),
            },
        );
        self.detect_transition(unit, &normalized, now);
        self.presenter.status_changed(unit, &normalized);
    }

    fn detect_transition(&mut self, unit: &str, normalized: &str, now: Instant) {
        let previous = self
            .last_status
            .insert(unit.to_string(), normalized.to_string());

        if let Some(&expiry) = self.suppressed_until.get(unit) {
            if now < expiry {
                debug!(unit, status = normalized, "transition notification suppressed");
                return;
            }
            self.suppressed_until.remove(unit);
        }

        if previous.as_deref() == Some("active") && matches!(normalized, "inactive" | "failed") {
            info!(unit, status = normalized, "service left active state");
            self.presenter.notify(Notification::new(
                unit,
                format!("Service became {}", normalized),
            ));
        }
    }

    /// Mute transition notifications for `unit` for `window`
    pub fn suppress(&mut self, unit: &str, window: Duration) {
        let until = self.clock.now() + window;
        self.suppressed_until.insert(unit.to_string(), until);
    }

    pub fn on_command_finished(
        &mut self,
        unit: &str,
        action: ServiceAction,
        success: bool,
        message: &str,
    ) {
        if action == ServiceAction::Status {
            self.in_flight.remove(unit);
        }

        if success {
            info!(unit, action = action.label(), "command succeeded");
            if let Some(window) = action.suppression_window() {
                self.suppress(unit, window);
            }
            match action {
                ServiceAction::DaemonReload => self.presenter.reload_finished(),
                ServiceAction::Status => {}
                _ => {
                    self.cache.remove(unit);
                    let now = self.clock.now();
                    self.fetch_now(unit, now);
                }
            }
        } else {
            let detail = failure_detail(message);
            info!(unit, action = action.label(), detail, "command failed");
            if action.is_per_unit() {
                self.presenter.notify(Notification::new(
                    unit,
                    format!("{} failed: {}", action.title(), detail),
                ));
                self.suppressed_until.remove(unit);
            } else {
                self.presenter.notify(Notification::new(
                    APP_NAME,
                    format!("Daemon reload failed: {}", detail),
                ));
                self.presenter.reload_finished();
            }
        }

        self.presenter.schedule_refresh(REFRESH_DELAY);
    }

    // Pruning -------------------------------------------------------------

    /// Forget every unit not in `active_units`; also drop long-stale cache entries
    pub fn prune_state_cache(&mut self, active_units: &BTreeSet<String>) {
        let now = self.clock.now();
        let max_age = STATUS_TTL * 2;
        self.cache.retain(|unit, entry| {
            active_units.contains(unit) && now.saturating_duration_since(entry.at) <= max_age
        });
        self.in_flight.retain(|unit, _| active_units.contains(unit));
        self.last_status.retain(|unit, _| active_units.contains(unit));
        self.suppressed_until
            .retain(|unit, _| active_units.contains(unit));
        debug!(remaining = active_units.len(), "pruned status state");
    }
}

/// Within the status ttl, boundary included
fn is_fresh(at: Instant, now: Instant) -> bool {
    now.saturating_duration_since(at) <= STATUS_TTL
}

/// First meaningful line of a failure message
fn failure_detail(message: &str) -> &str {
    message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(FALLBACK_DETAIL)
}
