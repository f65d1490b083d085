//! Tray event loop
//!
//! A single task owns the [`StatusReconciler`] and is the only place its
//! state changes. Executor tasks, delayed refresh timers and signals all feed
//! this loop through channels.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use unitray_core::action::{DAEMON_LABEL, ServiceAction};
use unitray_core::clock::Clock;
use unitray_core::config::{ConfigError, TrayConfig};
use unitray_core::event::{BackendEvent, EventEnvelope};
use unitray_core::executor::Executor;
use unitray_core::reconciler::{APP_NAME, Notification, Presenter, StatusReconciler};
use unitray_core::status::StatusTone;

/// Period of the presentation refresh while the tray runs
pub const PRESENTATION_REFRESH: Duration = Duration::from_secs(3);

/// Slack on top of command timeouts before a one-shot stops waiting
const RESULT_GRACE: Duration = Duration::from_secs(1);

/// Prints indicator changes and notifications as lines of text
pub struct TerminalPresenter<W> {
    out: W,
    /// unit -> configured display name
    names: BTreeMap<String, String>,
    /// Last status printed per unit
    shown: BTreeMap<String, String>,
    reloading: bool,
    refresh_tx: mpsc::UnboundedSender<()>,
    handle: Handle,
}

impl<W: Write> TerminalPresenter<W> {
    pub fn new(out: W, refresh_tx: mpsc::UnboundedSender<()>, handle: Handle) -> Self {
        Self {
            out,
            names: BTreeMap::new(),
            shown: BTreeMap::new(),
            reloading: false,
            refresh_tx,
            handle,
        }
    }

    /// Pick up display names and forget indicators of removed units
    pub fn set_names(&mut self, config: &TrayConfig) {
        self.names = config
            .tracked()
            .map(|(unit, svc)| (unit.to_string(), svc.display_name().to_string()))
            .collect();
        let names = &self.names;
        self.shown.retain(|unit, _| names.contains_key(unit));
    }

    #[cfg(test)]
    pub fn is_reloading(&self) -> bool {
        self.reloading
    }

    pub fn begin_reload(&mut self) {
        self.reloading = true;
        self.line("Reloading user daemon...");
    }

    #[cfg(test)]
    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn line(&mut self, text: impl Display) {
        if let Err(e) = writeln!(self.out, "{}", text) {
            debug!(error = %e, "failed to write output");
        }
    }

    fn label(&self, unit: &str) -> String {
        match self.names.get(unit) {
            Some(name) if name != unit => format!("{} ({})", name, unit),
            _ => unit.to_string(),
        }
    }
}

impl<W: Write> Presenter for TerminalPresenter<W> {
    fn status_changed(&mut self, unit: &str, status: &str) {
        if self.shown.get(unit).map(String::as_str) == Some(status) {
            return;
        }
        self.shown.insert(unit.to_string(), status.to_string());
        let icon = StatusTone::of(status).icon();
        let label = self.label(unit);
        self.line(format!("{} {}: {}", icon, label, status));
    }

    fn notify(&mut self, notification: Notification) {
        self.line(format!("[{}] {}", notification.title, notification.body));
    }

    fn schedule_refresh(&mut self, delay: Duration) {
        let tx = self.refresh_tx.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
    }

    fn reload_finished(&mut self) {
        self.reloading = false;
        self.line("Daemon reload finished");
    }
}

pub struct TrayRuntime<W: Write> {
    reconciler: StatusReconciler<TerminalPresenter<W>>,
    config_path: PathBuf,
    config: TrayConfig,
    /// Units whose results are accepted: the configured ones plus one-shot targets
    watched: BTreeSet<String>,
    events: mpsc::UnboundedReceiver<EventEnvelope>,
    refreshes: mpsc::UnboundedReceiver<()>,
}

impl<W: Write> TrayRuntime<W> {
    pub fn new(
        executor: Arc<dyn Executor>,
        events: mpsc::UnboundedReceiver<EventEnvelope>,
        clock: Arc<dyn Clock>,
        config_path: PathBuf,
        config: TrayConfig,
        out: W,
        handle: Handle,
    ) -> Self {
        let (refresh_tx, refreshes) = mpsc::unbounded_channel();
        let mut presenter = TerminalPresenter::new(out, refresh_tx, handle);
        presenter.set_names(&config);
        Self {
            reconciler: StatusReconciler::new(executor, presenter, clock),
            config_path,
            watched: config.active_units(),
            config,
            events,
            refreshes,
        }
    }

    #[cfg(test)]
    pub fn reconciler(&self) -> &StatusReconciler<TerminalPresenter<W>> {
        &self.reconciler
    }

    #[cfg(test)]
    pub fn config(&self) -> &TrayConfig {
        &self.config
    }

    /// Render every configured unit from the cache and ask for fresh statuses
    pub fn refresh(&mut self) {
        for unit in self.config.active_units() {
            let status = self.reconciler.query_status(&unit).to_string();
            self.reconciler.presenter_mut().status_changed(&unit, &status);
            self.reconciler.request_status_update(&unit);
        }
    }

    /// Re-read the config file, then prune and refresh
    pub fn reload_config(&mut self) -> Result<(), ConfigError> {
        let config = TrayConfig::load(&self.config_path)?;
        self.apply_config(config);
        Ok(())
    }

    pub fn apply_config(&mut self, config: TrayConfig) {
        let active = config.active_units();
        info!(services = active.len(), "applying configuration");
        self.reconciler.prune_state_cache(&active);
        self.reconciler.presenter_mut().set_names(&config);
        self.watched = active;
        self.config = config;
        self.refresh();
    }

    /// Fold one executor result into the reconciler. Results for units that
    /// were removed while the command ran are dropped.
    pub fn handle_event(&mut self, env: EventEnvelope) {
        let unit = env.event.unit();
        let per_unit = match &env.event {
            BackendEvent::StatusFetched { .. } => true,
            BackendEvent::CommandFinished { action, .. } => {
                action.is_per_unit() || *action == ServiceAction::Status
            }
        };
        if per_unit && !self.watched.contains(unit) {
            debug!(id = env.id, unit, "dropping result for unwatched unit");
            return;
        }
        debug!(id = env.id, unit, "event");
        self.reconciler.apply(&env);
    }

    /// Run until interrupted. In-flight tasks are left to finish or time out.
    pub async fn run(mut self) -> std::io::Result<()> {
        let mut ticker = tokio::time::interval(PRESENTATION_REFRESH);
        let mut hangup = signal(SignalKind::hangup())?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        info!(config = %self.config_path.display(), "tray running");
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("interrupted, shutting down");
                    break;
                }
                event = self.events.recv() => {
                    let Some(env) = event else { break };
                    self.handle_event(env);
                }
                Some(()) = self.refreshes.recv() => self.refresh(),
                _ = ticker.tick() => self.refresh(),
                _ = hangup.recv() => {
                    info!("SIGHUP, reloading configuration");
                    if let Err(e) = self.reload_config() {
                        warn!(error = %e, "config reload failed");
                        let body = format!("Config reload failed: {}", e);
                        self.reconciler
                            .presenter_mut()
                            .notify(Notification::new(APP_NAME, body));
                    }
                }
            }
        }
        Ok(())
    }

    // One-shot commands ---------------------------------------------------

    /// Fetch each unit's status once; returns how many could not be fetched.
    /// Units already covered by a fresh or in-flight fetch are shown from the
    /// cache instead of waited on.
    pub async fn fetch_statuses(&mut self, units: &[String]) -> usize {
        self.watched.extend(units.iter().cloned());
        let mut pending = BTreeSet::new();
        for unit in units {
            if self.reconciler.request_status_update(unit) {
                pending.insert((unit.clone(), ServiceAction::Status));
            } else {
                let status = self.reconciler.query_status(unit).to_string();
                self.reconciler.presenter_mut().status_changed(unit, &status);
            }
        }
        let budget = ServiceAction::Status.timeout() * unit_count(units);
        self.drain(pending, budget).await
    }

    /// Fetch each unit's status, then start the stopped ones and stop the
    /// active ones. Returns the number of failures.
    pub async fn toggle(&mut self, units: &[String]) -> usize {
        let failures = self.fetch_statuses(units).await;
        let mut pending = BTreeSet::new();
        let mut budget = Duration::ZERO;
        for unit in units {
            let action = self.reconciler.toggle(unit);
            budget += action.timeout() + ServiceAction::Status.timeout();
            pending.insert((unit.clone(), action));
        }
        failures + self.drain(pending, budget).await
    }

    /// Run `action` on every unit (or the daemon) and wait for the outcome
    /// and the follow-up status. Returns the number of failures.
    pub async fn run_action(&mut self, action: ServiceAction, units: &[String]) -> usize {
        self.watched.extend(units.iter().cloned());
        let mut pending = BTreeSet::new();
        match action {
            ServiceAction::Status => return self.fetch_statuses(units).await,
            ServiceAction::DaemonReload => {
                self.reconciler.presenter_mut().begin_reload();
                self.reconciler.reload_daemon();
                pending.insert((DAEMON_LABEL.to_string(), action));
            }
            ServiceAction::Start | ServiceAction::Stop | ServiceAction::Restart => {
                for unit in units {
                    match action {
                        ServiceAction::Start => self.reconciler.start(unit),
                        ServiceAction::Stop => self.reconciler.stop(unit),
                        _ => self.reconciler.restart(unit),
                    }
                    pending.insert((unit.clone(), action));
                }
            }
        }
        let per_unit = action.timeout() + ServiceAction::Status.timeout();
        self.drain(pending, per_unit * unit_count(units)).await
    }

    async fn drain(
        &mut self,
        mut pending: BTreeSet<(String, ServiceAction)>,
        budget: Duration,
    ) -> usize {
        let deadline = tokio::time::Instant::now() + budget + RESULT_GRACE;
        let mut failures = 0;

        while !pending.is_empty() {
            let env = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(env)) => env,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = pending.len(), "gave up waiting for results");
                    failures += pending.len();
                    break;
                }
            };

            if let BackendEvent::CommandFinished {
                unit,
                action,
                success,
                ..
            } = &env.event
            {
                if pending.remove(&(unit.clone(), *action)) {
                    if !*success {
                        failures += 1;
                    } else if *action != ServiceAction::Status {
                        let done = if action.is_per_unit() {
                            format!("{} {}: done", action.title(), unit)
                        } else {
                            format!("{}: done", action.title())
                        };
                        self.reconciler.presenter_mut().line(done);
                        if action.is_per_unit() {
                            // the reconciler re-fetches after a successful action
                            pending.insert((unit.clone(), ServiceAction::Status));
                        }
                    }
                }
            } else {
                pending.remove(&(env.event.unit().to_string(), ServiceAction::Status));
            }

            self.handle_event(env);
        }
        failures
    }
}

fn unit_count(units: &[String]) -> u32 {
    u32::try_from(units.len().max(1)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;
    use crate::systemctl::Systemctl;
    use crate::testing::fake_host;
    use tempfile::TempDir;
    use unitray_core::clock::SystemClock;
    use unitray_core::config::ManagedService;

    const SCRIPT: &str = r#"
shift
case "$1" in
  is-active)
    if [ "$2" = "broken.service" ]; then echo failed; exit 3; fi
    echo active
    ;;
  start) exit 0 ;;
  stop) echo "Access denied" >&2; exit 1 ;;
  daemon-reload) exit 0 ;;
esac
"#;

    fn config() -> TrayConfig {
        TrayConfig {
            services: vec![
                ManagedService::new("comfyui.service").with_name("ComfyUI"),
                ManagedService::new("broken.service"),
            ],
        }
    }

    fn runtime(script: &str, config: TrayConfig) -> (TrayRuntime<Vec<u8>>, TempDir) {
        let (dir, host) = fake_host(script);
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = TaskExecutor::new(Arc::new(Systemctl::new(host)), 2, tx, Handle::current());
        let runtime = TrayRuntime::new(
            Arc::new(executor),
            rx,
            Arc::new(SystemClock),
            dir.path().join("services.yaml"),
            config,
            Vec::new(),
            Handle::current(),
        );
        (runtime, dir)
    }

    fn output(runtime: &TrayRuntime<Vec<u8>>) -> String {
        String::from_utf8_lossy(runtime.reconciler().presenter().output()).into_owned()
    }

    fn units(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fetch_statuses_prints_indicators() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        let failures = rt
            .fetch_statuses(&units(&["comfyui.service", "broken.service"]))
            .await;
        assert_eq!(failures, 0);

        let out = output(&rt);
        assert!(out.contains("● ComfyUI (comfyui.service): active"));
        assert!(out.contains("○ broken.service: failed"));
        assert_eq!(rt.reconciler().query_status("comfyui.service"), "active");
    }

    #[tokio::test]
    async fn test_successful_action_reports_and_refetches() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        let failures = rt
            .run_action(ServiceAction::Start, &units(&["comfyui.service"]))
            .await;
        assert_eq!(failures, 0);

        let out = output(&rt);
        assert!(out.contains("Start comfyui.service: done"));
        assert!(out.contains("ComfyUI (comfyui.service): active"));
        assert!(rt.reconciler().suppressed_until("comfyui.service").is_some());
    }

    #[tokio::test]
    async fn test_failed_action_notifies() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        let failures = rt
            .run_action(ServiceAction::Stop, &units(&["comfyui.service"]))
            .await;
        assert_eq!(failures, 1);
        assert!(output(&rt).contains("[comfyui.service] Stop failed: Access denied"));
    }

    #[tokio::test]
    async fn test_daemon_reload_round_trip() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        let failures = rt.run_action(ServiceAction::DaemonReload, &[]).await;
        assert_eq!(failures, 0);
        assert!(!rt.reconciler().presenter().is_reloading());

        let out = output(&rt);
        assert!(out.contains("Reloading user daemon..."));
        assert!(out.contains("Daemon-reload: done"));
        assert!(out.contains("Daemon reload finished"));
    }

    #[tokio::test]
    async fn test_apply_config_prunes_removed_units() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        rt.fetch_statuses(&units(&["comfyui.service", "broken.service"]))
            .await;

        let smaller = TrayConfig {
            services: vec![ManagedService::new("comfyui.service")],
        };
        rt.apply_config(smaller);
        assert!(!rt.reconciler().tracked_units().contains("broken.service"));
        assert_eq!(rt.reconciler().query_status("broken.service"), "unknown");
    }

    #[tokio::test]
    async fn test_late_results_for_removed_units_are_dropped() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        rt.apply_config(TrayConfig {
            services: vec![ManagedService::new("comfyui.service")],
        });

        let late = |event| EventEnvelope {
            id: 99,
            at: std::time::SystemTime::now(),
            event,
        };
        rt.handle_event(late(BackendEvent::StatusFetched {
            unit: "broken.service".into(),
            status: "inactive".into(),
        }));
        rt.handle_event(late(BackendEvent::failed(
            "broken.service",
            ServiceAction::Stop,
            "Access denied",
        )));
        rt.handle_event(late(BackendEvent::CommandFinished {
            unit: DAEMON_LABEL.into(),
            action: ServiceAction::DaemonReload,
            success: true,
            message: String::new(),
        }));

        assert!(!rt.reconciler().tracked_units().contains("broken.service"));
        let out = output(&rt);
        assert!(!out.contains("broken.service"), "{}", out);
        assert!(out.contains("Daemon reload finished"));
    }

    #[tokio::test]
    async fn test_fresh_statuses_are_not_waited_on() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        let targets = units(&["comfyui.service", "broken.service"]);
        assert_eq!(rt.fetch_statuses(&targets).await, 0);

        let started = tokio::time::Instant::now();
        assert_eq!(rt.fetch_statuses(&targets).await, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_toggle_stops_active_and_starts_stopped() {
        let (mut rt, _dir) = runtime(SCRIPT, config());
        let failures = rt
            .toggle(&units(&["comfyui.service", "broken.service"]))
            .await;
        // stopping comfyui is denied by the script
        assert_eq!(failures, 1);

        let out = output(&rt);
        assert!(out.contains("[comfyui.service] Stop failed: Access denied"));
        assert!(out.contains("Start broken.service: done"));
    }

    #[tokio::test]
    async fn test_one_shot_accepts_unconfigured_units() {
        let (mut rt, _dir) = runtime(SCRIPT, TrayConfig::default());
        let failures = rt.fetch_statuses(&units(&["adhoc.service"])).await;
        assert_eq!(failures, 0);
        assert_eq!(rt.reconciler().query_status("adhoc.service"), "active");
    }

    #[tokio::test]
    async fn test_reload_config_from_disk() {
        let (mut rt, dir) = runtime(SCRIPT, config());
        let path = dir.path().join("services.yaml");

        assert!(matches!(rt.reload_config(), Err(ConfigError::Io { .. })));

        std::fs::write(&path, "services:\n  - unit: other.service\n").unwrap();
        rt.reload_config().unwrap();
        assert_eq!(
            rt.config().active_units(),
            ["other.service".to_string()].into()
        );
    }

    #[tokio::test]
    async fn test_presenter_dedups_and_schedules_refresh() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut presenter = TerminalPresenter::new(Vec::new(), tx, Handle::current());
        presenter.status_changed("a.service", "active");
        presenter.status_changed("a.service", "active");
        presenter.status_changed("a.service", "deactivating");
        let out = String::from_utf8(presenter.output().clone()).unwrap();
        assert_eq!(out, "● a.service: active\n◑ a.service: deactivating\n");

        presenter.schedule_refresh(Duration::from_millis(20));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(got, Ok(Some(())));
    }
}
