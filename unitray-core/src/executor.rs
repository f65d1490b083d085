use crate::action::{DAEMON_LABEL, ServiceAction};

/// The Executor trait is the fire-and-forget seam to the service manager.
///
/// Implementations schedule every call as an independent task and return
/// immediately. Results never come back through the call itself; they are
/// delivered later as [`crate::event::BackendEvent`]s:
/// - `Status` produces `StatusFetched`, or `CommandFinished` with
///   `success: false` when the query times out or cannot be spawned
/// - every other action produces `CommandFinished`
///
/// Tasks for different units or actions may complete in any order.
pub trait Executor: Send + Sync {
    /// Schedule `action` against `unit`
    fn submit(&self, action: ServiceAction, unit: &str);

    fn status(&self, unit: &str) {
        self.submit(ServiceAction::Status, unit);
    }

    fn start(&self, unit: &str) {
        self.submit(ServiceAction::Start, unit);
    }

    fn stop(&self, unit: &str) {
        self.submit(ServiceAction::Stop, unit);
    }

    fn restart(&self, unit: &str) {
        self.submit(ServiceAction::Restart, unit);
    }

    fn reload_daemon(&self) {
        self.submit(ServiceAction::DaemonReload, DAEMON_LABEL);
    }
}
