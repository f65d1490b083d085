//! Task-per-command executor
//!
//! Every submitted action becomes its own tokio task. A semaphore bounds how
//! many external commands run at once; the per-action timeout bounds how long
//! each may take. Results travel back to the event loop as
//! [`EventEnvelope`]s stamped in completion order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use unitray_core::action::ServiceAction;
use unitray_core::event::{BackendEvent, EventEnvelope};
use unitray_core::executor::Executor;
use unitray_core::status::UNKNOWN_STATUS;

use crate::systemctl::{CommandOutput, ServiceManager, SystemctlError};

/// Worker pool size when none is configured
pub const DEFAULT_WORKERS: usize = 4;

pub struct TaskExecutor<M> {
    manager: Arc<M>,
    permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<EventEnvelope>,
    next_id: Arc<AtomicU64>,
    handle: Handle,
}

impl<M: ServiceManager> TaskExecutor<M> {
    /// Tasks are spawned on `handle`; at most `workers` commands run at once
    pub fn new(
        manager: Arc<M>,
        workers: usize,
        events: mpsc::UnboundedSender<EventEnvelope>,
        handle: Handle,
    ) -> Self {
        Self {
            manager,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            handle,
        }
    }

    #[cfg(test)]
    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }
}

impl<M: ServiceManager> Executor for TaskExecutor<M> {
    fn submit(&self, action: ServiceAction, unit: &str) {
        let manager = self.manager.clone();
        let permits = self.permits.clone();
        let events = self.events.clone();
        let next_id = self.next_id.clone();
        let unit = unit.to_string();

        let task_id = Uuid::new_v4();
        let span = info_span!("task", %task_id, action = action.label(), unit = %unit);

        self.handle.spawn(
            async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let result = manager.run(&action.args(&unit), action.timeout()).await;
                let event = interpret(action, &unit, result);

                let envelope = EventEnvelope {
                    id: next_id.fetch_add(1, Ordering::SeqCst),
                    at: SystemTime::now(),
                    event,
                };
                // The event loop may already be gone at shutdown
                if events.send(envelope).is_err() {
                    debug!("event loop closed, dropping result");
                }
            }
            .instrument(span),
        );
    }
}

/// Turn a finished (or failed) invocation into the event the reconciler ingests
pub fn interpret(
    action: ServiceAction,
    unit: &str,
    result: Result<CommandOutput, SystemctlError>,
) -> BackendEvent {
    let output = match result {
        Ok(output) => output,
        Err(e) => return BackendEvent::failed(unit, action, e.to_string()),
    };

    if action == ServiceAction::Status {
        let stdout = output.stdout.trim();
        let stderr = output.stderr.trim();
        let status = if !stdout.is_empty() {
            stdout
        } else if !stderr.is_empty() {
            stderr
        } else {
            UNKNOWN_STATUS
        };
        return BackendEvent::StatusFetched {
            unit: unit.to_string(),
            status: status.to_string(),
        };
    }

    let success = output.success();
    let message = if success || output.stderr.trim().is_empty() {
        output.stdout
    } else {
        output.stderr
    };
    BackendEvent::CommandFinished {
        unit: unit.to_string(),
        action,
        success,
        message,
    }
}
