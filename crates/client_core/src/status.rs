//! Machine status model, driven only by controller pushes.
//!
//! The client never moves the machine to busy on its own: submitting an
//! order leaves the status untouched until `operation_started` arrives.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use shared::{
    domain::MachineStatusKind,
    protocol::{EventKind, ServerEvent, StatusSnapshot},
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::{
    error::StatusError,
    registry::{ListenerRegistry, Subscription},
};

const NOTICE_BUFFER: usize = 32;

/// Busy always carries its operation and start time together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MachineState {
    #[default]
    Available,
    Busy {
        operation: String,
        started_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineStatus {
    pub state: MachineState,
    pub connected_clients: u32,
}

/// User-facing outcome of a finished operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineNotice {
    Completed {
        operation: String,
    },
    Failed {
        operation: Option<String>,
        reason: Option<String>,
    },
}

impl MachineStatus {
    pub fn status(&self) -> MachineStatusKind {
        match self.state {
            MachineState::Available => MachineStatusKind::Available,
            MachineState::Busy { .. } => MachineStatusKind::Busy,
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == MachineState::Available
    }

    pub fn current_operation(&self) -> Option<&str> {
        match &self.state {
            MachineState::Available => None,
            MachineState::Busy { operation, .. } => Some(operation),
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            MachineState::Available => None,
            MachineState::Busy { started_at, .. } => Some(*started_at),
        }
    }

    /// Validates a full snapshot. An available snapshot must carry neither an
    /// operation nor a start time. A busy snapshot without a start time is
    /// stamped with `received_at`.
    pub fn from_snapshot(
        snapshot: &StatusSnapshot,
        received_at: DateTime<Utc>,
    ) -> Result<Self, StatusError> {
        let operation = snapshot
            .current_operation
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let state = match (snapshot.status, operation) {
            (MachineStatusKind::Available, None) if snapshot.start_time.is_some() => {
                return Err(StatusError::AvailableWithStartTime)
            }
            (MachineStatusKind::Available, None) => MachineState::Available,
            (MachineStatusKind::Available, Some(name)) => {
                return Err(StatusError::AvailableWithOperation(name.to_string()))
            }
            (MachineStatusKind::Busy, None) => return Err(StatusError::BusyWithoutOperation),
            (MachineStatusKind::Busy, Some(name)) => MachineState::Busy {
                operation: name.to_string(),
                started_at: snapshot.start_time.unwrap_or(received_at),
            },
        };
        Ok(Self {
            state,
            connected_clients: snapshot.connected_clients,
        })
    }

    pub fn to_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status(),
            current_operation: self.current_operation().map(str::to_string),
            start_time: self.start_time(),
            connected_clients: self.connected_clients,
        }
    }

    /// Applies one pushed event. Events outside the status protocol are
    /// ignored; a rejected snapshot leaves `self` untouched.
    pub fn apply(
        &mut self,
        event: &ServerEvent,
        received_at: DateTime<Utc>,
    ) -> Result<Option<MachineNotice>, StatusError> {
        match event {
            ServerEvent::StatusUpdate(snapshot) => {
                *self = Self::from_snapshot(snapshot, received_at)?;
                Ok(None)
            }
            ServerEvent::OperationStarted(started) => {
                let operation = started.operation.trim();
                if operation.is_empty() {
                    return Err(StatusError::BusyWithoutOperation);
                }
                self.state = MachineState::Busy {
                    operation: operation.to_string(),
                    started_at: started.time.unwrap_or(received_at),
                };
                Ok(None)
            }
            ServerEvent::OperationCompleted(completed) => {
                self.state = MachineState::Available;
                Ok(completed
                    .operation
                    .clone()
                    .map(|operation| MachineNotice::Completed { operation }))
            }
            ServerEvent::OperationFailed(failed) => {
                let previous = match std::mem::take(&mut self.state) {
                    MachineState::Busy { operation, .. } => Some(operation),
                    MachineState::Available => None,
                };
                Ok(Some(MachineNotice::Failed {
                    operation: failed.operation.clone().or(previous),
                    reason: failed.reason().map(str::to_string),
                }))
            }
            ServerEvent::Message(_) | ServerEvent::PongClient(_) => Ok(None),
        }
    }
}

struct TrackerInner {
    status: watch::Sender<MachineStatus>,
    notices: broadcast::Sender<MachineNotice>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Shared handle over the status model: a watch channel for the current
/// value and a broadcast channel for completion/failure notices.
#[derive(Clone)]
pub struct StatusTracker {
    inner: Arc<TrackerInner>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        let (status, _) = watch::channel(MachineStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            inner: Arc::new(TrackerInner {
                status,
                notices,
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn status(&self) -> MachineStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MachineStatus> {
        self.inner.status.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<MachineNotice> {
        self.inner.notices.subscribe()
    }

    /// Subscribes the tracker to the status events of `registry`. Calling it
    /// again replaces the previous subscriptions.
    pub fn attach(&self, registry: &ListenerRegistry) {
        self.detach();
        let subscriptions = EventKind::STATUS
            .into_iter()
            .map(|kind| {
                let tracker = self.clone();
                registry.on(kind, move |event| {
                    tracker.apply(event)?;
                    Ok(())
                })
            })
            .collect();
        *self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = subscriptions;
        debug!("status tracker attached");
    }

    pub fn detach(&self) {
        let subscriptions = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(Subscription::is_active)
    }

    /// Feeds one event through the model, publishing the new status and any
    /// resulting notice.
    pub fn apply(&self, event: &ServerEvent) -> Result<(), StatusError> {
        let received_at = Utc::now();
        let mut outcome = Ok(None);
        self.inner.status.send_if_modified(|status| {
            let before = status.clone();
            outcome = status.apply(event, received_at);
            *status != before
        });

        let notice = match outcome {
            Ok(notice) => notice,
            Err(err) => {
                warn!(event = %event.kind(), error = %err, "rejected status push");
                return Err(err);
            }
        };

        let status = self.status();
        info!(
            event = %event.kind(),
            status = %status.status(),
            operation = status.current_operation().unwrap_or("-"),
            connected_clients = status.connected_clients,
            "machine status updated"
        );
        if let Some(notice) = notice {
            let _ = self.inner.notices.send(notice);
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
