//! Renderable state for a UI layer.
//!
//! Catalog browsing never depends on this state; only ordering does.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    connection::ConnectionState,
    error::{ConnectionError, OrderError},
    orders::OrderCoordinator,
    status::{MachineNotice, MachineStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderAvailability {
    Ready,
    Busy { operation: String },
    Submitting,
    Offline,
}

impl OrderAvailability {
    pub fn can_order(&self) -> bool {
        *self == Self::Ready
    }

    /// Label for the order action.
    pub fn label(&self) -> String {
        match self {
            Self::Ready => "Order".to_string(),
            Self::Busy { operation } => format!("Busy: {operation}"),
            Self::Submitting => "Sending...".to_string(),
            Self::Offline => "Offline".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewState {
    pub connection: ConnectionState,
    pub last_error: Option<ConnectionError>,
    pub machine: MachineStatus,
    pub submitting: bool,
}

impl ViewState {
    pub fn order_availability(&self) -> OrderAvailability {
        if !self.connection.is_connected() {
            OrderAvailability::Offline
        } else if let Some(operation) = self.machine.current_operation() {
            OrderAvailability::Busy {
                operation: operation.to_string(),
            }
        } else if self.submitting {
            OrderAvailability::Submitting
        } else {
            OrderAvailability::Ready
        }
    }

    pub fn connection_label(&self) -> String {
        match (self.connection, &self.last_error) {
            (ConnectionState::Reconnecting { attempt }, _) => {
                format!("reconnecting (attempt {attempt})")
            }
            (ConnectionState::Disconnected, Some(err)) => format!("disconnected: {err}"),
            (state, _) => state.label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Failure,
}

/// A dismissible message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

impl Notice {
    pub fn from_machine(notice: &MachineNotice) -> Self {
        match notice {
            MachineNotice::Completed { operation } => Self {
                kind: NoticeKind::Success,
                text: format!("{operation} is ready"),
            },
            MachineNotice::Failed { operation, reason } => {
                let subject = operation.as_deref().unwrap_or("drink");
                let text = match reason {
                    Some(reason) => format!("Failed to prepare {subject}: {reason}"),
                    None => format!("Failed to prepare {subject}"),
                };
                Self {
                    kind: NoticeKind::Failure,
                    text,
                }
            }
        }
    }

    /// Busy and in-flight refusals are shown through [`OrderAvailability`],
    /// not as notices.
    pub fn from_order_error(err: &OrderError) -> Option<Self> {
        match err {
            OrderError::MachineBusy { .. } | OrderError::OrderInFlight => None,
            OrderError::SubmissionFailed(_) | OrderError::Rejected { .. } => Some(Self {
                kind: NoticeKind::Failure,
                text: err.to_string(),
            }),
        }
    }
}

/// Folds connection, machine status and order state into [`ViewState`].
pub struct ViewAdapter {
    connection: watch::Receiver<ConnectionState>,
    errors: watch::Receiver<Option<ConnectionError>>,
    status: watch::Receiver<MachineStatus>,
    submitting: watch::Receiver<bool>,
    orders: Arc<OrderCoordinator>,
}

impl ViewAdapter {
    pub fn new(
        connection: watch::Receiver<ConnectionState>,
        errors: watch::Receiver<Option<ConnectionError>>,
        status: watch::Receiver<MachineStatus>,
        orders: Arc<OrderCoordinator>,
    ) -> Self {
        Self {
            connection,
            errors,
            status,
            submitting: orders.watch_submitting(),
            orders,
        }
    }

    pub fn snapshot(&self) -> ViewState {
        ViewState {
            connection: *self.connection.borrow(),
            last_error: self.errors.borrow().clone(),
            machine: self.status.borrow().clone(),
            submitting: self.orders.is_submitting(),
        }
    }

    /// Waits for the next change of connection, error, machine status or
    /// order submission. Returns `None` once the session behind the channels
    /// is gone.
    pub async fn changed(&mut self) -> Option<ViewState> {
        let alive = tokio::select! {
            res = self.connection.changed() => res.is_ok(),
            res = self.errors.changed() => res.is_ok(),
            res = self.status.changed() => res.is_ok(),
            res = self.submitting.changed() => res.is_ok(),
        };
        if !alive {
            return None;
        }
        self.connection.borrow_and_update();
        self.errors.borrow_and_update();
        self.status.borrow_and_update();
        self.submitting.borrow_and_update();
        Some(self.snapshot())
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
