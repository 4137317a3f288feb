//! Event-name → subscriber multiplexer.
//!
//! Registrations live independently of any transport: the connection manager
//! feeds every decoded frame into [`ListenerRegistry::dispatch`], so a
//! replaced transport keeps delivering to the same subscribers.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use shared::protocol::{EventKind, ServerEvent};
use tracing::{debug, error};

use crate::error::SubscriptionCallbackError;

pub type Listener = Arc<dyn Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    listener: Listener,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<Registration>>,
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = lock(&self.inner);
        let counts: HashMap<EventKind, usize> = guard
            .listeners
            .iter()
            .map(|(kind, regs)| (*kind, regs.len()))
            .collect();
        f.debug_struct("ListenerRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `event`. Registering the same callback twice
    /// yields two independent subscriptions.
    pub fn on<F>(&self, event: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut guard = lock(&self.inner);
        guard.next_id += 1;
        let id = SubscriptionId(guard.next_id);
        guard.listeners.entry(event).or_default().push(Registration {
            id,
            listener: Arc::new(callback),
        });
        debug!(event = %event, subscription = id.0, "listener registered");
        Subscription {
            event,
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Name-based registration for callers that carry event names as strings.
    pub fn on_name<F>(
        &self,
        event: &str,
        callback: F,
    ) -> Result<Subscription, shared::error::ProtocolError>
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let kind: EventKind = event.parse()?;
        Ok(self.on(kind, callback))
    }

    pub fn listener_count(&self, event: EventKind) -> usize {
        lock(&self.inner)
            .listeners
            .get(&event)
            .map_or(0, Vec::len)
    }

    /// Invokes every listener registered for the event's name.
    ///
    /// The listener set is captured before the first call, so a callback that
    /// unsubscribes (itself or a sibling) only affects later dispatches.
    pub fn dispatch(&self, event: &ServerEvent) -> DispatchReport {
        let kind = event.kind();
        let listeners: Vec<Listener> = lock(&self.inner)
            .listeners
            .get(&kind)
            .map(|regs| regs.iter().map(|reg| Arc::clone(&reg.listener)).collect())
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for listener in listeners {
            match invoke(kind, &listener, event) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    error!(event = %kind, error = %err, "listener failed; continuing dispatch");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Drops every registration. Outstanding [`Subscription`] handles become
    /// no-ops.
    pub fn clear(&self) {
        lock(&self.inner).listeners.clear();
    }
}

fn invoke(
    kind: EventKind,
    listener: &Listener,
    event: &ServerEvent,
) -> Result<(), SubscriptionCallbackError> {
    match catch_unwind(AssertUnwindSafe(|| listener(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(cause)) => Err(SubscriptionCallbackError::Failed { event: kind, cause }),
        Err(payload) => Err(SubscriptionCallbackError::Panicked {
            event: kind,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for one registration. Dropping it leaves the listener registered;
/// call [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    event: EventKind,
    id: SubscriptionId,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    pub fn event(&self) -> EventKind {
        self.event
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes exactly this registration. Returns `false` when it was
    /// already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut guard = lock(&inner);
        let Some(regs) = guard.listeners.get_mut(&self.event) else {
            return false;
        };
        let before = regs.len();
        regs.retain(|reg| reg.id != self.id);
        let removed = regs.len() != before;
        if regs.is_empty() {
            guard.listeners.remove(&self.event);
        }
        if removed {
            debug!(event = %self.event, subscription = self.id.0, "listener removed");
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let guard = lock(&inner);
        guard
            .listeners
            .get(&self.event)
            .is_some_and(|regs| regs.iter().any(|reg| reg.id == self.id))
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
