//! Event multiplexer — one wire connection, many independent consumers.
//!
//! DESIGN
//! ======
//! Callbacks register per event type and receive every dispatched [`Event`]
//! of that type in registration order. Registration hands back a
//! [`Subscription`]; dropping it (or calling `unsubscribe`) is the only way
//! to remove the callback, so one consumer can never detach another.
//!
//! ERROR HANDLING
//! ==============
//! A panicking callback is caught, logged, and skipped. Siblings in the same
//! dispatch still run and the dispatcher keeps going. Event types with no
//! subscribers are dropped without complaint; features subscribe lazily.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value;
use tracing::{debug, error};

/// An inbound event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_type: String,
    /// Channel the event arrived on, when the server tagged one.
    pub channel: Option<String>,
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self { event_type: event_type.into(), channel: None, payload }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

impl From<frames::Frame> for Event {
    fn from(frame: frames::Frame) -> Self {
        Self { event_type: frame.syscall, channel: frame.channel, payload: frame.data }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registration {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    handlers: HashMap<String, Vec<Registration>>,
}

/// Local publish/subscribe bus keyed by event type. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_type`. Keep the returned handle alive for
    /// as long as the callback should fire.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, event_type: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let active = Arc::new(AtomicBool::new(true));
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.handlers.entry(event_type.clone()).or_default().push(Registration {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });
        debug!(%event_type, id, "bus: subscribed");

        Subscription { bus: Arc::downgrade(&self.inner), event_type, id, active }
    }

    /// Deliver `payload` to every callback registered for `event_type`.
    /// Returns the number of callbacks that ran to completion.
    pub fn dispatch(&self, event_type: &str, payload: Value) -> usize {
        self.dispatch_event(&Event::new(event_type, payload))
    }

    /// Deliver a fully formed event. Callbacks run outside the registry lock,
    /// so they may subscribe or unsubscribe freely.
    pub fn dispatch_event(&self, event: &Event) -> usize {
        let targets: Vec<(Arc<AtomicBool>, Callback)> = {
            let state = self.lock();
            let Some(regs) = state.handlers.get(&event.event_type) else {
                return 0;
            };
            regs.iter()
                .map(|r| (Arc::clone(&r.active), Arc::clone(&r.callback)))
                .collect()
        };

        let mut delivered = 0;
        for (active, callback) in targets {
            // Unsubscribed by an earlier callback in this same dispatch.
            if !active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(event_type = %event.event_type, %reason, "bus: subscriber panicked");
                }
            }
        }
        delivered
    }

    /// Number of live callbacks for `event_type`.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.lock().handlers.get(event_type).map_or(0, Vec::len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_owned()
}

// =============================================================================
// SUBSCRIPTION HANDLE
// =============================================================================

/// Scoped registration on an [`EventBus`]. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<Mutex<BusState>>,
    event_type: String,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Remove the callback now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {
        drop(self);
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    fn release(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut state = bus.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(regs) = state.handlers.get_mut(&self.event_type) {
            regs.retain(|r| r.id != self.id);
            if regs.is_empty() {
                state.handlers.remove(&self.event_type);
            }
        }
        debug!(event_type = %self.event_type, id = self.id, "bus: unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod tests;
