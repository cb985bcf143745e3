//! Notification delivery pipeline — the one consumer that fans out to the UI.
//!
//! DESIGN
//! ======
//! Each `notification:create` event passes three gates, in order:
//!
//! 1. muted kind, or every channel off → dropped without a trace
//! 2. in-app on → retained in the [`Inbox`] for later listing
//! 3. quiet hours → transient channels suppressed; otherwise every enabled
//!    channel (toast, platform popup, sound) gets the notification
//!
//! Preferences are read fresh from a `watch` receiver on every event, so the
//! settings owner can change them at any time. Presentation sinks are
//! fire-and-forget: the pipeline never awaits or retries them, and a
//! panicking sink is logged and skipped.

mod prefs;

pub use prefs::{NotificationPreferences, PrefsError, QuietHours};

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, Time};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Event type the pipeline consumes.
pub const NOTIFICATION_CREATED: &str = "notification:create";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
}

impl Notification {
    /// Read a notification from an event payload. `id` may be a string or a
    /// number; `kind` falls back to `type`.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = match payload.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let text = |field: &str| payload.get(field).and_then(Value::as_str).map(ToOwned::to_owned);
        Some(Self {
            id,
            kind: text("kind").or_else(|| text("type")).unwrap_or_default(),
            title: text("title").unwrap_or_default(),
            body: text("body").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentationChannel {
    Toast,
    Popup,
    Sound,
}

/// What the pipeline did with one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Dropped,
    /// Retained in the inbox; transient channels suppressed by quiet hours.
    Quiet,
    Delivered(Vec<PresentationChannel>),
}

/// A presentation channel endpoint. Called synchronously; must not block.
pub trait PresentationSink: Send + Sync {
    fn present(&self, channel: PresentationChannel, notification: &Notification);
}

/// Sink that writes presentations to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl PresentationSink for LogSink {
    fn present(&self, channel: PresentationChannel, notification: &Notification) {
        info!(
            ?channel,
            id = %notification.id,
            kind = %notification.kind,
            title = %notification.title,
            "notify: presented"
        );
    }
}

// =============================================================================
// INBOX
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxItem {
    pub notification: Notification,
    pub read: bool,
}

/// Bounded in-app listing, newest first. Cheap to clone.
#[derive(Clone)]
pub struct Inbox {
    capacity: usize,
    items: Arc<Mutex<VecDeque<InboxItem>>>,
}

impl Inbox {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), items: Arc::default() }
    }

    /// Insert at the front, evicting the oldest past capacity.
    /// Returns false if a notification with the same id is already listed.
    pub fn push(&self, notification: Notification) -> bool {
        let mut items = self.lock();
        if items.iter().any(|item| item.notification.id == notification.id) {
            return false;
        }
        items.push_front(InboxItem { notification, read: false });
        items.truncate(self.capacity);
        true
    }

    #[must_use]
    pub fn items(&self) -> Vec<InboxItem> {
        self.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.lock().iter().filter(|item| !item.read).count()
    }

    pub fn mark_read(&self, id: &str) -> bool {
        let mut items = self.lock();
        match items.iter_mut().find(|item| item.notification.id == id) {
            Some(item) => {
                item.read = true;
                true
            }
            None => false,
        }
    }

    /// Returns how many items flipped to read.
    pub fn mark_all_read(&self) -> usize {
        let mut items = self.lock();
        let mut flipped = 0;
        for item in items.iter_mut().filter(|item| !item.read) {
            item.read = true;
            flipped += 1;
        }
        flipped
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<InboxItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

pub struct NotificationPipeline {
    prefs: watch::Receiver<NotificationPreferences>,
    inbox: Inbox,
    sinks: Vec<(PresentationChannel, Arc<dyn PresentationSink>)>,
}

impl NotificationPipeline {
    #[must_use]
    pub fn new(prefs: watch::Receiver<NotificationPreferences>, inbox: Inbox) -> Self {
        Self { prefs, inbox, sinks: Vec::new() }
    }

    /// Route `channel` to `sink`. A channel may have several sinks.
    #[must_use]
    pub fn with_sink(mut self, channel: PresentationChannel, sink: Arc<dyn PresentationSink>) -> Self {
        self.sinks.push((channel, sink));
        self
    }

    /// [`LogSink`] on every channel.
    #[must_use]
    pub fn with_log_sinks(self) -> Self {
        let sink: Arc<dyn PresentationSink> = Arc::new(LogSink);
        self.with_sink(PresentationChannel::Toast, Arc::clone(&sink))
            .with_sink(PresentationChannel::Popup, Arc::clone(&sink))
            .with_sink(PresentationChannel::Sound, sink)
    }

    #[must_use]
    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    /// Handle a notification payload at the current local time.
    pub fn handle(&self, payload: &Value) -> Delivery {
        self.handle_at(payload, local_time())
    }

    /// Handle a notification payload as if the local time were `now`.
    pub fn handle_at(&self, payload: &Value, now: Time) -> Delivery {
        let Some(notification) = Notification::from_payload(payload) else {
            warn!("notify: payload without id; dropped");
            return Delivery::Dropped;
        };
        let prefs = self.prefs.borrow().clone();

        if prefs.is_muted(&notification.kind) {
            debug!(id = %notification.id, kind = %notification.kind, "notify: muted kind");
            return Delivery::Dropped;
        }
        let channels = enabled_channels(&prefs);
        if !prefs.in_app && channels.is_empty() {
            debug!(id = %notification.id, "notify: every channel off");
            return Delivery::Dropped;
        }

        if prefs.in_app && !self.inbox.push(notification.clone()) {
            debug!(id = %notification.id, "notify: already delivered");
            return Delivery::Dropped;
        }

        if prefs.quiet_hours.is_some_and(|q| q.contains(now)) {
            debug!(id = %notification.id, "notify: quiet hours");
            return if prefs.in_app { Delivery::Quiet } else { Delivery::Dropped };
        }

        for channel in &channels {
            self.present(*channel, &notification);
        }
        Delivery::Delivered(channels)
    }

    fn present(&self, channel: PresentationChannel, notification: &Notification) {
        for (_, sink) in self.sinks.iter().filter(|(c, _)| *c == channel) {
            if catch_unwind(AssertUnwindSafe(|| sink.present(channel, notification))).is_err() {
                error!(?channel, id = %notification.id, "notify: presentation sink panicked");
            }
        }
    }
}

fn enabled_channels(prefs: &NotificationPreferences) -> Vec<PresentationChannel> {
    let mut channels = Vec::new();
    if prefs.in_app {
        channels.push(PresentationChannel::Toast);
    }
    if prefs.push {
        channels.push(PresentationChannel::Popup);
    }
    if prefs.sound {
        channels.push(PresentationChannel::Sound);
    }
    channels
}

/// Local wall-clock time, or UTC when the local offset cannot be determined.
fn local_time() -> Time {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()).time()
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
