//! Per-user delivery preferences, as published by the settings collaborator.

use serde::{Deserialize, Serialize};
use time::Time;
use time::macros::format_description;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrefsError {
    #[error("invalid time '{0}' (expected HH:MM)")]
    InvalidTime(String),
}

/// Channel toggles plus an optional quiet-hours window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    pub in_app: bool,
    pub push: bool,
    /// Delivered server-side; carried so the snapshot round-trips intact.
    pub email: bool,
    pub sound: bool,
    /// Notification kinds the user silenced entirely.
    pub muted_kinds: Vec<String>,
    pub quiet_hours: Option<QuietHours>,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            in_app: true,
            push: true,
            email: true,
            sound: true,
            muted_kinds: Vec::new(),
            quiet_hours: None,
        }
    }
}

impl NotificationPreferences {
    #[must_use]
    pub fn is_muted(&self, kind: &str) -> bool {
        self.muted_kinds.iter().any(|k| k == kind)
    }
}

/// Wire form: `{ "start": "HH:MM", "end": "HH:MM" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuietHoursText {
    start: String,
    end: String,
}

/// Daily window in local time. `start > end` wraps past midnight;
/// `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuietHoursText", into = "QuietHoursText")]
pub struct QuietHours {
    start: Time,
    end: Time,
}

impl QuietHours {
    #[must_use]
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    /// Parse `"HH:MM"` bounds.
    ///
    /// # Errors
    ///
    /// Returns [`PrefsError::InvalidTime`] for anything but a valid `HH:MM`.
    pub fn parse(start: &str, end: &str) -> Result<Self, PrefsError> {
        Ok(Self { start: parse_hhmm(start)?, end: parse_hhmm(end)? })
    }

    #[must_use]
    pub fn start(&self) -> Time {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Time {
        self.end
    }

    /// Whether `now` falls inside the window, compared at minute resolution.
    #[must_use]
    pub fn contains(&self, now: Time) -> bool {
        let now = Time::from_hms(now.hour(), now.minute(), 0).unwrap_or(now);
        if self.start == self.end {
            return false;
        }
        if self.start > self.end {
            now >= self.start || now <= self.end
        } else {
            self.start <= now && now <= self.end
        }
    }
}

fn parse_hhmm(text: &str) -> Result<Time, PrefsError> {
    let format = format_description!("[hour]:[minute]");
    Time::parse(text.trim(), &format).map_err(|_| PrefsError::InvalidTime(text.to_owned()))
}

fn format_hhmm(t: Time) -> String {
    format!("{:02}:{:02}", t.hour(), t.minute())
}

impl TryFrom<QuietHoursText> for QuietHours {
    type Error = PrefsError;

    fn try_from(text: QuietHoursText) -> Result<Self, Self::Error> {
        Self::parse(&text.start, &text.end)
    }
}

impl From<QuietHours> for QuietHoursText {
    fn from(q: QuietHours) -> Self {
        Self { start: format_hhmm(q.start), end: format_hhmm(q.end) }
    }
}

#[cfg(test)]
#[path = "prefs_test.rs"]
mod tests;
