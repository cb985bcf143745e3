//! Channel subscription registry — reference-counted channel interest.
//!
//! DESIGN
//! ======
//! Any number of features may want the same channel (a project room, the
//! user's notification feed). Counts decide when the wire sees a join or a
//! leave: only on the 0→1 and 1→0 transitions.
//!
//! The registry also remembers which channels it has actually joined on the
//! current link generation. That makes `join` and `replay` idempotent per
//! link: a join queued while disconnected is sent exactly once, either by
//! `replay` after connect or by a direct `join` that races it.
//!
//! ERROR HANDLING
//! ==============
//! A leave without a matching join is clamped at zero and logged. Send
//! failures are logged; the channel stays wanted and is re-joined by the
//! next replay.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frames::Frame;
use tracing::{debug, info, warn};

use crate::transport::{LinkHandle, Transport};

#[derive(Default)]
struct RegistryState {
    counts: BTreeMap<String, usize>,
    wire_generation: u64,
    wire_joined: HashSet<String>,
}

impl RegistryState {
    /// Forget wire membership from older links.
    fn sync_generation(&mut self, generation: u64) {
        if self.wire_generation != generation {
            self.wire_joined.clear();
            self.wire_generation = generation;
        }
    }

    fn send_join(&mut self, link: &LinkHandle, channel: &str) -> bool {
        self.sync_generation(link.generation());
        if self.wire_joined.contains(channel) {
            return false;
        }
        match link.send(Frame::join_channel(channel)) {
            Ok(()) => {
                self.wire_joined.insert(channel.to_owned());
                true
            }
            Err(e) => {
                warn!(%channel, error = %e, "channels: join send failed");
                false
            }
        }
    }
}

/// Process-wide channel interest. Cheap to clone.
#[derive(Clone)]
pub struct ChannelRegistry {
    transport: Transport,
    state: Arc<Mutex<RegistryState>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self { transport, state: Arc::new(Mutex::new(RegistryState::default())) }
    }

    /// Register interest in `channel`. Returns the new count.
    pub fn join(&self, channel: &str) -> usize {
        let mut state = self.lock();
        let count = {
            let count = state.counts.entry(channel.to_owned()).or_insert(0);
            *count += 1;
            *count
        };
        if count == 1 {
            match self.transport.link() {
                Some(link) => {
                    state.send_join(&link, channel);
                    info!(%channel, "channels: joined");
                }
                None => debug!(%channel, "channels: join queued until connected"),
            }
        }
        count
    }

    /// Drop one unit of interest. Returns the remaining count.
    pub fn leave(&self, channel: &str) -> usize {
        let mut state = self.lock();
        let Some(count) = state.counts.get_mut(channel) else {
            warn!(%channel, "channels: leave without matching join; clamped at zero");
            return 0;
        };
        *count -= 1;
        let remaining = *count;
        if remaining > 0 {
            return remaining;
        }

        state.counts.remove(channel);
        if let Some(link) = self.transport.link() {
            state.sync_generation(link.generation());
            if state.wire_joined.remove(channel) {
                if let Err(e) = link.send(Frame::leave_channel(channel)) {
                    warn!(%channel, error = %e, "channels: leave send failed");
                }
                info!(%channel, "channels: left");
            }
        }
        0
    }

    /// Join `channel` for as long as the returned guard lives.
    #[must_use = "dropping the guard leaves the channel immediately"]
    pub fn join_scoped(&self, channel: &str) -> ChannelGuard {
        self.join(channel);
        ChannelGuard { registry: self.clone(), channel: channel.to_owned() }
    }

    /// Send a join for every wanted channel not yet joined on the current
    /// link. Called after each (re)connect. Returns the number of joins sent.
    pub fn replay(&self) -> usize {
        let Some(link) = self.transport.link() else {
            return 0;
        };
        let mut state = self.lock();
        let wanted: Vec<String> = state.counts.keys().cloned().collect();
        let sent = wanted.iter().filter(|channel| state.send_join(&link, channel)).count();
        if sent > 0 {
            info!(sent, generation = link.generation(), "channels: replayed joins");
        }
        sent
    }

    #[must_use]
    pub fn count(&self, channel: &str) -> usize {
        self.lock().counts.get(channel).copied().unwrap_or(0)
    }

    /// Channels with a positive count, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.lock().counts.keys().cloned().collect()
    }

    /// Forget all interest without touching the wire (logout).
    pub fn clear(&self) {
        let mut state = self.lock();
        state.counts.clear();
        state.wire_joined.clear();
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped channel membership from [`ChannelRegistry::join_scoped`].
pub struct ChannelGuard {
    registry: ChannelRegistry,
    channel: String,
}

impl ChannelGuard {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.registry.leave(&self.channel);
    }
}

#[cfg(test)]
#[path = "channels_test.rs"]
mod tests;
