//! Sync context — the explicitly constructed owner of every sync component.
//!
//! DESIGN
//! ======
//! `SyncContext` builds the transport, channel registry, event bus, query
//! cache, mutation coordinator and notification pipeline, and is handed to
//! consumers instead of living in a global. Clones share everything.
//!
//! `start()` connects and spawns the background work:
//!
//! - the pump: drains [`TransportEvent`]s in order, replays channel interest
//!   on each new link and dispatches frames to the bus
//! - the cache GC ticker
//! - the routers: bus subscriptions that turn entity change events into
//!   cascades and feed `notification:create` into the pipeline
//!
//! `shutdown()` stops all of it. `logout()` additionally forgets user state:
//! cached values, channel interest and the inbox.
//!
//! ERROR HANDLING
//! ==============
//! Malformed change events are logged and skipped. A change for an unknown
//! entity kind invalidates the whole kind instead. A change without an id
//! invalidates the whole kind plus every aggregate the kind feeds.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, Subscription};
use crate::cache::{CacheKey, QueryCache};
use crate::cascade::{
    ChangeError, ChangeOp, ENTITY_CHANGE_EVENT, EntityChange, EntityKind, cascade_for_kind, fallback_cascade,
};
use crate::channels::ChannelRegistry;
use crate::config::SyncConfig;
use crate::notify::{Inbox, NOTIFICATION_CREATED, NotificationPipeline, NotificationPreferences};
use crate::optimistic::MutationCoordinator;
use crate::transport::{ConnectionState, Connector, TokenSource, Transport, TransportError, TransportEvent};

const CHANGE_OPS: [&str; 3] = ["create", "update", "delete"];

type EventStream = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>>;

#[derive(Default)]
struct Running {
    tasks: Vec<JoinHandle<()>>,
    routes: Vec<Subscription>,
}

struct Inner {
    config: SyncConfig,
    transport: Transport,
    events: EventStream,
    bus: EventBus,
    channels: ChannelRegistry,
    cache: QueryCache,
    mutations: MutationCoordinator,
    notifications: Arc<NotificationPipeline>,
    running: Mutex<Running>,
}

/// Handle to the whole sync layer. Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<Inner>,
}

impl SyncContext {
    /// Build every component. Nothing runs until [`SyncContext::start`].
    /// Notifications are presented through [`crate::notify::LogSink`].
    #[must_use]
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        preferences: watch::Receiver<NotificationPreferences>,
    ) -> Self {
        let pipeline = NotificationPipeline::new(preferences, Inbox::new(config.inbox_capacity)).with_log_sinks();
        Self::with_pipeline(config, connector, tokens, pipeline)
    }

    /// Like [`SyncContext::new`], with a caller-built notification pipeline
    /// (platform sinks, a shared inbox).
    #[must_use]
    pub fn with_pipeline(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        pipeline: NotificationPipeline,
    ) -> Self {
        let (transport, events) = Transport::new(connector, tokens, config.reconnect);
        let cache = QueryCache::from_config(&config);
        let inner = Inner {
            channels: ChannelRegistry::new(transport.clone()),
            mutations: MutationCoordinator::new(cache.clone()),
            bus: EventBus::new(),
            events: Arc::new(tokio::sync::Mutex::new(events)),
            notifications: Arc::new(pipeline),
            running: Mutex::new(Running::default()),
            transport,
            cache,
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Connect and spawn the pump, GC and routers. Calling `start` on a
    /// running context only re-checks the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Authentication`] when no token is available.
    pub async fn start(&self) -> Result<(), TransportError> {
        {
            let mut running = lock(&self.inner.running);
            if running.tasks.is_empty() {
                running.routes = self.install_routes();
                running.tasks.push(tokio::spawn(pump(
                    Arc::clone(&self.inner.events),
                    self.inner.bus.clone(),
                    self.inner.channels.clone(),
                )));
                running.tasks.push(self.inner.cache.spawn_gc_task(self.inner.config.gc_interval));
                info!(routes = running.routes.len(), "sync: started");
            }
        }
        self.inner.transport.connect().await
    }

    /// Disconnect and stop background work. Cache, channel interest and
    /// inbox are kept; `start()` resumes from them.
    pub async fn shutdown(&self) {
        self.inner.transport.disconnect().await;

        let running = std::mem::take(&mut *lock(&self.inner.running));
        for task in &running.tasks {
            task.abort();
        }
        for task in running.tasks {
            let _ = task.await;
        }
        drop(running.routes);

        if let Ok(mut events) = self.inner.events.try_lock() {
            let mut stale = 0_usize;
            while events.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(stale, "sync: discarded undelivered transport events");
            }
        }
        info!("sync: stopped");
    }

    /// Shut down and forget everything that belongs to the signed-in user.
    pub async fn logout(&self) {
        self.shutdown().await;
        self.inner.cache.clear();
        self.inner.channels.clear();
        self.inner.notifications.inbox().clear();
        info!("sync: logged out");
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.inner.transport.status()
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    #[must_use]
    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    #[must_use]
    pub fn mutations(&self) -> &MutationCoordinator {
        &self.inner.mutations
    }

    #[must_use]
    pub fn inbox(&self) -> &Inbox {
        self.inner.notifications.inbox()
    }

    fn install_routes(&self) -> Vec<Subscription> {
        let bus = &self.inner.bus;
        let mut routes = Vec::with_capacity(EntityKind::ALL.len() * CHANGE_OPS.len() + 2);

        let event_types = EntityKind::ALL
            .iter()
            .flat_map(|kind| CHANGE_OPS.iter().map(move |op| format!("{kind}:{op}")))
            .chain(std::iter::once(ENTITY_CHANGE_EVENT.to_owned()));
        for event_type in event_types {
            let cache = self.inner.cache.clone();
            routes.push(bus.subscribe(event_type, move |event| {
                apply_change(&cache, event);
            }));
        }

        let pipeline = Arc::clone(&self.inner.notifications);
        routes.push(bus.subscribe(NOTIFICATION_CREATED, move |event| {
            let outcome = pipeline.handle(&event.payload);
            debug!(?outcome, "sync: notification routed");
        }));
        routes
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// BACKGROUND WORK
// =============================================================================

async fn pump(events: EventStream, bus: EventBus, channels: ChannelRegistry) {
    let mut events = events.lock_owned().await;
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected { generation } => {
                let joined = channels.replay();
                info!(generation, joined, "sync: link up; channel interest replayed");
            }
            TransportEvent::Frame(frame) => {
                let event = Event::from(frame);
                let delivered = bus.dispatch_event(&event);
                if delivered == 0 {
                    debug!(event_type = %event.event_type, "sync: no subscribers");
                }
            }
            TransportEvent::Disconnected => info!("sync: link lost"),
            TransportEvent::LinkDown => {
                warn!("sync: offline; serving last known cache state");
            }
        }
    }
}

/// Apply one inbound entity change to the cache. Returns how many entries
/// were invalidated or evicted.
pub fn apply_change(cache: &QueryCache, event: &Event) -> usize {
    let change = match EntityChange::from_event(event) {
        Ok(change) => change,
        Err(ChangeError::Gap(gap)) => {
            error!(error = %gap, "sync: change for unknown kind; invalidating the whole kind");
            return invalidate_all(cache, &fallback_cascade(&gap.kind));
        }
        Err(ChangeError::MissingId { kind }) => {
            warn!(%kind, event_type = %event.event_type, "sync: change without id; invalidating the whole kind");
            return invalidate_all(cache, &cascade_for_kind(kind));
        }
        Err(e) => {
            warn!(error = %e, event_type = %event.event_type, "sync: malformed change event");
            return 0;
        }
    };

    let mut touched = 0;
    if change.op == ChangeOp::Delete && cache.remove(&change.kind.detail(&change.id)) {
        touched += 1;
    }
    let keys = change.cascade();
    touched += invalidate_all(cache, &keys);
    debug!(kind = %change.kind, id = %change.id, keys = keys.len(), touched, "sync: cascade applied");
    touched
}

fn invalidate_all<'a>(cache: &QueryCache, keys: impl IntoIterator<Item = &'a CacheKey>) -> usize {
    keys.into_iter().map(|key| cache.invalidate(key)).sum()
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
