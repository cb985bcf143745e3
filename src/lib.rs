//! Real-time sync and cache-consistency layer for a task-management client.
//!
//! One realtime link carries server events; channel interest is reference
//! counted and replayed on reconnect; events fan out through a local bus to
//! the invalidation cascade and the notification pipeline; the query cache
//! coalesces fetches and keeps optimistic patches revertible.
//!
//! [`SyncContext`] owns all of it and is the usual entry point.

pub mod bus;
pub mod cache;
pub mod cascade;
pub mod channels;
pub mod config;
pub mod context;
pub mod notify;
pub mod optimistic;
pub mod transport;

pub use bus::{Event, EventBus, Subscription};
pub use cache::{CacheKey, CacheSubscription, FetchError, QueryCache, fetcher};
pub use cascade::{CascadeGapError, ChangeOp, EntityChange, EntityKind, cascade_for};
pub use channels::{ChannelGuard, ChannelRegistry};
pub use config::{ConfigError, ReconnectPolicy, SyncConfig};
pub use context::SyncContext;
pub use notify::{Delivery, Inbox, NotificationPipeline, NotificationPreferences, QuietHours};
pub use optimistic::{Mutation, MutationCoordinator, MutationError, merge_patch};
pub use transport::{ConnectionState, ConnectionStatus, Transport, TransportError};
