//! Invalidation cascade rules — which cache keys an entity change touches.
//!
//! DESIGN
//! ======
//! One table, one exhaustive `match` on [`EntityKind`]. Every kind has a
//! rule, so `cascade_for` is total and adding a kind fails to compile until
//! its rule exists. Rules return key patterns; the cache applies each to
//! every entry it matches, so `tasks` reaches every filtered task list.
//!
//! Lists are invalidated as whole families: the rules cannot know which
//! filters an entity matched before and after the change, and a spurious
//! refetch is cheaper than a stale list. Relation-keyed aggregates
//! (`project_stats:<id>`, `workload:<user>`) are targeted when the change
//! names the relation, and fall back to the whole family when it does not.
//! A changed relation invalidates both its old and its new target.
//!
//! KEY VOCABULARY
//! ==============
//! - details: `project:<id>`, `task:<id>`, `comment:<id>`, `time_log:<id>`,
//!   `notification:<id>`, `user:<id>`
//! - lists: `projects`, `tasks`, `comments`, `time_logs`, `notifications`, `users`
//! - aggregates: `project_stats:<project>`, `workload:<user>`, `dashboard`,
//!   `time_summary`, `notification_count`

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::bus::Event;
use crate::cache::CacheKey;

pub const PROJECT_STATS: &str = "project_stats";
pub const WORKLOAD: &str = "workload";
pub const DASHBOARD: &str = "dashboard";
pub const TIME_SUMMARY: &str = "time_summary";
pub const NOTIFICATION_COUNT: &str = "notification_count";

/// Generic change event carrying `kind`, `id`, and `op` in its payload.
pub const ENTITY_CHANGE_EVENT: &str = "entity:change";

// =============================================================================
// TYPES
// =============================================================================

/// Raised for an entity kind with no rule. Only reachable from untyped input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no cascade rule for entity kind '{kind}'")]
pub struct CascadeGapError {
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    #[error(transparent)]
    Gap(#[from] CascadeGapError),
    #[error("event '{0}' is not an entity change")]
    NotAChange(String),
    #[error("unknown change op '{0}'")]
    UnknownOp(String),
    #[error("{kind} change is missing its id")]
    MissingId { kind: EntityKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Task,
    Comment,
    TimeLog,
    Notification,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Project,
        EntityKind::Task,
        EntityKind::Comment,
        EntityKind::TimeLog,
        EntityKind::Notification,
        EntityKind::User,
    ];

    /// Wire name, also the detail-key kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Task => "task",
            Self::Comment => "comment",
            Self::TimeLog => "time_log",
            Self::Notification => "notification",
            Self::User => "user",
        }
    }

    /// Kind of the list keys for this entity.
    #[must_use]
    pub fn list_kind(self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Task => "tasks",
            Self::Comment => "comments",
            Self::TimeLog => "time_logs",
            Self::Notification => "notifications",
            Self::User => "users",
        }
    }

    #[must_use]
    pub fn detail(self, id: &str) -> CacheKey {
        CacheKey::detail(self.as_str(), id)
    }

    #[must_use]
    pub fn lists(self) -> CacheKey {
        CacheKey::list(self.list_kind())
    }

    /// Payload fields naming this kind's relations.
    fn relation_fields(self) -> &'static [(Relation, &'static str)] {
        match self {
            Self::Project | Self::User => &[],
            Self::Task => &[(Relation::Project, "project_id"), (Relation::Assignee, "assignee_id")],
            Self::Comment => &[(Relation::Task, "task_id"), (Relation::Author, "author_id")],
            Self::TimeLog => &[
                (Relation::Task, "task_id"),
                (Relation::Project, "project_id"),
                (Relation::Author, "user_id"),
            ],
            Self::Notification => &[(Relation::Recipient, "user_id")],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CascadeGapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CascadeGapError { kind: s.to_owned() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Project,
    Assignee,
    Task,
    Author,
    Recipient,
}

/// A relation as seen by one change. `before == after` when it did not move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationChange {
    pub relation: Relation,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl RelationChange {
    pub fn unchanged(relation: Relation, target: impl Into<String>) -> Self {
        let target = target.into();
        Self { relation, before: Some(target.clone()), after: Some(target) }
    }

    pub fn moved(relation: Relation, before: Option<String>, after: Option<String>) -> Self {
        Self { relation, before, after }
    }

    fn targets(&self) -> impl Iterator<Item = &str> {
        let after = self.after.as_deref().filter(|a| Some(*a) != self.before.as_deref());
        self.before.as_deref().into_iter().chain(after)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl FromStr for ChangeOp {
    type Err = ChangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" | "created" => Ok(Self::Create),
            "update" | "updated" => Ok(Self::Update),
            "delete" | "deleted" => Ok(Self::Delete),
            other => Err(ChangeError::UnknownOp(other.to_owned())),
        }
    }
}

/// One entity change, from an inbound event or a local mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    pub kind: EntityKind,
    pub id: String,
    pub op: ChangeOp,
    pub relations: Vec<RelationChange>,
}

impl EntityChange {
    pub fn new(kind: EntityKind, id: impl Into<String>, op: ChangeOp) -> Self {
        Self { kind, id: id.into(), op, relations: Vec::new() }
    }

    #[must_use]
    pub fn with_relation(mut self, change: RelationChange) -> Self {
        self.relations.push(change);
        self
    }

    /// Parse `<kind>:<op>` events and the generic `entity:change` event.
    ///
    /// Relation targets come from the payload's `*_id` fields; prior targets
    /// of moved relations from an optional `previous` object.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeError`] for unknown kinds or ops, or a missing `id`.
    pub fn from_event(event: &Event) -> Result<Self, ChangeError> {
        let payload = &event.payload;
        let (kind, op) = if event.event_type == ENTITY_CHANGE_EVENT {
            let kind = payload.get("kind").and_then(Value::as_str).unwrap_or_default();
            let op = payload.get("op").and_then(Value::as_str).unwrap_or_default();
            (kind, op)
        } else {
            event
                .event_type
                .split_once(':')
                .ok_or_else(|| ChangeError::NotAChange(event.event_type.clone()))?
        };
        let kind: EntityKind = kind.parse()?;
        let op: ChangeOp = op.parse()?;
        let id = payload.get("id").and_then(scalar).ok_or(ChangeError::MissingId { kind })?;

        let previous = payload.get("previous");
        let relations = kind
            .relation_fields()
            .iter()
            .filter_map(|(relation, field)| {
                let current = payload.get(*field)?;
                let after = scalar(current);
                let before = match previous.and_then(|p| p.get(*field)) {
                    Some(prior) => scalar(prior),
                    None => after.clone(),
                };
                Some(RelationChange::moved(*relation, before, after))
            })
            .collect();

        Ok(Self { kind, id, op, relations })
    }

    /// Keys to invalidate for this change, deletion extras included.
    #[must_use]
    pub fn cascade(&self) -> BTreeSet<CacheKey> {
        let mut keys = cascade_for(self.kind, &self.id, &self.relations);
        if self.op == ChangeOp::Delete {
            keys.extend(deletion_extras(self.kind, &self.id));
        }
        keys
    }
}

/// Render a JSON id (string or number) as key text.
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// RULES
// =============================================================================

/// Keys invalidated when entity `kind`/`id` changes with `relations`.
#[must_use]
pub fn cascade_for(kind: EntityKind, id: &str, relations: &[RelationChange]) -> BTreeSet<CacheKey> {
    let mut keys = BTreeSet::new();
    keys.insert(kind.detail(id));
    keys.insert(kind.lists());

    match kind {
        EntityKind::Project => {
            keys.insert(CacheKey::detail(PROJECT_STATS, id));
            keys.insert(CacheKey::list(DASHBOARD));
        }
        EntityKind::Task => {
            if !add_targets(&mut keys, relations, Relation::Project, |p| {
                vec![CacheKey::detail(PROJECT_STATS, p), EntityKind::Project.detail(p)]
            }) {
                keys.insert(CacheKey::list(PROJECT_STATS));
            }
            if !add_targets(&mut keys, relations, Relation::Assignee, |u| {
                vec![CacheKey::detail(WORKLOAD, u)]
            }) {
                keys.insert(CacheKey::list(WORKLOAD));
            }
            keys.insert(CacheKey::list(DASHBOARD));
        }
        EntityKind::Comment => {
            if !add_targets(&mut keys, relations, Relation::Task, |t| vec![EntityKind::Task.detail(t)]) {
                keys.insert(CacheKey::list(EntityKind::Task.as_str()));
            }
            keys.insert(CacheKey::list(DASHBOARD));
        }
        EntityKind::TimeLog => {
            if !add_targets(&mut keys, relations, Relation::Task, |t| vec![EntityKind::Task.detail(t)]) {
                keys.insert(CacheKey::list(EntityKind::Task.as_str()));
            }
            if !add_targets(&mut keys, relations, Relation::Project, |p| {
                vec![CacheKey::detail(PROJECT_STATS, p)]
            }) {
                keys.insert(CacheKey::list(PROJECT_STATS));
            }
            if !add_targets(&mut keys, relations, Relation::Author, |u| {
                vec![CacheKey::detail(WORKLOAD, u)]
            }) {
                keys.insert(CacheKey::list(WORKLOAD));
            }
            keys.insert(CacheKey::list(TIME_SUMMARY));
        }
        EntityKind::Notification => {
            keys.insert(CacheKey::list(NOTIFICATION_COUNT));
        }
        EntityKind::User => {
            keys.insert(CacheKey::detail(WORKLOAD, id));
        }
    }
    keys
}

/// Extra keys when an entity disappears and takes dependents with it.
fn deletion_extras(kind: EntityKind, id: &str) -> Vec<CacheKey> {
    match kind {
        EntityKind::Project => vec![
            EntityKind::Task.lists(),
            EntityKind::TimeLog.lists(),
            CacheKey::list(WORKLOAD),
            CacheKey::list(TIME_SUMMARY),
        ],
        EntityKind::Task => vec![
            EntityKind::Comment.lists(),
            EntityKind::TimeLog.lists(),
            CacheKey::list(TIME_SUMMARY),
        ],
        EntityKind::User => vec![EntityKind::Task.lists(), CacheKey::detail(WORKLOAD, id)],
        EntityKind::Comment | EntityKind::TimeLog | EntityKind::Notification => Vec::new(),
    }
}

/// Add `keys_for(target)` for every old and new target of `relation`.
/// Returns false when the change does not mention the relation at all, so
/// the caller can fall back to the whole family.
fn add_targets<F>(
    keys: &mut BTreeSet<CacheKey>,
    relations: &[RelationChange],
    relation: Relation,
    keys_for: F,
) -> bool
where
    F: Fn(&str) -> Vec<CacheKey>,
{
    let mut known = false;
    for change in relations.iter().filter(|c| c.relation == relation) {
        known = true;
        for target in change.targets() {
            keys.extend(keys_for(target));
        }
    }
    known
}

/// Cascade for an untyped kind name.
///
/// # Errors
///
/// Returns [`CascadeGapError`] when no rule exists for `kind`.
pub fn cascade_for_raw(
    kind: &str,
    id: &str,
    relations: &[RelationChange],
) -> Result<BTreeSet<CacheKey>, CascadeGapError> {
    let kind: EntityKind = kind.parse()?;
    Ok(cascade_for(kind, id, relations))
}

/// Keys touched by a change to some unknown entity of `kind`: every rule
/// this kind can reach, with each id-targeted key widened to its family.
#[must_use]
pub fn cascade_for_kind(kind: EntityKind) -> BTreeSet<CacheKey> {
    let mut keys: BTreeSet<CacheKey> = cascade_for(kind, "", &[])
        .into_iter()
        .chain(deletion_extras(kind, ""))
        .map(|key| match key.id() {
            Some("") => CacheKey::list(key.kind()),
            _ => key,
        })
        .collect();
    keys.extend(fallback_cascade(kind.as_str()));
    keys
}

/// Invalidate-everything fallback for a kind with no rule: every detail and
/// every list of that kind.
#[must_use]
pub fn fallback_cascade(kind: &str) -> BTreeSet<CacheKey> {
    BTreeSet::from([CacheKey::list(kind), CacheKey::list(format!("{kind}s"))])
}

/// [`cascade_for_raw`], logging a gap loudly and falling back instead of failing.
#[must_use]
pub fn cascade_or_fallback(kind: &str, id: &str, relations: &[RelationChange]) -> BTreeSet<CacheKey> {
    match cascade_for_raw(kind, id, relations) {
        Ok(keys) => keys,
        Err(e) => {
            error!(error = %e, "cascade: rule gap; invalidating the whole kind");
            fallback_cascade(kind)
        }
    }
}

#[cfg(test)]
#[path = "cascade_test.rs"]
mod tests;
