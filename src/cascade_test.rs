use super::*;
use serde_json::json;

fn keys(set: &BTreeSet<CacheKey>) -> Vec<String> {
    set.iter().map(ToString::to_string).collect()
}

#[test]
fn every_kind_has_a_rule_including_its_own_detail() {
    for kind in EntityKind::ALL {
        let set = cascade_for(kind, "1", &[]);
        assert!(set.contains(&kind.detail("1")), "{kind} misses its detail key");
        assert!(set.contains(&kind.lists()), "{kind} misses its list family");
    }
}

#[test]
fn kind_names_round_trip() {
    for kind in EntityKind::ALL {
        assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
    }
    assert_eq!(
        "sprint".parse::<EntityKind>(),
        Err(CascadeGapError { kind: "sprint".into() })
    );
}

#[test]
fn task_status_change_hits_detail_lists_and_aggregates() {
    let change = EntityChange::new(EntityKind::Task, "42", ChangeOp::Update)
        .with_relation(RelationChange::unchanged(Relation::Project, "7"))
        .with_relation(RelationChange::unchanged(Relation::Assignee, "u1"));

    assert_eq!(
        keys(&change.cascade()),
        vec![
            "dashboard",
            "project:7",
            "project_stats:7",
            "task:42",
            "tasks",
            "workload:u1",
        ]
    );
}

#[test]
fn reassignment_invalidates_old_and_new_assignee() {
    let change = EntityChange::new(EntityKind::Task, "42", ChangeOp::Update)
        .with_relation(RelationChange::unchanged(Relation::Project, "7"))
        .with_relation(RelationChange::moved(
            Relation::Assignee,
            Some("u1".into()),
            Some("u2".into()),
        ));

    let set = change.cascade();
    assert!(set.contains(&CacheKey::detail(WORKLOAD, "u1")));
    assert!(set.contains(&CacheKey::detail(WORKLOAD, "u2")));
    assert!(!set.contains(&CacheKey::list(WORKLOAD)));
}

#[test]
fn moving_task_between_projects_hits_both_projects() {
    let change = EntityChange::new(EntityKind::Task, "5", ChangeOp::Update).with_relation(
        RelationChange::moved(Relation::Project, Some("1".into()), Some("2".into())),
    );

    let set = change.cascade();
    assert!(set.contains(&CacheKey::detail(PROJECT_STATS, "1")));
    assert!(set.contains(&CacheKey::detail(PROJECT_STATS, "2")));
}

#[test]
fn unassigning_still_hits_previous_assignee() {
    let change = EntityChange::new(EntityKind::Task, "5", ChangeOp::Update)
        .with_relation(RelationChange::moved(Relation::Assignee, Some("u9".into()), None));

    assert!(change.cascade().contains(&CacheKey::detail(WORKLOAD, "u9")));
}

#[test]
fn unknown_relation_falls_back_to_family() {
    let set = cascade_for(EntityKind::Task, "5", &[]);
    assert!(set.contains(&CacheKey::list(PROJECT_STATS)));
    assert!(set.contains(&CacheKey::list(WORKLOAD)));
}

#[test]
fn time_log_touches_summary_task_project_and_author() {
    let set = cascade_for(
        EntityKind::TimeLog,
        "t1",
        &[
            RelationChange::unchanged(Relation::Task, "42"),
            RelationChange::unchanged(Relation::Project, "7"),
            RelationChange::unchanged(Relation::Author, "u1"),
        ],
    );
    assert_eq!(
        keys(&set),
        vec![
            "project_stats:7",
            "task:42",
            "time_log:t1",
            "time_logs",
            "time_summary",
            "workload:u1",
        ]
    );
}

#[test]
fn notification_touches_count() {
    let set = cascade_for(EntityKind::Notification, "n1", &[]);
    assert!(set.contains(&CacheKey::list(NOTIFICATION_COUNT)));
}

#[test]
fn deleting_project_sweeps_dependents() {
    let set = EntityChange::new(EntityKind::Project, "7", ChangeOp::Delete).cascade();
    assert!(set.contains(&EntityKind::Task.lists()));
    assert!(set.contains(&EntityKind::TimeLog.lists()));
    assert!(set.contains(&CacheKey::list(TIME_SUMMARY)));

    let update = EntityChange::new(EntityKind::Project, "7", ChangeOp::Update).cascade();
    assert!(!update.contains(&EntityKind::Task.lists()));
}

#[test]
fn raw_unknown_kind_is_a_gap_with_fallback() {
    let err = cascade_for_raw("sprint", "3", &[]).unwrap_err();
    assert_eq!(err.kind, "sprint");

    let set = cascade_or_fallback("sprint", "3", &[]);
    assert_eq!(keys(&set), vec!["sprint", "sprints"]);
    assert!(CacheKey::list("sprint").matches(&CacheKey::detail("sprint", 3)));
}

#[test]
fn whole_kind_cascade_widens_targeted_keys_to_families() {
    let set = cascade_for_kind(EntityKind::Task);
    assert!(set.iter().all(|key| key.id().is_none()), "{:?}", keys(&set));
    for family in ["task", "tasks", PROJECT_STATS, WORKLOAD, DASHBOARD, "comments", TIME_SUMMARY] {
        assert!(set.contains(&CacheKey::list(family)), "task misses {family}");
    }

    let user = cascade_for_kind(EntityKind::User);
    assert!(user.contains(&CacheKey::list(WORKLOAD)));
    assert!(user.contains(&CacheKey::list("user")));
    assert!(!user.contains(&CacheKey::list(DASHBOARD)));
}

#[test]
fn raw_known_kind_matches_typed_rule() {
    assert_eq!(
        cascade_for_raw("comment", "c1", &[]).unwrap(),
        cascade_for(EntityKind::Comment, "c1", &[])
    );
}

// =============================================================================
// EVENT PARSING
// =============================================================================

#[test]
fn parses_kind_and_op_from_event_type() {
    let event = Event::new(
        "task:update",
        json!({"id": 42, "project_id": 7, "assignee_id": "u2", "previous": {"assignee_id": "u1"}}),
    );

    let change = EntityChange::from_event(&event).unwrap();

    assert_eq!(change.kind, EntityKind::Task);
    assert_eq!(change.id, "42");
    assert_eq!(change.op, ChangeOp::Update);
    assert_eq!(
        change.relations,
        vec![
            RelationChange::unchanged(Relation::Project, "7"),
            RelationChange::moved(Relation::Assignee, Some("u1".into()), Some("u2".into())),
        ]
    );
}

#[test]
fn parses_generic_entity_change_event() {
    let event = Event::new(
        ENTITY_CHANGE_EVENT,
        json!({"kind": "time_log", "op": "deleted", "id": "t9", "task_id": 3}),
    );

    let change = EntityChange::from_event(&event).unwrap();

    assert_eq!(change.kind, EntityKind::TimeLog);
    assert_eq!(change.op, ChangeOp::Delete);
    assert_eq!(change.relations, vec![RelationChange::unchanged(Relation::Task, "3")]);
}

#[test]
fn null_relation_means_unset_not_unknown() {
    let event = Event::new("task:update", json!({"id": 1, "assignee_id": null}));
    let change = EntityChange::from_event(&event).unwrap();
    assert_eq!(change.relations, vec![RelationChange::moved(Relation::Assignee, None, None)]);
    assert!(!change.cascade().contains(&CacheKey::list(WORKLOAD)));
}

#[test]
fn parse_errors_are_typed() {
    assert_eq!(
        EntityChange::from_event(&Event::new("sprint:update", json!({"id": 1}))),
        Err(ChangeError::Gap(CascadeGapError { kind: "sprint".into() }))
    );
    assert_eq!(
        EntityChange::from_event(&Event::new("task:archive", json!({"id": 1}))),
        Err(ChangeError::UnknownOp("archive".into()))
    );
    assert_eq!(
        EntityChange::from_event(&Event::new("task:update", json!({"title": "x"}))),
        Err(ChangeError::MissingId { kind: EntityKind::Task })
    );
    assert_eq!(
        EntityChange::from_event(&Event::new("heartbeat", json!({}))),
        Err(ChangeError::NotAChange("heartbeat".into()))
    );
}
