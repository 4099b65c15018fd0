//! SQLite backing: durability across reopen, compaction, concurrent reads

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tradegate_rs::{
    ActionKind, AuditAction, AuditFilter, Enforcement, GrantDraft, Grantee, InstrumentKey,
    PermissionGate, PermissionKind, ResourceKind, RestrictionDraft, RestrictionKind, RuleLevel,
    SharingScope, TimeWindow, ValueLimits, ViewerSet,
};

fn reopen(path: &Path) -> PermissionGate {
    PermissionGate::open(path).unwrap()
}

#[test]
fn test_rules_and_audit_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.db");

    {
        let gate = reopen(&path);
        gate.grant_data_sharing(
            5,
            &[ResourceKind::Positions, ResourceKind::Holdings],
            SharingScope::AllExcept(vec![2]),
            None,
            Some("family"),
        )
        .unwrap();
        gate.apply_restriction(
            RestrictionDraft::new(
                1,
                9,
                RestrictionKind::InstrumentBlacklist,
                ActionKind::Create,
                Enforcement::Hard,
            )
            .with_instruments(vec![InstrumentKey::new("NSE:YESBANK").unwrap()])
            .with_priority(10),
        )
        .unwrap();
    }

    let gate = reopen(&path);
    assert!(gate.check(7, ActionKind::View, ResourceKind::Positions, None));
    assert!(!gate.check(2, ActionKind::View, ResourceKind::Positions, None));
    assert!(!gate.check(9, ActionKind::Create, ResourceKind::Positions, Some("NSE:YESBANK")));

    // 2 resources x (allow + deny) + 1 restriction
    let trail = gate.audit_log(&AuditFilter::new()).unwrap();
    assert_eq!(trail.len(), 5);
    assert_eq!(trail[0].action, AuditAction::Restrict);
}

#[test]
fn test_revocation_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.db");

    let rule_id = {
        let gate = reopen(&path);
        let rules = gate
            .grant_data_sharing(
                5,
                &[ResourceKind::Orders],
                SharingScope::Only(vec![3]),
                None,
                None,
            )
            .unwrap();
        gate.revoke(rules[0].id, 5, Some("shared by mistake".to_string())).unwrap();
        rules[0].id
    };

    let gate = reopen(&path);
    assert!(!gate.check(3, ActionKind::View, ResourceKind::Orders, None));

    // A repeat revoke is a no-op, not an error, and writes no second entry
    let repeat = gate.revoke(rule_id, 5, None).unwrap();
    assert!(!repeat.changed);
    let revokes = gate
        .audit_log(&AuditFilter::new().by_action(AuditAction::Revoke))
        .unwrap();
    assert_eq!(revokes.len(), 1);
    assert_eq!(revokes[0].reason.as_deref(), Some("shared by mistake"));
}

#[test]
fn test_identity_upsert_spans_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.db");

    let draft = || {
        GrantDraft::new(
            5,
            Grantee::User(1),
            PermissionKind::TradingAction,
            ResourceKind::Positions,
            ActionKind::Create,
            RuleLevel::Allow,
        )
    };

    let first_id = {
        let gate = reopen(&path);
        gate.engine().grant(draft()).unwrap().id
    };

    // Regranting the same identity after reopen updates the same row
    let gate = reopen(&path);
    let second = gate
        .engine()
        .grant(GrantDraft::new(
            5,
            Grantee::User(1),
            PermissionKind::TradingAction,
            ResourceKind::Positions,
            ActionKind::Create,
            RuleLevel::Deny,
        ))
        .unwrap();
    assert_eq!(second.id, first_id);
    assert!(!gate.check(1, ActionKind::Create, ResourceKind::Positions, None));

    // Identity includes scope: a targeted variant is a separate row
    let targeted = gate
        .engine()
        .grant(draft().with_scope(
            tradegate_rs::InstrumentScope::specific(&["NSE:TCS".to_string()]).unwrap(),
        ))
        .unwrap();
    assert_ne!(targeted.id, first_id);
}

#[test]
fn test_restriction_payload_roundtrips() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.db");

    {
        let gate = reopen(&path);
        gate.apply_restriction(
            RestrictionDraft::new(
                1,
                7,
                RestrictionKind::ValueLimit,
                ActionKind::Create,
                Enforcement::Soft,
            )
            .with_value_limits(ValueLimits {
                max_order_value: Some(250_000.0),
                max_position_size: Some(500.0),
            })
            .with_windows(vec![TimeWindow::new(
                chrono::NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
            )])
            .with_notes("advisory cap"),
        )
        .unwrap();
    }

    let gate = reopen(&path);
    let restrictions = gate.restrictions_on(7).unwrap();
    assert_eq!(restrictions.len(), 1);
    let stored = &restrictions[0];
    assert_eq!(stored.kind, RestrictionKind::ValueLimit);
    assert_eq!(stored.enforcement, Enforcement::Soft);
    assert_eq!(
        stored.value_limits.as_ref().unwrap().max_order_value,
        Some(250_000.0)
    );
    assert_eq!(stored.time_windows.len(), 1);
    assert_eq!(stored.notes.as_deref(), Some("advisory cap"));
}

#[test]
fn test_compaction_deactivates_expired_rows() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.db");
    let gate = reopen(&path);

    gate.grant_data_sharing(
        5,
        &[ResourceKind::Positions],
        SharingScope::Only(vec![2]),
        Some(chrono::Utc::now() + chrono::Duration::milliseconds(50)),
        None,
    )
    .unwrap();
    gate.grant_data_sharing(5, &[ResourceKind::Holdings], SharingScope::Only(vec![2]), None, None)
        .unwrap();

    assert!(gate.check(2, ActionKind::View, ResourceKind::Positions, None));
    std::thread::sleep(Duration::from_millis(80));

    // Already invisible to evaluation before compaction runs
    let gate = reopen(&path);
    assert!(!gate.check(2, ActionKind::View, ResourceKind::Positions, None));

    assert_eq!(gate.compact_expired().unwrap(), 1);
    assert_eq!(gate.compact_expired().unwrap(), 0);

    // The unexpired grant is untouched
    assert!(gate.check(2, ActionKind::View, ResourceKind::Holdings, None));
}

#[test]
fn test_viewer_listing_from_persisted_rules() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gate.db");

    {
        let gate = reopen(&path);
        gate.grant_data_sharing(
            5,
            &[ResourceKind::Positions],
            SharingScope::AllExcept(vec![2, 3]),
            None,
            None,
        )
        .unwrap();
    }

    let gate = reopen(&path);
    assert_eq!(
        gate.list_viewers(5, ResourceKind::Positions).unwrap(),
        ViewerSet::Everyone { except: vec![2, 3] }
    );
}

#[test]
fn test_concurrent_checks_on_one_database() {
    let dir = TempDir::new().unwrap();
    let gate = Arc::new(reopen(&dir.path().join("gate.db")));

    gate.grant_data_sharing(5, &[ResourceKind::Positions], SharingScope::Everyone, None, None)
        .unwrap();

    let handles: Vec<_> = (0..4i64)
        .map(|thread_id| {
            let gate = gate.clone();
            std::thread::spawn(move || {
                for i in 0..200i64 {
                    let subject = 10 + (thread_id * 200 + i) % 40;
                    assert!(gate.check(subject, ActionKind::View, ResourceKind::Positions, None));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
