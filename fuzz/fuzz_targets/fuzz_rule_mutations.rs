#![no_main]
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};
use std::sync::Arc;
use tradegate_rs::{
    ActionKind, Enforcement, Evaluator, GrantDraft, Grantee, MemoryAuditLog, MemoryStore,
    PermissionEngine, PermissionKind, ResourceKind, RestrictionDraft, RestrictionKind, RuleLevel,
};

#[derive(Debug, Arbitrary)]
enum RuleOp {
    Grant {
        grantor: u8,
        grantee: u8,
        action: u8,
        deny: bool,
        everyone: bool,
    },
    Restrict {
        restrictor: u8,
        subject: u8,
        action: u8,
        hard: bool,
        priority: i8,
    },
    Revoke {
        rule_idx: u8,
    },
    Check {
        subject: u8,
        action: u8,
    },
}

fn action(raw: u8) -> ActionKind {
    match raw % 4 {
        0 => ActionKind::View,
        1 => ActionKind::Create,
        2 => ActionKind::Modify,
        _ => ActionKind::Exit,
    }
}

// Arbitrary mutation sequences must leave the engine consistent: every
// call returns Ok or a typed error, never panics.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let ops: Vec<RuleOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };
    if ops.is_empty() {
        return;
    }

    let store = Arc::new(MemoryStore::new());
    let evaluator = Evaluator::new(store.clone());
    let engine = PermissionEngine::new(store, Arc::new(MemoryAuditLog::new()), evaluator);
    let mut rule_ids = Vec::new();

    for op in ops.iter().take(16) {
        match op {
            RuleOp::Grant {
                grantor,
                grantee,
                action: act,
                deny,
                everyone,
            } => {
                let who = if *everyone {
                    Grantee::Everyone
                } else {
                    Grantee::User(i64::from(*grantee))
                };
                let level = if *deny { RuleLevel::Deny } else { RuleLevel::Allow };
                if let Ok(rule) = engine.grant(GrantDraft::new(
                    i64::from(*grantor),
                    who,
                    PermissionKind::TradingAction,
                    ResourceKind::Positions,
                    action(*act),
                    level,
                )) {
                    rule_ids.push(rule.id);
                }
            }
            RuleOp::Restrict {
                restrictor,
                subject,
                action: act,
                hard,
                priority,
            } => {
                let enforcement = if *hard { Enforcement::Hard } else { Enforcement::Soft };
                let draft = RestrictionDraft::new(
                    i64::from(*restrictor),
                    i64::from(*subject),
                    RestrictionKind::InstrumentBlacklist,
                    action(*act),
                    enforcement,
                )
                .with_priority(i32::from(*priority));
                if let Ok(rule) = engine.restrict(draft) {
                    rule_ids.push(rule.id);
                }
            }
            RuleOp::Revoke { rule_idx } => {
                if !rule_ids.is_empty() {
                    let id = rule_ids[usize::from(*rule_idx) % rule_ids.len()];
                    let _ = engine.revoke(id, 1, None);
                }
            }
            RuleOp::Check { subject, action: act } => {
                let _ = engine.check(
                    i64::from(*subject),
                    action(*act),
                    ResourceKind::Positions,
                    Some("NSE:TCS"),
                );
            }
        }
    }
});
