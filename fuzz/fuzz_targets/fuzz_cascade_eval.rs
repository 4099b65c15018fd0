#![no_main]
use libfuzzer_sys::{
    arbitrary::{Arbitrary, Unstructured},
    fuzz_target,
};
use std::sync::Arc;
use tradegate_rs::{
    ActionKind, DecisionCache, EvalRequest, Evaluator, GrantDraft, Grantee, InstrumentScope,
    MemoryAuditLog, MemoryStore, PermissionEngine, PermissionKind, ResourceKind, RuleLevel,
};

#[derive(Debug, Arbitrary)]
struct SeedRule {
    grantor: u8,
    grantee: u8,
    action: u8,
    deny: bool,
    scoped: bool,
    instrument: u8,
}

fn action(raw: u8) -> ActionKind {
    match raw % 4 {
        0 => ActionKind::View,
        1 => ActionKind::Create,
        2 => ActionKind::Modify,
        _ => ActionKind::Exit,
    }
}

// The cascade must be deterministic: the same question gets the same
// answer on every pass, with or without the cache in front.
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);
    let rules: Vec<SeedRule> = match u.arbitrary() {
        Ok(rules) => rules,
        Err(_) => return,
    };
    if rules.is_empty() {
        return;
    }

    let store = Arc::new(MemoryStore::new());
    let evaluator = Evaluator::new(store.clone());
    let engine = PermissionEngine::new(store.clone(), Arc::new(MemoryAuditLog::new()), evaluator);

    for rule in rules.iter().take(12) {
        let level = if rule.deny { RuleLevel::Deny } else { RuleLevel::Allow };
        let mut draft = GrantDraft::new(
            i64::from(rule.grantor % 4),
            Grantee::User(i64::from(rule.grantee % 4)),
            PermissionKind::TradingAction,
            ResourceKind::Positions,
            action(rule.action),
            level,
        );
        if rule.scoped {
            let pattern = format!("NSE:SYM{}", rule.instrument % 8);
            let Ok(scope) = InstrumentScope::specific(&[pattern]) else {
                return;
            };
            draft = draft.with_scope(scope);
        }
        let _ = engine.grant(draft);
    }

    let cached = Evaluator::new(store.clone());
    let uncached = Evaluator::new(store).with_cache(DecisionCache::disabled());

    for subject in 0..4i64 {
        for raw in 0..4u8 {
            let key = format!("NSE:SYM{}", subject % 8);
            let request = EvalRequest::new(subject, action(raw), ResourceKind::Positions)
                .on_instrument(&key);

            let first = cached.evaluate(&request);
            assert_eq!(first, cached.evaluate(&request));
            let cold = uncached.evaluate(&request);
            assert_eq!(first.allowed, cold.allowed);
            assert_eq!(first.reason, cold.reason);
        }
    }
});
