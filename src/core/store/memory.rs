//! In-memory rule store
//!
//! Two id-keyed maps behind one `RwLock`: evaluation reads share the lock,
//! only mutations take it exclusively. Fits tests and single-process
//! embedders that persist rules elsewhere.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::core::error::{PermissionError, Result};
use crate::core::rule::{GrantDraft, GrantRule, RestrictionDraft, RestrictionRule};
use crate::core::store::{Revocation, RuleRecord, RuleStore, UpsertedGrant, UpsertedRestriction};
use crate::core::types::{ActionKind, PermissionKind, ResourceKind, RuleId, UserId};

#[derive(Default)]
struct Tables {
    grants: AHashMap<RuleId, GrantRule>,
    restrictions: AHashMap<RuleId, RestrictionRule>,
}

/// Heap-backed [`RuleStore`]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicI64::new(1),
        }
    }

    fn mint_id(&self) -> RuleId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Total rows, active or not. Test and introspection helper.
    pub fn row_count(&self) -> usize {
        let tables = self.tables.read();
        tables.grants.len() + tables.restrictions.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleStore for MemoryStore {
    fn grants_for_grantee(
        &self,
        grantee: UserId,
        permission: PermissionKind,
        resource: ResourceKind,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>> {
        let tables = self.tables.read();
        let mut rules: Vec<GrantRule> = tables
            .grants
            .values()
            .filter(|rule| {
                rule.is_live(now)
                    && rule.permission == permission
                    && rule.resource == resource
                    && rule.grantee.includes(grantee)
                    && rule.action.covers(action)
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(rules)
    }

    fn restrictions_for_subject(
        &self,
        subject: UserId,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<RestrictionRule>> {
        let tables = self.tables.read();
        let mut rules: Vec<RestrictionRule> = tables
            .restrictions
            .values()
            .filter(|rule| rule.is_live(now) && rule.subject == subject && rule.action.covers(action))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    fn grants_by_grantor(
        &self,
        grantor: UserId,
        permission: Option<PermissionKind>,
        resource: Option<ResourceKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>> {
        let tables = self.tables.read();
        let mut rules: Vec<GrantRule> = tables
            .grants
            .values()
            .filter(|rule| {
                rule.is_live(now)
                    && rule.grantor == grantor
                    && permission.map_or(true, |p| rule.permission == p)
                    && resource.map_or(true, |r| rule.resource == r)
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(rules)
    }

    fn grants_held_by(
        &self,
        grantee: UserId,
        permission: Option<PermissionKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>> {
        let tables = self.tables.read();
        let mut rules: Vec<GrantRule> = tables
            .grants
            .values()
            .filter(|rule| {
                rule.is_live(now)
                    && rule.grantee.includes(grantee)
                    && permission.map_or(true, |p| rule.permission == p)
            })
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(rules)
    }

    fn restrictions_by_subject(
        &self,
        subject: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RestrictionRule>> {
        let tables = self.tables.read();
        let mut rules: Vec<RestrictionRule> = tables
            .restrictions
            .values()
            .filter(|rule| rule.is_live(now) && rule.subject == subject)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    fn find_rule(&self, rule_id: RuleId) -> Result<Option<RuleRecord>> {
        let tables = self.tables.read();
        if let Some(rule) = tables.grants.get(&rule_id) {
            return Ok(Some(RuleRecord::Grant(rule.clone())));
        }
        if let Some(rule) = tables.restrictions.get(&rule_id) {
            return Ok(Some(RuleRecord::Restriction(rule.clone())));
        }
        Ok(None)
    }

    fn upsert_grant(&self, draft: GrantDraft, now: DateTime<Utc>) -> Result<UpsertedGrant> {
        let mut tables = self.tables.write();
        let identity = draft.identity();
        let existing = tables
            .grants
            .values()
            .find(|rule| rule.active && rule.identity() == identity)
            .map(|rule| rule.id);

        match existing {
            Some(id) => {
                let previous = tables.grants.get(&id).cloned();
                let rule = draft.into_rule(id, now);
                tables.grants.insert(id, rule.clone());
                Ok(UpsertedGrant { rule, previous })
            }
            None => {
                let id = self.mint_id();
                let rule = draft.into_rule(id, now);
                tables.grants.insert(id, rule.clone());
                Ok(UpsertedGrant {
                    rule,
                    previous: None,
                })
            }
        }
    }

    fn upsert_restriction(
        &self,
        draft: RestrictionDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertedRestriction> {
        let mut tables = self.tables.write();
        let identity = draft.identity();
        let existing = tables
            .restrictions
            .values()
            .find(|rule| rule.active && rule.identity() == identity)
            .map(|rule| rule.id);

        match existing {
            Some(id) => {
                let previous = tables.restrictions.get(&id).cloned();
                let rule = draft.into_rule(id, now);
                tables.restrictions.insert(id, rule.clone());
                Ok(UpsertedRestriction { rule, previous })
            }
            None => {
                let id = self.mint_id();
                let rule = draft.into_rule(id, now);
                tables.restrictions.insert(id, rule.clone());
                Ok(UpsertedRestriction {
                    rule,
                    previous: None,
                })
            }
        }
    }

    fn revoke(&self, rule_id: RuleId, revoked_by: UserId, now: DateTime<Utc>) -> Result<Revocation> {
        let mut tables = self.tables.write();

        if let Some(rule) = tables.grants.get_mut(&rule_id) {
            let previous = RuleRecord::Grant(rule.clone());
            if !rule.active {
                return Ok(Revocation {
                    current: previous.clone(),
                    previous,
                    changed: false,
                });
            }
            rule.active = false;
            rule.revoked_by = Some(revoked_by);
            rule.revoked_at = Some(now);
            return Ok(Revocation {
                previous,
                current: RuleRecord::Grant(rule.clone()),
                changed: true,
            });
        }

        if let Some(rule) = tables.restrictions.get_mut(&rule_id) {
            let previous = RuleRecord::Restriction(rule.clone());
            if !rule.active {
                return Ok(Revocation {
                    current: previous.clone(),
                    previous,
                    changed: false,
                });
            }
            rule.active = false;
            return Ok(Revocation {
                previous,
                current: RuleRecord::Restriction(rule.clone()),
                changed: true,
            });
        }

        Err(PermissionError::RuleNotFound(rule_id))
    }

    fn restore(&self, rule_id: RuleId, previous: Option<RuleRecord>) -> Result<()> {
        let mut tables = self.tables.write();
        match previous {
            Some(RuleRecord::Grant(rule)) => {
                tables.grants.insert(rule_id, rule);
            }
            Some(RuleRecord::Restriction(rule)) => {
                tables.restrictions.insert(rule_id, rule);
            }
            None => {
                tables.grants.remove(&rule_id);
                tables.restrictions.remove(&rule_id);
            }
        }
        Ok(())
    }

    fn compact_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write();
        let mut compacted = 0;

        for rule in tables.grants.values_mut() {
            if rule.active && rule.expires_at.is_some_and(|exp| exp <= now) {
                rule.active = false;
                compacted += 1;
            }
        }
        for rule in tables.restrictions.values_mut() {
            if rule.active && rule.expires_at.is_some_and(|exp| exp <= now) {
                rule.active = false;
                compacted += 1;
            }
        }

        Ok(compacted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::InstrumentScope;
    use crate::core::types::{Grantee, RuleLevel};
    use chrono::Duration;

    fn draft(grantor: UserId, grantee: Grantee, level: RuleLevel) -> GrantDraft {
        GrantDraft::new(
            grantor,
            grantee,
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            level,
        )
    }

    #[test]
    fn test_upsert_then_read_back() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let out = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Allow), now)
            .unwrap();
        assert!(out.previous.is_none());

        let rules = store
            .grants_for_grantee(1, PermissionKind::DataSharing, ResourceKind::Positions, ActionKind::View, now)
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, out.rule.id);
    }

    #[test]
    fn test_upsert_supersedes_same_identity() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);

        let first = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Allow), t0)
            .unwrap();
        let second = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Deny), t1)
            .unwrap();

        // Same identity: same id, updated row, previous captured
        assert_eq!(first.rule.id, second.rule.id);
        assert_eq!(second.rule.level, RuleLevel::Deny);
        assert_eq!(second.rule.granted_at, t1);
        assert_eq!(second.previous.as_ref().unwrap().level, RuleLevel::Allow);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn test_distinct_identities_coexist() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store
            .upsert_grant(draft(5, Grantee::Everyone, RuleLevel::Allow), now)
            .unwrap();
        store
            .upsert_grant(
                draft(5, Grantee::User(2), RuleLevel::Deny)
                    .with_scope(InstrumentScope::specific(&[]).unwrap()),
                now,
            )
            .unwrap();

        assert_eq!(store.row_count(), 2);
        // Both rows apply to user 2 (one via Everyone)
        let rules = store
            .grants_for_grantee(2, PermissionKind::DataSharing, ResourceKind::Positions, ActionKind::View, now)
            .unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_lazy_expiry_excludes_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let d = draft(5, Grantee::User(1), RuleLevel::Allow)
            .expiring_at(now + Duration::seconds(10));
        store.upsert_grant(d, now).unwrap();

        let later = now + Duration::seconds(11);
        let rules = store
            .grants_for_grantee(1, PermissionKind::DataSharing, ResourceKind::Positions, ActionKind::View, later)
            .unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_revoke_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let out = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Allow), now)
            .unwrap();

        let first = store.revoke(out.rule.id, 5, now).unwrap();
        assert!(first.changed);
        assert!(!first.current.is_active());

        let second = store.revoke(out.rule.id, 5, now).unwrap();
        assert!(!second.changed);
        assert!(!second.current.is_active());

        assert!(matches!(
            store.revoke(9999, 5, now),
            Err(PermissionError::RuleNotFound(9999))
        ));
    }

    #[test]
    fn test_restore_undoes_insert_and_update() {
        let store = MemoryStore::new();
        let now = Utc::now();

        // Fresh insert: restore(None) removes the row entirely
        let inserted = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Allow), now)
            .unwrap();
        store.restore(inserted.rule.id, None).unwrap();
        assert_eq!(store.row_count(), 0);

        // Update: restore(previous) reinstates the old row
        let first = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Allow), now)
            .unwrap();
        let second = store
            .upsert_grant(draft(5, Grantee::User(1), RuleLevel::Deny), now)
            .unwrap();
        store
            .restore(second.rule.id, second.previous.clone().map(RuleRecord::Grant))
            .unwrap();
        let rules = store
            .grants_for_grantee(1, PermissionKind::DataSharing, ResourceKind::Positions, ActionKind::View, now)
            .unwrap();
        assert_eq!(rules[0].level, RuleLevel::Allow);
        assert_eq!(rules[0].id, first.rule.id);
    }

    #[test]
    fn test_compact_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let expiring = draft(5, Grantee::User(1), RuleLevel::Allow)
            .expiring_at(now + Duration::seconds(1));
        store.upsert_grant(expiring, now).unwrap();
        store
            .upsert_grant(draft(6, Grantee::User(1), RuleLevel::Allow), now)
            .unwrap();

        let later = now + Duration::seconds(2);
        assert_eq!(store.compact_expired(later).unwrap(), 1);
        // Second run finds nothing left to do
        assert_eq!(store.compact_expired(later).unwrap(), 0);
    }

    #[test]
    fn test_restriction_ordering_by_priority() {
        use crate::core::types::{Enforcement, RestrictionKind};

        let store = MemoryStore::new();
        let now = Utc::now();

        let low = RestrictionDraft::new(1, 3, RestrictionKind::InstrumentBlacklist, ActionKind::Create, Enforcement::Soft)
            .with_priority(1);
        let high = RestrictionDraft::new(1, 3, RestrictionKind::InstrumentBlacklist, ActionKind::All, Enforcement::Hard)
            .with_priority(10);
        store.upsert_restriction(low, now).unwrap();
        store.upsert_restriction(high, now).unwrap();

        let rules = store.restrictions_for_subject(3, ActionKind::Create, now).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 10);
        assert_eq!(rules[1].priority, 1);
    }
}
