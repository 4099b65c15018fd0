//! Permission engine
//!
//! Owns the write path. Every mutation runs the same sequence: validate,
//! take the owner's mutation scope, upsert in the store, append the audit
//! entry, invalidate affected cache entries, release, acknowledge. A failed
//! audit append rolls the store write back before the error surfaces, so a
//! rule never exists without its trail.
//!
//! Evaluation never touches the mutation scopes; concurrent readers go
//! straight through the evaluator.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::core::audit::{AuditAction, AuditEntry, AuditFilter, AuditLog, RuleTable};
use crate::core::cache::CacheStats;
use crate::core::error::{PermissionError, Result};
use crate::core::evaluator::{Decision, EvalRequest, Evaluator};
use crate::core::rule::{GrantDraft, GrantRule, RestrictionDraft, RestrictionRule};
use crate::core::store::{Revocation, RuleRecord, RuleStore, UpsertedGrant, UpsertedRestriction};
use crate::core::types::{ActionKind, Grantee, PermissionKind, ResourceKind, RuleId, RuleLevel, UserId};

/// Per-owner mutation locks; owners never block each other
#[derive(Default)]
struct MutationScopes {
    scopes: Mutex<AHashMap<UserId, Arc<Mutex<()>>>>,
}

impl MutationScopes {
    fn scope_for(&self, owner: UserId) -> Arc<Mutex<()>> {
        self.scopes
            .lock()
            .entry(owner)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Who currently sees an owner's resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerSet {
    /// Shared with everyone, minus the listed users
    Everyone { except: Vec<UserId> },
    /// Shared with exactly the listed users
    Listed(Vec<UserId>),
}

impl ViewerSet {
    /// Whether a given user is in the set.
    pub fn contains(&self, user: UserId) -> bool {
        match self {
            ViewerSet::Everyone { except } => !except.contains(&user),
            ViewerSet::Listed(users) => users.contains(&user),
        }
    }
}

/// The rule engine behind every mutation and query
pub struct PermissionEngine {
    store: Arc<dyn RuleStore>,
    audit: Arc<dyn AuditLog>,
    evaluator: Evaluator,
    scopes: MutationScopes,
}

impl PermissionEngine {
    pub fn new(store: Arc<dyn RuleStore>, audit: Arc<dyn AuditLog>, evaluator: Evaluator) -> Self {
        PermissionEngine {
            store,
            audit,
            evaluator,
            scopes: MutationScopes::default(),
        }
    }

    /// Answer one permission question.
    pub fn evaluate(&self, request: &EvalRequest<'_>) -> Decision {
        self.evaluator.evaluate(request)
    }

    /// Boolean shorthand over [`PermissionEngine::evaluate`].
    pub fn check(
        &self,
        subject: UserId,
        action: ActionKind,
        resource: ResourceKind,
        instrument: Option<&str>,
    ) -> bool {
        let mut request = EvalRequest::new(subject, action, resource);
        if let Some(key) = instrument {
            request = request.on_instrument(key);
        }
        self.evaluate(&request).allowed
    }

    /// Write or supersede a grant rule.
    pub fn grant(&self, draft: GrantDraft) -> Result<GrantRule> {
        let now = Utc::now();
        draft.validate(now)?;

        let scope = self.scopes.scope_for(draft.grantor);
        let _guard = scope.lock();

        let UpsertedGrant { rule, previous } = self.store.upsert_grant(draft, now)?;
        let entry = grant_entry(&rule, previous.as_ref(), now)?;
        self.settle(rule.id, previous.map(RuleRecord::Grant), entry)?;

        self.invalidate_for(rule.grantee);
        Ok(rule)
    }

    /// Write or supersede a restriction rule.
    pub fn restrict(&self, draft: RestrictionDraft) -> Result<RestrictionRule> {
        let now = Utc::now();
        draft.validate(now)?;

        let scope = self.scopes.scope_for(draft.restrictor);
        let _guard = scope.lock();

        let UpsertedRestriction { rule, previous } = self.store.upsert_restriction(draft, now)?;
        let entry = restriction_entry(&rule, previous.as_ref(), now)?;
        self.settle(rule.id, previous.map(RuleRecord::Restriction), entry)?;

        self.evaluator.invalidate_subject(rule.subject);
        Ok(rule)
    }

    /// Soft-delete a rule. Revoking an already-revoked rule is a no-op that
    /// writes no audit entry; an unknown id is an error.
    pub fn revoke(
        &self,
        rule_id: RuleId,
        revoked_by: UserId,
        reason: Option<String>,
    ) -> Result<Revocation> {
        let record = self
            .store
            .find_rule(rule_id)?
            .ok_or(PermissionError::RuleNotFound(rule_id))?;

        let scope = self.scopes.scope_for(record.owner());
        let _guard = scope.lock();
        let now = Utc::now();

        let revocation = self.store.revoke(rule_id, revoked_by, now)?;
        if !revocation.changed {
            return Ok(revocation);
        }

        let entry = revoke_entry(&revocation, revoked_by, reason, now)?;
        self.settle(rule_id, Some(revocation.previous.clone()), entry)?;

        match &revocation.current {
            RuleRecord::Grant(rule) => self.invalidate_for(rule.grantee),
            RuleRecord::Restriction(rule) => self.evaluator.invalidate_subject(rule.subject),
        }
        Ok(revocation)
    }

    /// Batch-deactivate rules whose expiry has passed. Expired rules are
    /// already invisible to evaluation, so no cache entries need to go.
    pub fn compact_expired(&self) -> Result<usize> {
        self.store.compact_expired(Utc::now())
    }

    /// Active data-sharing grants issued by `grantor`, newest first.
    pub fn sharing_settings(&self, grantor: UserId) -> Result<Vec<GrantRule>> {
        self.store
            .grants_by_grantor(grantor, Some(PermissionKind::DataSharing), None, Utc::now())
    }

    /// Active trading grants held by `grantee` (Everyone rows included),
    /// newest first.
    pub fn trading_grants_for(&self, grantee: UserId) -> Result<Vec<GrantRule>> {
        self.store
            .grants_held_by(grantee, Some(PermissionKind::TradingAction), Utc::now())
    }

    /// Active restrictions on `subject`, highest priority first.
    pub fn restrictions_on(&self, subject: UserId) -> Result<Vec<RestrictionRule>> {
        self.store.restrictions_by_subject(subject, Utc::now())
    }

    /// Who can currently view `owner`'s `resource`, derived from the live
    /// sharing grants the way the evaluator would decide a resource-level
    /// view (no instrument named).
    pub fn list_viewers(&self, owner: UserId, resource: ResourceKind) -> Result<ViewerSet> {
        let now = Utc::now();
        let grants = self.store.grants_by_grantor(
            owner,
            Some(PermissionKind::DataSharing),
            Some(resource),
            now,
        )?;

        let resource_wide =
            |rule: &&GrantRule, level: RuleLevel| rule.level == level && rule.scope.matches(None);

        // A deny against everyone blocks even explicitly allowed users.
        if grants
            .iter()
            .any(|rule| resource_wide(&rule, RuleLevel::Deny) && rule.grantee.is_everyone())
        {
            return Ok(ViewerSet::Listed(Vec::new()));
        }

        let mut denied: Vec<UserId> = grants
            .iter()
            .filter(|rule| resource_wide(rule, RuleLevel::Deny))
            .filter_map(|rule| rule.grantee.user_id())
            .collect();
        denied.sort_unstable();
        denied.dedup();

        if grants
            .iter()
            .any(|rule| resource_wide(&rule, RuleLevel::Allow) && rule.grantee.is_everyone())
        {
            return Ok(ViewerSet::Everyone { except: denied });
        }

        let mut listed: Vec<UserId> = grants
            .iter()
            .filter(|rule| resource_wide(rule, RuleLevel::Allow))
            .filter_map(|rule| rule.grantee.user_id())
            .filter(|user| !denied.contains(user))
            .collect();
        listed.sort_unstable();
        listed.dedup();
        Ok(ViewerSet::Listed(listed))
    }

    /// Page through the audit trail, newest first.
    pub fn audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.audit.query(filter)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.evaluator.cache_stats()
    }

    /// Append the audit entry; on failure undo the store write and surface
    /// the audit error. Runs under the owner's mutation scope.
    fn settle(
        &self,
        rule_id: RuleId,
        rollback: Option<RuleRecord>,
        entry: AuditEntry,
    ) -> Result<()> {
        if let Err(audit_err) = self.audit.append(entry) {
            if let Err(restore_err) = self.store.restore(rule_id, rollback) {
                warn!(
                    "rollback of rule {} after audit failure also failed: {}",
                    rule_id, restore_err
                );
            }
            return Err(audit_err);
        }
        Ok(())
    }

    fn invalidate_for(&self, grantee: Grantee) {
        match grantee {
            Grantee::Everyone => self.evaluator.invalidate_all(),
            Grantee::User(user) => self.evaluator.invalidate_subject(user),
        }
    }
}

fn grant_entry(
    rule: &GrantRule,
    previous: Option<&GrantRule>,
    now: DateTime<Utc>,
) -> Result<AuditEntry> {
    let action = match rule.level {
        RuleLevel::Allow => AuditAction::Grant,
        RuleLevel::Deny => AuditAction::Deny,
    };
    let mut entry = AuditEntry::new(action, rule.granted_by, rule.grantee.user_id(), RuleTable::Grants)
        .with_new_value(serde_json::to_value(rule)?);
    if let Some(prev) = previous {
        entry = entry.with_old_value(serde_json::to_value(prev)?);
    }
    entry.at = now;
    Ok(entry)
}

fn restriction_entry(
    rule: &RestrictionRule,
    previous: Option<&RestrictionRule>,
    now: DateTime<Utc>,
) -> Result<AuditEntry> {
    let mut entry = AuditEntry::new(
        AuditAction::Restrict,
        rule.restrictor,
        Some(rule.subject),
        RuleTable::Restrictions,
    )
    .with_new_value(serde_json::to_value(rule)?);
    if let Some(prev) = previous {
        entry = entry.with_old_value(serde_json::to_value(prev)?);
    }
    entry.at = now;
    Ok(entry)
}

fn revoke_entry(
    revocation: &Revocation,
    revoked_by: UserId,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<AuditEntry> {
    let mut entry = AuditEntry::new(
        AuditAction::Revoke,
        revoked_by,
        revocation.current.affected_subject(),
        revocation.current.table(),
    )
    .with_old_value(revocation.previous.to_json()?)
    .with_new_value(revocation.current.to_json()?);
    if let Some(reason) = reason {
        entry = entry.with_reason(reason);
    }
    entry.at = now;
    Ok(entry)
}
