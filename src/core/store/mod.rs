//! Rule persistence
//!
//! Stores hold grant and restriction rows and enforce two invariants the rest
//! of the engine leans on: identity uniqueness among active rules (upserts
//! supersede in place) and lazy expiry (rows past `expires_at` are never
//! returned, compacted or not). Policy lives in the evaluator; stores only
//! filter and persist.
//!
//! Rule ids come from a single sequence shared by both tables, so an id names
//! exactly one rule across the store.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::core::audit::RuleTable;
use crate::core::error::Result;
use crate::core::rule::{GrantDraft, GrantRule, RestrictionDraft, RestrictionRule};
use crate::core::types::{ActionKind, PermissionKind, ResourceKind, RuleId, UserId};

/// A rule from either table
#[derive(Debug, Clone, PartialEq)]
pub enum RuleRecord {
    Grant(GrantRule),
    Restriction(RestrictionRule),
}

impl RuleRecord {
    pub fn id(&self) -> RuleId {
        match self {
            RuleRecord::Grant(rule) => rule.id,
            RuleRecord::Restriction(rule) => rule.id,
        }
    }

    /// The user whose mutation scope owns this rule.
    pub fn owner(&self) -> UserId {
        match self {
            RuleRecord::Grant(rule) => rule.grantor,
            RuleRecord::Restriction(rule) => rule.restrictor,
        }
    }

    /// The user whose decisions this rule affects; `None` for Everyone
    /// grants, which can affect any subject.
    pub fn affected_subject(&self) -> Option<UserId> {
        match self {
            RuleRecord::Grant(rule) => rule.grantee.user_id(),
            RuleRecord::Restriction(rule) => Some(rule.subject),
        }
    }

    pub fn table(&self) -> RuleTable {
        match self {
            RuleRecord::Grant(_) => RuleTable::Grants,
            RuleRecord::Restriction(_) => RuleTable::Restrictions,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            RuleRecord::Grant(rule) => rule.active,
            RuleRecord::Restriction(rule) => rule.active,
        }
    }

    /// JSON snapshot for audit old/new values.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            RuleRecord::Grant(rule) => serde_json::to_value(rule)?,
            RuleRecord::Restriction(rule) => serde_json::to_value(rule)?,
        };
        Ok(value)
    }
}

/// Result of a grant upsert: the stored rule plus whatever it superseded
#[derive(Debug, Clone)]
pub struct UpsertedGrant {
    pub rule: GrantRule,
    pub previous: Option<GrantRule>,
}

/// Result of a restriction upsert
#[derive(Debug, Clone)]
pub struct UpsertedRestriction {
    pub rule: RestrictionRule,
    pub previous: Option<RestrictionRule>,
}

/// Result of a revoke
///
/// `changed` is false when the rule was already revoked; revokes are
/// idempotent and the repeat is a no-op.
#[derive(Debug, Clone)]
pub struct Revocation {
    pub previous: RuleRecord,
    pub current: RuleRecord,
    pub changed: bool,
}

/// Storage contract for both rule families
///
/// Reads exclude inactive rows and rows past expiry. Mutations uphold the
/// identity uniqueness invariant by updating in place rather than erroring.
/// `restore` is the rollback hook for a failed audit append: it reinstates
/// the exact previous state (or deletes a row that was never acknowledged).
pub trait RuleStore: Send + Sync {
    /// Live grants bearing on (grantee, permission, resource, action),
    /// including Everyone rows and action wildcards, newest first.
    fn grants_for_grantee(
        &self,
        grantee: UserId,
        permission: PermissionKind,
        resource: ResourceKind,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>>;

    /// Live restrictions on the subject matching the action (or `all`),
    /// highest priority first.
    fn restrictions_for_subject(
        &self,
        subject: UserId,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<RestrictionRule>>;

    /// Live grants issued by the grantor, optionally narrowed by family and
    /// resource. Powers viewer listing and settings views.
    fn grants_by_grantor(
        &self,
        grantor: UserId,
        permission: Option<PermissionKind>,
        resource: Option<ResourceKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>>;

    /// Live grants held by the grantee, Everyone rows included, optionally
    /// narrowed by family. Powers the grants-received view.
    fn grants_held_by(
        &self,
        grantee: UserId,
        permission: Option<PermissionKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>>;

    /// Every live restriction on a subject.
    fn restrictions_by_subject(
        &self,
        subject: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RestrictionRule>>;

    /// Look up one rule by id, regardless of liveness.
    fn find_rule(&self, rule_id: RuleId) -> Result<Option<RuleRecord>>;

    /// Write a grant, superseding any active rule with the same identity.
    fn upsert_grant(&self, draft: GrantDraft, now: DateTime<Utc>) -> Result<UpsertedGrant>;

    /// Write a restriction, superseding any active rule with the same identity.
    fn upsert_restriction(
        &self,
        draft: RestrictionDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertedRestriction>;

    /// Soft-delete a rule. Idempotent; unknown ids are `RuleNotFound`.
    fn revoke(&self, rule_id: RuleId, revoked_by: UserId, now: DateTime<Utc>) -> Result<Revocation>;

    /// Reinstate the exact previous state of a rule (`None` deletes the row).
    /// Only the engine's audit-failure rollback calls this.
    fn restore(&self, rule_id: RuleId, previous: Option<RuleRecord>) -> Result<()>;

    /// Batch-deactivate rows whose expiry has passed; returns how many.
    fn compact_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
