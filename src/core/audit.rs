//! Audit trail for rule mutations
//!
//! Every grant, deny, revoke, and restriction lands here with before/after
//! snapshots. Appends are durable before the paired mutation acknowledges;
//! entries are never updated or deleted. Queries page backwards through
//! unbounded history.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::UserId;

/// What kind of mutation an entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    /// An ALLOW grant was written or superseded
    Grant,
    /// A DENY grant was written or superseded
    Deny,
    /// A rule was revoked
    Revoke,
    /// A restriction was applied or superseded
    Restrict,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Grant => "GRANT",
            AuditAction::Deny => "DENY",
            AuditAction::Revoke => "REVOKE",
            AuditAction::Restrict => "RESTRICT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GRANT" => Some(AuditAction::Grant),
            "DENY" => Some(AuditAction::Deny),
            "REVOKE" => Some(AuditAction::Revoke),
            "RESTRICT" => Some(AuditAction::Restrict),
            _ => None,
        }
    }
}

/// Which rule table a mutation touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTable {
    Grants,
    Restrictions,
}

impl RuleTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleTable::Grants => "grants",
            RuleTable::Restrictions => "restrictions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grants" => Some(RuleTable::Grants),
            "restrictions" => Some(RuleTable::Restrictions),
            _ => None,
        }
    }
}

/// Immutable audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Assigned by the log on append; 0 until then
    pub id: i64,
    pub action: AuditAction,
    /// Who performed the mutation
    pub actor: UserId,
    /// Whose access the mutation concerns; absent for everyone-wide rules
    pub target: Option<UserId>,
    pub table: RuleTable,

    /// Rule state before the mutation, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,

    /// Rule state after the mutation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub at: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an entry with the current timestamp, id unassigned.
    pub fn new(action: AuditAction, actor: UserId, target: Option<UserId>, table: RuleTable) -> Self {
        AuditEntry {
            id: 0,
            action,
            actor,
            target,
            table,
            old_value: None,
            new_value: None,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn with_old_value(mut self, value: serde_json::Value) -> Self {
        self.old_value = Some(value);
        self
    }

    pub fn with_new_value(mut self, value: serde_json::Value) -> Self {
        self.new_value = Some(value);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Query filter for the audit trail
///
/// All criteria are conjunctive; `limit`/`offset` page through the matches
/// newest-first.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<UserId>,
    pub target: Option<UserId>,
    pub table: Option<RuleTable>,
    pub action: Option<AuditAction>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl AuditFilter {
    /// Default page size when the caller doesn't set one
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn new() -> Self {
        AuditFilter {
            limit: Self::DEFAULT_LIMIT,
            ..Default::default()
        }
    }

    pub fn by_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn by_target(mut self, target: UserId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn in_table(mut self, table: RuleTable) -> Self {
        self.table = Some(table);
        self
    }

    pub fn by_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Whether an entry passes every set criterion.
    pub fn accepts(&self, entry: &AuditEntry) -> bool {
        if let Some(actor) = self.actor {
            if entry.actor != actor {
                return false;
            }
        }
        if let Some(target) = self.target {
            if entry.target != Some(target) {
                return false;
            }
        }
        if let Some(table) = self.table {
            if entry.table != table {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.action != action {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.at > to {
                return false;
            }
        }
        true
    }
}

/// Append-only audit sink
///
/// `append` must be durable before it returns: the engine treats a returned
/// id as proof the entry survives. `query` returns entries newest-first.
pub trait AuditLog: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<i64>;
    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;
}

/// In-memory audit log
///
/// Durability here means "held until drop"; the SQLite-backed log provides
/// real persistence. Useful for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, mut entry: AuditEntry) -> Result<i64> {
        let mut entries = self.entries.write();
        let id = entries.len() as i64 + 1;
        entry.id = id;
        entries.push(entry);
        Ok(id)
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let entries = self.entries.read();
        let page = entries
            .iter()
            .rev()
            .filter(|e| filter.accepts(e))
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect();
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: AuditAction, actor: UserId, target: UserId) -> AuditEntry {
        AuditEntry::new(action, actor, Some(target), RuleTable::Grants)
    }

    #[test]
    fn test_append_assigns_ids_in_order() {
        let log = MemoryAuditLog::new();
        let a = log.append(entry(AuditAction::Grant, 1, 2)).unwrap();
        let b = log.append(entry(AuditAction::Revoke, 1, 2)).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_query_newest_first() {
        let log = MemoryAuditLog::new();
        log.append(entry(AuditAction::Grant, 1, 2)).unwrap();
        log.append(entry(AuditAction::Deny, 1, 3)).unwrap();
        log.append(entry(AuditAction::Revoke, 1, 2)).unwrap();

        let all = log.query(&AuditFilter::new()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, AuditAction::Revoke);
        assert_eq!(all[2].action, AuditAction::Grant);
    }

    #[test]
    fn test_query_filters() {
        let log = MemoryAuditLog::new();
        log.append(entry(AuditAction::Grant, 1, 2)).unwrap();
        log.append(entry(AuditAction::Grant, 7, 2)).unwrap();
        log.append(entry(AuditAction::Restrict, 7, 3)).unwrap();

        let by_actor = log.query(&AuditFilter::new().by_actor(7)).unwrap();
        assert_eq!(by_actor.len(), 2);

        let by_target = log.query(&AuditFilter::new().by_target(2)).unwrap();
        assert_eq!(by_target.len(), 2);

        let by_action = log
            .query(&AuditFilter::new().by_action(AuditAction::Restrict))
            .unwrap();
        assert_eq!(by_action.len(), 1);
        assert_eq!(by_action[0].target, Some(3));
    }

    #[test]
    fn test_query_pagination_restartable() {
        let log = MemoryAuditLog::new();
        for i in 0..10 {
            log.append(entry(AuditAction::Grant, 1, i)).unwrap();
        }

        let first = log.query(&AuditFilter::new().page(4, 0)).unwrap();
        let second = log.query(&AuditFilter::new().page(4, 4)).unwrap();
        let third = log.query(&AuditFilter::new().page(4, 8)).unwrap();

        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert_eq!(third.len(), 2);
        assert_eq!(first[0].target, Some(9)); // newest first
        assert_eq!(third[1].target, Some(0));
    }
}
