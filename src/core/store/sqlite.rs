//! SQLite-backed rule store
//!
//! One connection behind a `Mutex`, per-mutation transactions. The same
//! database file holds rules and the audit log, so a grant and its audit
//! entry live in one durable store. Enums go in as TEXT via their storage
//! names; nested structures (patterns, conditions, windows) as JSON columns.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

use crate::core::audit::{AuditAction, AuditEntry, AuditFilter, AuditLog, RuleTable};
use crate::core::condition::{GrantConditions, TimeWindow, ValueLimits};
use crate::core::error::{PermissionError, Result};
use crate::core::rule::{GrantDraft, GrantRule, InstrumentScope, RestrictionDraft, RestrictionRule};
use crate::core::store::{Revocation, RuleRecord, RuleStore, UpsertedGrant, UpsertedRestriction};
use crate::core::types::{
    ActionKind, Enforcement, Grantee, PermissionKind, ResourceKind, RestrictionKind, RuleId,
    RuleLevel, UserId,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rule_ids (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);

CREATE TABLE IF NOT EXISTS grants (
    id              INTEGER PRIMARY KEY,
    grantor         INTEGER NOT NULL,
    grantee_kind    TEXT    NOT NULL,
    grantee_id      INTEGER,
    permission      TEXT    NOT NULL,
    resource        TEXT    NOT NULL,
    action          TEXT    NOT NULL,
    level           TEXT    NOT NULL,
    scope_kind      TEXT    NOT NULL,
    scope_patterns  TEXT    NOT NULL,
    conditions      TEXT,
    granted_by      INTEGER NOT NULL,
    granted_at      TEXT    NOT NULL,
    expires_at      TEXT,
    active          INTEGER NOT NULL,
    revoked_by      INTEGER,
    revoked_at      TEXT,
    notes           TEXT
);
CREATE INDEX IF NOT EXISTS idx_grants_grantee
    ON grants(grantee_id, permission, resource) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_grants_grantor
    ON grants(grantor) WHERE active = 1;

CREATE TABLE IF NOT EXISTS restrictions (
    id              INTEGER PRIMARY KEY,
    subject         INTEGER NOT NULL,
    restrictor      INTEGER NOT NULL,
    kind            TEXT    NOT NULL,
    action          TEXT    NOT NULL,
    instruments     TEXT    NOT NULL,
    value_limits    TEXT,
    time_windows    TEXT    NOT NULL,
    priority        INTEGER NOT NULL,
    enforcement     TEXT    NOT NULL,
    applied_at      TEXT    NOT NULL,
    expires_at      TEXT,
    active          INTEGER NOT NULL,
    notes           TEXT
);
CREATE INDEX IF NOT EXISTS idx_restrictions_subject
    ON restrictions(subject) WHERE active = 1;

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    action      TEXT    NOT NULL,
    actor       INTEGER NOT NULL,
    target      INTEGER,
    rule_table  TEXT    NOT NULL,
    old_value   TEXT,
    new_value   TEXT,
    reason      TEXT,
    at          TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor);
CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_log(target);
";

const GRANT_COLUMNS: &str = "id, grantor, grantee_kind, grantee_id, permission, resource, \
     action, level, scope_kind, scope_patterns, conditions, granted_by, granted_at, \
     expires_at, active, revoked_by, revoked_at, notes";

const RESTRICTION_COLUMNS: &str = "id, subject, restrictor, kind, action, instruments, \
     value_limits, time_windows, priority, enforcement, applied_at, expires_at, active, notes";

/// Durable [`RuleStore`] and [`AuditLog`] over a single SQLite file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Private scratch database. Rows vanish when the store is dropped.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn mint_id(tx: &rusqlite::Transaction<'_>) -> Result<RuleId> {
        tx.execute("INSERT INTO rule_ids DEFAULT VALUES", [])?;
        Ok(tx.last_insert_rowid())
    }
}

fn grantee_parts(grantee: Grantee) -> (&'static str, Option<UserId>) {
    match grantee {
        Grantee::Everyone => ("everyone", None),
        Grantee::User(id) => ("user", Some(id)),
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unrecognized stored value '{raw}'").into(),
        )
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_column_opt<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<GrantRule> {
    let grantee_kind: String = row.get(2)?;
    let grantee_id: Option<UserId> = row.get(3)?;
    let grantee = match (grantee_kind.as_str(), grantee_id) {
        ("everyone", _) => Grantee::Everyone,
        ("user", Some(id)) => Grantee::User(id),
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unrecognized grantee '{grantee_kind}'").into(),
            ))
        }
    };

    let scope_kind: String = row.get(8)?;
    let scope_patterns: Vec<String> = json_column(row, 9)?;
    let scope = InstrumentScope::from_stored(&scope_kind, &scope_patterns);
    let conditions: Option<GrantConditions> = json_column_opt(row, 10)?;

    Ok(GrantRule {
        id: row.get(0)?,
        grantor: row.get(1)?,
        grantee,
        permission: parse_column(row, 4, PermissionKind::parse)?,
        resource: parse_column(row, 5, ResourceKind::parse)?,
        action: parse_column(row, 6, ActionKind::parse)?,
        level: parse_column(row, 7, RuleLevel::parse)?,
        scope,
        conditions,
        granted_by: row.get(11)?,
        granted_at: row.get(12)?,
        expires_at: row.get(13)?,
        active: row.get(14)?,
        revoked_by: row.get(15)?,
        revoked_at: row.get(16)?,
        notes: row.get(17)?,
    })
}

fn restriction_from_row(row: &Row<'_>) -> rusqlite::Result<RestrictionRule> {
    let instruments: Vec<String> = json_column(row, 5)?;
    let value_limits: Option<ValueLimits> = json_column_opt(row, 6)?;
    let time_windows: Vec<TimeWindow> = json_column(row, 7)?;

    Ok(RestrictionRule {
        id: row.get(0)?,
        subject: row.get(1)?,
        restrictor: row.get(2)?,
        kind: parse_column(row, 3, RestrictionKind::parse)?,
        action: parse_column(row, 4, ActionKind::parse)?,
        instruments,
        value_limits,
        time_windows,
        priority: row.get(8)?,
        enforcement: parse_column(row, 9, Enforcement::parse)?,
        applied_at: row.get(10)?,
        expires_at: row.get(11)?,
        active: row.get(12)?,
        notes: row.get(13)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        action: parse_column(row, 1, AuditAction::parse)?,
        actor: row.get(2)?,
        target: row.get(3)?,
        table: parse_column(row, 4, RuleTable::parse)?,
        old_value: json_column_opt(row, 5)?,
        new_value: json_column_opt(row, 6)?,
        reason: row.get(7)?,
        at: row.get(8)?,
    })
}

/// Full-row write. REPLACE keeps insert, supersede, and restore on one path.
fn write_grant(conn: &Connection, rule: &GrantRule) -> Result<()> {
    let (grantee_kind, grantee_id) = grantee_parts(rule.grantee);
    let patterns = rule
        .scope
        .filter()
        .map(|f| f.raw_patterns())
        .unwrap_or_default();
    let conditions = rule
        .conditions
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT OR REPLACE INTO grants (id, grantor, grantee_kind, grantee_id, permission, \
         resource, action, level, scope_kind, scope_patterns, conditions, granted_by, \
         granted_at, expires_at, active, revoked_by, revoked_at, notes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            rule.id,
            rule.grantor,
            grantee_kind,
            grantee_id,
            rule.permission.as_str(),
            rule.resource.as_str(),
            rule.action.as_str(),
            rule.level.as_str(),
            rule.scope.kind_str(),
            serde_json::to_string(&patterns)?,
            conditions,
            rule.granted_by,
            rule.granted_at,
            rule.expires_at,
            rule.active,
            rule.revoked_by,
            rule.revoked_at,
            rule.notes,
        ],
    )?;
    Ok(())
}

fn write_restriction(conn: &Connection, rule: &RestrictionRule) -> Result<()> {
    let value_limits = rule
        .value_limits
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT OR REPLACE INTO restrictions (id, subject, restrictor, kind, action, \
         instruments, value_limits, time_windows, priority, enforcement, applied_at, \
         expires_at, active, notes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            rule.id,
            rule.subject,
            rule.restrictor,
            rule.kind.as_str(),
            rule.action.as_str(),
            serde_json::to_string(&rule.instruments)?,
            value_limits,
            serde_json::to_string(&rule.time_windows)?,
            rule.priority,
            rule.enforcement.as_str(),
            rule.applied_at,
            rule.expires_at,
            rule.active,
            rule.notes,
        ],
    )?;
    Ok(())
}

impl RuleStore for SqliteStore {
    fn grants_for_grantee(
        &self,
        grantee: UserId,
        permission: PermissionKind,
        resource: ResourceKind,
        action: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<GrantRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE active = 1 AND permission = ?1 AND resource = ?2 \
               AND (action = ?3 OR action = 'all') \
               AND (grantee_kind = 'everyone' OR grantee_id = ?4)"
        ))?;
        let mut rules: Vec<GrantRule> = stmt
            .query_map(
                params![
                    permission.as_str(),
                    resource.as_str(),
                    action.as_str(),
                    grantee
                ],
                grant_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|rule| rule.is_live(now))
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
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RESTRICTION_COLUMNS} FROM restrictions \
             WHERE active = 1 AND subject = ?1 AND (action = ?2 OR action = 'all')"
        ))?;
        let mut rules: Vec<RestrictionRule> = stmt
            .query_map(params![subject, action.as_str()], restriction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|rule| rule.is_live(now))
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
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE active = 1 AND grantor = ?1 \
               AND (?2 IS NULL OR permission = ?2) \
               AND (?3 IS NULL OR resource = ?3)"
        ))?;
        let mut rules: Vec<GrantRule> = stmt
            .query_map(
                params![
                    grantor,
                    permission.map(|p| p.as_str()),
                    resource.map(|r| r.as_str())
                ],
                grant_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|rule| rule.is_live(now))
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
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {GRANT_COLUMNS} FROM grants \
             WHERE active = 1 \
               AND (grantee_kind = 'everyone' OR grantee_id = ?1) \
               AND (?2 IS NULL OR permission = ?2)"
        ))?;
        let mut rules: Vec<GrantRule> = stmt
            .query_map(
                params![grantee, permission.map(|p| p.as_str())],
                grant_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|rule| rule.is_live(now))
            .collect();
        rules.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(rules)
    }

    fn restrictions_by_subject(
        &self,
        subject: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RestrictionRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RESTRICTION_COLUMNS} FROM restrictions WHERE active = 1 AND subject = ?1"
        ))?;
        let mut rules: Vec<RestrictionRule> = stmt
            .query_map(params![subject], restriction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|rule| rule.is_live(now))
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    fn find_rule(&self, rule_id: RuleId) -> Result<Option<RuleRecord>> {
        let conn = self.conn.lock();
        let grant = conn
            .query_row(
                &format!("SELECT {GRANT_COLUMNS} FROM grants WHERE id = ?1"),
                params![rule_id],
                grant_from_row,
            )
            .optional()?;
        if let Some(rule) = grant {
            return Ok(Some(RuleRecord::Grant(rule)));
        }

        let restriction = conn
            .query_row(
                &format!("SELECT {RESTRICTION_COLUMNS} FROM restrictions WHERE id = ?1"),
                params![rule_id],
                restriction_from_row,
            )
            .optional()?;
        Ok(restriction.map(RuleRecord::Restriction))
    }

    fn upsert_grant(&self, draft: GrantDraft, now: DateTime<Utc>) -> Result<UpsertedGrant> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let identity = draft.identity();
        let (grantee_kind, grantee_id) = grantee_parts(identity.grantee);
        let existing = tx
            .query_row(
                &format!(
                    "SELECT {GRANT_COLUMNS} FROM grants \
                     WHERE active = 1 AND grantor = ?1 AND grantee_kind = ?2 \
                       AND grantee_id IS ?3 AND permission = ?4 AND resource = ?5 \
                       AND action = ?6 AND scope_kind = ?7"
                ),
                params![
                    identity.grantor,
                    grantee_kind,
                    grantee_id,
                    identity.permission.as_str(),
                    identity.resource.as_str(),
                    identity.action.as_str(),
                    identity.scope_kind,
                ],
                grant_from_row,
            )
            .optional()?;

        let (rule, previous) = match existing {
            Some(prev) => {
                let id = prev.id;
                (draft.into_rule(id, now), Some(prev))
            }
            None => {
                let id = Self::mint_id(&tx)?;
                (draft.into_rule(id, now), None)
            }
        };
        write_grant(&tx, &rule)?;
        tx.commit()?;
        Ok(UpsertedGrant { rule, previous })
    }

    fn upsert_restriction(
        &self,
        draft: RestrictionDraft,
        now: DateTime<Utc>,
    ) -> Result<UpsertedRestriction> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let identity = draft.identity();
        let existing = tx
            .query_row(
                &format!(
                    "SELECT {RESTRICTION_COLUMNS} FROM restrictions \
                     WHERE active = 1 AND subject = ?1 AND restrictor = ?2 \
                       AND kind = ?3 AND action = ?4"
                ),
                params![
                    identity.subject,
                    identity.restrictor,
                    identity.kind.as_str(),
                    identity.action.as_str(),
                ],
                restriction_from_row,
            )
            .optional()?;

        let (rule, previous) = match existing {
            Some(prev) => {
                let id = prev.id;
                (draft.into_rule(id, now), Some(prev))
            }
            None => {
                let id = Self::mint_id(&tx)?;
                (draft.into_rule(id, now), None)
            }
        };
        write_restriction(&tx, &rule)?;
        tx.commit()?;
        Ok(UpsertedRestriction { rule, previous })
    }

    fn revoke(&self, rule_id: RuleId, revoked_by: UserId, now: DateTime<Utc>) -> Result<Revocation> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let grant = tx
            .query_row(
                &format!("SELECT {GRANT_COLUMNS} FROM grants WHERE id = ?1"),
                params![rule_id],
                grant_from_row,
            )
            .optional()?;
        if let Some(rule) = grant {
            let previous = RuleRecord::Grant(rule.clone());
            if !rule.active {
                return Ok(Revocation {
                    current: previous.clone(),
                    previous,
                    changed: false,
                });
            }
            let mut revoked = rule;
            revoked.active = false;
            revoked.revoked_by = Some(revoked_by);
            revoked.revoked_at = Some(now);
            write_grant(&tx, &revoked)?;
            tx.commit()?;
            return Ok(Revocation {
                previous,
                current: RuleRecord::Grant(revoked),
                changed: true,
            });
        }

        let restriction = tx
            .query_row(
                &format!("SELECT {RESTRICTION_COLUMNS} FROM restrictions WHERE id = ?1"),
                params![rule_id],
                restriction_from_row,
            )
            .optional()?;
        if let Some(rule) = restriction {
            let previous = RuleRecord::Restriction(rule.clone());
            if !rule.active {
                return Ok(Revocation {
                    current: previous.clone(),
                    previous,
                    changed: false,
                });
            }
            let mut revoked = rule;
            revoked.active = false;
            write_restriction(&tx, &revoked)?;
            tx.commit()?;
            return Ok(Revocation {
                previous,
                current: RuleRecord::Restriction(revoked),
                changed: true,
            });
        }

        Err(PermissionError::RuleNotFound(rule_id))
    }

    fn restore(&self, rule_id: RuleId, previous: Option<RuleRecord>) -> Result<()> {
        let conn = self.conn.lock();
        match previous {
            Some(RuleRecord::Grant(rule)) => write_grant(&conn, &rule)?,
            Some(RuleRecord::Restriction(rule)) => write_restriction(&conn, &rule)?,
            None => {
                conn.execute("DELETE FROM grants WHERE id = ?1", params![rule_id])?;
                conn.execute("DELETE FROM restrictions WHERE id = ?1", params![rule_id])?;
            }
        }
        Ok(())
    }

    fn compact_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut compacted = 0;

        for table in ["grants", "restrictions"] {
            let expired: Vec<RuleId> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id, expires_at FROM {table} \
                     WHERE active = 1 AND expires_at IS NOT NULL"
                ))?;
                let ids = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, RuleId>(0)?, row.get::<_, DateTime<Utc>>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?
                    .into_iter()
                    .filter(|(_, expires)| *expires <= now)
                    .map(|(id, _)| id)
                    .collect();
                ids
            };
            for id in &expired {
                tx.execute(
                    &format!("UPDATE {table} SET active = 0 WHERE id = ?1"),
                    params![id],
                )?;
            }
            compacted += expired.len();
        }

        tx.commit()?;
        Ok(compacted)
    }
}

impl AuditLog for SqliteStore {
    fn append(&self, entry: AuditEntry) -> Result<i64> {
        let conn = self.conn.lock();
        let old_value = entry
            .old_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let new_value = entry
            .new_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO audit_log (action, actor, target, rule_table, old_value, new_value, \
             reason, at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.action.as_str(),
                entry.actor,
                entry.target,
                entry.table.as_str(),
                old_value,
                new_value,
                entry.reason,
                entry.at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, action, actor, target, rule_table, old_value, new_value, reason, at \
             FROM audit_log \
             WHERE (?1 IS NULL OR actor = ?1) \
               AND (?2 IS NULL OR target = ?2) \
               AND (?3 IS NULL OR rule_table = ?3) \
               AND (?4 IS NULL OR action = ?4) \
               AND (?5 IS NULL OR at >= ?5) \
               AND (?6 IS NULL OR at <= ?6) \
             ORDER BY id DESC LIMIT ?7 OFFSET ?8",
        )?;
        let entries = stmt
            .query_map(
                params![
                    filter.actor,
                    filter.target,
                    filter.table.map(|t| t.as_str()),
                    filter.action.map(|a| a.as_str()),
                    filter.from,
                    filter.to,
                    filter.limit as i64,
                    filter.offset as i64,
                ],
                audit_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::condition::{EvalContext, GrantConditions, ValueLimits};
    use crate::core::types::{Grantee, RuleLevel};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn sharing_draft(grantor: UserId, grantee: Grantee) -> GrantDraft {
        GrantDraft::new(
            grantor,
            grantee,
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            RuleLevel::Allow,
        )
    }

    #[test]
    fn test_grant_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.db");
        let now = Utc::now();

        let draft = sharing_draft(5, Grantee::User(1))
            .with_scope(InstrumentScope::specific(&["NSE:NIFTY*".to_string()]).unwrap())
            .with_conditions(
                GrantConditions::new().with_value_limits(ValueLimits {
                    max_order_value: Some(100_000.0),
                    max_position_size: None,
                }),
            )
            .with_notes("quarterly review");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_grant(draft, now).unwrap().rule.id
        };

        let store = SqliteStore::open(&path).unwrap();
        let rules = store
            .grants_for_grantee(
                1,
                PermissionKind::DataSharing,
                ResourceKind::Positions,
                ActionKind::View,
                now,
            )
            .unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.id, id);
        assert_eq!(rule.scope.kind_str(), "SPECIFIC");
        assert!(rule.scope.matches(Some("NSE:NIFTY50")));
        assert!(!rule.scope.matches(Some("BSE:NIFTY50")));
        let conditions = rule.conditions.as_ref().unwrap();
        let ctx = EvalContext::new().with_order_value(50_000.0);
        assert!(conditions.satisfied(Some(&ctx), now));
        assert_eq!(rule.notes.as_deref(), Some("quarterly review"));
    }

    #[test]
    fn test_upsert_supersedes_same_row() {
        let store = SqliteStore::in_memory().unwrap();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(5);

        let first = store.upsert_grant(sharing_draft(5, Grantee::User(1)), t0).unwrap();
        let mut flipped = sharing_draft(5, Grantee::User(1));
        flipped.level = RuleLevel::Deny;
        let second = store.upsert_grant(flipped, t1).unwrap();

        assert_eq!(first.rule.id, second.rule.id);
        assert_eq!(second.rule.level, RuleLevel::Deny);
        assert_eq!(second.previous.as_ref().unwrap().level, RuleLevel::Allow);

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM grants", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_everyone_rows_reach_every_grantee() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        store
            .upsert_grant(sharing_draft(5, Grantee::Everyone), now)
            .unwrap();

        for user in [1, 2, 99] {
            let rules = store
                .grants_for_grantee(
                    user,
                    PermissionKind::DataSharing,
                    ResourceKind::Positions,
                    ActionKind::View,
                    now,
                )
                .unwrap();
            assert_eq!(rules.len(), 1, "user {user} should see the everyone grant");
            assert_eq!(rules[0].grantee, Grantee::Everyone);
        }
    }

    #[test]
    fn test_revoke_soft_deletes_but_find_rule_still_sees_it() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let id = store
            .upsert_grant(sharing_draft(5, Grantee::User(1)), now)
            .unwrap()
            .rule
            .id;

        let revocation = store.revoke(id, 5, now).unwrap();
        assert!(revocation.changed);

        let rules = store
            .grants_for_grantee(
                1,
                PermissionKind::DataSharing,
                ResourceKind::Positions,
                ActionKind::View,
                now,
            )
            .unwrap();
        assert!(rules.is_empty());

        match store.find_rule(id).unwrap() {
            Some(RuleRecord::Grant(rule)) => {
                assert!(!rule.active);
                assert_eq!(rule.revoked_by, Some(5));
            }
            other => panic!("expected revoked grant, got {other:?}"),
        }

        // Second revoke is a no-op
        assert!(!store.revoke(id, 5, now).unwrap().changed);
    }

    #[test]
    fn test_restriction_roundtrip_with_limits_and_windows() {
        use chrono::{NaiveTime, Weekday};

        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        let windows = vec![crate::core::condition::TimeWindow::new(
            NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        )
        .on_days(vec![Weekday::Mon, Weekday::Tue])];
        let draft = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::TimeRestriction,
            ActionKind::Create,
            Enforcement::Hard,
        )
        .with_windows(windows)
        .with_priority(7);

        let id = store.upsert_restriction(draft, now).unwrap().rule.id;
        let rules = store.restrictions_for_subject(3, ActionKind::Create, now).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, id);
        assert_eq!(rules[0].priority, 7);
        assert_eq!(rules[0].time_windows.len(), 1);
        assert_eq!(rules[0].enforcement, Enforcement::Hard);
    }

    #[test]
    fn test_restore_deletes_fresh_insert() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let id = store
            .upsert_grant(sharing_draft(5, Grantee::User(1)), now)
            .unwrap()
            .rule
            .id;

        store.restore(id, None).unwrap();
        assert!(store.find_rule(id).unwrap().is_none());
    }

    #[test]
    fn test_compact_expired_sticks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.db");
        let now = Utc::now();

        {
            let store = SqliteStore::open(&path).unwrap();
            let expiring = sharing_draft(5, Grantee::User(1))
                .expiring_at(now + ChronoDuration::seconds(1));
            store.upsert_grant(expiring, now).unwrap();

            let later = now + ChronoDuration::seconds(2);
            assert_eq!(store.compact_expired(later).unwrap(), 1);
            assert_eq!(store.compact_expired(later).unwrap(), 0);
        }

        let store = SqliteStore::open(&path).unwrap();
        let active: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM grants WHERE active = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(active, 0);
    }

    #[test]
    fn test_audit_append_and_filtered_query() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        for (actor, action) in [
            (5, AuditAction::Grant),
            (5, AuditAction::Revoke),
            (9, AuditAction::Restrict),
        ] {
            let mut entry = AuditEntry::new(action, actor, Some(1), RuleTable::Grants)
                .with_reason("settings change");
            entry.at = now;
            store.append(entry).unwrap();
        }

        let all = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(all.len(), 3);
        // Newest first
        assert_eq!(all[0].action, AuditAction::Restrict);

        let by_actor = store.query(&AuditFilter::new().by_actor(5)).unwrap();
        assert_eq!(by_actor.len(), 2);

        let paged = store.query(&AuditFilter::new().page(1, 1)).unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].action, AuditAction::Revoke);
    }

    #[test]
    fn test_ids_unique_across_tables() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();

        let grant_id = store
            .upsert_grant(sharing_draft(5, Grantee::User(1)), now)
            .unwrap()
            .rule
            .id;
        let restriction_id = store
            .upsert_restriction(
                RestrictionDraft::new(
                    1,
                    3,
                    RestrictionKind::InstrumentBlacklist,
                    ActionKind::Create,
                    Enforcement::Hard,
                ),
                now,
            )
            .unwrap()
            .rule
            .id;

        assert_ne!(grant_id, restriction_id);
        assert!(matches!(
            store.find_rule(grant_id).unwrap(),
            Some(RuleRecord::Grant(_))
        ));
        assert!(matches!(
            store.find_rule(restriction_id).unwrap(),
            Some(RuleRecord::Restriction(_))
        ));
    }
}
