//! Grant and restriction rules
//!
//! Two rule families drive every decision:
//! - [`GrantRule`]: an ALLOW/DENY between a grantor and a grantee, scoped to a
//!   resource, an action, and optionally a set of instrument patterns.
//! - [`RestrictionRule`]: a one-sided limit a restrictor imposes on a subject,
//!   with priority and enforcement strength.
//!
//! Rules are soft-deleted on revoke and lazily expired: a rule whose
//! `expires_at` has passed is never considered live, even before compaction
//! deactivates it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::condition::{EvalContext, GrantConditions, TimeWindow, ValueLimits};
use crate::core::error::{PermissionError, Result};
use crate::core::pattern::InstrumentFilter;
use crate::core::types::{
    ActionKind, Enforcement, Grantee, PermissionKind, ResourceKind, RestrictionKind, RuleId,
    RuleLevel, UserId,
};
use crate::core::validation::InstrumentKey;

/// How a grant's instrument filter applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "patterns", rename_all = "UPPERCASE")]
pub enum InstrumentScope {
    /// Every instrument
    All,
    /// Only instruments matching the listed patterns; an empty list targets
    /// the grantee as a whole and matches any instrument
    Specific(InstrumentFilter),
    /// Every instrument except those matching the listed patterns
    Exclude(InstrumentFilter),
}

impl InstrumentScope {
    /// Compile a SPECIFIC scope from raw pattern strings.
    pub fn specific(patterns: &[String]) -> Result<Self> {
        Ok(InstrumentScope::Specific(InstrumentFilter::compile(
            patterns,
        )?))
    }

    /// Compile an EXCLUDE scope from raw pattern strings.
    pub fn exclude(patterns: &[String]) -> Result<Self> {
        Ok(InstrumentScope::Exclude(InstrumentFilter::compile(
            patterns,
        )?))
    }

    /// Rebuild from stored parts, dropping unparseable patterns with a
    /// warning. Unknown kinds collapse to an empty SPECIFIC, which matches
    /// nothing beyond the grantee targeting semantics.
    pub fn from_stored(kind: &str, patterns: &[String]) -> Self {
        match kind {
            "ALL" => InstrumentScope::All,
            "EXCLUDE" => InstrumentScope::Exclude(InstrumentFilter::compile_lenient(patterns)),
            _ => InstrumentScope::Specific(InstrumentFilter::compile_lenient(patterns)),
        }
    }

    /// Whether this scope covers the given instrument.
    ///
    /// `None` means the request names no instrument (pure resource access):
    /// ALL and empty SPECIFIC cover it, a non-empty SPECIFIC does not, and
    /// EXCLUDE covers it (nothing named, nothing excluded).
    pub fn matches(&self, instrument: Option<&str>) -> bool {
        match self {
            InstrumentScope::All => true,
            InstrumentScope::Specific(filter) => {
                if filter.is_empty() {
                    return true;
                }
                match instrument {
                    Some(key) => filter.matches(key),
                    None => false,
                }
            }
            InstrumentScope::Exclude(filter) => match instrument {
                Some(key) => !filter.matches(key),
                None => true,
            },
        }
    }

    /// Storage name of the scope kind.
    pub fn kind_str(&self) -> &'static str {
        match self {
            InstrumentScope::All => "ALL",
            InstrumentScope::Specific(_) => "SPECIFIC",
            InstrumentScope::Exclude(_) => "EXCLUDE",
        }
    }

    /// Targeted scopes outrank ALL when breaking ties between matching rules.
    pub fn specificity(&self) -> u8 {
        match self {
            InstrumentScope::All => 0,
            InstrumentScope::Specific(_) | InstrumentScope::Exclude(_) => 1,
        }
    }

    /// The pattern filter, for scopes that carry one.
    pub fn filter(&self) -> Option<&InstrumentFilter> {
        match self {
            InstrumentScope::All => None,
            InstrumentScope::Specific(f) | InstrumentScope::Exclude(f) => Some(f),
        }
    }
}

/// Identity tuple enforcing grant uniqueness among active rules
///
/// Re-granting the same identity supersedes the prior rule in place. `level`
/// is deliberately absent: flipping ALLOW to DENY on the same identity is an
/// update, not a second rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantIdentity {
    pub grantor: UserId,
    pub grantee: Grantee,
    pub permission: PermissionKind,
    pub resource: ResourceKind,
    pub action: ActionKind,
    pub scope_kind: &'static str,
}

/// A stored grant rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantRule {
    pub id: RuleId,
    pub grantor: UserId,
    pub grantee: Grantee,
    pub permission: PermissionKind,
    pub resource: ResourceKind,
    pub action: ActionKind,
    pub level: RuleLevel,
    #[serde(flatten)]
    pub scope: InstrumentScope,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<GrantConditions>,

    pub granted_by: UserId,
    pub granted_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_by: Option<UserId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl GrantRule {
    /// Active and not past expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }

    pub fn identity(&self) -> GrantIdentity {
        GrantIdentity {
            grantor: self.grantor,
            grantee: self.grantee,
            permission: self.permission,
            resource: self.resource,
            action: self.action,
            scope_kind: self.scope.kind_str(),
        }
    }

    /// Whether this rule bears on the given request.
    pub fn applies_to(
        &self,
        subject: UserId,
        action: ActionKind,
        resource: ResourceKind,
        instrument: Option<&str>,
        context: Option<&EvalContext>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.grantee.includes(subject) {
            return false;
        }
        if self.resource != resource || !self.action.covers(action) {
            return false;
        }
        if !self.scope.matches(instrument) {
            return false;
        }
        match &self.conditions {
            Some(conditions) => conditions.satisfied(context, now),
            None => true,
        }
    }

    /// Tie-break key: targeted scope first, then recency.
    pub fn precedence(&self) -> (u8, DateTime<Utc>) {
        (self.scope.specificity(), self.granted_at)
    }
}

/// Input for a grant mutation; the store mints id and timestamps
#[derive(Debug, Clone)]
pub struct GrantDraft {
    pub grantor: UserId,
    pub grantee: Grantee,
    pub permission: PermissionKind,
    pub resource: ResourceKind,
    pub action: ActionKind,
    pub level: RuleLevel,
    pub scope: InstrumentScope,
    pub conditions: Option<GrantConditions>,
    pub granted_by: UserId,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl GrantDraft {
    pub fn new(
        grantor: UserId,
        grantee: Grantee,
        permission: PermissionKind,
        resource: ResourceKind,
        action: ActionKind,
        level: RuleLevel,
    ) -> Self {
        GrantDraft {
            grantor,
            grantee,
            permission,
            resource,
            action,
            level,
            scope: InstrumentScope::All,
            conditions: None,
            granted_by: grantor,
            expires_at: None,
            notes: None,
        }
    }

    pub fn with_scope(mut self, scope: InstrumentScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_conditions(mut self, conditions: GrantConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    pub fn granted_by(mut self, user: UserId) -> Self {
        self.granted_by = user;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Mutation-time validation; nothing is written when this fails.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        let action_ok = match self.permission {
            PermissionKind::DataSharing => {
                matches!(self.action, ActionKind::View | ActionKind::All)
            }
            PermissionKind::TradingAction => matches!(
                self.action,
                ActionKind::Create | ActionKind::Modify | ActionKind::Exit | ActionKind::All
            ),
        };
        if !action_ok {
            return Err(PermissionError::Validation(format!(
                "action '{}' is not valid for {} grants",
                self.action.as_str(),
                self.permission.as_str()
            )));
        }

        if let Some(exp) = self.expires_at {
            if exp <= now {
                return Err(PermissionError::Validation(
                    "expires_at must lie in the future".to_string(),
                ));
            }
        }

        if let Some(conditions) = &self.conditions {
            validate_limits(conditions.value_limits.as_ref())?;
        }

        Ok(())
    }

    pub fn identity(&self) -> GrantIdentity {
        GrantIdentity {
            grantor: self.grantor,
            grantee: self.grantee,
            permission: self.permission,
            resource: self.resource,
            action: self.action,
            scope_kind: self.scope.kind_str(),
        }
    }

    /// Materialize a rule row. Used by stores after identity resolution.
    pub fn into_rule(self, id: RuleId, now: DateTime<Utc>) -> GrantRule {
        GrantRule {
            id,
            grantor: self.grantor,
            grantee: self.grantee,
            permission: self.permission,
            resource: self.resource,
            action: self.action,
            level: self.level,
            scope: self.scope,
            conditions: self.conditions,
            granted_by: self.granted_by,
            granted_at: now,
            expires_at: self.expires_at,
            active: true,
            revoked_by: None,
            revoked_at: None,
            notes: self.notes,
        }
    }
}

/// Identity tuple for restriction upserts
///
/// Re-applying a restriction with the same identity updates it in place, the
/// same supersede semantics grants have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RestrictionIdentity {
    pub subject: UserId,
    pub restrictor: UserId,
    pub kind: RestrictionKind,
    pub action: ActionKind,
}

/// A stored restriction rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionRule {
    pub id: RuleId,
    pub subject: UserId,
    pub restrictor: UserId,
    pub kind: RestrictionKind,
    pub action: ActionKind,

    /// Explicit keys, no globs; empty matches any instrument
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instruments: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_limits: Option<ValueLimits>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_windows: Vec<TimeWindow>,

    pub priority: i32,
    pub enforcement: Enforcement,

    pub applied_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RestrictionRule {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }

    pub fn identity(&self) -> RestrictionIdentity {
        RestrictionIdentity {
            subject: self.subject,
            restrictor: self.restrictor,
            kind: self.kind,
            action: self.action,
        }
    }

    /// Whether this restriction triggers for the given request.
    pub fn matches(
        &self,
        action: ActionKind,
        instrument: Option<&str>,
        context: Option<&EvalContext>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.action.covers(action) {
            return false;
        }

        if !self.instruments.is_empty() {
            match instrument {
                Some(key) => {
                    if !self.instruments.iter().any(|k| k == key) {
                        return false;
                    }
                }
                None => return false,
            }
        }

        match self.kind {
            // The instrument containment above is the whole condition
            RestrictionKind::InstrumentBlacklist => true,
            RestrictionKind::ValueLimit => self
                .value_limits
                .as_ref()
                .is_some_and(|limits| limits.exceeded_by(context)),
            RestrictionKind::TimeRestriction => {
                self.time_windows.iter().any(|w| w.contains(now))
            }
        }
    }
}

/// Input for a restriction mutation
#[derive(Debug, Clone)]
pub struct RestrictionDraft {
    pub subject: UserId,
    pub restrictor: UserId,
    pub kind: RestrictionKind,
    pub action: ActionKind,
    pub instruments: Vec<InstrumentKey>,
    pub value_limits: Option<ValueLimits>,
    pub time_windows: Vec<TimeWindow>,
    pub priority: i32,
    pub enforcement: Enforcement,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl RestrictionDraft {
    pub fn new(
        restrictor: UserId,
        subject: UserId,
        kind: RestrictionKind,
        action: ActionKind,
        enforcement: Enforcement,
    ) -> Self {
        RestrictionDraft {
            subject,
            restrictor,
            kind,
            action,
            instruments: Vec::new(),
            value_limits: None,
            time_windows: Vec::new(),
            priority: 1,
            enforcement,
            expires_at: None,
            notes: None,
        }
    }

    pub fn with_instruments(mut self, instruments: Vec<InstrumentKey>) -> Self {
        self.instruments = instruments;
        self
    }

    pub fn with_value_limits(mut self, limits: ValueLimits) -> Self {
        self.value_limits = Some(limits);
        self
    }

    pub fn with_windows(mut self, windows: Vec<TimeWindow>) -> Self {
        self.time_windows = windows;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Mutation-time validation; nothing is written when this fails.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.action == ActionKind::View {
            return Err(PermissionError::Validation(
                "restrictions cover trading actions, not views".to_string(),
            ));
        }

        match self.kind {
            RestrictionKind::InstrumentBlacklist => {}
            RestrictionKind::ValueLimit => {
                let has_limits = self
                    .value_limits
                    .as_ref()
                    .map_or(false, |l| !l.is_empty());
                if !has_limits {
                    return Err(PermissionError::Validation(
                        "value_limit restriction needs at least one cap".to_string(),
                    ));
                }
                validate_limits(self.value_limits.as_ref())?;
            }
            RestrictionKind::TimeRestriction => {
                if self.time_windows.is_empty() {
                    return Err(PermissionError::Validation(
                        "time_restriction needs at least one window".to_string(),
                    ));
                }
            }
        }

        if let Some(exp) = self.expires_at {
            if exp <= now {
                return Err(PermissionError::Validation(
                    "expires_at must lie in the future".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn identity(&self) -> RestrictionIdentity {
        RestrictionIdentity {
            subject: self.subject,
            restrictor: self.restrictor,
            kind: self.kind,
            action: self.action,
        }
    }

    pub fn into_rule(self, id: RuleId, now: DateTime<Utc>) -> RestrictionRule {
        RestrictionRule {
            id,
            subject: self.subject,
            restrictor: self.restrictor,
            kind: self.kind,
            action: self.action,
            instruments: self
                .instruments
                .into_iter()
                .map(|k| k.into_string())
                .collect(),
            value_limits: self.value_limits,
            time_windows: self.time_windows,
            priority: self.priority,
            enforcement: self.enforcement,
            applied_at: now,
            expires_at: self.expires_at,
            active: true,
            notes: self.notes,
        }
    }
}

fn validate_limits(limits: Option<&ValueLimits>) -> Result<()> {
    if let Some(limits) = limits {
        for value in [limits.max_order_value, limits.max_position_size]
            .into_iter()
            .flatten()
        {
            if !value.is_finite() || value < 0.0 {
                return Err(PermissionError::Validation(format!(
                    "value limit {} is not a non-negative finite number",
                    value
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_scope_all_matches_everything() {
        let scope = InstrumentScope::All;
        assert!(scope.matches(Some("NSE:TCS")));
        assert!(scope.matches(None));
    }

    #[test]
    fn test_scope_specific() {
        let scope = InstrumentScope::specific(&["NSE:HDFCBANK".to_string()]).unwrap();
        assert!(scope.matches(Some("NSE:HDFCBANK")));
        assert!(!scope.matches(Some("NSE:TCS")));
        assert!(!scope.matches(None)); // instrument-targeted rule, no instrument named
    }

    #[test]
    fn test_scope_specific_empty_targets_grantee() {
        let scope = InstrumentScope::specific(&[]).unwrap();
        assert!(scope.matches(Some("NSE:TCS")));
        assert!(scope.matches(None));
    }

    #[test]
    fn test_scope_exclude() {
        let scope = InstrumentScope::exclude(&["NSE:YESBANK".to_string()]).unwrap();
        assert!(!scope.matches(Some("NSE:YESBANK")));
        assert!(scope.matches(Some("NSE:TCS")));
        assert!(scope.matches(None));
    }

    #[test]
    fn test_scope_from_stored_drops_garbage() {
        let scope = InstrumentScope::from_stored("SPECIFIC", &["##".to_string()]);
        // The one pattern was unparseable, leaving an empty filter
        assert_eq!(scope.kind_str(), "SPECIFIC");
        assert!(scope.matches(Some("NSE:TCS")));
    }

    #[test]
    fn test_grant_applies_to() {
        let rule = GrantDraft::new(
            5,
            Grantee::User(1),
            PermissionKind::TradingAction,
            ResourceKind::Positions,
            ActionKind::All,
            RuleLevel::Allow,
        )
        .into_rule(1, now());

        assert!(rule.applies_to(1, ActionKind::Create, ResourceKind::Positions, None, None, now()));
        assert!(!rule.applies_to(2, ActionKind::Create, ResourceKind::Positions, None, None, now()));
        assert!(!rule.applies_to(1, ActionKind::Create, ResourceKind::Orders, None, None, now()));
    }

    #[test]
    fn test_grant_expiry() {
        let mut rule = GrantDraft::new(
            5,
            Grantee::Everyone,
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            RuleLevel::Allow,
        )
        .into_rule(1, now());

        assert!(rule.is_live(now()));
        rule.expires_at = Some(now() - Duration::hours(1));
        assert!(!rule.is_live(now()));
        rule.expires_at = None;
        rule.active = false;
        assert!(!rule.is_live(now()));
    }

    #[test]
    fn test_grant_identity_ignores_level() {
        let allow = GrantDraft::new(
            5,
            Grantee::User(2),
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            RuleLevel::Allow,
        );
        let deny = GrantDraft::new(
            5,
            Grantee::User(2),
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            RuleLevel::Deny,
        );
        assert_eq!(allow.identity(), deny.identity());

        let scoped = GrantDraft::new(
            5,
            Grantee::User(2),
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            RuleLevel::Deny,
        )
        .with_scope(InstrumentScope::specific(&[]).unwrap());
        assert_ne!(allow.identity(), scoped.identity());
    }

    #[test]
    fn test_draft_action_vocabulary() {
        let bad = GrantDraft::new(
            5,
            Grantee::User(1),
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::Create,
            RuleLevel::Allow,
        );
        assert!(bad.validate(now()).is_err());

        let good = GrantDraft::new(
            5,
            Grantee::User(1),
            PermissionKind::TradingAction,
            ResourceKind::Positions,
            ActionKind::Create,
            RuleLevel::Allow,
        );
        assert!(good.validate(now()).is_ok());
    }

    #[test]
    fn test_draft_rejects_past_expiry() {
        let draft = GrantDraft::new(
            5,
            Grantee::User(1),
            PermissionKind::DataSharing,
            ResourceKind::Holdings,
            ActionKind::View,
            RuleLevel::Allow,
        )
        .expiring_at(now() - Duration::minutes(1));
        assert!(draft.validate(now()).is_err());
    }

    #[test]
    fn test_restriction_blacklist_matching() {
        let restriction = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::InstrumentBlacklist,
            ActionKind::All,
            Enforcement::Hard,
        )
        .with_instruments(vec![InstrumentKey::new("NSE:YESBANK").unwrap()])
        .with_priority(10)
        .into_rule(1, now());

        assert!(restriction.matches(ActionKind::Create, Some("NSE:YESBANK"), None, now()));
        assert!(!restriction.matches(ActionKind::Create, Some("NSE:TCS"), None, now()));
        assert!(!restriction.matches(ActionKind::Create, None, None, now()));
    }

    #[test]
    fn test_restriction_empty_instruments_match_any() {
        let restriction = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::InstrumentBlacklist,
            ActionKind::Exit,
            Enforcement::Hard,
        )
        .into_rule(1, now());

        assert!(restriction.matches(ActionKind::Exit, Some("NSE:TCS"), None, now()));
        assert!(restriction.matches(ActionKind::Exit, None, None, now()));
        assert!(!restriction.matches(ActionKind::Create, Some("NSE:TCS"), None, now()));
    }

    #[test]
    fn test_restriction_value_limit_needs_context() {
        let restriction = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::ValueLimit,
            ActionKind::Create,
            Enforcement::Hard,
        )
        .with_value_limits(ValueLimits {
            max_order_value: Some(100_000.0),
            max_position_size: None,
        })
        .into_rule(1, now());

        let over = EvalContext::new().with_order_value(200_000.0);
        let under = EvalContext::new().with_order_value(50_000.0);
        assert!(restriction.matches(ActionKind::Create, None, Some(&over), now()));
        assert!(!restriction.matches(ActionKind::Create, None, Some(&under), now()));
        assert!(!restriction.matches(ActionKind::Create, None, None, now()));
    }

    #[test]
    fn test_restriction_draft_validation() {
        let no_caps = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::ValueLimit,
            ActionKind::Create,
            Enforcement::Hard,
        );
        assert!(no_caps.validate(now()).is_err());

        let no_windows = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::TimeRestriction,
            ActionKind::Create,
            Enforcement::Soft,
        );
        assert!(no_windows.validate(now()).is_err());

        let view = RestrictionDraft::new(
            1,
            3,
            RestrictionKind::InstrumentBlacklist,
            ActionKind::View,
            Enforcement::Hard,
        );
        assert!(view.validate(now()).is_err());
    }

    #[test]
    fn test_grant_serde_roundtrip() {
        let rule = GrantDraft::new(
            5,
            Grantee::Everyone,
            PermissionKind::DataSharing,
            ResourceKind::Positions,
            ActionKind::View,
            RuleLevel::Allow,
        )
        .with_scope(InstrumentScope::exclude(&["NSE:NIFTY*".to_string()]).unwrap())
        .with_notes("quarterly review share")
        .into_rule(42, now());

        let json = serde_json::to_string(&rule).unwrap();
        let back: GrantRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
