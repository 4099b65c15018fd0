//! Decision evaluator
//!
//! The conflict-resolution cascade, in order, first match wins:
//!
//! 1. Highest-priority matching restriction, when its enforcement is HARD.
//! 2. Explicit DENY grants.
//! 3. Explicit ALLOW grants.
//! 4. SOFT and WARNING restrictions attach to allowed outcomes as warnings.
//! 5. Role default, then the system-wide deny.
//!
//! Each stage is a pure function over rule slices already pulled from the
//! store, so ordering stays auditable and every stage is testable on its
//! own. The store is consulted at most twice per evaluation. Store failures
//! and deadline overruns never propagate: they collapse into a DENY, since
//! a broken permission check must block a trade rather than wave it through.

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::core::cache::{CacheKey, CacheStats, DecisionCache};
use crate::core::condition::EvalContext;
use crate::core::rule::{GrantRule, RestrictionRule};
use crate::core::store::RuleStore;
use crate::core::types::{
    ActionKind, Enforcement, PermissionKind, ResourceKind, RestrictionKind, Role, RuleId,
    RuleLevel, UserId,
};

/// Ceiling on one evaluation before it fails closed
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(100);

/// Why a decision came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    /// A HARD restriction outranked everything else
    RestrictionHard,
    /// An explicit DENY grant matched
    ExplicitDeny,
    /// An explicit ALLOW grant matched
    ExplicitAllow,
    /// No explicit rule; the subject's role default applied
    RoleDefault,
    /// No rule and no role default; denied by default
    SystemDefault,
    /// The rule store could not be read; denied, never fail-open
    StoreUnavailable,
    /// The evaluation deadline passed; denied, never hang the caller
    EvaluationTimeout,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::RestrictionHard => "RESTRICTION_HARD",
            DecisionReason::ExplicitDeny => "EXPLICIT_DENY",
            DecisionReason::ExplicitAllow => "EXPLICIT_ALLOW",
            DecisionReason::RoleDefault => "ROLE_DEFAULT",
            DecisionReason::SystemDefault => "SYSTEM_DEFAULT",
            DecisionReason::StoreUnavailable => "STORE_UNAVAILABLE",
            DecisionReason::EvaluationTimeout => "EVALUATION_TIMEOUT",
        }
    }

    /// Failure reasons describe a moment, not the rule state, and are never
    /// cached.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DecisionReason::StoreUnavailable | DecisionReason::EvaluationTimeout
        )
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-blocking restriction that matched an allowed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestrictionWarning {
    pub rule_id: RuleId,
    pub kind: RestrictionKind,
    pub enforcement: Enforcement,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl From<&RestrictionRule> for RestrictionWarning {
    fn from(rule: &RestrictionRule) -> Self {
        RestrictionWarning {
            rule_id: rule.id,
            kind: rule.kind,
            enforcement: rule.enforcement,
            notes: rule.notes.clone(),
        }
    }
}

/// The outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,

    /// The rule that decided, when one did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<RuleId>,

    /// Priority of the deciding restriction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<RestrictionWarning>,
}

impl Decision {
    pub fn allowed(reason: DecisionReason, rule_id: Option<RuleId>) -> Self {
        Decision {
            allowed: true,
            reason,
            rule_id,
            priority: None,
            warnings: Vec::new(),
        }
    }

    pub fn denied(reason: DecisionReason, rule_id: Option<RuleId>) -> Self {
        Decision {
            allowed: false,
            reason,
            rule_id,
            priority: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<RestrictionWarning>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Supplies the platform role of a subject
///
/// Roles live outside this engine; deployments plug in whatever identity
/// layer they have. [`StaticRoles`] covers tests and simple embedders.
pub trait RoleProvider: Send + Sync {
    fn role_of(&self, user: UserId) -> Option<Role>;
}

/// Fixed user-to-role table
#[derive(Default)]
pub struct StaticRoles {
    roles: RwLock<AHashMap<UserId, Role>>,
}

impl StaticRoles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, user: UserId, role: Role) {
        self.roles.write().insert(user, role);
    }

    pub fn clear(&self, user: UserId) {
        self.roles.write().remove(&user);
    }
}

impl RoleProvider for StaticRoles {
    fn role_of(&self, user: UserId) -> Option<Role> {
        self.roles.read().get(&user).copied()
    }
}

/// Every subject is roleless; unmatched requests land on the system deny.
pub struct NoRoles;

impl RoleProvider for NoRoles {
    fn role_of(&self, _user: UserId) -> Option<Role> {
        None
    }
}

/// Fallback table consulted when no explicit rule matched
///
/// An exact action entry beats the role's catch-all. A role with no entry
/// for the action falls through to the system default.
#[derive(Debug, Clone)]
pub struct RoleDefaults {
    table: AHashMap<Role, Vec<(ActionKind, RuleLevel)>>,
}

impl RoleDefaults {
    /// Platform defaults: admins may do anything, viewers may not touch
    /// orders, editors carry no default.
    pub fn standard() -> Self {
        let mut defaults = Self::empty();
        defaults.set(Role::Admin, ActionKind::All, RuleLevel::Allow);
        defaults.set(Role::Viewer, ActionKind::Create, RuleLevel::Deny);
        defaults.set(Role::Viewer, ActionKind::Modify, RuleLevel::Deny);
        defaults.set(Role::Viewer, ActionKind::Exit, RuleLevel::Deny);
        defaults
    }

    pub fn empty() -> Self {
        RoleDefaults {
            table: AHashMap::new(),
        }
    }

    pub fn set(&mut self, role: Role, action: ActionKind, level: RuleLevel) {
        let entries = self.table.entry(role).or_default();
        entries.retain(|(covered, _)| *covered != action);
        entries.push((action, level));
    }

    pub fn lookup(&self, role: Role, action: ActionKind) -> Option<RuleLevel> {
        let entries = self.table.get(&role)?;
        entries
            .iter()
            .find(|(covered, _)| *covered == action)
            .or_else(|| entries.iter().find(|(covered, _)| *covered == ActionKind::All))
            .map(|(_, level)| *level)
    }
}

impl Default for RoleDefaults {
    fn default() -> Self {
        Self::standard()
    }
}

/// One permission question
#[derive(Debug, Clone, Copy)]
pub struct EvalRequest<'a> {
    pub subject: UserId,
    pub action: ActionKind,
    pub resource: ResourceKind,
    pub instrument: Option<&'a str>,
    pub context: Option<&'a EvalContext>,
}

impl<'a> EvalRequest<'a> {
    pub fn new(subject: UserId, action: ActionKind, resource: ResourceKind) -> Self {
        EvalRequest {
            subject,
            action,
            resource,
            instrument: None,
            context: None,
        }
    }

    pub fn on_instrument(mut self, key: &'a str) -> Self {
        self.instrument = Some(key);
        self
    }

    pub fn with_context(mut self, context: &'a EvalContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Stage 1. The store returns restrictions priority-descending, so the first
/// match is the one that counts; only its enforcement decides. A SOFT rule
/// at the top shadows HARD rules below it.
fn hard_restriction_stage(
    restrictions: &[RestrictionRule],
    request: &EvalRequest<'_>,
    now: DateTime<Utc>,
) -> Option<Decision> {
    let top = restrictions
        .iter()
        .find(|rule| rule.matches(request.action, request.instrument, request.context, now))?;
    if top.enforcement == Enforcement::Hard {
        Some(
            Decision::denied(DecisionReason::RestrictionHard, Some(top.id))
                .with_priority(top.priority),
        )
    } else {
        None
    }
}

/// Stages 2 and 3. The best matching grant at `level`: targeted scopes beat
/// ALL, then the most recently granted wins.
fn best_grant<'a>(
    grants: &'a [GrantRule],
    level: RuleLevel,
    request: &EvalRequest<'_>,
    now: DateTime<Utc>,
) -> Option<&'a GrantRule> {
    grants
        .iter()
        .filter(|rule| {
            rule.level == level
                && rule.applies_to(
                    request.subject,
                    request.action,
                    request.resource,
                    request.instrument,
                    request.context,
                    now,
                )
        })
        .max_by_key(|rule| rule.precedence())
}

/// Stage 4. SOFT and WARNING restrictions that matched the request ride
/// along on allowed decisions.
fn warning_overlay(
    restrictions: &[RestrictionRule],
    request: &EvalRequest<'_>,
    now: DateTime<Utc>,
) -> Vec<RestrictionWarning> {
    restrictions
        .iter()
        .filter(|rule| {
            rule.enforcement != Enforcement::Hard
                && rule.matches(request.action, request.instrument, request.context, now)
        })
        .map(RestrictionWarning::from)
        .collect()
}

/// Runs the cascade over a [`RuleStore`], fronted by a [`DecisionCache`]
pub struct Evaluator {
    store: Arc<dyn RuleStore>,
    roles: Arc<dyn RoleProvider>,
    defaults: RoleDefaults,
    cache: DecisionCache,
    deadline: Duration,
}

impl Evaluator {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Evaluator {
            store,
            roles: Arc::new(NoRoles),
            defaults: RoleDefaults::standard(),
            cache: DecisionCache::new(
                crate::core::cache::DEFAULT_CAPACITY,
                crate::core::cache::DEFAULT_TTL,
            ),
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_roles(mut self, roles: Arc<dyn RoleProvider>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_defaults(mut self, defaults: RoleDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_cache(mut self, cache: DecisionCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Answer one permission question, consulting the cache first.
    ///
    /// Requests carrying caller context bypass the cache entirely: the key
    /// does not encode order values or position sizes, and a decision that
    /// held for one order must not answer for another.
    pub fn evaluate(&self, request: &EvalRequest<'_>) -> Decision {
        let cacheable = request.context.is_none();
        let key = CacheKey::new(
            request.subject,
            request.resource,
            request.action,
            request.instrument,
        );

        if cacheable {
            if let Some(hit) = self.cache.get(&key) {
                return hit;
            }
        }

        let decision = self.evaluate_uncached(request);
        if cacheable && !decision.reason.is_transient() {
            self.cache.put(key, decision.clone());
        }
        decision
    }

    /// The cascade itself, no cache involved.
    pub fn evaluate_uncached(&self, request: &EvalRequest<'_>) -> Decision {
        let started = Instant::now();
        let now = request
            .context
            .and_then(|ctx| ctx.at)
            .unwrap_or_else(Utc::now);

        let restrictions =
            match self
                .store
                .restrictions_for_subject(request.subject, request.action, now)
            {
                Ok(rules) => rules,
                Err(err) => {
                    warn!("restriction read failed, denying: {}", err);
                    return Decision::denied(DecisionReason::StoreUnavailable, None);
                }
            };
        if self.out_of_time(started) {
            return self.timeout_denial(request);
        }

        if let Some(decision) = hard_restriction_stage(&restrictions, request, now) {
            return decision;
        }

        let permission = PermissionKind::implied_by(request.action);
        let grants = match self.store.grants_for_grantee(
            request.subject,
            permission,
            request.resource,
            request.action,
            now,
        ) {
            Ok(rules) => rules,
            Err(err) => {
                warn!("grant read failed, denying: {}", err);
                return Decision::denied(DecisionReason::StoreUnavailable, None);
            }
        };
        if self.out_of_time(started) {
            return self.timeout_denial(request);
        }

        if let Some(rule) = best_grant(&grants, RuleLevel::Deny, request, now) {
            return Decision::denied(DecisionReason::ExplicitDeny, Some(rule.id));
        }

        if let Some(rule) = best_grant(&grants, RuleLevel::Allow, request, now) {
            return Decision::allowed(DecisionReason::ExplicitAllow, Some(rule.id))
                .with_warnings(warning_overlay(&restrictions, request, now));
        }

        match self
            .roles
            .role_of(request.subject)
            .and_then(|role| self.defaults.lookup(role, request.action))
        {
            Some(RuleLevel::Allow) => Decision::allowed(DecisionReason::RoleDefault, None)
                .with_warnings(warning_overlay(&restrictions, request, now)),
            Some(RuleLevel::Deny) => Decision::denied(DecisionReason::RoleDefault, None),
            None => Decision::denied(DecisionReason::SystemDefault, None),
        }
    }

    fn out_of_time(&self, started: Instant) -> bool {
        started.elapsed() >= self.deadline
    }

    fn timeout_denial(&self, request: &EvalRequest<'_>) -> Decision {
        debug!(
            "evaluation for subject {} timed out after {:?}",
            request.subject, self.deadline
        );
        Decision::denied(DecisionReason::EvaluationTimeout, None)
    }

    pub fn invalidate_subject(&self, subject: UserId) {
        self.cache.invalidate_subject(subject);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
