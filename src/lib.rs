//! # TradeGate - Permission Decision Engine
//!
//! `tradegate-rs` answers one question fast: may user U perform action A on
//! resource R, optionally narrowed to a single instrument? It is built for
//! trading platforms where a wrong answer places a wrong order:
//!
//! - **Two rule families**: grants (ALLOW/DENY between a grantor and a
//!   grantee) and restrictions (one-sided limits with priority and
//!   enforcement strength)
//! - **Deterministic cascade**: hard restrictions, explicit DENY, explicit
//!   ALLOW, role defaults, then deny by default
//! - **Fail-closed**: store failures and deadline overruns come back as DENY
//! - **Short-TTL decision cache**, invalidated synchronously before any
//!   mutation acknowledges
//! - **Append-only audit trail** paired with every mutation; a failed audit
//!   append rolls the mutation back
//!
//! ## Quick Start
//!
//! ```rust
//! use tradegate_rs::{ActionKind, PermissionGate, ResourceKind, Result, SharingScope};
//!
//! # fn main() -> Result<()> {
//! let gate = PermissionGate::in_memory()?;
//!
//! // User 5 shares positions with everyone except user 2
//! gate.grant_data_sharing(
//!     5,
//!     &[ResourceKind::Positions],
//!     SharingScope::AllExcept(vec![2]),
//!     None,
//!     None,
//! )?;
//!
//! assert!(gate.check(7, ActionKind::View, ResourceKind::Positions, None));
//! assert!(!gate.check(2, ActionKind::View, ResourceKind::Positions, None));
//! # Ok(())
//! # }
//! ```
//!
//! ## Advanced Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tradegate_rs::{GateBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! // SQLite-backed gate with tuned cache and deadline
//! let gate = GateBuilder::new()
//!     .sqlite_at("/data/permissions.db")
//!     .cache_capacity(16_384)
//!     .cache_ttl(Duration::from_secs(10))
//!     .deadline(Duration::from_millis(50))
//!     .build()?;
//!
//! let stats = gate.cache_stats();
//! println!("cache holds {} decisions", stats.entries);
//! # Ok(())
//! # }
//! ```

// Core implementation
pub mod core;

// Re-export core types that users need
pub use crate::core::{
    audit::{AuditAction, AuditEntry, AuditFilter, AuditLog, MemoryAuditLog, RuleTable},
    cache::{CacheStats, DecisionCache, DEFAULT_CAPACITY, DEFAULT_TTL},
    condition::{EvalContext, GrantConditions, TimeWindow, ValueLimits},
    engine::{PermissionEngine, ViewerSet},
    error::{PermissionError, Result},
    evaluator::{
        Decision, DecisionReason, EvalRequest, Evaluator, RestrictionWarning, RoleDefaults,
        RoleProvider, StaticRoles, DEFAULT_DEADLINE,
    },
    pattern::{InstrumentFilter, InstrumentPattern},
    rule::{GrantDraft, GrantRule, InstrumentScope, RestrictionDraft, RestrictionRule},
    store::{
        MemoryStore, Revocation, RuleRecord, RuleStore, SqliteStore, UpsertedGrant,
        UpsertedRestriction,
    },
    template::{SharingScope, SharingTemplate, TemplateRegistry},
    types::{
        ActionKind, Enforcement, Grantee, PermissionKind, ResourceKind, RestrictionKind, Role,
        RuleId, RuleLevel, UserId,
    },
    validation::InstrumentKey,
};

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One action/instrument bundle inside a trading grant
///
/// # Examples
///
/// ```rust
/// use tradegate_rs::{ActionKind, TradeScope, TradeSpec};
///
/// // Exit-only, everywhere but one name
/// let spec = TradeSpec {
///     action: ActionKind::Exit,
///     instruments: TradeScope::Blacklist(vec!["NSE:HDFCBANK".to_string()]),
/// };
/// # let _ = spec;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TradeSpec {
    pub action: ActionKind,
    pub instruments: TradeScope,
}

/// Which instruments a trading grant covers
#[derive(Debug, Clone, PartialEq)]
pub enum TradeScope {
    /// Every instrument
    All,
    /// Only instruments matching the listed patterns
    Whitelist(Vec<String>),
    /// Every instrument except those matching the listed patterns
    Blacklist(Vec<String>),
}

impl TradeSpec {
    /// The grant drafts realizing this bundle.
    ///
    /// A blacklist becomes an ALLOW over everything plus a DENY on the listed
    /// patterns; the DENY's SPECIFIC scope outranks the blanket ALLOW
    /// wherever both match.
    fn drafts(&self, grantor: UserId, grantee: UserId) -> Result<Vec<GrantDraft>> {
        let base = |level: RuleLevel, scope: InstrumentScope| {
            GrantDraft::new(
                grantor,
                Grantee::User(grantee),
                PermissionKind::TradingAction,
                ResourceKind::Positions,
                self.action,
                level,
            )
            .with_scope(scope)
        };

        Ok(match &self.instruments {
            TradeScope::All => vec![base(RuleLevel::Allow, InstrumentScope::All)],
            TradeScope::Whitelist(patterns) => {
                vec![base(RuleLevel::Allow, InstrumentScope::specific(patterns)?)]
            }
            TradeScope::Blacklist(patterns) => vec![
                base(RuleLevel::Allow, InstrumentScope::All),
                base(RuleLevel::Deny, InstrumentScope::specific(patterns)?),
            ],
        })
    }
}

/// High-level permission gate
///
/// Wraps the [`PermissionEngine`] with the batch operations a platform
/// actually calls: share data, grant trading authority, restrict, revoke,
/// list viewers, apply templates. Every mutation is validated, serialized
/// per owner, audited, and made visible to evaluation before it returns.
///
/// # Examples
///
/// ```rust
/// use tradegate_rs::{ActionKind, PermissionGate, ResourceKind, Result, TradeScope, TradeSpec};
///
/// # fn main() -> Result<()> {
/// let gate = PermissionGate::in_memory()?;
///
/// // User 1 lets user 3 exit positions, anywhere except one name
/// gate.grant_trading(
///     1,
///     3,
///     &[TradeSpec {
///         action: ActionKind::Exit,
///         instruments: TradeScope::Blacklist(vec!["NSE:HDFCBANK".to_string()]),
///     }],
///     None,
///     None,
/// )?;
///
/// assert!(gate.check(3, ActionKind::Exit, ResourceKind::Positions, Some("NSE:TCS")));
/// assert!(!gate.check(3, ActionKind::Exit, ResourceKind::Positions, Some("NSE:HDFCBANK")));
/// # Ok(())
/// # }
/// ```
pub struct PermissionGate {
    engine: PermissionEngine,
    templates: TemplateRegistry,
}

impl PermissionGate {
    /// Gate over in-memory storage. Rules and audit history live only as
    /// long as the gate does.
    pub fn in_memory() -> Result<Self> {
        GateBuilder::new().build()
    }

    /// Gate over a SQLite file; rules and audit history persist together.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        GateBuilder::new().sqlite_at(path.as_ref()).build()
    }

    pub fn builder() -> GateBuilder {
        GateBuilder::new()
    }

    /// Answer one permission question with full detail: outcome, reason,
    /// deciding rule, and any advisory warnings.
    pub fn evaluate(&self, request: &EvalRequest<'_>) -> Decision {
        self.engine.evaluate(request)
    }

    /// Boolean shorthand over [`PermissionGate::evaluate`].
    pub fn check(
        &self,
        subject: UserId,
        action: ActionKind,
        resource: ResourceKind,
        instrument: Option<&str>,
    ) -> bool {
        self.engine.check(subject, action, resource, instrument)
    }

    /// Share resources according to a scope, in one call.
    ///
    /// `Everyone` writes one everyone-wide ALLOW per resource. `AllExcept`
    /// adds an explicit DENY per excluded user. `Only` writes one ALLOW per
    /// (user, resource). All drafts are validated before anything is
    /// written.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tradegate_rs::{PermissionGate, ResourceKind, SharingScope};
    ///
    /// # let gate = PermissionGate::in_memory()?;
    /// let rules = gate.grant_data_sharing(
    ///     5,
    ///     &[ResourceKind::Positions, ResourceKind::Holdings],
    ///     SharingScope::Only(vec![2, 3]),
    ///     None,
    ///     Some("advisor access"),
    /// )?;
    /// assert_eq!(rules.len(), 4);
    /// # Ok::<(), tradegate_rs::PermissionError>(())
    /// ```
    pub fn grant_data_sharing(
        &self,
        grantor: UserId,
        resources: &[ResourceKind],
        sharing: SharingScope,
        expires_at: Option<DateTime<Utc>>,
        notes: Option<&str>,
    ) -> Result<Vec<GrantRule>> {
        let drafts = sharing.drafts(grantor, resources, expires_at, notes);
        info!(
            "user {} granting data sharing over {} rules",
            grantor,
            drafts.len()
        );
        self.write_all(drafts)
    }

    /// Grant trading authority over another user's positions.
    ///
    /// Each spec carries one action and an instrument scope; see
    /// [`TradeScope`] for the whitelist/blacklist shapes.
    pub fn grant_trading(
        &self,
        grantor: UserId,
        grantee: UserId,
        specs: &[TradeSpec],
        expires_at: Option<DateTime<Utc>>,
        notes: Option<&str>,
    ) -> Result<Vec<GrantRule>> {
        let mut drafts = Vec::new();
        for spec in specs {
            drafts.extend(spec.drafts(grantor, grantee)?);
        }
        let drafts = drafts
            .into_iter()
            .map(|mut draft| {
                if let Some(at) = expires_at {
                    draft = draft.expiring_at(at);
                }
                if let Some(text) = notes {
                    draft = draft.with_notes(text);
                }
                draft
            })
            .collect();
        info!("user {} granting trading authority to user {}", grantor, grantee);
        self.write_all(drafts)
    }

    /// Impose a one-sided restriction on a user.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tradegate_rs::{
    ///     ActionKind, Enforcement, InstrumentKey, PermissionGate, RestrictionDraft,
    ///     RestrictionKind,
    /// };
    ///
    /// # let gate = PermissionGate::in_memory()?;
    /// // Risk desk (user 1) blocks user 9 from creating F&O positions
    /// let rule = gate.apply_restriction(
    ///     RestrictionDraft::new(
    ///         1,
    ///         9,
    ///         RestrictionKind::InstrumentBlacklist,
    ///         ActionKind::Create,
    ///         Enforcement::Hard,
    ///     )
    ///     .with_instruments(vec![InstrumentKey::new("NFO:BANKNIFTY24DECFUT")?])
    ///     .with_priority(10),
    /// )?;
    /// assert!(rule.active);
    /// # Ok::<(), tradegate_rs::PermissionError>(())
    /// ```
    pub fn apply_restriction(&self, draft: RestrictionDraft) -> Result<RestrictionRule> {
        self.engine.restrict(draft)
    }

    /// Soft-delete a rule by id. Idempotent; unknown ids error.
    pub fn revoke(
        &self,
        rule_id: RuleId,
        revoked_by: UserId,
        reason: Option<String>,
    ) -> Result<Revocation> {
        self.engine.revoke(rule_id, revoked_by, reason)
    }

    /// Who currently sees an owner's resource, as allow-minus-deny algebra.
    /// An everyone-wide grant cannot be enumerated without a user directory,
    /// hence the tagged result.
    pub fn list_viewers(&self, owner: UserId, resource: ResourceKind) -> Result<ViewerSet> {
        self.engine.list_viewers(owner, resource)
    }

    /// Active data-sharing grants issued by `grantor`, newest first.
    pub fn sharing_settings(&self, grantor: UserId) -> Result<Vec<GrantRule>> {
        self.engine.sharing_settings(grantor)
    }

    /// Active trading grants held by `grantee`, newest first.
    pub fn trading_grants_for(&self, grantee: UserId) -> Result<Vec<GrantRule>> {
        self.engine.trading_grants_for(grantee)
    }

    /// Active restrictions on `subject`, highest priority first.
    pub fn restrictions_on(&self, subject: UserId) -> Result<Vec<RestrictionRule>> {
        self.engine.restrictions_on(subject)
    }

    /// Page through the audit trail, newest first.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tradegate_rs::{AuditFilter, PermissionGate};
    ///
    /// # let gate = PermissionGate::in_memory()?;
    /// let recent = gate.audit_log(&AuditFilter::new().by_actor(5).page(20, 0))?;
    /// # assert!(recent.is_empty());
    /// # Ok::<(), tradegate_rs::PermissionError>(())
    /// ```
    pub fn audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.engine.audit_log(filter)
    }

    /// Register a reusable sharing template under its name.
    pub fn define_template(&self, template: SharingTemplate) -> Result<()> {
        self.templates.define(template)
    }

    /// Drop a user-defined template. System templates refuse.
    pub fn remove_template(&self, name: &str) -> Result<()> {
        self.templates.remove(name)
    }

    /// Every registered template, ordered by name.
    pub fn templates(&self) -> Vec<SharingTemplate> {
        self.templates.list()
    }

    /// Expand a named template into grants for `owner`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tradegate_rs::{ActionKind, PermissionGate, ResourceKind};
    ///
    /// # let gate = PermissionGate::in_memory()?;
    /// gate.apply_template(5, "share-all", None)?;
    /// assert!(gate.check(42, ActionKind::View, ResourceKind::Holdings, None));
    /// # Ok::<(), tradegate_rs::PermissionError>(())
    /// ```
    pub fn apply_template(
        &self,
        owner: UserId,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<GrantRule>> {
        let template = self.templates.get(name)?;
        info!("user {} applying template '{}'", owner, name);
        self.write_all(template.expand(owner, expires_at))
    }

    /// Batch-deactivate expired rules; returns how many were compacted.
    pub fn compact_expired(&self) -> Result<usize> {
        self.engine.compact_expired()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.engine.cache_stats()
    }

    /// Access the underlying engine for lower-level operations, such as
    /// granting a hand-built [`GrantDraft`] directly.
    pub fn engine(&self) -> &PermissionEngine {
        &self.engine
    }

    /// Validate every draft before writing any of them, so a malformed
    /// batch touches nothing.
    fn write_all(&self, drafts: Vec<GrantDraft>) -> Result<Vec<GrantRule>> {
        let now = Utc::now();
        for draft in &drafts {
            draft.validate(now)?;
        }
        drafts
            .into_iter()
            .map(|draft| self.engine.grant(draft))
            .collect()
    }
}

enum Backing {
    Memory,
    File(PathBuf),
}

/// Builder for customizing gate creation
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use tradegate_rs::{GateBuilder, Role, RoleDefaults, StaticRoles};
///
/// # fn main() -> tradegate_rs::Result<()> {
/// let roles = Arc::new(StaticRoles::new());
/// roles.assign(1, Role::Admin);
///
/// let gate = GateBuilder::new()
///     .roles(roles)
///     .role_defaults(RoleDefaults::standard())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct GateBuilder {
    backing: Backing,
    cache_capacity: usize,
    cache_ttl: Duration,
    deadline: Duration,
    roles: Option<Arc<dyn RoleProvider>>,
    defaults: Option<RoleDefaults>,
    templates: Option<TemplateRegistry>,
}

impl GateBuilder {
    pub fn new() -> Self {
        GateBuilder {
            backing: Backing::Memory,
            cache_capacity: DEFAULT_CAPACITY,
            cache_ttl: DEFAULT_TTL,
            deadline: DEFAULT_DEADLINE,
            roles: None,
            defaults: None,
            templates: None,
        }
    }

    /// Back the gate with a SQLite file at `path`.
    pub fn sqlite_at<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.backing = Backing::File(path.as_ref().to_path_buf());
        self
    }

    /// Decision cache capacity; 0 disables caching.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// How long a cached decision stays fresh.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Evaluation deadline; overruns fail closed.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Role provider consulted when no explicit rule matches.
    pub fn roles(mut self, provider: Arc<dyn RoleProvider>) -> Self {
        self.roles = Some(provider);
        self
    }

    /// Per-role default decisions.
    pub fn role_defaults(mut self, defaults: RoleDefaults) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// Start from a custom template registry instead of the stock one.
    pub fn templates(mut self, registry: TemplateRegistry) -> Self {
        self.templates = Some(registry);
        self
    }

    /// Build the gate.
    pub fn build(self) -> Result<PermissionGate> {
        let (store, audit): (Arc<dyn RuleStore>, Arc<dyn AuditLog>) = match self.backing {
            Backing::Memory => {
                info!("building in-memory permission gate");
                (Arc::new(MemoryStore::new()), Arc::new(MemoryAuditLog::new()))
            }
            Backing::File(path) => {
                info!("building permission gate at {:?}", path);
                let sqlite = Arc::new(SqliteStore::open(&path)?);
                (sqlite.clone(), sqlite)
            }
        };

        let mut evaluator = Evaluator::new(store.clone())
            .with_cache(DecisionCache::new(self.cache_capacity, self.cache_ttl))
            .with_deadline(self.deadline);
        if let Some(roles) = self.roles {
            evaluator = evaluator.with_roles(roles);
        }
        if let Some(defaults) = self.defaults {
            evaluator = evaluator.with_defaults(defaults);
        }

        Ok(PermissionGate {
            engine: PermissionEngine::new(store, audit, evaluator),
            templates: self.templates.unwrap_or_default(),
        })
    }
}

impl Default for GateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
