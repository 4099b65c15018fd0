//! Permission decision engine
//!
//! Everything the facade in the crate root builds on:
//!
//! - [`types`] - Identifier and enum vocabulary shared by every module
//! - [`validation`] - Instrument key validation (`EXCHANGE:SYMBOL`)
//! - [`pattern`] - Compile-once instrument patterns and filters
//! - [`condition`] - Grant conditions: value limits and time windows
//! - [`rule`] - The two rule families, grants and restrictions
//! - [`store`] - Storage contract with in-memory and SQLite backends
//! - [`audit`] - Append-only trail of every rule mutation
//! - [`cache`] - TTL + LRU decision memo
//! - [`evaluator`] - The conflict-resolution cascade
//! - [`engine`] - Mutation write path and queries
//! - [`template`] - Named sharing presets that expand to plain grants
//!
//! Decisions flow one way: the evaluator reads rules through the cache and
//! never writes; the engine writes rules, pairs each write with an audit
//! entry, and invalidates the cache before acknowledging.

pub mod audit;
pub mod cache;
pub mod condition;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod pattern;
pub mod rule;
pub mod store;
pub mod template;
pub mod types;
pub mod validation;

// Re-export commonly used types
pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditLog, MemoryAuditLog, RuleTable};
pub use cache::{CacheStats, DecisionCache, DEFAULT_CAPACITY, DEFAULT_TTL};
pub use condition::{EvalContext, GrantConditions, TimeWindow, ValueLimits};
pub use engine::{PermissionEngine, ViewerSet};
pub use error::{PermissionError, Result};
pub use evaluator::{
    Decision, DecisionReason, EvalRequest, Evaluator, RestrictionWarning, RoleDefaults,
    RoleProvider, StaticRoles, DEFAULT_DEADLINE,
};
pub use pattern::{InstrumentFilter, InstrumentPattern};
pub use rule::{GrantDraft, GrantRule, InstrumentScope, RestrictionDraft, RestrictionRule};
pub use store::{
    MemoryStore, Revocation, RuleRecord, RuleStore, SqliteStore, UpsertedGrant,
    UpsertedRestriction,
};
pub use template::{SharingScope, SharingTemplate, TemplateRegistry};
pub use types::{
    ActionKind, Enforcement, Grantee, PermissionKind, ResourceKind, RestrictionKind, Role, RuleId,
    RuleLevel, UserId,
};
pub use validation::InstrumentKey;
