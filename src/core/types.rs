//! Core vocabulary for permission rules
//!
//! Enums here mirror the persisted rule rows: which family a rule belongs to,
//! what resource and action it covers, and who it applies to. String forms
//! (serde and `as_str`) are the stable storage representation.

use serde::{Deserialize, Serialize};

/// User identifier, assigned by the surrounding platform.
pub type UserId = i64;

/// Rule identifier, minted by the rule store from one sequence shared by
/// grants and restrictions.
pub type RuleId = i64;

/// Which rule family a grant belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    /// Visibility of another user's data (positions, holdings, ...)
    DataSharing,
    /// Authority to place, modify or exit orders
    TradingAction,
}

/// Resource classes a rule can cover
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Positions,
    Holdings,
    Orders,
    Strategies,
    Margins,
}

/// Actions a subject can attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Read access to a resource
    View,
    /// Place a new order
    Create,
    /// Modify a working order
    Modify,
    /// Exit or square off a position
    Exit,
    /// All actions (wildcard, valid on rules only)
    All,
}

impl ActionKind {
    /// Check whether a rule carrying this action covers the requested one.
    pub fn covers(&self, requested: ActionKind) -> bool {
        matches!(self, ActionKind::All) || *self == requested
    }

    /// Order-touching actions, as opposed to pure reads.
    pub fn is_trading(&self) -> bool {
        matches!(
            self,
            ActionKind::Create | ActionKind::Modify | ActionKind::Exit
        )
    }
}

/// Effect of a grant rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleLevel {
    /// Permit the action
    Allow,
    /// Forbid the action (takes precedence over Allow)
    Deny,
}

/// Restriction categories a restrictor can impose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestrictionKind {
    /// Block named instruments outright
    InstrumentBlacklist,
    /// Cap order value or position size
    ValueLimit,
    /// Block actions during configured time windows
    TimeRestriction,
}

/// How strongly a restriction is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Enforcement {
    /// Blocks the action outright
    Hard,
    /// Action proceeds, warning attached
    Soft,
    /// Advisory only, logged with the decision
    Warning,
}

/// Platform roles consulted when no explicit rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Viewer,
}

/// Who a grant applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grantee {
    /// Every user except those holding a matching explicit deny
    Everyone,
    /// One specific user
    User(UserId),
}

impl Grantee {
    /// Whether this grantee designation covers `user`.
    pub fn includes(&self, user: UserId) -> bool {
        match self {
            Grantee::Everyone => true,
            Grantee::User(id) => *id == user,
        }
    }

    pub fn is_everyone(&self) -> bool {
        matches!(self, Grantee::Everyone)
    }

    /// The concrete user id, if this grantee names one.
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Grantee::Everyone => None,
            Grantee::User(id) => Some(*id),
        }
    }
}

impl PermissionKind {
    /// The rule family a request with this action consults: views are
    /// data-sharing territory, everything order-touching is trading.
    pub fn implied_by(action: ActionKind) -> PermissionKind {
        if action == ActionKind::View {
            PermissionKind::DataSharing
        } else {
            PermissionKind::TradingAction
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionKind::DataSharing => "data_sharing",
            PermissionKind::TradingAction => "trading_action",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_sharing" => Some(PermissionKind::DataSharing),
            "trading_action" => Some(PermissionKind::TradingAction),
            _ => None,
        }
    }
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Positions => "positions",
            ResourceKind::Holdings => "holdings",
            ResourceKind::Orders => "orders",
            ResourceKind::Strategies => "strategies",
            ResourceKind::Margins => "margins",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positions" => Some(ResourceKind::Positions),
            "holdings" => Some(ResourceKind::Holdings),
            "orders" => Some(ResourceKind::Orders),
            "strategies" => Some(ResourceKind::Strategies),
            "margins" => Some(ResourceKind::Margins),
            _ => None,
        }
    }
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::View => "view",
            ActionKind::Create => "create",
            ActionKind::Modify => "modify",
            ActionKind::Exit => "exit",
            ActionKind::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "view" => Some(ActionKind::View),
            "create" => Some(ActionKind::Create),
            "modify" => Some(ActionKind::Modify),
            "exit" => Some(ActionKind::Exit),
            "all" => Some(ActionKind::All),
            _ => None,
        }
    }
}

impl RuleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleLevel::Allow => "ALLOW",
            RuleLevel::Deny => "DENY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALLOW" => Some(RuleLevel::Allow),
            "DENY" => Some(RuleLevel::Deny),
            _ => None,
        }
    }
}

impl RestrictionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestrictionKind::InstrumentBlacklist => "instrument_blacklist",
            RestrictionKind::ValueLimit => "value_limit",
            RestrictionKind::TimeRestriction => "time_restriction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "instrument_blacklist" => Some(RestrictionKind::InstrumentBlacklist),
            "value_limit" => Some(RestrictionKind::ValueLimit),
            "time_restriction" => Some(RestrictionKind::TimeRestriction),
            _ => None,
        }
    }
}

impl Enforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Enforcement::Hard => "HARD",
            Enforcement::Soft => "SOFT",
            Enforcement::Warning => "WARNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HARD" => Some(Enforcement::Hard),
            "SOFT" => Some(Enforcement::Soft),
            "WARNING" => Some(Enforcement::Warning),
            _ => None,
        }
    }
}
