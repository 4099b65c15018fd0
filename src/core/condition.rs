//! Conditional qualifiers on rules
//!
//! Grants can carry qualifiers (only during these hours, only up to this order
//! value) and restrictions of kind `value_limit`/`time_restriction` trigger off
//! the same structures. Numeric facts (order value, position size) come from a
//! caller-supplied [`EvalContext`]; a condition that needs a fact the caller
//! did not supply is treated as not satisfied.

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Caller-supplied facts for condition evaluation
///
/// `at` pins the evaluation clock; when absent the engine uses `Utc::now()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_value: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_size: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order_value(mut self, value: f64) -> Self {
        self.order_value = Some(value);
        self
    }

    pub fn with_position_size(mut self, size: f64) -> Self {
        self.position_size = Some(size);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }
}

/// Caps on order value and position size
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_order_value: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_position_size: Option<f64>,
}

impl ValueLimits {
    /// True when the context proves at least one cap exceeded.
    ///
    /// A cap with no corresponding context fact cannot be proven exceeded.
    pub fn exceeded_by(&self, context: Option<&EvalContext>) -> bool {
        let ctx = match context {
            Some(c) => c,
            None => return false,
        };
        let order_exceeded = match (self.max_order_value, ctx.order_value) {
            (Some(max), Some(value)) => value > max,
            _ => false,
        };
        let position_exceeded = match (self.max_position_size, ctx.position_size) {
            (Some(max), Some(size)) => size > max,
            _ => false,
        };
        order_exceeded || position_exceeded
    }

    /// True when the context proves every configured cap respected.
    ///
    /// Used by conditional grants: a missing fact fails the condition.
    pub fn within(&self, context: Option<&EvalContext>) -> bool {
        let ctx = match context {
            Some(c) => c,
            None => return self.max_order_value.is_none() && self.max_position_size.is_none(),
        };
        let order_ok = match self.max_order_value {
            Some(max) => matches!(ctx.order_value, Some(value) if value <= max),
            None => true,
        };
        let position_ok = match self.max_position_size {
            Some(max) => matches!(ctx.position_size, Some(size) if size <= max),
            None => true,
        };
        order_ok && position_ok
    }

    pub fn is_empty(&self) -> bool {
        self.max_order_value.is_none() && self.max_position_size.is_none()
    }
}

/// A recurring window during which a rule is in force
///
/// Times are UTC. A window with `start > end` wraps midnight. `days = None`
/// means every day of the week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<Weekday>>,

    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        TimeWindow {
            days: None,
            start,
            end,
        }
    }

    pub fn on_days(mut self, days: Vec<Weekday>) -> Self {
        self.days = Some(days);
        self
    }

    /// Whether `at` falls inside this window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if let Some(days) = &self.days {
            if !days.contains(&at.weekday()) {
                return false;
            }
        }
        let t = at.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

/// Qualifiers attached to a grant rule
///
/// A conditioned grant applies only while every configured facet holds: the
/// clock inside one of the windows, the context within the caps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantConditions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_windows: Vec<TimeWindow>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_limits: Option<ValueLimits>,
}

impl GrantConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.time_windows.push(window);
        self
    }

    pub fn with_value_limits(mut self, limits: ValueLimits) -> Self {
        self.value_limits = Some(limits);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.time_windows.is_empty() && self.value_limits.is_none()
    }

    /// Whether the grant carrying these conditions applies right now.
    pub fn satisfied(&self, context: Option<&EvalContext>, now: DateTime<Utc>) -> bool {
        if !self.time_windows.is_empty() && !self.time_windows.iter().any(|w| w.contains(now)) {
            return false;
        }
        match &self.value_limits {
            Some(limits) => limits.within(context),
            None => true,
        }
    }
}
