//! Declarative condition evaluation
//!
//! Predicates are field/operator/value triples evaluated against the run
//! context. A predicate list is AND-ed; there is no OR or grouping.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Context;

/// Comparison operator for a single predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    IsEmpty,
    IsNotEmpty,
    In,
}

/// One field/operator/value predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    /// Dot-path into the context, e.g. `trigger.amount`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Check this predicate against a context.
    pub fn matches(&self, context: &Context) -> bool {
        let actual = lookup_path(context, &self.field);

        match self.operator {
            ConditionOperator::Equals => actual.map_or(false, |v| values_equal(v, &self.value)),
            ConditionOperator::NotEquals => !actual.map_or(false, |v| values_equal(v, &self.value)),
            ConditionOperator::Contains => actual.map_or(false, |v| {
                stringify(v).contains(&stringify(&self.value))
            }),
            ConditionOperator::GreaterThan => compare_numeric(actual, &self.value)
                .map_or(false, |ordering| ordering == std::cmp::Ordering::Greater),
            ConditionOperator::LessThan => compare_numeric(actual, &self.value)
                .map_or(false, |ordering| ordering == std::cmp::Ordering::Less),
            ConditionOperator::IsEmpty => actual.map_or(true, is_empty),
            ConditionOperator::IsNotEmpty => actual.map_or(false, |v| !is_empty(v)),
            ConditionOperator::In => match &self.value {
                Value::Array(options) => actual.map_or(false, |v| {
                    options.iter().any(|option| values_equal(v, option))
                }),
                _ => false,
            },
        }
    }
}

/// Evaluate a predicate list against a context. Empty list matches vacuously.
pub fn evaluate(conditions: &[Predicate], context: &Context) -> bool {
    conditions.iter().all(|predicate| predicate.matches(context))
}

/// Resolve a dot-path against nested JSON objects.
///
/// Traversal through a non-object value or a missing key yields `None`.
pub fn lookup_path<'a>(context: &'a Context, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = context.get(first)?;

    for part in parts {
        current = current.as_object()?.get(part)?;
    }

    Some(current)
}

/// Loose equality: numeric values compare as numbers, everything else by
/// value with a stringified fallback.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    left == right || stringify(left) == stringify(right)
}

fn compare_numeric(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let left = actual?.as_f64()?;
    let right = expected.as_f64()?;
    left.partial_cmp(&right)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Render a JSON value as a plain string (strings lose their quotes).
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
