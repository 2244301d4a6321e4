//! Filter grammar
//!
//! Filters arrive as an ordered map from field name to a value. The value can
//! take three shapes:
//!
//! - a condition string: comma-separated conditions, each `op__value` or a
//!   bare value meaning `eq`. `"gte__10,lte__20"` is two conditions OR'd
//!   together; `in` values are separated by `|`, as in `"in__apple|pear"`.
//! - a JSON array, meaning `in`.
//! - an object mapping operators to values, e.g. `{"gte": 10, "in": [1, 2]}`.
//!
//! A key may also carry the operator itself (`price__gte`). Conditions on one
//! field OR together; different fields AND together. Values are coerced to
//! the field's declared [`FieldKind`](super::field::FieldKind).
//!
//! Changing this grammar changes the public query-string contract.

use super::entity::Entity;
use super::error::{CrudError, FieldErrors};
use super::field::{FieldDef, FieldValue};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Raw filter input: field (or `field__op`) → value
pub type FilterMap = IndexMap<String, Value>;

/// Comparison operators understood by the grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    Ilike,
    In,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Like => "like",
            Operator::Ilike => "ilike",
            Operator::In => "in",
        }
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "eq" => Ok(Operator::Eq),
            "ne" => Ok(Operator::Ne),
            "lt" => Ok(Operator::Lt),
            "lte" => Ok(Operator::Lte),
            "gt" => Ok(Operator::Gt),
            "gte" => Ok(Operator::Gte),
            "like" => Ok(Operator::Like),
            "ilike" => Ok(Operator::Ilike),
            "in" => Ok(Operator::In),
            other => Err(format!("Unknown filter operator '{}'.", other)),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with filter entries that cannot be applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterPolicy {
    /// Skip the entry and log a warning
    #[default]
    Permissive,
    /// Reject the request with a validation error
    Strict,
}

/// Split a condition string into `(operator, value)` pairs.
///
/// Parts with an unknown operator come back as errors so the caller can apply
/// its [`FilterPolicy`].
pub fn parse_condition_string(raw: &str) -> Vec<Result<(Operator, String), String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once("__") {
            Some((op, value)) => op
                .parse::<Operator>()
                .map(|op| (op, value.trim().to_string())),
            None => Ok((Operator::Eq, part.to_string())),
        })
        .collect()
}

#[derive(Debug)]
enum Operand {
    Value(FieldValue),
    List(Vec<FieldValue>),
    Pattern(Regex),
}

#[derive(Debug)]
struct Condition {
    op: Operator,
    operand: Operand,
}

impl Condition {
    fn matches(&self, actual: &FieldValue) -> bool {
        match (&self.op, &self.operand) {
            (_, Operand::Pattern(regex)) => actual
                .as_text()
                .is_some_and(|text| regex.is_match(&text)),
            (_, Operand::List(items)) => items
                .iter()
                .any(|item| actual.compare(item) == Some(Ordering::Equal)),
            (op, Operand::Value(expected)) => {
                let Some(ordering) = actual.compare(expected) else {
                    return false;
                };
                match op {
                    Operator::Ne => ordering != Ordering::Equal,
                    Operator::Lt => ordering == Ordering::Less,
                    Operator::Lte => ordering != Ordering::Greater,
                    Operator::Gt => ordering == Ordering::Greater,
                    Operator::Gte => ordering != Ordering::Less,
                    _ => ordering == Ordering::Equal,
                }
            }
        }
    }
}

struct Clause<M: 'static> {
    field: &'static FieldDef<M>,
    conditions: Vec<Condition>,
}

/// A filter bound to one entity type, ready to evaluate
pub struct CompiledFilter<M: 'static> {
    clauses: Vec<Clause<M>>,
}

impl<M: Entity> CompiledFilter<M> {
    /// A filter that admits everything
    pub fn empty() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    /// Compile raw filter input against `M`'s field registry
    pub fn compile(input: &FilterMap, policy: FilterPolicy) -> Result<Self, CrudError> {
        let mut compiler = Compiler {
            policy,
            rejected: FieldErrors::new(),
        };
        let mut clauses: Vec<Clause<M>> = Vec::new();

        for (key, value) in input {
            let Some((field, key_op)) = resolve_key::<M>(key) else {
                compiler.reject(key, format!("Unknown filter field '{}'.", key));
                continue;
            };

            let conditions: Vec<Condition> = compiler
                .expand(key, key_op, value)
                .into_iter()
                .filter_map(|(op, raw)| compiler.compile_condition(key, field, op, &raw))
                .collect();

            if conditions.is_empty() {
                continue;
            }
            match clauses
                .iter_mut()
                .find(|c| c.field.name() == field.name())
            {
                Some(clause) => clause.conditions.extend(conditions),
                None => clauses.push(Clause { field, conditions }),
            }
        }

        if compiler.policy == FilterPolicy::Strict && !compiler.rejected.is_empty() {
            return Err(CrudError::ValidationFailed(compiler.rejected));
        }
        Ok(Self { clauses })
    }

    /// AND across fields, OR within a field
    pub fn matches(&self, model: &M) -> bool {
        self.clauses.iter().all(|clause| {
            let actual = clause.field.get(model);
            clause.conditions.iter().any(|c| c.matches(&actual))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

/// Resolve a filter key to a registered field and an optional key operator
fn resolve_key<M: Entity>(key: &str) -> Option<(&'static FieldDef<M>, Option<&str>)> {
    let registry = M::fields();
    if let Some(def) = registry.get(key) {
        return Some((def, None));
    }
    let (field, op) = key.rsplit_once("__")?;
    registry.get(field).map(|def| (def, Some(op)))
}

struct Compiler {
    policy: FilterPolicy,
    rejected: FieldErrors,
}

impl Compiler {
    fn reject(&mut self, key: &str, reason: String) {
        if self.policy == FilterPolicy::Permissive {
            tracing::warn!(filter = key, "Skipping filter condition: {}", reason);
        }
        self.rejected.add(key, reason);
    }

    /// Turn one filter entry into `(operator, raw value)` pairs
    fn expand(&mut self, key: &str, key_op: Option<&str>, value: &Value) -> Vec<(Operator, Value)> {
        if let Some(op) = key_op {
            return match op.parse::<Operator>() {
                Ok(op) => vec![(op, value.clone())],
                Err(reason) => {
                    self.reject(key, reason);
                    Vec::new()
                }
            };
        }

        match value {
            Value::String(raw) => parse_condition_string(raw)
                .into_iter()
                .filter_map(|parsed| match parsed {
                    Ok((op, v)) => Some((op, Value::String(v))),
                    Err(reason) => {
                        self.reject(key, reason);
                        None
                    }
                })
                .collect(),
            Value::Array(_) => vec![(Operator::In, value.clone())],
            Value::Object(ops) => ops
                .iter()
                .filter_map(|(op, v)| match op.parse::<Operator>() {
                    Ok(op) => Some((op, v.clone())),
                    Err(reason) => {
                        self.reject(key, reason);
                        None
                    }
                })
                .collect(),
            scalar => vec![(Operator::Eq, scalar.clone())],
        }
    }

    fn compile_condition<M>(
        &mut self,
        key: &str,
        field: &FieldDef<M>,
        op: Operator,
        raw: &Value,
    ) -> Option<Condition> {
        let operand = match op {
            Operator::In => {
                let items: Vec<Value> = match raw {
                    Value::Array(items) => items.clone(),
                    Value::String(s) => s
                        .split(['|', ','])
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                    scalar => vec![scalar.clone()],
                };
                let mut values = Vec::with_capacity(items.len());
                for item in &items {
                    match field.kind().coerce_json(item) {
                        Some(v) => values.push(v),
                        None => self.reject(key, uncoercible(field, item)),
                    }
                }
                if values.is_empty() {
                    return None;
                }
                Operand::List(values)
            }
            Operator::Like | Operator::Ilike => {
                let text = match raw {
                    Value::String(s) => s.clone(),
                    Value::Null | Value::Array(_) | Value::Object(_) => {
                        self.reject(key, format!("'{}' needs a text value.", op));
                        return None;
                    }
                    other => other.to_string(),
                };
                match like_pattern(&text, op == Operator::Ilike) {
                    Ok(regex) => Operand::Pattern(regex),
                    Err(err) => {
                        self.reject(key, err.to_string());
                        return None;
                    }
                }
            }
            _ => match field.kind().coerce_json(raw) {
                Some(value) => Operand::Value(value),
                None => {
                    self.reject(key, uncoercible(field, raw));
                    return None;
                }
            },
        };
        Some(Condition { op, operand })
    }
}

fn uncoercible<M>(field: &FieldDef<M>, raw: &Value) -> String {
    format!(
        "Value {} is not a valid {:?} for field '{}'.",
        raw,
        field.kind(),
        field.name()
    )
}

/// Build a matcher for `%value%` with SQL LIKE wildcards
fn like_pattern(value: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    let mut pattern = String::from(if case_insensitive { "(?is)^.*" } else { "(?s)^.*" });
    let mut buf = [0u8; 4];
    for ch in value.chars() {
        match ch {
            '%' => pattern.push_str(".*"),
            '_' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    pattern.push_str(".*$");
    Regex::new(&pattern)
}
