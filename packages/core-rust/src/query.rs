//! Serializable find options (`where` / `orderBy` / `limit`) and their
//! in-memory evaluation.
//!
//! The `where` document uses the JSON filter dialect of the entity layer:
//! plain values mean equality, arrays mean membership, objects carry `$`
//! operators, and `$and` / `$or` / `$not` compose sub-filters. Translating
//! filters to SQL is the repository's concern; evaluation here backs the
//! in-memory repository and row-local membership checks.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Row;

/// Errors raised while evaluating a filter against a row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("unknown filter operator: {0}")]
    UnknownOperator(String),
    #[error("operator {op} expects {expected}")]
    InvalidOperand { op: String, expected: &'static str },
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// A `where` document in the entity layer's JSON filter dialect.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(pub Map<String, Value>);

impl Filter {
    /// The empty filter, which matches every row.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// `field == value`.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut map = Map::new();
        map.insert(field.into(), value.into());
        Self(map)
    }

    /// `field IN (values)`.
    #[must_use]
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        let mut op = Map::new();
        op.insert("$in".to_string(), Value::Array(list));
        let mut map = Map::new();
        map.insert(field.into(), Value::Object(op));
        Self(map)
    }

    /// Conjunction of filters. Empty filters are dropped; a single remaining
    /// filter is returned as-is.
    #[must_use]
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut parts: Vec<Filter> = filters.into_iter().filter(|f| !f.is_empty()).collect();
        match parts.len() {
            0 => Self::new(),
            1 => parts.remove(0),
            _ => {
                let list = parts.into_iter().map(|f| Value::Object(f.0)).collect();
                let mut map = Map::new();
                map.insert("$and".to_string(), Value::Array(list));
                Self(map)
            }
        }
    }

    /// Whether this filter has no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluates the filter against a single row.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] for unknown operators or malformed operands.
    pub fn matches(&self, row: &Row) -> Result<bool, FilterError> {
        for (key, cond) in &self.0 {
            let ok = match key.as_str() {
                "$and" => {
                    let mut all = true;
                    for sub in sub_filters("$and", cond)? {
                        if !sub.matches(row)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                "$or" => {
                    let mut any = false;
                    for sub in sub_filters("$or", cond)? {
                        if sub.matches(row)? {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                "$not" => {
                    let sub = single_filter("$not", cond)?;
                    !sub.matches(row)?
                }
                op if op.starts_with('$') => {
                    return Err(FilterError::UnknownOperator(op.to_string()));
                }
                field => match_field(row.get(field).unwrap_or(&Value::Null), cond)?,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn single_filter(op: &str, cond: &Value) -> Result<Filter, FilterError> {
    match cond {
        Value::Object(map) => Ok(Filter(map.clone())),
        _ => Err(FilterError::InvalidOperand {
            op: op.to_string(),
            expected: "an object",
        }),
    }
}

fn sub_filters(op: &str, cond: &Value) -> Result<Vec<Filter>, FilterError> {
    match cond {
        Value::Array(items) => items.iter().map(|v| single_filter(op, v)).collect(),
        Value::Object(_) => Ok(vec![single_filter(op, cond)?]),
        _ => Err(FilterError::InvalidOperand {
            op: op.to_string(),
            expected: "an array of objects",
        }),
    }
}

fn match_field(value: &Value, cond: &Value) -> Result<bool, FilterError> {
    match cond {
        Value::Object(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
            for (op, operand) in ops {
                if !match_operator(value, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Value::Array(options) => Ok(options.iter().any(|o| values_equal(value, o))),
        _ => Ok(values_equal(value, cond)),
    }
}

fn match_operator(value: &Value, op: &str, operand: &Value) -> Result<bool, FilterError> {
    let ok = match op {
        "$eq" => values_equal(value, operand),
        "$ne" => !values_equal(value, operand),
        "$gt" => partial_compare(value, operand) == Some(Ordering::Greater),
        "$gte" => matches!(
            partial_compare(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => partial_compare(value, operand) == Some(Ordering::Less),
        "$lte" => matches!(
            partial_compare(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" | "$nin" => {
            let Value::Array(options) = operand else {
                return Err(FilterError::InvalidOperand {
                    op: op.to_string(),
                    expected: "an array",
                });
            };
            let found = options.iter().any(|o| values_equal(value, o));
            if op == "$in" {
                found
            } else {
                !found
            }
        }
        "$contains" | "$notContains" | "$startsWith" | "$endsWith" => {
            let Value::String(needle) = operand else {
                return Err(FilterError::InvalidOperand {
                    op: op.to_string(),
                    expected: "a string",
                });
            };
            let Value::String(hay) = value else {
                return Ok(op == "$notContains");
            };
            let hay = hay.to_lowercase();
            let needle = needle.to_lowercase();
            match op {
                "$contains" => hay.contains(&needle),
                "$notContains" => !hay.contains(&needle),
                "$startsWith" => hay.starts_with(&needle),
                _ => hay.ends_with(&needle),
            }
        }
        other => return Err(FilterError::UnknownOperator(other.to_string())),
    };
    Ok(ok)
}

/// Equality that treats `1` and `1.0` as the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between values of the same JSON type; `None` across types.
fn partial_compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order used for sorting: nulls first, then by JSON type, then by value.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| partial_compare(a, b).unwrap_or(Ordering::Equal))
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Sort direction for `orderBy` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One `orderBy` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Compares two rows by a list of `orderBy` entries.
#[must_use]
pub fn compare_rows(order_by: &[OrderBy], a: &Row, b: &Row) -> Ordering {
    for entry in order_by {
        let left = a.get(&entry.field).unwrap_or(&Value::Null);
        let right = b.get(&entry.field).unwrap_or(&Value::Null);
        let ord = compare_values(left, right);
        let ord = match entry.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

// ---------------------------------------------------------------------------
// FindOptions
// ---------------------------------------------------------------------------

/// Serializable query description stored with every registered live query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindOptions {
    /// Row filter. `where` is a Rust keyword, so we use raw identifier syntax.
    #[serde(rename = "where")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub r#where: Option<Filter>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub order_by: Vec<OrderBy>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<u32>,
}

impl FindOptions {
    /// Options with only a `where` filter.
    #[must_use]
    pub fn filtered(filter: Filter) -> Self {
        Self {
            r#where: Some(filter),
            ..Self::default()
        }
    }

    /// Whether row membership can be decided one row at a time.
    ///
    /// A `limit` makes membership depend on the rest of the table (rows
    /// enter and leave the window as others change).
    #[must_use]
    pub fn is_row_local(&self) -> bool {
        self.limit.is_none()
    }

    /// Whether the result has a deterministic order that ids can be diffed against.
    #[must_use]
    pub fn has_stable_ordering(&self) -> bool {
        self.limit.is_none() || !self.order_by.is_empty()
    }

    /// Copy of these options narrowed by an extra filter, without `limit`.
    #[must_use]
    pub fn restricted_to(&self, extra: Filter) -> Self {
        let base = self.r#where.clone().unwrap_or_default();
        Self {
            r#where: Some(Filter::and([base, extra])),
            order_by: self.order_by.clone(),
            limit: None,
        }
    }

    /// Deterministic JSON form, used to derive live query ids.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Sorts rows in place according to `order_by` (stable).
    pub fn sort_rows(&self, rows: &mut [Row]) {
        if !self.order_by.is_empty() {
            rows.sort_by(|a, b| compare_rows(&self.order_by, a, b));
        }
    }

    /// Applies filter, ordering, and limit to a set of rows.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] if the filter cannot be evaluated.
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Row>) -> Result<Vec<Row>, FilterError> {
        let mut out = Vec::new();
        for row in rows {
            let keep = match &self.r#where {
                Some(filter) => filter.matches(row)?,
                None => true,
            };
            if keep {
                out.push(row.clone());
            }
        }
        self.sort_rows(&mut out);
        if let Some(limit) = self.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }
}

/// Derives the id of a live query, which is also the name of its channel.
///
/// The same client subscribing to the same query twice gets the same id, so
/// the second registration overwrites the first. Clients compute it too, to
/// listen on the channel before the subscribe request returns.
#[must_use]
pub fn live_query_id(client_id: &str, entity_key: &str, options: &FindOptions) -> String {
    let options_json = options.canonical_json();
    let mut hasher = blake3::Hasher::new();
    for part in [client_id, entity_key, options_json.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}
