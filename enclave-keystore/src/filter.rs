//! Metadata filters for vector queries.
//!
//! The JSON form follows the common `where` clause convention:
//!
//! ```text
//! {"source_id": "doc1"}                          implicit $eq
//! {"page": {"$gte": 3}, "source_type": "pdf"}    several keys are ANDed
//! {"$or": [{"source_id": "a"}, {"source_id": "b"}]}
//! ```

use crate::error::StoreError;
use crate::types::{MetadataValue, StoredMetadata};
use serde_json::{json, Map, Value};

/// Comparison applied to one field.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Eq(MetadataValue),
    Ne(MetadataValue),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    In(Vec<MetadataValue>),
    Nin(Vec<MetadataValue>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Field { name: String, condition: Condition },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn field(name: impl Into<String>, condition: Condition) -> Self {
        Self::Field {
            name: name.into(),
            condition,
        }
    }

    pub fn eq(name: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self::field(name, Condition::Eq(value.into()))
    }

    /// Every field name referenced anywhere in the filter, first occurrence
    /// order, no duplicates.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Field { name, .. } => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_names(out);
                }
            }
        }
    }

    /// Evaluate against stored metadata. A missing field only satisfies
    /// `$ne` and `$nin`.
    pub fn matches(&self, metadata: &StoredMetadata) -> bool {
        match self {
            Self::Field { name, condition } => condition.matches(metadata.get(name)),
            Self::And(children) => children.iter().all(|c| c.matches(metadata)),
            Self::Or(children) => children.iter().any(|c| c.matches(metadata)),
        }
    }

    // -----------------------------------------------------------------------
    // JSON form
    // -----------------------------------------------------------------------

    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| invalid("filter must be an object"))?;
        let mut clauses = Vec::with_capacity(obj.len());
        for (key, val) in obj {
            clauses.push(match key.as_str() {
                "$and" => Self::And(parse_list(val)?),
                "$or" => Self::Or(parse_list(val)?),
                op if op.starts_with('$') => {
                    return Err(invalid(format!("unknown logical operator {}", op)))
                }
                field => parse_field(field, val)?,
            });
        }
        match clauses.len() {
            0 => Err(invalid("empty filter")),
            1 => Ok(clauses.remove(0)),
            _ => Ok(Self::And(clauses)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Field { name, condition } => {
                let mut obj = Map::new();
                obj.insert(name.clone(), condition.to_json());
                Value::Object(obj)
            }
            Self::And(children) => json!({ "$and": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
            Self::Or(children) => json!({ "$or": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
        }
    }
}

impl Condition {
    fn matches(&self, value: Option<&MetadataValue>) -> bool {
        match (self, value) {
            (Self::Ne(_), None) | (Self::Nin(_), None) => true,
            (_, None) => false,
            (Self::Eq(want), Some(have)) => values_equal(want, have),
            (Self::Ne(want), Some(have)) => !values_equal(want, have),
            (Self::Gt(n), Some(have)) => have.as_f64().map_or(false, |h| h > *n),
            (Self::Gte(n), Some(have)) => have.as_f64().map_or(false, |h| h >= *n),
            (Self::Lt(n), Some(have)) => have.as_f64().map_or(false, |h| h < *n),
            (Self::Lte(n), Some(have)) => have.as_f64().map_or(false, |h| h <= *n),
            (Self::In(set), Some(have)) => set.iter().any(|w| values_equal(w, have)),
            (Self::Nin(set), Some(have)) => !set.iter().any(|w| values_equal(w, have)),
        }
    }

    fn to_json(&self) -> Value {
        fn list(vs: &[MetadataValue]) -> Value {
            Value::Array(vs.iter().map(MetadataValue::to_json).collect())
        }
        match self {
            Self::Eq(v) => json!({ "$eq": v.to_json() }),
            Self::Ne(v) => json!({ "$ne": v.to_json() }),
            Self::Gt(n) => json!({ "$gt": n }),
            Self::Gte(n) => json!({ "$gte": n }),
            Self::Lt(n) => json!({ "$lt": n }),
            Self::Lte(n) => json!({ "$lte": n }),
            Self::In(vs) => json!({ "$in": list(vs) }),
            Self::Nin(vs) => json!({ "$nin": list(vs) }),
        }
    }
}

fn values_equal(a: &MetadataValue, b: &MetadataValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn invalid(msg: impl Into<String>) -> StoreError {
    StoreError::InvalidFilter(msg.into())
}

fn parse_list(value: &Value) -> Result<Vec<Filter>, StoreError> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid("$and/$or expects an array"))?;
    if items.is_empty() {
        return Err(invalid("$and/$or expects at least one clause"));
    }
    items.iter().map(Filter::from_json).collect()
}

fn primitive(value: &Value) -> Result<MetadataValue, StoreError> {
    match value {
        Value::Array(_) | Value::Object(_) | Value::Null => {
            Err(invalid("comparison value must be a string, number or bool"))
        }
        other => MetadataValue::from_json(other).ok_or_else(|| invalid("unsupported value")),
    }
}

fn number(value: &Value) -> Result<f64, StoreError> {
    value
        .as_f64()
        .ok_or_else(|| invalid("range operators take a number"))
}

fn primitives(value: &Value) -> Result<Vec<MetadataValue>, StoreError> {
    value
        .as_array()
        .ok_or_else(|| invalid("$in/$nin expects an array"))?
        .iter()
        .map(primitive)
        .collect()
}

fn parse_field(name: &str, value: &Value) -> Result<Filter, StoreError> {
    let ops = match value {
        Value::Object(ops) => ops,
        other => return Ok(Filter::field(name, Condition::Eq(primitive(other)?))),
    };
    let mut conditions = Vec::with_capacity(ops.len());
    for (op, arg) in ops {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(primitive(arg)?),
            "$ne" => Condition::Ne(primitive(arg)?),
            "$gt" => Condition::Gt(number(arg)?),
            "$gte" => Condition::Gte(number(arg)?),
            "$lt" => Condition::Lt(number(arg)?),
            "$lte" => Condition::Lte(number(arg)?),
            "$in" => Condition::In(primitives(arg)?),
            "$nin" => Condition::Nin(primitives(arg)?),
            other => return Err(invalid(format!("unknown operator {}", other))),
        };
        conditions.push(Filter::field(name, condition));
    }
    match conditions.len() {
        0 => Err(invalid(format!("no operator for field {}", name))),
        1 => Ok(conditions.remove(0)),
        _ => Ok(Filter::And(conditions)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, MetadataValue)]) -> StoredMetadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn implicit_and_of_fields() {
        let filter = Filter::from_json(&json!({"source_id": "x", "page": {"$gte": 2}})).unwrap();
        assert_eq!(filter.field_names(), vec!["page", "source_id"]);
        assert!(filter.matches(&meta(&[("source_id", "x".into()), ("page", 3i64.into())])));
        assert!(!filter.matches(&meta(&[("source_id", "x".into()), ("page", 1i64.into())])));
    }

    #[test]
    fn nested_or() {
        let filter = Filter::from_json(&json!({
            "$or": [{"source_id": "a"}, {"source_type": {"$in": ["pdf", "md"]}}]
        }))
        .unwrap();
        assert!(filter.matches(&meta(&[("source_id", "a".into())])));
        assert!(filter.matches(&meta(&[("source_type", "md".into())])));
        assert!(!filter.matches(&meta(&[("source_type", "html".into())])));
    }

    #[test]
    fn missing_field_semantics() {
        let empty = StoredMetadata::new();
        assert!(!Filter::eq("a", "x").matches(&empty));
        assert!(Filter::field("a", Condition::Ne("x".into())).matches(&empty));
        assert!(Filter::field("a", Condition::Nin(vec!["x".into()])).matches(&empty));
    }

    #[test]
    fn int_and_float_compare_numerically() {
        let m = meta(&[("page", 2i64.into())]);
        assert!(Filter::from_json(&json!({"page": 2.0})).unwrap().matches(&m));
        assert!(Filter::from_json(&json!({"page": {"$lt": 2.5}})).unwrap().matches(&m));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Filter::from_json(&json!([])).is_err());
        assert!(Filter::from_json(&json!({})).is_err());
        assert!(Filter::from_json(&json!({"$not": []})).is_err());
        assert!(Filter::from_json(&json!({"a": {"$regex": "x"}})).is_err());
        assert!(Filter::from_json(&json!({"a": {"$gt": "x"}})).is_err());
        assert!(Filter::from_json(&json!({"$and": []})).is_err());
        assert!(Filter::from_json(&json!({"a": null})).is_err());
    }

    #[test]
    fn json_form_parses_back() {
        let filter = Filter::Or(vec![
            Filter::eq("source_id", "a"),
            Filter::field("page", Condition::Gt(3.0)),
        ]);
        assert_eq!(Filter::from_json(&filter.to_json()).unwrap(), filter);
    }
}
