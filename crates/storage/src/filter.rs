//! Predicates over stored documents.

use crate::Document;
use serde_json::Value;
use std::cmp::Ordering;

/// A predicate selecting documents.
///
/// Comparisons are numeric when both sides are numbers and lexical when both
/// are strings; mixed or missing values never match.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document
    All,
    /// Field equals value
    Eq(String, Value),
    /// Field less than value
    Lt(String, Value),
    /// Field less than or equal to value
    Le(String, Value),
    /// Field greater than value
    Gt(String, Value),
    /// Field equals one of the values
    In(String, Vec<Value>),
    /// Document id is one of the ids
    IdIn(Vec<String>),
    /// All of the filters match
    And(Vec<Filter>),
}

impl Filter {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    /// `field <= value`
    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Le(field.into(), value.into())
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    /// Match documents with one of the given ids.
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::IdIn(ids.into_iter().map(Into::into).collect())
    }

    /// Combine with another filter.
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut all) => {
                all.push(other);
                Filter::And(all)
            }
            Filter::All => other,
            first => Filter::And(vec![first, other]),
        }
    }

    /// Whether the document satisfies this filter.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => doc.get(field).is_some_and(|v| compare(v, value) == Some(Ordering::Equal)),
            Filter::Lt(field, value) => doc.get(field).is_some_and(|v| compare(v, value) == Some(Ordering::Less)),
            Filter::Le(field, value) => doc
                .get(field)
                .is_some_and(|v| matches!(compare(v, value), Some(Ordering::Less | Ordering::Equal))),
            Filter::Gt(field, value) => doc.get(field).is_some_and(|v| compare(v, value) == Some(Ordering::Greater)),
            Filter::In(field, values) => doc
                .get(field)
                .is_some_and(|v| values.iter().any(|x| compare(v, x) == Some(Ordering::Equal))),
            Filter::IdIn(ids) => doc
                .get(factory_core::record::fields::ID)
                .and_then(Value::as_str)
                .is_some_and(|id| ids.iter().any(|x| x == id)),
            Filter::And(all) => all.iter().all(|f| f.matches(doc)),
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_numeric_comparisons() {
        let d = doc(json!({"id": "a", "state": 1, "due_at": 5000}));
        assert!(Filter::lt("state", 3).matches(&d));
        assert!(!Filter::lt("state", 1).matches(&d));
        assert!(Filter::le("due_at", 5000.0).matches(&d));
        assert!(Filter::gt("due_at", 4999).matches(&d));
        assert!(Filter::eq("state", 1).matches(&d));
    }

    #[test]
    fn test_missing_and_mixed_fields_never_match() {
        let d = doc(json!({"id": "a", "state": "1"}));
        assert!(!Filter::lt("state", 3).matches(&d));
        assert!(!Filter::lt("due_at", 3).matches(&d));
    }

    #[test]
    fn test_combinators() {
        let d = doc(json!({"id": "a", "job_id": "j", "state": 3}));
        let f = Filter::All.and(Filter::eq("job_id", "j")).and(Filter::In("state".into(), vec![json!(3), json!(4)]));
        assert!(f.matches(&d));
        assert!(Filter::ids(["x", "a"]).matches(&d));
        assert!(!Filter::ids(["x"]).matches(&d));
        assert!(!Filter::eq("job_id", "k").and(Filter::All).matches(&d));
    }
}
