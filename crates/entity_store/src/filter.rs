//! Filter expressions over component attributes.
//!
//! A [`FilterExpr`] is the lowered form of a query filter. Leaves either test
//! one component attribute against a value ([`FilterExpr::Compare`]) or
//! require a set of defs ([`FilterExpr::Defs`]); inner nodes combine results
//! with `and` / `or`.
//!
//! Backends lower the tree to their own execution strategy. The in-memory
//! strategy, [`evaluate`], walks the tree depth-first over candidate entity
//! ids:
//!
//! - `and` evaluates its right side only over the entities its left side
//!   matched, and skips the right side entirely when the left matched nothing.
//! - `or` evaluates both sides over the same candidates and unions the results.
//!
//! The RHS kind picks the comparison: a list tests membership, a regex tests
//! the pattern, a date compares chronologically, anything else compares JSON
//! values (numbers numerically, strings lexically).

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::trace;

use crate::bitfield::BitField;
use crate::component_def::ComponentDefId;
use crate::entity::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    /// Parses the query-language spelling of an operator.
    #[must_use]
    pub fn from_word(word: &str) -> Option<Self> {
        let op = match word {
            "==" => Self::Eq,
            "!=" => Self::Ne,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            _ => return None,
        };
        Some(op)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }

    /// The operator with its operands swapped (`2 < x` is `x > 2`).
    #[must_use]
    pub const fn flip(self) -> Self {
        match self {
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            other => other,
        }
    }

    /// Whether an ordering between lhs and rhs satisfies the operator.
    #[must_use]
    pub fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points at one attribute of one def. `def_id == 0` is an unregistered def
/// and matches nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttrLocator {
    pub def_id: ComponentDefId,
    pub key: String,
}

impl AttrLocator {
    #[must_use]
    pub fn new(def_id: ComponentDefId, key: impl Into<String>) -> Self {
        Self {
            def_id,
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FilterValue {
    Value(Value),
    List(Vec<Value>),
    Regex(Regex),
    DateTime(DateTime<Utc>),
}

impl PartialEq for FilterValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Compare {
        op: CompareOp,
        attr: AttrLocator,
        value: FilterValue,
    },
    /// Entities carrying every def in the bit set.
    Defs(BitField),
}

impl FilterExpr {
    #[must_use]
    pub fn and(left: FilterExpr, right: FilterExpr) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    #[must_use]
    pub fn or(left: FilterExpr, right: FilterExpr) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    #[must_use]
    pub fn compare(op: CompareOp, attr: AttrLocator, value: FilterValue) -> Self {
        Self::Compare { op, attr, value }
    }
}

/// Read access the in-memory evaluator needs from a backend.
pub trait FilterSource {
    /// Every stored entity id, ascending.
    fn entity_ids(&self) -> Vec<EntityId>;

    fn entity_bit_field(&self, eid: EntityId) -> Option<&BitField>;

    /// Reads an attribute (plain key or JSON pointer) of one component.
    fn attribute(&self, eid: EntityId, def_id: ComponentDefId, key: &str) -> Option<&Value>;
}

/// Evaluates a filter over every entity of `source`, returning matching ids in
/// ascending order.
pub fn evaluate<S: FilterSource + ?Sized>(expr: &FilterExpr, source: &S) -> Vec<EntityId> {
    walk(expr, source, source.entity_ids())
}

fn walk<S: FilterSource + ?Sized>(expr: &FilterExpr, source: &S, candidates: Vec<EntityId>) -> Vec<EntityId> {
    match expr {
        FilterExpr::And(left, right) => {
            let matched = walk(left, source, candidates);
            if matched.is_empty() {
                trace!("left side of and matched nothing, skipping right side");
                return matched;
            }
            walk(right, source, matched)
        }
        FilterExpr::Or(left, right) => {
            let mut matched = walk(left, source, candidates.clone());
            matched.extend(walk(right, source, candidates));
            matched.sort_unstable();
            matched.dedup();
            matched
        }
        FilterExpr::Defs(bf) => {
            if bf.is_empty() {
                return Vec::new();
            }
            candidates
                .into_iter()
                .filter(|eid| source.entity_bit_field(*eid).is_some_and(|ebf| BitField::and(bf, ebf)))
                .collect()
        }
        FilterExpr::Compare { op, attr, value } => {
            if attr.def_id == 0 {
                return Vec::new();
            }
            candidates
                .into_iter()
                .filter(|eid| {
                    source
                        .attribute(*eid, attr.def_id, &attr.key)
                        .is_some_and(|lhs| compare_value(*op, lhs, value))
                })
                .collect()
        }
    }
}

/// Applies one comparison leaf to an attribute value.
#[must_use]
pub fn compare_value(op: CompareOp, lhs: &Value, rhs: &FilterValue) -> bool {
    match rhs {
        FilterValue::Value(rhs) => match op {
            CompareOp::Eq => json_eq(lhs, rhs),
            CompareOp::Ne => !json_eq(lhs, rhs),
            _ => json_cmp(lhs, rhs).is_some_and(|ord| op.accepts(ord)),
        },
        FilterValue::List(items) => match op {
            CompareOp::Eq => items.iter().any(|item| json_eq(lhs, item)),
            CompareOp::Ne => !items.iter().any(|item| json_eq(lhs, item)),
            _ => false,
        },
        FilterValue::Regex(re) => {
            let matched = lhs.as_str().is_some_and(|s| re.is_match(s));
            match op {
                CompareOp::Eq => matched,
                CompareOp::Ne => !matched,
                _ => false,
            }
        }
        FilterValue::DateTime(rhs) => value_to_datetime(lhs).is_some_and(|lhs| op.accepts(lhs.cmp(rhs))),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Parses an RFC 3339 timestamp, a `YYYY-MM-DDTHH:MM:SS` date-time or a plain
/// `YYYY-MM-DD` date (midnight UTC).
#[must_use]
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Dates stored as text are parsed; integers are Unix milliseconds.
fn value_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s),
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::collections::BTreeMap;

    /// Entities 1..=3 with def 1 `{ n, name }`; entity 3 also has def 2.
    struct Fixture {
        bit_fields: BTreeMap<EntityId, BitField>,
        attrs: BTreeMap<(EntityId, ComponentDefId), serde_json::Map<String, Value>>,
        reads: Cell<usize>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut bit_fields = BTreeMap::new();
            let mut attrs = BTreeMap::new();
            for (eid, name) in [(1, "alpha"), (2, "beta"), (3, "gamma")] {
                bit_fields.insert(eid, BitField::from_values([1]));
                let obj = json!({ "n": eid, "name": name, "when": format!("2021-0{eid}-01") });
                attrs.insert((eid, 1), obj.as_object().unwrap().clone());
            }
            bit_fields.get_mut(&3).unwrap().set(2, true);
            attrs.insert((3, 2), serde_json::Map::new());
            Self {
                bit_fields,
                attrs,
                reads: Cell::new(0),
            }
        }
    }

    impl FilterSource for Fixture {
        fn entity_ids(&self) -> Vec<EntityId> {
            self.bit_fields.keys().copied().collect()
        }

        fn entity_bit_field(&self, eid: EntityId) -> Option<&BitField> {
            self.bit_fields.get(&eid)
        }

        fn attribute(&self, eid: EntityId, def_id: ComponentDefId, key: &str) -> Option<&Value> {
            self.reads.set(self.reads.get() + 1);
            crate::component::pointer(self.attrs.get(&(eid, def_id))?, key)
        }
    }

    fn cmp(op: CompareOp, key: &str, value: FilterValue) -> FilterExpr {
        FilterExpr::compare(op, AttrLocator::new(1, key), value)
    }

    #[test]
    fn test_equality_and_ordering() {
        let src = Fixture::new();
        assert_eq!(evaluate(&cmp(CompareOp::Eq, "/n", FilterValue::Value(json!(2))), &src), vec![2]);
        assert_eq!(evaluate(&cmp(CompareOp::Eq, "n", FilterValue::Value(json!(2.0))), &src), vec![2]);
        assert_eq!(evaluate(&cmp(CompareOp::Ne, "/n", FilterValue::Value(json!(2))), &src), vec![1, 3]);
        assert_eq!(evaluate(&cmp(CompareOp::Ge, "/n", FilterValue::Value(json!(2))), &src), vec![2, 3]);
        assert_eq!(evaluate(&cmp(CompareOp::Lt, "/name", FilterValue::Value(json!("beta"))), &src), vec![1]);
    }

    #[test]
    fn test_membership_regex_and_dates() {
        let src = Fixture::new();
        let list = FilterValue::List(vec![json!("alpha"), json!("gamma")]);
        assert_eq!(evaluate(&cmp(CompareOp::Eq, "/name", list.clone()), &src), vec![1, 3]);
        assert_eq!(evaluate(&cmp(CompareOp::Ne, "/name", list), &src), vec![2]);

        let re = FilterValue::Regex(Regex::new("^(al|be)").unwrap());
        assert_eq!(evaluate(&cmp(CompareOp::Eq, "/name", re), &src), vec![1, 2]);

        let date = FilterValue::DateTime(parse_datetime("2021-02-01").unwrap());
        assert_eq!(evaluate(&cmp(CompareOp::Gt, "/when", date.clone()), &src), vec![3]);
        assert_eq!(evaluate(&cmp(CompareOp::Le, "/when", date), &src), vec![1, 2]);
    }

    #[test]
    fn test_and_or_composition() {
        let src = Fixture::new();
        let and = FilterExpr::and(
            cmp(CompareOp::Gt, "/n", FilterValue::Value(json!(1))),
            FilterExpr::Defs(BitField::from_values([2])),
        );
        assert_eq!(evaluate(&and, &src), vec![3]);

        let or = FilterExpr::or(
            cmp(CompareOp::Eq, "/n", FilterValue::Value(json!(3))),
            cmp(CompareOp::Eq, "/n", FilterValue::Value(json!(1))),
        );
        assert_eq!(evaluate(&or, &src), vec![1, 3]);
    }

    #[test]
    fn test_and_skips_right_side_when_left_is_empty() {
        let src = Fixture::new();
        let expr = FilterExpr::and(
            cmp(CompareOp::Eq, "/name", FilterValue::Value(json!("nobody"))),
            cmp(CompareOp::Gt, "/n", FilterValue::Value(json!(0))),
        );
        assert!(evaluate(&expr, &src).is_empty());
        // only the three reads of the left leaf happened
        assert_eq!(src.reads.get(), 3);
    }

    #[test]
    fn test_and_narrows_right_side_candidates() {
        let src = Fixture::new();
        let expr = FilterExpr::and(
            cmp(CompareOp::Eq, "/n", FilterValue::Value(json!(1))),
            cmp(CompareOp::Eq, "/name", FilterValue::Value(json!("alpha"))),
        );
        assert_eq!(evaluate(&expr, &src), vec![1]);
        assert_eq!(src.reads.get(), 4);
    }

    #[test]
    fn test_unregistered_def_matches_nothing() {
        let src = Fixture::new();
        let expr = FilterExpr::compare(CompareOp::Ne, AttrLocator::new(0, "/n"), FilterValue::Value(json!(0)));
        assert!(evaluate(&expr, &src).is_empty());
        assert!(evaluate(&FilterExpr::Defs(BitField::new()), &src).is_empty());
        assert_eq!(evaluate(&FilterExpr::Defs(BitField::all()), &src), vec![1, 2, 3]);
    }

    #[test]
    fn test_parse_datetime_forms() {
        assert!(parse_datetime("2021-01-01").is_some());
        assert!(parse_datetime("2021-01-01T10:00:00").is_some());
        assert!(parse_datetime("2021-01-01T10:00:00Z").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
