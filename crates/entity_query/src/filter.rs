//! Lowers Filter stack values to [`FilterExpr`].
//!
//! The query words build filters as raw `[op, left, right]` nodes, with the
//! attribute locator on either side of a comparison. Compilation normalises
//! the locator to the left (flipping ordering operators), turns bit fields
//! into def-set leaves and checks the right-hand side is a literal.

use entity_store::{AttrLocator, CompareOp, FilterExpr, FilterValue};

use crate::error::{Result, StackError};
use crate::value::{ComponentAttr, Filter, FilterOp, StackValue};

pub fn compile(filter: &Filter) -> Result<FilterExpr> {
    match filter.op {
        FilterOp::And => Ok(FilterExpr::and(node(&filter.left)?, node(&filter.right)?)),
        FilterOp::Or => Ok(FilterExpr::or(node(&filter.left)?, node(&filter.right)?)),
        FilterOp::Compare(op) => match (&filter.left, &filter.right) {
            (StackValue::ComponentAttr(attr), rhs) => leaf(op, attr, rhs),
            (lhs, StackValue::ComponentAttr(attr)) => leaf(op.flip(), attr, lhs),
            _ => Err(StackError::invalid(format!(
                "comparison needs a component attribute: {}",
                StackValue::from(filter.clone())
            ))),
        },
    }
}

fn node(value: &StackValue) -> Result<FilterExpr> {
    match value {
        StackValue::Filter(filter) => compile(filter),
        StackValue::BitField(bf) => Ok(FilterExpr::Defs(bf.clone())),
        // a bare attribute tests for the def
        StackValue::ComponentAttr(attr) => Ok(FilterExpr::Defs(attr.bit_field.clone())),
        other => Err(StackError::invalid(format!("not a filter: {}", other.stype()))),
    }
}

/// One comparison per def of the locator, or-ed. An unresolved locator keeps
/// def id 0, which matches nothing. Lists and regexes only take `==`/`!=`.
fn leaf(op: CompareOp, attr: &ComponentAttr, rhs: &StackValue) -> Result<FilterExpr> {
    let value = filter_value(rhs)?;
    if !matches!(op, CompareOp::Eq | CompareOp::Ne) && matches!(value, FilterValue::List(_) | FilterValue::Regex(_)) {
        return Err(StackError::invalid(format!("{} needs a scalar, found {}", op.as_str(), rhs.stype())));
    }
    let mut dids = attr.bit_field.to_values();
    if dids.is_empty() {
        dids.push(0);
    }
    let mut leaves = dids
        .into_iter()
        .map(|did| FilterExpr::compare(op, AttrLocator::new(did, attr.key.clone()), value.clone()));
    let first = leaves.next().ok_or_else(|| StackError::invalid("empty locator"))?;
    Ok(leaves.fold(first, FilterExpr::or))
}

fn filter_value(value: &StackValue) -> Result<FilterValue> {
    let value = match value {
        StackValue::Value(v) => FilterValue::Value(v.clone()),
        StackValue::Word(w) => FilterValue::Value(w.clone().into()),
        StackValue::List(items) => FilterValue::List(items.iter().map(StackValue::to_json).collect()),
        StackValue::Regex(re) => FilterValue::Regex(re.clone()),
        StackValue::DateTime(dt) => FilterValue::DateTime(*dt),
        StackValue::Entity(e) => FilterValue::Value(e.id.into()),
        other => return Err(StackError::invalid(format!("cannot compare against {}", other.stype()))),
    };
    Ok(value)
}
