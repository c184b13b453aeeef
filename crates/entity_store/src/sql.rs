//! SQL lowering of filter expressions.
//!
//! SQL-backed entity sets keep one table per component def plus two shared
//! tables:
//!
//! - `tbl_entity (id)`: one row per entity.
//! - `tbl_entity_component (eid, did)`: one row per stored component.
//!
//! [`compile_filter`] lowers a [`FilterExpr`] into a single statement that
//! yields the matching `eid`s. Values are always bound parameters.
//! `and` becomes `INTERSECT` and `or` becomes `UNION`. A regex needs a
//! `REGEXP` function registered on the connection.

use std::fmt::Write as _;

use serde_json::Value;

use crate::bitfield::BitField;
use crate::component_def::{ComponentDef, PropertyType};
use crate::filter::{CompareOp, FilterExpr, FilterValue};
use crate::registry::DefRegistry;

pub const ENTITY_TABLE: &str = "tbl_entity";
pub const ENTITY_COMPONENT_TABLE: &str = "tbl_entity_component";

/// A statement with positional (`?`) parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// `tbl` + url with non-alphanumerics mapped to `_` + `_` + hex hash.
#[must_use]
pub fn table_name(def: &ComponentDef) -> String {
    let url: String = def
        .url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("tbl{url}_{:x}", def.hash)
}

#[must_use]
pub fn column_type(ty: PropertyType) -> &'static str {
    match ty {
        PropertyType::Integer | PropertyType::Entity => "INTEGER",
        PropertyType::Number => "REAL",
        PropertyType::Boolean => "BOOLEAN",
        _ => "TEXT",
    }
}

/// DDL for a def's table. Non-persisted properties get no column.
#[must_use]
pub fn create_table_sql(def: &ComponentDef) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  eid INTEGER PRIMARY KEY,\n  created_at TEXT,\n  updated_at TEXT",
        table_name(def)
    );
    for prop in def.properties.iter().filter(|p| p.persist) {
        let _ = write!(sql, ",\n  \"{}\" {}", quote_ident(&prop.name), column_type(prop.ty));
    }
    sql.push_str(",\n  FOREIGN KEY(eid) REFERENCES tbl_entity(id) ON DELETE CASCADE\n);");
    sql
}

/// Lowers a filter into a statement returning matching `eid`s.
#[must_use]
pub fn compile_filter(expr: &FilterExpr, registry: &DefRegistry) -> SqlStatement {
    let mut params = Vec::new();
    let sql = lower(expr, registry, &mut params);
    SqlStatement { sql, params }
}

fn lower(expr: &FilterExpr, registry: &DefRegistry, params: &mut Vec<Value>) -> String {
    match expr {
        FilterExpr::And(left, right) => {
            let l = lower(left, registry, params);
            let r = lower(right, registry, params);
            format!("SELECT eid FROM ({l}) INTERSECT SELECT eid FROM ({r})")
        }
        FilterExpr::Or(left, right) => {
            let l = lower(left, registry, params);
            let r = lower(right, registry, params);
            format!("SELECT eid FROM ({l}) UNION SELECT eid FROM ({r})")
        }
        FilterExpr::Defs(bf) => lower_defs(bf, params),
        FilterExpr::Compare { op, attr, value } => {
            let Some(def) = registry.get(attr.def_id) else {
                return empty_select();
            };
            // lists and regexes only support (in)equality; the memory evaluator
            // matches nothing for the ordering operators
            let ordered = !matches!(op, CompareOp::Eq | CompareOp::Ne);
            if ordered && matches!(value, FilterValue::List(_) | FilterValue::Regex(_)) {
                return empty_select();
            }
            let column = column_expr(&attr.key);
            let test = match value {
                FilterValue::Value(v) => {
                    params.push(v.clone());
                    format!("{column} {} ?", op_to_sql(*op))
                }
                FilterValue::List(items) => {
                    let marks = vec!["?"; items.len()].join(", ");
                    params.extend(items.iter().cloned());
                    let not = if *op == CompareOp::Ne { "NOT " } else { "" };
                    format!("{column} {not}IN ({marks})")
                }
                FilterValue::Regex(re) => {
                    params.push(Value::String(re.as_str().to_string()));
                    let not = if *op == CompareOp::Ne { "NOT " } else { "" };
                    format!("{column} {not}REGEXP ?")
                }
                FilterValue::DateTime(dt) => {
                    params.push(Value::String(dt.to_rfc3339()));
                    format!("{column} {} ?", op_to_sql(*op))
                }
            };
            format!("SELECT eid FROM {} WHERE {test}", table_name(def))
        }
    }
}

fn lower_defs(bf: &BitField, params: &mut Vec<Value>) -> String {
    if bf.is_all() {
        return format!("SELECT id AS eid FROM {ENTITY_TABLE}");
    }
    if bf.is_empty() {
        return empty_select();
    }
    let dids = bf.to_values();
    let marks = vec!["?"; dids.len()].join(", ");
    params.extend(dids.iter().map(|d| Value::from(*d)));
    format!(
        "SELECT eid FROM {ENTITY_COMPONENT_TABLE} WHERE did IN ({marks}) GROUP BY eid HAVING COUNT(DISTINCT did) = {}",
        dids.len()
    )
}

fn empty_select() -> String {
    format!("SELECT eid FROM {ENTITY_COMPONENT_TABLE} WHERE 0")
}

#[must_use]
pub const fn op_to_sql(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
    }
}

/// `/a` reads column `a`; `/a/b/c` reads `$.b.c` out of column `a`,
/// whatever the column type.
fn column_expr(key: &str) -> String {
    let path = key.strip_prefix('/').unwrap_or(key);
    let mut segments = path.split('/');
    let column = segments.next().unwrap_or_default().replace("~1", "/").replace("~0", "~");
    let rest: Vec<&str> = segments.collect();
    let quoted = format!("\"{}\"", quote_ident(&column));
    if rest.is_empty() {
        return quoted;
    }
    let json_path: String = rest.iter().fold(String::from("$"), |mut acc, seg| {
        if seg.chars().all(|c| c.is_ascii_digit()) && !seg.is_empty() {
            let _ = write!(acc, "[{seg}]");
        } else {
            let _ = write!(acc, ".{}", seg.replace('\'', "''"));
        }
        acc
    });
    format!("json_extract({quoted}, '{json_path}')")
}

fn quote_ident(name: &str) -> String {
    name.replace('"', "\"\"")
}
