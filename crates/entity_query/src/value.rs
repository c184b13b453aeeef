//! Tagged values held by the query stack.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use entity_store::{BitField, CompareOp, Component, ComponentDef, Entity, EntitySetRef};
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Result, StackError};

/// The type tag of a [`StackValue`], used in word signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SType {
    /// Matches any value in a signature.
    Any,
    Value,
    List,
    Map,
    Entity,
    Component,
    ComponentDef,
    EntitySet,
    BitField,
    Regex,
    DateTime,
    Filter,
    ComponentAttr,
    Word,
}

impl SType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Value => "value",
            Self::List => "list",
            Self::Map => "map",
            Self::Entity => "entity",
            Self::Component => "component",
            Self::ComponentDef => "def",
            Self::EntitySet => "es",
            Self::BitField => "bitfield",
            Self::Regex => "regex",
            Self::DateTime => "datetime",
            Self::Filter => "filter",
            Self::ComponentAttr => "attr",
            Self::Word => "word",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "any" => Self::Any,
            "value" => Self::Value,
            "list" => Self::List,
            "map" => Self::Map,
            "entity" => Self::Entity,
            "component" => Self::Component,
            "def" => Self::ComponentDef,
            "es" => Self::EntitySet,
            "bitfield" => Self::BitField,
            "regex" => Self::Regex,
            "datetime" => Self::DateTime,
            "filter" => Self::Filter,
            "attr" => Self::ComponentAttr,
            "word" => Self::Word,
            _ => return None,
        };
        Some(ty)
    }

    /// Whether a signature slot of this type accepts a value tagged `other`.
    #[must_use]
    pub fn accepts(self, other: SType) -> bool {
        self == Self::Any || self == other
    }
}

impl fmt::Display for SType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `{def, key}` component-attribute locator built by `!ca`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentAttr {
    pub bit_field: BitField,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    And,
    Or,
    Compare(CompareOp),
}

impl FilterOp {
    #[must_use]
    pub fn from_word(word: &str) -> Option<Self> {
        match word {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            other => CompareOp::from_word(other).map(Self::Compare),
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => f.write_str("and"),
            Self::Or => f.write_str("or"),
            Self::Compare(op) => f.write_str(op.as_str()),
        }
    }
}

/// An unlowered `[op, left, right]` filter node.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub op: FilterOp,
    pub left: StackValue,
    pub right: StackValue,
}

impl Filter {
    #[must_use]
    pub fn new(op: FilterOp, left: StackValue, right: StackValue) -> Self {
        Self { op, left, right }
    }
}

#[derive(Clone)]
pub enum StackValue {
    Value(Value),
    List(Vec<StackValue>),
    Map(BTreeMap<String, StackValue>),
    Entity(Entity),
    Component(Component),
    ComponentDef(ComponentDef),
    EntitySet(EntitySetRef),
    BitField(BitField),
    Regex(Regex),
    DateTime(DateTime<Utc>),
    Filter(Box<Filter>),
    ComponentAttr(ComponentAttr),
    Word(String),
}

impl StackValue {
    #[must_use]
    pub fn stype(&self) -> SType {
        match self {
            Self::Value(_) => SType::Value,
            Self::List(_) => SType::List,
            Self::Map(_) => SType::Map,
            Self::Entity(_) => SType::Entity,
            Self::Component(_) => SType::Component,
            Self::ComponentDef(_) => SType::ComponentDef,
            Self::EntitySet(_) => SType::EntitySet,
            Self::BitField(_) => SType::BitField,
            Self::Regex(_) => SType::Regex,
            Self::DateTime(_) => SType::DateTime,
            Self::Filter(_) => SType::Filter,
            Self::ComponentAttr(_) => SType::ComponentAttr,
            Self::Word(_) => SType::Word,
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::Value(Value::String(s.into()))
    }

    /// Arrays become lists and objects become maps, recursively.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(obj) => Self::Map(obj.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect()),
            other => Self::Value(other),
        }
    }

    /// A JSON rendering. Entities render as their id, entity sets as their url.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>()),
            Self::Entity(e) => Value::from(e.id),
            Self::Component(c) => c.to_value(),
            Self::ComponentDef(d) => d.to_short_value(),
            Self::EntitySet(es) => es.try_read().map_or(Value::Null, |es| Value::String(es.url())),
            Self::BitField(bf) if bf.is_all() => Value::String("all".into()),
            Self::BitField(bf) => Value::from(bf.to_values()),
            Self::Regex(re) => Value::String(format!("~r/{}/", re.as_str())),
            Self::DateTime(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Filter(f) => Value::Array(vec![Value::String(f.op.to_string()), f.left.to_json(), f.right.to_json()]),
            Self::ComponentAttr(attr) => Value::Array(vec![StackValue::BitField(attr.bit_field.clone()).to_json(), Value::String(attr.key.clone())]),
            Self::Word(w) => Value::String(w.clone()),
        }
    }

    /// Falsy: `null`, `false`, `0`, `""` and empty lists or maps.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Value(Value::Null | Value::Bool(false)) => false,
            Self::Value(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
            Self::Value(Value::String(s)) => !s.is_empty(),
            Self::List(items) => !items.is_empty(),
            Self::Map(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// The text of a string value or a word.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(Value::String(s)) | Self::Word(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Value(v) => v.as_i64(),
            _ => None,
        }
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_list(self) -> Result<Vec<StackValue>> {
        match self {
            Self::List(items) => Ok(items),
            other => Err(other.unexpected("list")),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            Self::Value(Value::String(s)) | Self::Word(s) => Ok(s),
            other => Err(other.unexpected("string")),
        }
    }

    pub fn into_entity_set(self) -> Result<EntitySetRef> {
        match self {
            Self::EntitySet(es) => Ok(es),
            other => Err(other.unexpected("entity set")),
        }
    }

    pub fn into_bit_field(self) -> Result<BitField> {
        match self {
            Self::BitField(bf) => Ok(bf),
            other => Err(other.unexpected("bitfield")),
        }
    }

    pub fn into_component_attr(self) -> Result<ComponentAttr> {
        match self {
            Self::ComponentAttr(attr) => Ok(attr),
            other => Err(other.unexpected("component attribute")),
        }
    }

    fn unexpected(&self, expected: &str) -> StackError {
        StackError::invalid(format!("expected {expected}, found {}", self.stype()))
    }
}

impl From<Value> for StackValue {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Entity> for StackValue {
    fn from(e: Entity) -> Self {
        Self::Entity(e)
    }
}

impl From<Component> for StackValue {
    fn from(c: Component) -> Self {
        Self::Component(c)
    }
}

impl From<ComponentDef> for StackValue {
    fn from(d: ComponentDef) -> Self {
        Self::ComponentDef(d)
    }
}

impl From<BitField> for StackValue {
    fn from(bf: BitField) -> Self {
        Self::BitField(bf)
    }
}

impl From<Filter> for StackValue {
    fn from(f: Filter) -> Self {
        Self::Filter(Box::new(f))
    }
}

impl PartialEq for StackValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(Value::Number(a)), Self::Value(Value::Number(b))) => a.as_f64() == b.as_f64(),
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => a == b,
            (Self::Component(a), Self::Component(b)) => a == b,
            (Self::ComponentDef(a), Self::ComponentDef(b)) => a == b,
            (Self::EntitySet(a), Self::EntitySet(b)) => Arc::ptr_eq(a, b),
            (Self::BitField(a), Self::BitField(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Filter(a), Self::Filter(b)) => a == b,
            (Self::ComponentAttr(a), Self::ComponentAttr(b)) => a == b,
            (Self::Word(a), Self::Word(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for StackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "Value({v})"),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Entity(e) => f.debug_tuple("Entity").field(e).finish(),
            Self::Component(c) => f.debug_tuple("Component").field(c).finish(),
            Self::ComponentDef(d) => f.debug_tuple("ComponentDef").field(d).finish(),
            Self::EntitySet(_) => f.write_str("EntitySet(..)"),
            Self::BitField(bf) => write!(f, "{bf}"),
            Self::Regex(re) => write!(f, "Regex({})", re.as_str()),
            Self::DateTime(dt) => write!(f, "DateTime({dt})"),
            Self::Filter(filter) => f.debug_tuple("Filter").field(filter).finish(),
            Self::ComponentAttr(attr) => f.debug_tuple("ComponentAttr").field(attr).finish(),
            Self::Word(w) => write!(f, "Word({w})"),
        }
    }
}

impl fmt::Display for StackValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(Value::String(s)) | Self::Word(s) => f.write_str(s),
            Self::Entity(e) => write!(f, "{e}"),
            Self::Component(c) => write!(f, "{c}"),
            Self::ComponentDef(d) => write!(f, "{d}"),
            Self::BitField(bf) => write!(f, "{bf}"),
            Self::Regex(re) => write!(f, "~r/{}/", re.as_str()),
            Self::DateTime(dt) => write!(f, "~d/{}/", dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Filter(filter) => write!(f, "[{} {} {}]", filter.op, filter.left, filter.right),
            other => write!(f, "{}", other.to_json()),
        }
    }
}
