//! Component definitions.
//!
//! A [`ComponentDef`] describes the shape of a component: a url such as
//! `/component/position`, a display name and a list of typed properties.
//!
//! ## Identity
//!
//! Every def has two identities:
//!
//! - `id`: a 1-based index assigned by the registry of one entity set.
//! - `hash`: a content hash over the normalised url and properties, stable
//!   across entity sets and processes. Two defs with equal hashes are the same
//!   def, whatever their ids.
//!
//! The hash is FNV-1a 64-bit over the MessagePack encoding of the normalised
//! `(url, properties)` pair. Property fields left at their defaults are
//! omitted from the encoding, so `"x"` and `{ "name": "x" }` hash identically.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// 1-based def identifier, local to one entity set. `0` means unassigned.
pub type ComponentDefId = u32;

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a 64-bit over raw bytes.
#[must_use]
pub const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Entity,
    List,
    Map,
    DateTime,
    Json,
}

impl PropertyType {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "string" => Self::String,
            "number" => Self::Number,
            "integer" => Self::Integer,
            "boolean" => Self::Boolean,
            "entity" => Self::Entity,
            "list" => Self::List,
            "map" => Self::Map,
            "datetime" => Self::DateTime,
            "json" => Self::Json,
            _ => return None,
        };
        Some(ty)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Entity => "entity",
            Self::List => "list",
            Self::Map => "map",
            Self::DateTime => "datetime",
            Self::Json => "json",
        }
    }

    /// The value a property of this type takes when none is supplied.
    #[must_use]
    pub fn default_value(self) -> Option<Value> {
        match self {
            Self::Json | Self::Map => Some(Value::Object(Map::new())),
            Self::List => Some(Value::Array(Vec::new())),
            Self::Integer | Self::Entity => Some(Value::from(0)),
            Self::Boolean => Some(Value::Bool(false)),
            Self::String | Self::Number | Self::DateTime => None,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed property of a [`ComponentDef`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDefProperty {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: PropertyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_persist() -> bool {
    true
}

impl ComponentDefProperty {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: PropertyType::String,
            default: None,
            optional: false,
            persist: true,
        }
    }

    #[must_use]
    pub fn with_type(mut self, ty: PropertyType) -> Self {
        self.ty = ty;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Marks the property as not persisted by storage backends.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.persist = false;
        self
    }

    /// Returns `true` if every field other than the name is at its default.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.ty == PropertyType::String && self.default.is_none() && !self.optional && self.persist
    }

    /// Parse a property from either a bare name or an object.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self::new(name.as_str())),
            Value::Object(obj) => {
                let name = obj
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::InvalidDef(format!("property without name: {value}")))?;
                let mut prop = Self::new(name);
                if let Some(ty) = obj.get("type").and_then(Value::as_str) {
                    prop.ty = PropertyType::parse(ty)
                        .ok_or_else(|| StoreError::InvalidDef(format!("unknown property type '{ty}'")))?;
                }
                if let Some(default) = obj.get("default") {
                    prop.default = Some(default.clone());
                }
                if let Some(optional) = obj.get("optional").and_then(Value::as_bool) {
                    prop.optional = optional;
                }
                if let Some(persist) = obj.get("persist").and_then(Value::as_bool) {
                    prop.persist = persist;
                }
                Ok(prop)
            }
            other => Err(StoreError::InvalidDef(format!("invalid property: {other}"))),
        }
    }

    /// Renders the short form: the bare name when plain, else an object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        if self.is_plain() {
            return Value::String(self.name.clone());
        }
        let mut obj = Map::new();
        obj.insert("name".into(), Value::String(self.name.clone()));
        if self.ty != PropertyType::String {
            obj.insert("type".into(), Value::String(self.ty.as_str().into()));
        }
        if let Some(default) = &self.default {
            obj.insert("default".into(), default.clone());
        }
        if self.optional {
            obj.insert("optional".into(), Value::Bool(true));
        }
        if !self.persist {
            obj.insert("persist".into(), Value::Bool(false));
        }
        Value::Object(obj)
    }
}

impl From<&str> for ComponentDefProperty {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Registration input for a [`ComponentDef`], before an id is assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefSpec {
    pub url: String,
    pub name: Option<String>,
    pub properties: Vec<ComponentDefProperty>,
}

impl DefSpec {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, property: impl Into<ComponentDefProperty>) -> Self {
        self.properties.push(property.into());
        self
    }

    #[must_use]
    pub fn with_properties<I, P>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ComponentDefProperty>,
    {
        self.properties.extend(properties.into_iter().map(Into::into));
        self
    }

    /// Accepts a url string, a `[url, properties]` array or an
    /// `{ url, name, properties }` object (`uri` is accepted for `url`).
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(url) => Ok(Self::new(url.as_str())),
            Value::Array(items) => {
                let url = items
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::InvalidDef(format!("missing url: {value}")))?;
                let mut spec = Self::new(url);
                if let Some(props) = items.get(1) {
                    spec.properties = parse_properties(props)?;
                }
                Ok(spec)
            }
            Value::Object(obj) => {
                let url = obj
                    .get("url")
                    .or_else(|| obj.get("uri"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::InvalidDef(format!("missing url: {value}")))?;
                let mut spec = Self::new(url);
                spec.name = obj.get("name").and_then(Value::as_str).map(str::to_string);
                if let Some(props) = obj.get("properties") {
                    spec.properties = parse_properties(props)?;
                }
                Ok(spec)
            }
            other => Err(StoreError::InvalidDef(format!("unsupported def spec: {other}"))),
        }
    }
}

impl From<&str> for DefSpec {
    fn from(url: &str) -> Self {
        Self::new(url)
    }
}

impl From<&ComponentDef> for DefSpec {
    fn from(def: &ComponentDef) -> Self {
        Self {
            url: def.url.clone(),
            name: Some(def.name.clone()),
            properties: def.properties.clone(),
        }
    }
}

fn parse_properties(value: &Value) -> Result<Vec<ComponentDefProperty>> {
    match value {
        Value::Array(items) => items.iter().map(ComponentDefProperty::from_value).collect(),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![ComponentDefProperty::from_value(single)?]),
    }
}

/// A registered component definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDef {
    pub id: ComponentDefId,
    pub url: String,
    pub name: String,
    pub properties: Vec<ComponentDefProperty>,
    pub hash: u64,
}

#[derive(Serialize)]
struct HashInput<'a> {
    url: &'a str,
    properties: Vec<HashProperty<'a>>,
}

#[derive(Serialize)]
struct HashProperty<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ty: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    optional: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    persist: Option<bool>,
}

impl ComponentDef {
    /// Validate a spec and build a def with the given id.
    pub fn from_spec(id: ComponentDefId, spec: DefSpec) -> Result<Self> {
        if spec.url.trim().is_empty() {
            return Err(StoreError::InvalidDef("url must not be empty".into()));
        }
        for (i, prop) in spec.properties.iter().enumerate() {
            if prop.name.is_empty() {
                return Err(StoreError::InvalidDef(format!("{}: property {i} has no name", spec.url)));
            }
            if spec.properties[..i].iter().any(|p| p.name == prop.name) {
                return Err(StoreError::InvalidDef(format!(
                    "{}: duplicate property '{}'",
                    spec.url, prop.name
                )));
            }
        }
        let hash = Self::content_hash(&spec.url, &spec.properties)?;
        let name = spec.name.unwrap_or_else(|| name_from_url(&spec.url));
        Ok(Self {
            id,
            url: spec.url,
            name,
            properties: spec.properties,
            hash,
        })
    }

    /// Content hash over the normalised url and properties.
    pub fn content_hash(url: &str, properties: &[ComponentDefProperty]) -> Result<u64> {
        let input = HashInput {
            url,
            properties: properties
                .iter()
                .map(|p| HashProperty {
                    name: &p.name,
                    ty: (p.ty != PropertyType::String).then(|| p.ty.as_str()),
                    default: p.default.as_ref(),
                    optional: p.optional.then_some(true),
                    persist: (!p.persist).then_some(false),
                })
                .collect(),
        };
        let bytes = rmp_serde::to_vec_named(&input)?;
        Ok(fnv1a_64(&bytes))
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&ComponentDefProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// `[url, [properties]]`
    #[must_use]
    pub fn to_short_value(&self) -> Value {
        let props = self.properties.iter().map(ComponentDefProperty::to_value).collect();
        Value::Array(vec![Value::String(self.url.clone()), Value::Array(props)])
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("@d".into(), Value::from(self.id));
        obj.insert("url".into(), Value::String(self.url.clone()));
        obj.insert("name".into(), Value::String(self.name.clone()));
        if !self.properties.is_empty() {
            let props = self.properties.iter().map(ComponentDefProperty::to_value).collect();
            obj.insert("properties".into(), Value::Array(props));
        }
        Value::Object(obj)
    }
}

impl fmt::Display for ComponentDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentDef({}, {})", self.id, self.url)
    }
}

/// Derives a display name from the last url segment:
/// `/component/channel_member` becomes `ChannelMember`.
#[must_use]
pub fn name_from_url(url: &str) -> String {
    let last = url.rsplit('/').find(|s| !s.is_empty()).unwrap_or(url);
    last.split(|c: char| c == '_' || c == '-' || c == '.')
        .filter(|s| !s.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fnv1a_known_vector() {
        // FNV-1a 64-bit of the empty input is the offset basis itself.
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_ne!(fnv1a_64(b"a"), fnv1a_64(b"b"));
    }

    #[test]
    fn test_name_from_url() {
        assert_eq!(name_from_url("/component/channel_member"), "ChannelMember");
        assert_eq!(name_from_url("/component/title"), "Title");
        assert_eq!(name_from_url("/component/meta/"), "Meta");
    }

    #[test]
    fn test_spec_forms_are_equivalent() {
        let from_str = DefSpec::from_value(&json!("/component/tag")).unwrap();
        let from_arr = DefSpec::from_value(&json!(["/component/tag"])).unwrap();
        let from_obj = DefSpec::from_value(&json!({ "uri": "/component/tag" })).unwrap();
        assert_eq!(from_str, from_arr);
        assert_eq!(from_str, from_obj);
    }

    #[test]
    fn test_property_forms() {
        let spec = DefSpec::from_value(&json!({
            "url": "/component/channel",
            "properties": ["name", { "name": "isOpen", "type": "boolean", "default": true }]
        }))
        .unwrap();
        assert_eq!(spec.properties.len(), 2);
        assert_eq!(spec.properties[1].ty, PropertyType::Boolean);
        assert_eq!(spec.properties[1].default, Some(json!(true)));
        assert!(spec.properties[1].persist);
    }

    #[test]
    fn test_unknown_property_type_is_rejected() {
        let err = DefSpec::from_value(&json!(["/component/x", [{ "name": "a", "type": "blob" }]]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDef(_)));
    }

    #[test]
    fn test_hash_ignores_id_and_name_and_default_fields() {
        let a = ComponentDef::from_spec(1, DefSpec::new("/component/pos").with_properties(["x", "y"])).unwrap();
        let b = ComponentDef::from_spec(
            7,
            DefSpec::from_value(&json!({
                "url": "/component/pos",
                "name": "Where",
                "properties": [{ "name": "x", "type": "string" }, { "name": "y", "persist": true }]
            }))
            .unwrap(),
        )
        .unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_hash_tracks_shape() {
        let a = ComponentDef::from_spec(1, DefSpec::new("/component/pos").with_properties(["x"])).unwrap();
        let b = ComponentDef::from_spec(1, DefSpec::new("/component/pos").with_properties(["x", "y"])).unwrap();
        let c = ComponentDef::from_spec(
            1,
            DefSpec::new("/component/pos").with_property(ComponentDefProperty::new("x").with_type(PropertyType::Integer)),
        )
        .unwrap();
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_invalid_defs() {
        assert!(ComponentDef::from_spec(1, DefSpec::new("")).is_err());
        assert!(ComponentDef::from_spec(1, DefSpec::new("/c").with_properties(["a", "a"])).is_err());
    }

    #[test]
    fn test_short_value() {
        let def = ComponentDef::from_spec(
            3,
            DefSpec::new("/component/status")
                .with_property("status")
                .with_property(ComponentDefProperty::new("since").with_type(PropertyType::DateTime)),
        )
        .unwrap();
        assert_eq!(
            def.to_short_value(),
            json!(["/component/status", ["status", { "name": "since", "type": "datetime" }]])
        );
    }

    #[test]
    fn test_type_defaults() {
        assert_eq!(PropertyType::Integer.default_value(), Some(json!(0)));
        assert_eq!(PropertyType::Json.default_value(), Some(json!({})));
        assert_eq!(PropertyType::String.default_value(), None);
    }
}
