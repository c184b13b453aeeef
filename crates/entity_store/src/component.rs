//! Components: attribute maps attached to an entity under a def.
//!
//! A [`Component`] is identified by the pair `(entity id, def id)`, see
//! [`ComponentId`]. Attributes are a dynamic `serde_json` map; the reserved
//! keys `@e` and `@d` carry the entity and def ids in the JSON form and never
//! appear in [`Component::attributes`].
//!
//! An [`OrphanComponent`] names its def by url instead of id. It is resolved
//! against a registry before it can be stored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::component_def::{ComponentDef, ComponentDefId};
use crate::entity::EntityId;
use crate::error::{Result, StoreError};

/// Reserved attribute key carrying the entity id.
pub const ENTITY_KEY: &str = "@e";

/// Reserved attribute key carrying the def id (or url, for orphans).
pub const DEF_KEY: &str = "@d";

/// Canonical component identifier, rendered as `[eid,did]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId {
    pub entity: EntityId,
    pub def: ComponentDefId,
}

impl ComponentId {
    #[must_use]
    pub const fn new(entity: EntityId, def: ComponentDefId) -> Self {
        Self { entity, def }
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.entity, self.def)
    }
}

impl FromStr for ComponentId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StoreError::InvalidComponentId(s.to_string());
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .ok_or_else(invalid)?;
        let (entity, def) = inner.split_once(',').ok_or_else(invalid)?;
        Ok(Self {
            entity: entity.trim().parse().map_err(|_| invalid())?,
            def: def.trim().parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub entity_id: EntityId,
    pub def_id: ComponentDefId,
    pub attributes: Map<String, Value>,
}

impl Component {
    #[must_use]
    pub fn new(def_id: ComponentDefId) -> Self {
        Self {
            entity_id: 0,
            def_id,
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = entity_id;
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes.extend(strip_reserved(attributes));
        self
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        ComponentId::new(self.entity_id, self.def_id)
    }

    /// Reads an attribute by plain name or by JSON pointer (`/a/b`).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        pointer(&self.attributes, key)
    }

    /// Parses the `{ "@e": eid, "@d": did, ...attributes }` form.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::InvalidComponent(format!("expected object: {value}")))?;
        let def_id = obj
            .get(DEF_KEY)
            .and_then(Value::as_u64)
            .and_then(|d| ComponentDefId::try_from(d).ok())
            .ok_or_else(|| StoreError::InvalidComponent(format!("missing def id: {value}")))?;
        Ok(Self {
            entity_id: entity_id_of(obj)?,
            def_id,
            attributes: strip_reserved(obj.clone()),
        })
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(ENTITY_KEY.into(), Value::from(self.entity_id));
        obj.insert(DEF_KEY.into(), Value::from(self.def_id));
        obj.extend(self.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(obj)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({}, {})", self.id(), Value::Object(self.attributes.clone()))
    }
}

/// A component whose def is referenced by url rather than id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrphanComponent {
    pub entity_id: EntityId,
    pub def_url: String,
    pub attributes: Map<String, Value>,
}

impl OrphanComponent {
    #[must_use]
    pub fn new(def_url: impl Into<String>) -> Self {
        Self {
            entity_id: 0,
            def_url: def_url.into(),
            attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = entity_id;
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Parses `{ "@d": "/component/url", ...attributes }`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::InvalidComponent(format!("expected object: {value}")))?;
        let def_url = obj
            .get(DEF_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::InvalidComponent(format!("missing def url: {value}")))?;
        Ok(Self {
            entity_id: entity_id_of(obj)?,
            def_url: def_url.to_string(),
            attributes: strip_reserved(obj.clone()),
        })
    }

    /// Binds the orphan to a resolved def.
    #[must_use]
    pub fn resolve(self, def: &ComponentDef) -> Component {
        Component {
            entity_id: self.entity_id,
            def_id: def.id,
            attributes: self.attributes,
        }
    }
}

fn entity_id_of(obj: &Map<String, Value>) -> Result<EntityId> {
    match obj.get(ENTITY_KEY) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| StoreError::InvalidComponent(format!("invalid entity id: {v}"))),
    }
}

fn strip_reserved(mut attributes: Map<String, Value>) -> Map<String, Value> {
    attributes.remove(ENTITY_KEY);
    attributes.remove(DEF_KEY);
    attributes
}

/// Resolves a plain key or a JSON pointer against an attribute map.
pub(crate) fn pointer<'a>(attributes: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    let Some(path) = key.strip_prefix('/') else {
        return attributes.get(key);
    };
    let (head, rest) = match path.find('/') {
        Some(i) => (&path[..i], &path[i..]),
        None => (path, ""),
    };
    let head = head.replace("~1", "/").replace("~0", "~");
    let value = attributes.get(&head)?;
    if rest.is_empty() {
        Some(value)
    } else {
        value.pointer(rest)
    }
}
