//! Component def registry.
//!
//! Each entity set owns a [`DefRegistry`] mapping ids, urls and content
//! hashes to [`ComponentDef`]s.
//!
//! Registration rules:
//!
//! - A spec whose hash is already registered is a no-op returning the existing def.
//! - A known url with a new shape is registered under a fresh id; url lookups
//!   resolve to the newest def, while components keep the def they were stored with.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::bitfield::BitField;
use crate::component_def::{ComponentDef, ComponentDefId, DefSpec};
use crate::entity::NameIndex;
use crate::error::Result;

/// A reference to a def by id, url or content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DefRef {
    Id(ComponentDefId),
    Url(String),
    Hash(u64),
}

impl DefRef {
    /// Strings are urls; integers that fit a def id are ids, larger ones hashes.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(url) => Some(Self::Url(url.clone())),
            Value::Number(n) => {
                let n = n.as_u64()?;
                Some(match ComponentDefId::try_from(n) {
                    Ok(id) => Self::Id(id),
                    Err(_) => Self::Hash(n),
                })
            }
            _ => None,
        }
    }
}

impl From<&str> for DefRef {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for DefRef {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<ComponentDefId> for DefRef {
    fn from(id: ComponentDefId) -> Self {
        Self::Id(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefRegistry {
    defs: Vec<ComponentDef>,
    by_url: HashMap<String, ComponentDefId>,
    by_hash: HashMap<u64, ComponentDefId>,
}

impl DefRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a def, or returns the already registered def with the same hash.
    pub fn register(&mut self, spec: DefSpec) -> Result<ComponentDef> {
        let next_id = self.defs.len() as ComponentDefId + 1;
        let def = ComponentDef::from_spec(next_id, spec)?;
        if let Some(existing) = self.get_by_hash(def.hash) {
            return Ok(existing.clone());
        }
        debug!(id = def.id, url = %def.url, hash = def.hash, "registered component def");
        self.by_url.insert(def.url.clone(), def.id);
        self.by_hash.insert(def.hash, def.id);
        self.defs.push(def.clone());
        Ok(def)
    }

    #[must_use]
    pub fn get(&self, id: ComponentDefId) -> Option<&ComponentDef> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.defs.get(index)
    }

    #[must_use]
    pub fn get_by_url(&self, url: &str) -> Option<&ComponentDef> {
        self.by_url.get(url).and_then(|id| self.get(*id))
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: u64) -> Option<&ComponentDef> {
        self.by_hash.get(&hash).and_then(|id| self.get(*id))
    }

    #[must_use]
    pub fn resolve(&self, def: &DefRef) -> Option<&ComponentDef> {
        match def {
            DefRef::Id(id) => self.get(*id),
            DefRef::Url(url) => self.get_by_url(url),
            DefRef::Hash(hash) => self.get_by_hash(*hash),
        }
    }

    /// Registered defs in id order.
    #[must_use]
    pub fn defs(&self) -> &[ComponentDef] {
        &self.defs
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Builds a bit set from def references. Unknown references are dropped.
    #[must_use]
    pub fn resolve_def_ids(&self, defs: &[DefRef]) -> BitField {
        defs.iter().filter_map(|d| self.resolve(d)).map(|d| d.id).collect()
    }

    /// Splits a `url#key` locator into the def's bit set and the key.
    ///
    /// An unknown url yields an empty bit set.
    #[must_use]
    pub fn resolve_attr(&self, locator: &str) -> (BitField, Option<String>) {
        let (url, key) = match locator.split_once('#') {
            Some((url, key)) => (url, Some(key.to_string())),
            None => (locator, None),
        };
        let bf = self
            .get_by_url(url)
            .map(|d| BitField::from_values([d.id]))
            .unwrap_or_default();
        (bf, key)
    }

    /// Def names mapped to their newest def id.
    #[must_use]
    pub fn name_index(&self) -> NameIndex {
        let index: BTreeMap<String, ComponentDefId> =
            self.defs.iter().map(|d| (d.name.clone(), d.id)).collect();
        Arc::new(index)
    }
}
