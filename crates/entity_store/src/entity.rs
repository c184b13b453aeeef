//! Entities: an id plus the components attached to it.
//!
//! An [`Entity`] carries a [`BitField`] of the def ids it holds and, when
//! populated, the components themselves keyed by def id. Entities created
//! through an entity set also carry a name index built from the registered
//! defs, so components can be reached by def name (`"Title"`) as well as by id.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bitfield::BitField;
use crate::component::Component;
use crate::component_def::ComponentDefId;
use crate::error::{Result, StoreError};

/// Entity identifier. `0` marks a transient entity that has not been stored.
pub type EntityId = u64;

/// Maps def names to def ids.
pub type NameIndex = Arc<BTreeMap<String, ComponentDefId>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub bit_field: BitField,
    components: BTreeMap<ComponentDefId, Component>,
    #[serde(skip)]
    names: NameIndex,
}

impl Entity {
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_bit_field(mut self, bit_field: BitField) -> Self {
        self.bit_field = bit_field;
        self
    }

    #[must_use]
    pub fn with_names(mut self, names: NameIndex) -> Self {
        self.names = names;
        self
    }

    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.add_component(component);
        self
    }

    /// Returns `true` if this entity has been assigned a (non-zero) id.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.id != 0
    }

    /// Changes the entity id, retagging every attached component.
    pub fn set_id(&mut self, id: EntityId) {
        self.id = id;
        for com in self.components.values_mut() {
            com.entity_id = id;
        }
    }

    /// Attaches a component, replacing any existing one of the same def.
    ///
    /// The component is retagged with this entity's id.
    pub fn add_component(&mut self, mut component: Component) -> Option<Component> {
        component.entity_id = self.id;
        self.bit_field.set(component.def_id, true);
        self.components.insert(component.def_id, component)
    }

    pub fn remove_component(&mut self, def_id: ComponentDefId) -> Option<Component> {
        self.bit_field.set(def_id, false);
        self.components.remove(&def_id)
    }

    #[must_use]
    pub fn get_component(&self, def_id: ComponentDefId) -> Option<&Component> {
        self.components.get(&def_id)
    }

    pub fn get_component_mut(&mut self, def_id: ComponentDefId) -> Option<&mut Component> {
        self.components.get_mut(&def_id)
    }

    #[must_use]
    pub fn has_component(&self, def_id: ComponentDefId) -> bool {
        self.bit_field.get(def_id)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    #[must_use]
    pub fn into_components(self) -> Vec<Component> {
        self.components.into_values().collect()
    }

    /// Number of defs this entity carries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bit_field.count()
    }

    /// Returns `true` if the components themselves are attached.
    #[must_use]
    pub fn is_populated(&self) -> bool {
        self.components.len() == self.bit_field.count()
    }

    /// Def names this entity can resolve, in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    #[must_use]
    pub fn get_named(&self, name: &str) -> Option<&Component> {
        let did = self.names.get(name)?;
        self.components.get(did)
    }

    /// Attaches (or replaces) the component of the named def.
    pub fn set_named(&mut self, name: &str, attributes: Map<String, Value>) -> Result<&Component> {
        let did = *self
            .names
            .get(name)
            .ok_or_else(|| StoreError::DefNotFound(name.to_string()))?;
        self.add_component(Component::new(did).with_attributes(attributes));
        self.components
            .get(&did)
            .ok_or_else(|| StoreError::DefNotFound(name.to_string()))
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.bit_field == other.bit_field && self.components == other.components
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}, {:?})", self.id, self.bit_field.to_values())
    }
}
