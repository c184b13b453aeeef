//! In-memory entity set.
//!
//! Entities are kept as bit fields keyed by id and components in an ordered
//! map keyed by [`ComponentId`], so iteration is always in id order. Filters
//! run through the bit-vector scan in [`crate::filter::evaluate`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::component::{Component, ComponentId, pointer};
use crate::component_def::{ComponentDef, ComponentDefId, DefSpec};
use crate::config::EntitySetConfig;
use crate::entity::{Entity, EntityId};
use crate::entity_set::{BatchChanges, EntitySet};
use crate::error::{Result, StoreError};
use crate::filter::{self, FilterExpr, FilterSource};
use crate::id::EntityIdGen;
use crate::registry::DefRegistry;

pub struct MemEntitySet {
    uuid: Uuid,
    registry: DefRegistry,
    changes: BatchChanges,
    id_gen: Arc<dyn EntityIdGen>,
    entities: BTreeMap<EntityId, BitField>,
    components: BTreeMap<ComponentId, Component>,
}

impl MemEntitySet {
    #[must_use]
    pub fn new(config: EntitySetConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            registry: DefRegistry::new(),
            changes: BatchChanges::default(),
            id_gen: config.build_id_gen(),
            entities: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }

    /// An independent copy of `source` under a new uuid. Defs, entity ids and
    /// components are kept as they are; pending changes are not. The copy
    /// draws fresh ids from the source's generator.
    pub async fn copy_of(source: &dyn EntitySet) -> Result<Self> {
        let mut es = Self::new(EntitySetConfig::new().with_id_gen(Arc::clone(source.id_gen())));
        let mut def_ids = BTreeMap::new();
        for def in source.get_component_defs().await? {
            let local = es.registry.register(DefSpec::from(&def))?;
            def_ids.insert(def.id, local.id);
        }

        let mut stream = source.get_components();
        while let Some(com) = stream.next().await {
            let mut com = com?;
            com.def_id = *def_ids
                .get(&com.def_id)
                .ok_or_else(|| StoreError::DefNotFound(format!("source def {}", com.def_id)))?;
            es.insert_component(com);
        }
        drop(stream);

        es.changes.clear();
        trace!(source = %source.url(), copy = %es.url(), "copied entity set");
        Ok(es)
    }

    fn build_entity(&self, eid: EntityId, populate: bool) -> Option<Entity> {
        let bf = self.entities.get(&eid)?;
        let mut e = Entity::new(eid)
            .with_bit_field(bf.clone())
            .with_names(self.registry.name_index());
        if populate {
            for did in bf.iter() {
                if let Some(com) = self.components.get(&ComponentId::new(eid, did)) {
                    e.add_component(com.clone());
                }
            }
        }
        Some(e)
    }

    fn insert_component(&mut self, com: Component) {
        let cid = com.id();
        let eid = com.entity_id;
        let Some(bf) = self.entities.get_mut(&eid) else {
            trace!(%cid, "new entity");
            self.entities.insert(eid, BitField::from_values([com.def_id]));
            self.changes.entities.add(eid);
            self.changes.components.add(cid);
            self.components.insert(cid, com);
            return;
        };

        if !bf.get(com.def_id) {
            bf.set(com.def_id, true);
            self.changes.entities.update(eid);
            self.changes.components.add(cid);
            self.components.insert(cid, com);
            return;
        }

        let unchanged = self
            .components
            .get(&cid)
            .is_some_and(|existing| existing.attributes == com.attributes);
        if unchanged {
            // re-adding a marked component only lifts the removal mark
            if self.changes.components.removed.contains(&cid) {
                self.changes.components.add(cid);
            }
            return;
        }
        self.changes.components.update(cid);
        self.changes.entities.update(eid);
        self.components.insert(cid, com);
    }

    fn check_def(&self, def_id: ComponentDefId) -> Result<()> {
        match self.registry.get(def_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::DefNotFound(format!("id {def_id}"))),
        }
    }
}

impl Default for MemEntitySet {
    fn default() -> Self {
        Self::new(EntitySetConfig::new())
    }
}

impl fmt::Debug for MemEntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemEntitySet")
            .field("uuid", &self.uuid)
            .field("defs", &self.registry.len())
            .field("entities", &self.entities.len())
            .field("components", &self.components.len())
            .finish()
    }
}

impl FilterSource for MemEntitySet {
    fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    fn entity_bit_field(&self, eid: EntityId) -> Option<&BitField> {
        self.entities.get(&eid)
    }

    fn attribute(&self, eid: EntityId, def_id: ComponentDefId, key: &str) -> Option<&Value> {
        let com = self.components.get(&ComponentId::new(eid, def_id))?;
        pointer(&com.attributes, key)
    }
}

#[async_trait]
impl EntitySet for MemEntitySet {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn kind(&self) -> &'static str {
        "mem"
    }

    fn registry(&self) -> &DefRegistry {
        &self.registry
    }

    fn changes(&self) -> &BatchChanges {
        &self.changes
    }

    fn changes_mut(&mut self) -> &mut BatchChanges {
        &mut self.changes
    }

    fn id_gen(&self) -> &Arc<dyn EntityIdGen> {
        &self.id_gen
    }

    async fn register(&mut self, spec: DefSpec) -> Result<ComponentDef> {
        self.registry.register(spec)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.entities.len())
    }

    async fn get_entity(&self, eid: EntityId, populate: bool) -> Result<Option<Entity>> {
        Ok(self.build_entity(eid, populate))
    }

    fn get_entities(&self, populate: bool) -> BoxStream<'_, Result<Entity>> {
        let entities: Vec<Result<Entity>> = self
            .entities
            .keys()
            .filter_map(|eid| self.build_entity(*eid, populate))
            .map(Ok)
            .collect();
        stream::iter(entities).boxed()
    }

    async fn get_component(&self, id: ComponentId) -> Result<Option<Component>> {
        Ok(self.components.get(&id).cloned())
    }

    fn get_components(&self) -> BoxStream<'_, Result<Component>> {
        stream::iter(self.components.values().cloned().map(Ok)).boxed()
    }

    async fn add_components(&mut self, components: Vec<Component>) -> Result<()> {
        for com in &components {
            self.check_def(com.def_id)?;
        }

        let mut pending: Option<(EntityId, BitField)> = None;
        for mut com in components {
            if com.entity_id == 0 {
                let start_new = pending.as_ref().is_none_or(|(_, bf)| bf.get(com.def_id));
                if start_new {
                    pending = Some((self.id_gen.next_id(), BitField::new()));
                }
                if let Some((eid, bf)) = pending.as_mut() {
                    bf.set(com.def_id, true);
                    com.entity_id = *eid;
                }
            }
            self.insert_component(com);
        }
        Ok(())
    }

    async fn mark_entity_components_remove(&mut self, eids: &[EntityId]) -> Result<()> {
        for eid in eids {
            let Some(bf) = self.entities.get(eid) else {
                continue;
            };
            for did in bf.iter() {
                self.changes.components.remove(ComponentId::new(*eid, did));
            }
        }
        Ok(())
    }

    async fn mark_components_remove(&mut self, ids: &[ComponentId]) -> Result<()> {
        for id in ids {
            if self.components.contains_key(id) {
                self.changes.components.remove(*id);
            }
        }
        Ok(())
    }

    async fn apply_remove_changes(&mut self) -> Result<()> {
        let marked: Vec<ComponentId> = self.changes.components.removed.iter().copied().collect();
        for cid in marked {
            if self.components.remove(&cid).is_none() {
                continue;
            }
            let Some(bf) = self.entities.get_mut(&cid.entity) else {
                continue;
            };
            bf.set(cid.def, false);
            if bf.is_empty() {
                trace!(eid = cid.entity, "entity removed with its last component");
                self.entities.remove(&cid.entity);
                self.changes.entities.remove(cid.entity);
            } else {
                self.changes.entities.update(cid.entity);
            }
        }
        Ok(())
    }

    async fn select_entity_ids(&self, filter: &FilterExpr) -> Result<Vec<EntityId>> {
        Ok(filter::evaluate(filter, self))
    }

    async fn select_components(&self, defs: &BitField, eids: Option<&[EntityId]>) -> Result<Vec<Component>> {
        if defs.is_empty() {
            return Ok(Vec::new());
        }
        let eids: Vec<EntityId> = match eids {
            Some(ids) => ids.to_vec(),
            None => self.entities.keys().copied().collect(),
        };
        let mut out = Vec::new();
        for eid in eids {
            let Some(ebf) = self.entities.get(&eid) else {
                continue;
            };
            if !BitField::and(defs, ebf) {
                continue;
            }
            for did in ebf.iter() {
                if defs.is_all() || defs.get(did) {
                    if let Some(com) = self.components.get(&ComponentId::new(eid, did)) {
                        out.push(com.clone());
                    }
                }
            }
        }
        Ok(out)
    }
}
