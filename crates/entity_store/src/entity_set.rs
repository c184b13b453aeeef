//! The entity set contract.
//!
//! An [`EntitySet`] stores entities and their components and owns the def
//! registry, the per-batch change sets and an id generator. Backends
//! implement the storage primitives. The orchestration is provided on top of
//! them: [`EntitySet::add`], the removal operations and the `create_*`
//! helpers.
//!
//! ## Batches
//!
//! Every mutating call is one batch. Unless [`AddOptions::retain`] is set,
//! the change sets are cleared first. Removals use a mark-then-apply
//! protocol: components are first marked in the component change set,
//! re-adding a marked component turns the mark into an update, and
//! [`EntitySet::apply_remove_changes`] deletes whatever is still marked.
//! An entity left without components is deleted with its last component.
//!
//! ## Foreign entity sets
//!
//! Adding another entity set reconciles defs by content hash before any
//! component moves:
//!
//! 1. each source def is registered locally (or matched by hash), building an
//!    id remap;
//! 2. every source component is rewritten to the local def id, and each
//!    source entity is retagged with one fresh local id;
//! 3. the rewritten components are inserted as one batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::bitfield::BitField;
use crate::change_set::{ChangeSet, ChangeSetOp};
use crate::component::{Component, ComponentId, ENTITY_KEY, OrphanComponent};
use crate::component_def::{ComponentDef, DefSpec};
use crate::entity::{Entity, EntityId};
use crate::error::{Result, StoreError};
use crate::filter::FilterExpr;
use crate::id::EntityIdGen;
use crate::registry::{DefRef, DefRegistry};

/// A shared, lockable handle to any entity set.
pub type EntitySetRef = Arc<RwLock<dyn EntitySet>>;

/// Wraps an entity set into a shared handle.
pub fn shared<E: EntitySet + 'static>(es: E) -> EntitySetRef {
    Arc::new(RwLock::new(es))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Keep the change sets of earlier batches instead of clearing them.
    pub retain: bool,
}

impl AddOptions {
    #[must_use]
    pub const fn retained() -> Self {
        Self { retain: true }
    }
}

/// Anything [`EntitySet::add`] accepts.
pub enum AddItem {
    Component(Component),
    Components(Vec<Component>),
    Orphan(OrphanComponent),
    Entity(Entity),
    Entities(Vec<Entity>),
    /// A mixed list; entities are added before loose components.
    List(Vec<AddItem>),
    EntitySet(EntitySetRef),
}

impl fmt::Debug for AddItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Component(c) => f.debug_tuple("Component").field(c).finish(),
            Self::Components(c) => f.debug_tuple("Components").field(c).finish(),
            Self::Orphan(o) => f.debug_tuple("Orphan").field(o).finish(),
            Self::Entity(e) => f.debug_tuple("Entity").field(e).finish(),
            Self::Entities(e) => f.debug_tuple("Entities").field(e).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::EntitySet(_) => f.write_str("EntitySet(..)"),
        }
    }
}

impl From<Component> for AddItem {
    fn from(c: Component) -> Self {
        Self::Component(c)
    }
}

impl From<Vec<Component>> for AddItem {
    fn from(c: Vec<Component>) -> Self {
        Self::Components(c)
    }
}

impl From<OrphanComponent> for AddItem {
    fn from(o: OrphanComponent) -> Self {
        Self::Orphan(o)
    }
}

impl From<Entity> for AddItem {
    fn from(e: Entity) -> Self {
        Self::Entity(e)
    }
}

impl From<Vec<Entity>> for AddItem {
    fn from(e: Vec<Entity>) -> Self {
        Self::Entities(e)
    }
}

impl From<EntitySetRef> for AddItem {
    fn from(es: EntitySetRef) -> Self {
        Self::EntitySet(es)
    }
}

/// Entity- and component-level changes of the current batch.
#[derive(Debug, Clone, Default)]
pub struct BatchChanges {
    pub entities: ChangeSet<EntityId>,
    pub components: ChangeSet<ComponentId>,
}

impl BatchChanges {
    pub fn clear(&mut self) {
        self.entities.clear();
        self.components.clear();
    }
}

#[async_trait]
pub trait EntitySet: Send + Sync {
    // -- State owned by every backend --

    fn uuid(&self) -> Uuid;

    /// Short backend name used in [`EntitySet::url`], e.g. `"mem"`.
    fn kind(&self) -> &'static str;

    fn registry(&self) -> &DefRegistry;

    fn changes(&self) -> &BatchChanges;

    fn changes_mut(&mut self) -> &mut BatchChanges;

    /// The generator behind [`EntitySet::create_entity_id`]. Copies of a set
    /// share it so their fresh ids never collide.
    fn id_gen(&self) -> &Arc<dyn EntityIdGen>;

    // -- Backend primitives --

    /// Registers a def (a no-op for an already registered hash).
    async fn register(&mut self, spec: DefSpec) -> Result<ComponentDef>;

    /// Number of stored entities.
    async fn size(&self) -> Result<usize>;

    async fn get_entity(&self, eid: EntityId, populate: bool) -> Result<Option<Entity>>;

    /// Streams every entity in ascending id order. Each call starts over.
    fn get_entities(&self, populate: bool) -> BoxStream<'_, Result<Entity>>;

    async fn get_component(&self, id: ComponentId) -> Result<Option<Component>>;

    /// Streams every component in ascending id order. Each call starts over.
    fn get_components(&self) -> BoxStream<'_, Result<Component>>;

    /// Inserts or updates components. Components with entity id `0` are
    /// grouped into fresh entities, one def per entity.
    async fn add_components(&mut self, components: Vec<Component>) -> Result<()>;

    /// Marks every component of the given entities for removal.
    async fn mark_entity_components_remove(&mut self, eids: &[EntityId]) -> Result<()>;

    /// Marks the given (existing) components for removal.
    async fn mark_components_remove(&mut self, ids: &[ComponentId]) -> Result<()>;

    /// Deletes every component still marked for removal.
    async fn apply_remove_changes(&mut self) -> Result<()>;

    /// Ids of the entities matching a filter, ascending.
    async fn select_entity_ids(&self, filter: &FilterExpr) -> Result<Vec<EntityId>>;

    /// Components whose def is in `defs`, taken from entities carrying all of
    /// `defs` (optionally restricted to `eids`).
    async fn select_components(&self, defs: &BitField, eids: Option<&[EntityId]>) -> Result<Vec<Component>>;

    // -- Provided --

    fn url(&self) -> String {
        format!("es://{}/{}", self.kind(), self.uuid())
    }

    async fn get_component_defs(&self) -> Result<Vec<ComponentDef>> {
        Ok(self.registry().defs().to_vec())
    }

    fn get_component_def(&self, def: &DefRef) -> Option<ComponentDef> {
        self.registry().resolve(def).cloned()
    }

    fn resolve_component_def_ids(&self, defs: &[DefRef]) -> BitField {
        self.registry().resolve_def_ids(defs)
    }

    fn create_entity_id(&self) -> EntityId {
        self.id_gen().next_id()
    }

    /// A detached entity wired to this set's def names.
    fn create_entity(&self, eid: EntityId, bit_field: Option<BitField>) -> Entity {
        Entity::new(eid)
            .with_bit_field(bit_field.unwrap_or_default())
            .with_names(self.registry().name_index())
    }

    /// Builds a component of a registered def. An `@e` attribute sets the
    /// entity id.
    fn create_component(&self, def: &DefRef, attributes: Map<String, Value>) -> Result<Component> {
        let def = self
            .registry()
            .resolve(def)
            .ok_or_else(|| StoreError::DefNotFound(format!("{def:?}")))?;
        let entity_id = match attributes.get(ENTITY_KEY) {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| StoreError::InvalidComponent(format!("invalid entity id: {v}")))?,
        };
        Ok(Component::new(def.id)
            .with_entity(entity_id)
            .with_attributes(attributes))
    }

    /// Binds an orphan component to the def its url names.
    fn resolve_component(&self, orphan: OrphanComponent) -> Result<Component> {
        let def = self
            .registry()
            .get_by_url(&orphan.def_url)
            .ok_or_else(|| StoreError::DefNotFound(orphan.def_url.clone()))?;
        Ok(orphan.resolve(def))
    }

    async fn get_entities_by_ids(&self, eids: &[EntityId], populate: bool) -> Result<Vec<Entity>> {
        let mut out = Vec::with_capacity(eids.len());
        for eid in eids {
            if let Some(e) = self.get_entity(*eid, populate).await? {
                out.push(e);
            }
        }
        Ok(out)
    }

    /// Adds components, entities, mixed lists or a whole foreign entity set
    /// as one batch.
    async fn add(&mut self, item: AddItem, options: AddOptions) -> Result<()> {
        if !options.retain {
            self.clear_changes();
        }
        add_item(self, item).await?;
        self.apply_remove_changes().await?;
        log_batch(self.changes(), "add");
        Ok(())
    }

    async fn remove_entity(&mut self, eids: &[EntityId], options: AddOptions) -> Result<()> {
        if !options.retain {
            self.clear_changes();
        }
        self.mark_entity_components_remove(eids).await?;
        self.apply_remove_changes().await?;
        log_batch(self.changes(), "remove entity");
        Ok(())
    }

    async fn remove_component(&mut self, id: ComponentId, options: AddOptions) -> Result<()> {
        self.remove_components(&[id], options).await
    }

    async fn remove_components(&mut self, ids: &[ComponentId], options: AddOptions) -> Result<()> {
        if !options.retain {
            self.clear_changes();
        }
        self.mark_components_remove(ids).await?;
        self.apply_remove_changes().await?;
        log_batch(self.changes(), "remove components");
        Ok(())
    }

    /// Entities added or updated by the current batch.
    fn get_updated_entities(&self) -> Vec<EntityId> {
        self.changes().entities.changes(ChangeSetOp::ADD | ChangeSetOp::UPDATE)
    }

    /// Entities removed by the current batch.
    fn get_removed_entities(&self) -> Vec<EntityId> {
        self.changes().entities.changes(ChangeSetOp::REMOVE)
    }

    fn clear_changes(&mut self) {
        self.changes_mut().clear();
    }
}

fn log_batch(changes: &BatchChanges, op: &'static str) {
    debug!(
        op,
        entities_added = changes.entities.added.len(),
        entities_updated = changes.entities.updated.len(),
        entities_removed = changes.entities.removed.len(),
        components_added = changes.components.added.len(),
        components_updated = changes.components.updated.len(),
        components_removed = changes.components.removed.len(),
        "batch applied"
    );
}

fn add_item<'a, E: EntitySet + ?Sized>(es: &'a mut E, item: AddItem) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        match item {
            AddItem::Component(c) => es.add_components(vec![c]).await,
            AddItem::Components(c) => es.add_components(c).await,
            AddItem::Orphan(o) => {
                let c = es.resolve_component(o)?;
                es.add_components(vec![c]).await
            }
            AddItem::Entity(e) => add_entities(es, vec![e]).await,
            AddItem::Entities(e) => add_entities(es, e).await,
            AddItem::List(items) => {
                let mut entities = Vec::new();
                let mut components = Vec::new();
                for item in items {
                    match item {
                        AddItem::Component(c) => components.push(c),
                        AddItem::Components(c) => components.extend(c),
                        AddItem::Orphan(o) => components.push(es.resolve_component(o)?),
                        AddItem::Entity(e) => entities.push(e),
                        AddItem::Entities(e) => entities.extend(e),
                        nested @ (AddItem::List(_) | AddItem::EntitySet(_)) => add_item(&mut *es, nested).await?,
                    }
                }
                add_entities(&mut *es, entities).await?;
                if components.is_empty() {
                    return Ok(());
                }
                es.add_components(components).await
            }
            AddItem::EntitySet(source) => {
                // a set held for writing, such as the destination itself, cannot be merged
                let source = source
                    .try_read()
                    .map_err(|_| StoreError::InvalidEntity("source entity set is locked for writing".into()))?;
                merge_entity_set(es, &*source).await
            }
        }
    })
}

/// Adding an entity replaces its component set.
async fn add_entities<E: EntitySet + ?Sized>(es: &mut E, entities: Vec<Entity>) -> Result<()> {
    let mut marked = Vec::new();
    let mut components = Vec::new();
    for mut e in entities {
        if !e.is_valid() {
            if e.size() == 0 {
                continue;
            }
            e.set_id(es.create_entity_id());
        }
        marked.push(e.id);
        components.extend(e.into_components());
    }
    if marked.is_empty() {
        return Ok(());
    }
    es.mark_entity_components_remove(&marked).await?;
    es.add_components(components).await
}

async fn merge_entity_set<E: EntitySet + ?Sized>(es: &mut E, source: &dyn EntitySet) -> Result<()> {
    let mut def_ids = HashMap::new();
    for def in source.get_component_defs().await? {
        let local = es.register(DefSpec::from(&def)).await?;
        def_ids.insert(def.id, local.id);
    }

    let mut entity_ids: HashMap<EntityId, EntityId> = HashMap::new();
    let mut components = Vec::new();
    let mut stream = source.get_components();
    while let Some(com) = stream.next().await {
        let mut com = com?;
        com.def_id = *def_ids
            .get(&com.def_id)
            .ok_or_else(|| StoreError::DefNotFound(format!("source def {}", com.def_id)))?;
        com.entity_id = *entity_ids
            .entry(com.entity_id)
            .or_insert_with(|| es.create_entity_id());
        components.push(com);
    }
    drop(stream);

    debug!(
        source = %source.url(),
        defs = def_ids.len(),
        entities = entity_ids.len(),
        components = components.len(),
        "merging entity set"
    );
    if components.is_empty() {
        return Ok(());
    }
    es.add_components(components).await
}
