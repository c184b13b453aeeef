//! # entity_store
//!
//! Entities, components and their definitions, with per-batch change
//! tracking and a pluggable storage contract.
//!
//! This crate provides:
//!
//! - [`BitField`]: def-id bit sets with ALL / ANY membership tests.
//! - [`ComponentDef`], [`DefSpec`] and [`DefRegistry`]: content-hashed def registration.
//! - [`Component`], [`ComponentId`], [`OrphanComponent`]: attribute maps keyed by `(eid, did)`.
//! - [`Entity`]: an id, its def bit set and (optionally) its components.
//! - [`ChangeSet`]: added / updated / removed classification per batch.
//! - [`EntitySet`]: the backend contract plus the add/remove orchestration.
//! - [`MemEntitySet`]: the in-memory backend.
//! - [`FilterExpr`]: attribute filters, evaluated in memory or lowered to SQL ([`sql`]).
//! - [`FlakeIdGen`] / [`SequentialIdGen`]: entity id generation.

pub mod bitfield;
pub mod change_set;
pub mod component;
pub mod component_def;
pub mod config;
pub mod entity;
pub mod entity_set;
pub mod error;
pub mod filter;
pub mod id;
pub mod mem;
pub mod registry;
pub mod sql;

pub use bitfield::BitField;
pub use change_set::{ChangeSet, ChangeSetOp};
pub use component::{Component, ComponentId, DEF_KEY, ENTITY_KEY, OrphanComponent};
pub use component_def::{ComponentDef, ComponentDefId, ComponentDefProperty, DefSpec, PropertyType};
pub use config::EntitySetConfig;
pub use entity::{Entity, EntityId};
pub use entity_set::{AddItem, AddOptions, BatchChanges, EntitySet, EntitySetRef, shared};
pub use error::StoreError;
pub use filter::{AttrLocator, CompareOp, FilterExpr, FilterValue};
pub use id::{EntityIdGen, FlakeIdGen, SequentialIdGen, build_flake53, parse_flake53};
pub use mem::MemEntitySet;
pub use registry::{DefRef, DefRegistry};
