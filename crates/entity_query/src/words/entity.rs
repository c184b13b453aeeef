//! Words that build and feed entity sets.

use std::sync::Arc;

use entity_store::{
    AddItem, AddOptions, Component, ComponentDef, DEF_KEY, DefRef, DefSpec, Entity, EntitySet, EntitySetConfig, EntitySetRef,
    MemEntitySet, OrphanComponent, StoreError, shared,
};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use super::{suspend, sync};
use crate::error::{Result, StackError};
use crate::stack::{QueryStack, WordResult, WordTable};
use crate::value::{SType, StackValue};

pub fn register(words: &mut WordTable) {
    words.register("!d", &[SType::Value], sync(on_create_def));
    words.register("!d", &[SType::List], sync(on_create_def));
    words.register("!d", &[SType::Map], sync(on_create_def));
    words.register("!es", &[], sync(on_create_entity_set));
    words.register("!c", &[SType::List], suspend(on_create_component));
    words.register("!c", &[SType::Map], suspend(on_create_component));
    words.register("!e", &[SType::Value], sync(on_create_entity));
    words.register("!e", &[SType::List], sync(on_create_entity));
    words.register("+", &[SType::EntitySet, SType::Any], suspend(on_add));
    words.register("@d", &[SType::EntitySet], suspend(on_defs));
    words.register("size", &[SType::EntitySet], suspend(on_size));
    words.register("dup", &[SType::EntitySet], suspend(on_copy));
    words.register("over", &[SType::EntitySet, SType::Any], suspend(on_copy));
}

/// An unregistered def from any spec form: `url`, `[url [props]]` or
/// `{url: .., properties: [..]}`.
fn on_create_def(stack: &mut QueryStack, _: &str) -> WordResult {
    let spec = DefSpec::from_value(&stack.pop()?.to_json())?;
    Ok(Some(ComponentDef::from_spec(0, spec)?.into()))
}

fn on_create_entity_set(_: &mut QueryStack, _: &str) -> WordResult {
    let es = MemEntitySet::new(EntitySetConfig::from_env());
    debug!(url = %es.url(), "created entity set");
    Ok(Some(StackValue::EntitySet(shared(es))))
}

/// `[url {attrs}] !c` or `{"@d": url, ..attrs} !c`, resolved against the
/// nearest entity set.
fn on_create_component<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let (def, attributes) = match stack.pop()? {
            StackValue::List(items) => {
                let mut items = items.into_iter();
                let def = items.next().ok_or_else(|| StackError::invalid("!c needs a def"))?;
                let attributes = match items.next().map(|v| v.to_json()) {
                    None => Map::new(),
                    Some(Value::Object(obj)) => obj,
                    Some(other) => return Err(StackError::invalid(format!("invalid attributes: {other}"))),
                };
                (def.to_json(), attributes)
            }
            other => {
                let Value::Object(mut obj) = other.to_json() else {
                    return Err(StackError::invalid("!c needs a map"));
                };
                let def = obj.remove(DEF_KEY).unwrap_or(Value::Null);
                (def, obj)
            }
        };
        let def = DefRef::from_value(&def).ok_or_else(|| StackError::invalid(format!("invalid def reference: {def}")))?;
        let es = stack.require_es()?;
        let component = es.read().await.create_component(&def, attributes)?;
        Ok(Some(component.into()))
    })
}

/// `eid !e` or `[components] !e`.
fn on_create_entity(stack: &mut QueryStack, _: &str) -> WordResult {
    let entity = match stack.pop()? {
        StackValue::Value(v) => {
            let eid = v.as_u64().ok_or_else(|| StoreError::InvalidEntity(format!("invalid entity id: {v}")))?;
            Entity::new(eid)
        }
        other => {
            let mut components = Vec::new();
            for item in other.into_list()? {
                match item {
                    StackValue::Component(c) => components.push(c),
                    other => {
                        return Err(StoreError::InvalidEntity(format!("not a component: {}", other.stype())).into());
                    }
                }
            }
            let eid = components.first().map_or(0, |c| c.entity_id);
            components.into_iter().fold(Entity::new(eid), Entity::with_component)
        }
    };
    Ok(Some(entity.into()))
}

fn map_to_add_item(obj: &Value) -> Result<AddItem> {
    if obj.get(DEF_KEY).is_some_and(Value::is_string) {
        return Ok(OrphanComponent::from_value(obj)?.into());
    }
    Ok(Component::from_value(obj)?.into())
}

fn to_add_item(value: StackValue) -> Result<AddItem> {
    let item = match value {
        StackValue::Component(c) => c.into(),
        StackValue::Entity(e) => e.into(),
        StackValue::EntitySet(es) => es.into(),
        map @ StackValue::Map(_) => map_to_add_item(&map.to_json())?,
        StackValue::List(items) => AddItem::List(items.into_iter().map(to_add_item).collect::<Result<_>>()?),
        other => return Err(StoreError::InvalidEntity(format!("cannot add {}", other.stype())).into()),
    };
    Ok(item)
}

/// Whether `value` is `es` or a list holding it at any depth.
fn contains_set(value: &StackValue, es: &EntitySetRef) -> bool {
    match value {
        StackValue::EntitySet(other) => Arc::ptr_eq(other, es),
        StackValue::List(items) => items.iter().any(|v| contains_set(v, es)),
        _ => false,
    }
}

/// `es item +` registers defs and adds everything else as one batch. The
/// entity set stays on the stack.
fn on_add<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let item = stack.pop()?;
        let es = stack.peek().cloned().ok_or(StackError::Underflow)?.into_entity_set()?;

        let mut defs = Vec::new();
        let mut rest = Vec::new();
        match item {
            StackValue::ComponentDef(def) => defs.push(def),
            StackValue::List(items) => {
                for item in items {
                    match item {
                        StackValue::ComponentDef(def) => defs.push(def),
                        other => rest.push(other),
                    }
                }
            }
            other => rest.push(other),
        }

        if rest.iter().any(|v| contains_set(v, &es)) {
            return Err(StackError::invalid("cannot add an entity set to itself"));
        }

        let mut guard = es.write().await;
        for def in &defs {
            guard.register(DefSpec::from(def)).await?;
        }
        if !rest.is_empty() {
            let item = match rest.len() {
                1 => to_add_item(rest.remove(0))?,
                _ => AddItem::List(rest.into_iter().map(to_add_item).collect::<Result<_>>()?),
            };
            guard.add(item, AddOptions::default()).await?;
        }
        Ok(None)
    })
}

/// `dup` and `over` on an entity set push an independent in-memory copy.
fn on_copy<'a>(stack: &'a mut QueryStack, word: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let depth = usize::from(word == "over");
        let es = stack.peek_at(depth).cloned().ok_or(StackError::Underflow)?.into_entity_set()?;
        let copy = {
            let source = es.read().await;
            MemEntitySet::copy_of(&*source).await?
        };
        debug!(copy = %copy.url(), "dup entity set");
        Ok(Some(StackValue::EntitySet(shared(copy))))
    })
}

fn on_defs<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let es = stack.peek().cloned().ok_or(StackError::Underflow)?.into_entity_set()?;
        let defs = es.read().await.get_component_defs().await?;
        Ok(Some(StackValue::List(defs.into_iter().map(StackValue::from).collect())))
    })
}

fn on_size<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let es = stack.peek().cloned().ok_or(StackError::Underflow)?.into_entity_set()?;
        let size = es.read().await.size().await?;
        Ok(Some(Value::from(size).into()))
    })
}
