//! List and map words.

use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde_json::Value;

use super::{suspend, sync};
use crate::error::{Result, StackError};
use crate::stack::{QueryStack, WordResult, WordTable, pairs_to_map};
use crate::value::{SType, StackValue};

pub fn register(words: &mut WordTable) {
    words.register("eval", &[SType::List], suspend(on_eval));
    words.register("spread", &[SType::List], sync(on_spread));
    words.register("map", &[SType::List, SType::List], suspend(on_map));
    words.register("filter", &[SType::List, SType::List], suspend(on_filter));
    words.register("reduce", &[SType::List, SType::Any, SType::List], suspend(on_reduce));
    words.register("unique", &[SType::List], sync(on_unique));
    words.register("concat", &[SType::List, SType::List], sync(on_concat));
    words.register("concat", &[SType::List, SType::Any], sync(on_push));
    words.register("+", &[SType::List, SType::Any], sync(on_push));
    words.register("push", &[SType::List, SType::Any], sync(on_push));
    words.register("pop", &[SType::List], sync(on_pop));
    words.register("pop!", &[SType::List], sync(on_pop));
    words.register("gather", &[], sync(on_gather));
    words.register("@", &[SType::List, SType::Value], sync(on_fetch));
    words.register("@", &[SType::Map, SType::Value], sync(on_fetch));
    words.register("@", &[SType::Component, SType::Value], sync(on_fetch));
    words.register("index_of", &[SType::List, SType::Any], sync(on_index_of));
    words.register("len", &[SType::List], sync(on_len));
    words.register("len", &[SType::Map], sync(on_len));
    words.register("len", &[SType::Value], sync(on_len));
    words.register("pluck", &[SType::Any, SType::Value], sync(on_pluck));
    words.register("pluck", &[SType::Any, SType::List], sync(on_pluck));
    words.register("pluck!", &[SType::Any, SType::Value], sync(on_pluck));
    words.register("pluck!", &[SType::Any, SType::List], sync(on_pluck));
    for op in ["diff", "intersect", "union"] {
        words.register(op, &[SType::List, SType::List], sync(on_set_op));
    }
    words.register("to_map", &[SType::List], sync(on_to_map));
}

/// Evaluates a list in a child frame and spreads its results.
fn on_eval<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let body = stack.pop()?.into_list()?;
        for value in stack.eval_child(body).await? {
            stack.push_raw(value);
        }
        Ok(None)
    })
}

fn on_spread(stack: &mut QueryStack, _: &str) -> WordResult {
    for value in stack.pop()?.into_list()? {
        stack.push_raw(value);
    }
    Ok(None)
}

/// `list [body] map`: each item is pushed before `body` runs; every result
/// is collected.
fn on_map<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let body = stack.pop()?.into_list()?;
        let list = stack.pop()?.into_list()?;
        let mut out = Vec::with_capacity(list.len());
        for item in list {
            out.extend(stack.eval_with(vec![item], body.clone()).await?);
        }
        Ok(Some(StackValue::List(out)))
    })
}

/// Keeps the items for which `body` leaves a truthy top value.
fn on_filter<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let body = stack.pop()?.into_list()?;
        let list = stack.pop()?.into_list()?;
        let mut out = Vec::new();
        for item in list {
            let result = stack.eval_with(vec![item.clone()], body.clone()).await?;
            if result.last().is_some_and(StackValue::is_truthy) {
                out.push(item);
            }
        }
        Ok(Some(StackValue::List(out)))
    })
}

/// `list init [body] reduce`: `body` sees `acc item` and leaves the next acc.
fn on_reduce<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let body = stack.pop()?.into_list()?;
        let mut acc = stack.pop()?;
        let list = stack.pop()?.into_list()?;
        for item in list {
            let mut result = stack.eval_with(vec![acc, item], body.clone()).await?;
            acc = result.pop().ok_or(StackError::Underflow)?;
        }
        Ok(Some(acc))
    })
}

fn on_unique(stack: &mut QueryStack, _: &str) -> WordResult {
    let list = stack.pop()?.into_list()?;
    let mut out: Vec<StackValue> = Vec::with_capacity(list.len());
    for item in list {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    Ok(Some(StackValue::List(out)))
}

fn on_concat(stack: &mut QueryStack, _: &str) -> WordResult {
    let tail = stack.pop()?.into_list()?;
    let mut list = stack.pop()?.into_list()?;
    list.extend(tail);
    Ok(Some(StackValue::List(list)))
}

fn on_push(stack: &mut QueryStack, _: &str) -> WordResult {
    let item = stack.pop()?;
    let mut list = stack.pop()?.into_list()?;
    list.push(item);
    Ok(Some(StackValue::List(list)))
}

/// `[1 2 3] pop` leaves `[1 2] 3`; `pop!` leaves only `3`.
fn on_pop(stack: &mut QueryStack, word: &str) -> WordResult {
    let mut list = stack.pop()?.into_list()?;
    let last = list.pop().ok_or(StackError::Underflow)?;
    if word == "pop" {
        stack.push_raw(StackValue::List(list));
    }
    Ok(Some(last))
}

/// Collects every item of the active frame into one list.
fn on_gather(stack: &mut QueryStack, _: &str) -> WordResult {
    let items = stack.items().to_vec();
    stack.clear_items();
    Ok(Some(StackValue::List(items)))
}

fn on_fetch(stack: &mut QueryStack, _: &str) -> WordResult {
    let key = stack.pop()?.into_value()?;
    let subject = stack.pop()?;
    let found = match (&subject, &key) {
        (StackValue::List(items), Value::Number(n)) => {
            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let index = n.as_i64().map(|i| if i < 0 { len + i } else { i });
            index
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i).cloned())
        }
        (StackValue::Map(map), Value::String(k)) => map.get(k).cloned(),
        (StackValue::Component(c), Value::String(k)) => c.get(k).cloned().map(StackValue::from_json),
        _ => None,
    };
    Ok(Some(found.unwrap_or(StackValue::Value(Value::Null))))
}

fn on_index_of(stack: &mut QueryStack, _: &str) -> WordResult {
    let needle = stack.pop()?;
    let list = stack.pop()?.into_list()?;
    let index = list
        .iter()
        .position(|item| *item == needle)
        .and_then(|i| i64::try_from(i).ok())
        .unwrap_or(-1);
    Ok(Some(Value::from(index).into()))
}

fn on_len(stack: &mut QueryStack, _: &str) -> WordResult {
    let len = match stack.pop()? {
        StackValue::List(items) => items.len(),
        StackValue::Map(map) => map.len(),
        StackValue::Value(Value::String(s)) => s.chars().count(),
        other => return Err(StackError::invalid(format!("{} has no length", other.stype()))),
    };
    Ok(Some(Value::from(len).into()))
}

fn json_get(value: &Value, key: &str) -> Value {
    let found = if key.starts_with('/') {
        value.pointer(key)
    } else {
        value.get(key)
    };
    found.cloned().unwrap_or(Value::Null)
}

fn pluck_one(item: &StackValue, key: &str) -> StackValue {
    match item {
        StackValue::Component(c) => StackValue::from_json(c.get(key).cloned().unwrap_or(Value::Null)),
        other => StackValue::from_json(json_get(&other.to_json(), key)),
    }
}

fn pluck_keys(item: &StackValue, keys: &[String]) -> StackValue {
    if keys.len() == 1 {
        return pluck_one(item, &keys[0]);
    }
    let map: BTreeMap<String, StackValue> = keys
        .iter()
        .map(|k| (k.trim_start_matches('/').to_string(), pluck_one(item, k)))
        .collect();
    StackValue::Map(map)
}

/// `subject key pluck` reads a key or JSON pointer from a map or component,
/// or from each item of a list. A list of keys yields maps. `pluck!` keeps
/// the subject beneath the result.
fn on_pluck(stack: &mut QueryStack, word: &str) -> WordResult {
    let keys: Vec<String> = match stack.pop()? {
        StackValue::List(keys) => keys.into_iter().map(StackValue::into_string).collect::<Result<_>>()?,
        key => vec![key.into_string()?],
    };
    let subject = stack.pop()?;
    let result = match &subject {
        StackValue::List(items) => StackValue::List(items.iter().map(|item| pluck_keys(item, &keys)).collect()),
        other => pluck_keys(other, &keys),
    };
    if word == "pluck!" {
        stack.push_raw(subject);
    }
    Ok(Some(result))
}

fn on_set_op(stack: &mut QueryStack, word: &str) -> WordResult {
    let b = stack.pop()?.into_list()?;
    let a = stack.pop()?.into_list()?;
    let out: Vec<StackValue> = match word {
        "diff" => a.into_iter().filter(|item| !b.contains(item)).collect(),
        "intersect" => a.into_iter().filter(|item| b.contains(item)).collect(),
        _ => {
            let mut out = a;
            for item in b {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            out
        }
    };
    Ok(Some(StackValue::List(out)))
}

/// `[k1 v1 k2 v2] to_map`
fn on_to_map(stack: &mut QueryStack, _: &str) -> WordResult {
    let list = stack.pop()?.into_list()?;
    Ok(Some(StackValue::Map(pairs_to_map(list)?)))
}
