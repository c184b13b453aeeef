//! `select` and the words that build and run filters inside it.
//!
//! `es [query] select` evaluates the query list in a child frame with `es` as
//! the select context. Any Filter value left over is applied to the entity
//! set and replaced by the list of matching entities.

use entity_store::{BitField, DefRef, EntityId, EntitySetRef, FilterExpr};
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::{suspend, sync};
use crate::error::{Result, StackError};
use crate::filter::compile;
use crate::stack::{QueryStack, WordResult, WordTable};
use crate::value::{ComponentAttr, Filter, FilterOp, SType, StackValue};

pub fn register(words: &mut WordTable) {
    words.register("select", &[SType::EntitySet, SType::List], suspend(on_select));

    words.register("!bf", &[SType::Value], suspend(on_bit_field));
    words.register("!bf", &[SType::List], suspend(on_bit_field));
    words.register("!ca", &[SType::Value], suspend(on_component_attr));

    for ty in [SType::Value, SType::List, SType::BitField, SType::Filter] {
        words.register("@e", &[ty], suspend(on_entities));
        words.register("@eid", &[ty], suspend(on_entities));
    }
    words.register("@c", &[SType::BitField], suspend(on_components));
    words.register("@c", &[SType::Filter], suspend(on_components));
    words.register("@ca", &[SType::ComponentAttr], suspend(on_attributes));
    for subject in [SType::Filter, SType::List, SType::Entity] {
        words.register("@c", &[subject, SType::BitField], suspend(on_components));
        words.register("@ca", &[subject, SType::ComponentAttr], suspend(on_attributes));
    }

    for op in ["==", "!=", "<", "<=", ">", ">="] {
        words.register(op, &[SType::ComponentAttr, SType::Any], sync(on_filter));
        words.register(op, &[SType::Any, SType::ComponentAttr], sync(on_filter));
    }
    for op in ["and", "or"] {
        for (l, r) in [
            (SType::Filter, SType::Filter),
            (SType::Filter, SType::BitField),
            (SType::BitField, SType::Filter),
            (SType::BitField, SType::BitField),
        ] {
            words.register(op, &[l, r], sync(on_filter));
        }
    }
}

/// Runs `query` against `es` and returns what it left, with filters applied.
pub async fn select(stack: &mut QueryStack, es: EntitySetRef, query: Vec<StackValue>) -> Result<Vec<StackValue>> {
    let previous = stack.replace_select_es(Some(es.clone()));
    let result = stack.eval_child(query).await;
    stack.replace_select_es(previous);

    let mut out = Vec::new();
    for item in result? {
        match item {
            StackValue::Filter(filter) => {
                let ids = filter_entity_ids(&es, &filter).await?;
                let entities = es.read().await.get_entities_by_ids(&ids, true).await?;
                out.push(StackValue::List(entities.into_iter().map(StackValue::Entity).collect()));
            }
            other => out.push(other),
        }
    }
    debug!(results = out.len(), "select");
    Ok(out)
}

fn on_select<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let query = stack.pop()?.into_list()?;
        let es = stack.pop()?.into_entity_set()?;
        for value in select(stack, es, query).await? {
            stack.push_raw(value);
        }
        Ok(None)
    })
}

async fn filter_entity_ids(es: &EntitySetRef, filter: &Filter) -> Result<Vec<EntityId>> {
    let expr = compile(filter)?;
    Ok(es.read().await.select_entity_ids(&expr).await?)
}

/// `all`, a url, a def id or a list of them. Unknown defs are dropped.
fn on_bit_field<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let value = stack.pop()?;
        if value.as_str() == Some("all") {
            return Ok(Some(BitField::all().into()));
        }
        let refs: Vec<DefRef> = match value {
            StackValue::List(items) => items.iter().filter_map(|v| DefRef::from_value(&v.to_json())).collect(),
            other => DefRef::from_value(&other.to_json()).into_iter().collect(),
        };
        let es = stack.require_es()?;
        let bf = es.read().await.resolve_component_def_ids(&refs);
        Ok(Some(bf.into()))
    })
}

/// `/component/title#/text !ca`
fn on_component_attr<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let locator = stack.pop()?.into_string()?;
        let es = stack.require_es()?;
        let (bit_field, key) = es.read().await.registry().resolve_attr(&locator);
        Ok(Some(StackValue::ComponentAttr(ComponentAttr {
            bit_field,
            key: key.unwrap_or_default(),
        })))
    })
}

/// Entity ids named by an id, a list of ids or entities, a def set or a filter.
async fn entity_ids(es: &EntitySetRef, subject: StackValue) -> Result<Vec<EntityId>> {
    let ids = match subject {
        StackValue::Value(v) => vec![v.as_u64().ok_or_else(|| StackError::invalid(format!("invalid entity id: {v}")))?],
        StackValue::Entity(e) => vec![e.id],
        StackValue::List(items) => items
            .into_iter()
            .filter_map(|item| match item {
                StackValue::Entity(e) => Some(e.id),
                StackValue::Component(c) => Some(c.entity_id),
                other => other.to_json().as_u64(),
            })
            .collect(),
        StackValue::BitField(bf) => es.read().await.select_entity_ids(&FilterExpr::Defs(bf)).await?,
        StackValue::Filter(filter) => filter_entity_ids(es, &filter).await?,
        other => return Err(StackError::invalid(format!("cannot select entities by {}", other.stype()))),
    };
    Ok(ids)
}

/// `@e` pushes entities, `@eid` their ids. A single id yields a single
/// entity (or null).
fn on_entities<'a>(stack: &'a mut QueryStack, word: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let subject = stack.pop()?;
        let single = matches!(subject, StackValue::Value(_));
        let es = stack.require_es()?;
        let ids = entity_ids(&es, subject).await?;

        if word == "@eid" {
            let ids: Vec<StackValue> = ids.into_iter().map(|id| Value::from(id).into()).collect();
            return Ok(Some(StackValue::List(ids)));
        }
        let mut entities: Vec<StackValue> = es
            .read()
            .await
            .get_entities_by_ids(&ids, true)
            .await?
            .into_iter()
            .map(StackValue::Entity)
            .collect();
        if single {
            return Ok(Some(entities.pop().unwrap_or(StackValue::Value(Value::Null))));
        }
        Ok(Some(StackValue::List(entities)))
    })
}

/// `bf @c`, `filter @c` or `subject bf @c`.
fn on_components<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let es = stack.require_es()?;
        let (defs, eids) = match stack.pop()? {
            StackValue::BitField(defs) if is_subject(stack.peek()) => (defs, Some(entity_ids(&es, stack.pop()?).await?)),
            StackValue::BitField(defs) => (defs, None),
            subject => (BitField::all(), Some(entity_ids(&es, subject).await?)),
        };
        let components = es.read().await.select_components(&defs, eids.as_deref()).await?;
        Ok(Some(StackValue::List(components.into_iter().map(StackValue::Component).collect())))
    })
}

/// Values that can restrict `@c` / `@ca` to a set of entities.
fn is_subject(value: Option<&StackValue>) -> bool {
    matches!(
        value,
        Some(StackValue::Filter(_) | StackValue::List(_) | StackValue::Entity(_))
    )
}

/// `attr @ca` or `subject attr @ca`: the attribute's values, one per
/// component that has it.
fn on_attributes<'a>(stack: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
    Box::pin(async move {
        let attr = stack.pop()?.into_component_attr()?;
        let es = stack.require_es()?;
        let eids = if is_subject(stack.peek()) {
            Some(entity_ids(&es, stack.pop()?).await?)
        } else {
            None
        };
        let components = es.read().await.select_components(&attr.bit_field, eids.as_deref()).await?;
        let values = components
            .iter()
            .filter_map(|c| c.get(&attr.key).cloned())
            .map(StackValue::from_json)
            .collect();
        Ok(Some(StackValue::List(values)))
    })
}

/// Comparison, `and` and `or` words that build Filter values.
fn on_filter(stack: &mut QueryStack, word: &str) -> WordResult {
    let op = FilterOp::from_word(word).ok_or_else(|| StackError::UnknownWord(word.to_string()))?;
    let right = stack.pop()?;
    let left = stack.pop()?;
    Ok(Some(Filter::new(op, left, right).into()))
}

#[cfg(test)]
mod tests {
    use entity_store::ComponentId;
    use serde_json::{Value, json};

    use crate::value::StackValue;
    use crate::words::create_stack;

    const TASKS: &str = r#"
        !es
        [ "/component/title" ["text"] ] !d +
        [ "/component/position" ["x" "y"] ] !d +
        [ "/component/done" ["done"] ] !d +
        [
            { "@e": 1, "@d": "/component/title", text: "do homework" }
            { "@e": 1, "@d": "/component/position", x: 2, y: 5 }
            { "@e": 2, "@d": "/component/title", text: "walk dog" }
            { "@e": 2, "@d": "/component/position", x: 3 }
            { "@e": 2, "@d": "/component/done", done: true }
            { "@e": 3, "@d": "/component/title", text: "do laundry" }
            { "@e": 3, "@d": "/component/done", done: false }
        ] +
    "#;

    /// Channels 1-3, clients 9-13 and their memberships (entities 20-27).
    const CHAT: &str = r#"
        !es
        [ "/component/channel" ["name"] ] !d +
        [ "/component/username" ["username"] ] !d +
        [ "/component/nickname" ["nickname"] ] !d +
        [ "/component/channel_member" ["channel" "client"] ] !d +
        [
            { "@e": 1, "@d": "/component/channel", name: "general" }
            { "@e": 2, "@d": "/component/channel", name: "chat" }
            { "@e": 3, "@d": "/component/channel", name: "mr-rap" }
            { "@e": 9, "@d": "/component/username", username: "roxanne" }
            { "@e": 9, "@d": "/component/nickname", nickname: "roxy" }
            { "@e": 10, "@d": "/component/username", username: "melliot" }
            { "@e": 10, "@d": "/component/nickname", nickname: "missy" }
            { "@e": 11, "@d": "/component/username", username: "ggrice" }
            { "@e": 11, "@d": "/component/nickname", nickname: "grandmaster" }
            { "@e": 12, "@d": "/component/username", username: "lhill" }
            { "@e": 12, "@d": "/component/nickname", nickname: "lauryn" }
            { "@e": 13, "@d": "/component/username", username: "kgrap" }
            { "@e": 13, "@d": "/component/nickname", nickname: "koolgrap" }
            { "@e": 20, "@d": "/component/channel_member", channel: 3, client: 9 }
            { "@e": 21, "@d": "/component/channel_member", channel: 3, client: 10 }
            { "@e": 22, "@d": "/component/channel_member", channel: 3, client: 12 }
            { "@e": 23, "@d": "/component/channel_member", channel: 1, client: 9 }
            { "@e": 24, "@d": "/component/channel_member", channel: 1, client: 12 }
            { "@e": 25, "@d": "/component/channel_member", channel: 1, client: 13 }
            { "@e": 26, "@d": "/component/channel_member", channel: 2, client: 11 }
            { "@e": 27, "@d": "/component/channel_member", channel: 2, client: 10 }
        ] +
        es let
    "#;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn select(query: &str) -> Vec<StackValue> {
        init_tracing();
        let mut stack = create_stack();
        stack.run(TASKS).await.unwrap();
        stack.run(&format!("{query} select")).await.unwrap();
        stack.items().to_vec()
    }

    async fn select_json(query: &str) -> Vec<Value> {
        select(query).await.iter().map(StackValue::to_json).collect()
    }

    #[tokio::test]
    async fn test_select_by_regex() {
        assert_eq!(
            select_json("[ /component/title#/text !ca ~r/^do/ == ]").await,
            vec![json!([1, 3])]
        );
    }

    #[tokio::test]
    async fn test_select_components_of_matching_entities() {
        let items = select("[ /component/position#/x !ca 2 == /component/position !bf @c ]").await;
        let [StackValue::List(components)] = items.as_slice() else { panic!("expected one list") };
        assert_eq!(components.len(), 1);
        let StackValue::Component(com) = &components[0] else { panic!("expected component") };
        assert_eq!(com.id(), ComponentId::new(1, 2));
    }

    #[tokio::test]
    async fn test_list_membership_and_or() {
        assert_eq!(
            select_json("[ /component/done#/done !ca [false] == ]").await,
            vec![json!([3])]
        );
        assert_eq!(
            select_json("[ /component/position#/x !ca 2 > /component/done !bf and ]").await,
            vec![json!([2])]
        );
        assert_eq!(
            select_json("[ 3 /component/position#/x !ca <= /component/done#/done !ca true == or ]").await,
            vec![json!([2])]
        );
    }

    #[tokio::test]
    async fn test_unregistered_def_matches_nothing() {
        assert_eq!(
            select_json("[ /component/missing#/x !ca 1 == ]").await,
            vec![json!([])]
        );
        assert_eq!(select_json("[ /component/missing !bf @e ]").await, vec![json!([])]);
    }

    #[tokio::test]
    async fn test_entity_and_attribute_words() {
        assert_eq!(select_json("[ /component/position !bf @e ]").await, vec![json!([1, 2])]);
        assert_eq!(select_json("[ /component/done !bf @eid ]").await, vec![json!([2, 3])]);
        assert_eq!(select_json("[ 3 @e ]").await, vec![json!(3)]);
        assert_eq!(select_json("[ 9 @e ]").await, vec![Value::Null]);

        let mut x = select_json("[ /component/position#/x !ca @ca ]").await;
        assert_eq!(x.len(), 1);
        let Value::Array(values) = x.remove(0) else { panic!("expected array") };
        assert_eq!(values.len(), 2);
        assert!(values.contains(&json!(2)) && values.contains(&json!(3)));
    }

    async fn chat(query: &str) -> Vec<Value> {
        init_tracing();
        let mut stack = create_stack();
        stack.run(CHAT).await.unwrap();
        stack.run(query).await.unwrap();
        stack.items().iter().map(StackValue::to_json).collect()
    }

    #[tokio::test]
    async fn test_macros_take_parameters_and_capture_results() {
        let out = chat(
            r#"
            [
                uid !
                $es [ /component/username#/username !ca $uid == ] select
                0 @
            ] selectUserId define

            [
                ch_name !
                $es [ /component/channel#/name !ca $ch_name == ] select
                0 @
            ] selectChannelId define

            ggrice selectUserId
            "mr-rap" selectChannelId

            // both references reach out of the map and the list
            [ "/component/channel_member" { "@e": 14, channel: ^^$0, client: ^^$0 } ]
            to_str
            "#,
        )
        .await;
        let [Value::String(text)] = out.as_slice() else { panic!("expected one string") };
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap(),
            json!(["/component/channel_member", { "@e": 14, "channel": 3, "client": 11 }])
        );
    }

    #[tokio::test]
    async fn test_macros_chain_through_bindings() {
        let out = chat(
            r#"
            [
                client_id let
                $es [
                    /component/channel_member#/client !ca $client_id ==
                    /component/channel_member !bf
                    @c
                ] select
                /channel pluck
            ] selectChannelsFromMember define

            [
                channel_ids let
                $es [
                    /component/channel_member#/channel !ca $channel_ids ==
                    /component/channel_member !bf
                    @c
                ] select
                /client pluck unique
                [ $client_id != ] filter
            ] selectChannelMemberComs define

            [
                eids let
                $es [ $eids [/component/nickname] !bf @c ] select
            ] selectNicknames define

            [
                selectChannelsFromMember
                selectChannelMemberComs
                selectNicknames
            ] selectChannelMembersByClientId define

            9 selectChannelMembersByClientId
            /nickname pluck
            "#,
        )
        .await;
        assert_eq!(out, vec![json!(["missy", "lauryn", "koolgrap"])]);
    }

    #[tokio::test]
    async fn test_query_list_reads_outer_items() {
        // captured while the list is built
        let out = chat(
            r#"
            $es [ /component/username#/username !ca ggrice == ] select
            $es [ ^$1 /component/nickname !bf @c ] select
            /nickname pluck
            "#,
        )
        .await;
        assert_eq!(out, vec![json!(["grandmaster"])]);

        // deferred until select runs the list
        let out = chat(
            r#"
            $es [ /component/username#/username !ca [roxanne kgrap] == ] select
            $es [ *^$0 /component/nickname !bf @c ] select
            /nickname pluck
            "#,
        )
        .await;
        assert_eq!(out, vec![json!(["roxy", "koolgrap"])]);
    }

    #[tokio::test]
    async fn test_ordering_against_a_list_is_rejected() {
        let mut stack = create_stack();
        stack.run(TASKS).await.unwrap();
        let err = stack
            .run("[ /component/position#/x !ca [1 2] > ] select")
            .await
            .unwrap_err();
        assert!(matches!(err.stack_error(), Some(crate::error::StackError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_select_consumes_its_operands() {
        let mut stack = create_stack();
        stack.run(TASKS).await.unwrap();
        stack.run("[ /component/title !bf @eid ] select").await.unwrap();
        assert_eq!(stack.len(), 1);
        assert!(stack.run("@e").await.is_err());
    }
}
