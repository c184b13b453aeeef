//! The query VM.
//!
//! A [`QueryStack`] is a stack of frames. The root frame holds the visible
//! items; `[` and `{` open literal frames in which words are stored rather
//! than dispatched, and `]` / `}` reify the frame into a List or Map pushed
//! onto the parent. Child evaluations (`eval`, `map`, `select`, ...) run in an
//! isolated `Eval` frame that is dropped when they finish.
//!
//! Words resolve through a [`WordTable`]: user bindings first, then the
//! registered entries for the name in most-specific-first order, matching
//! each entry's signature against the tags of the top items. A bare word with
//! no entry at all is pushed as a string value.
//!
//! Values can be referenced by name or by position:
//!
//! - `$name` runs the user binding `name`; `$2` copies the third item from
//!   the top of the active frame.
//! - `^$2` moves the third item from the top of the caller's frame (the one
//!   beneath the innermost child evaluation) onto the active frame.
//! - Inside literal scopes a word with one `^` per open scope is resolved
//!   while the literal is built: `[ ^$0 ]` captures the top item from outside
//!   the list, `[ { a: ^^$0 } ]` from outside both. Prefixing `*` stores the
//!   word with the `*` removed, deferring it to when the literal is run.
//!
//! Nested evaluation (macros, async words and child frames) is bounded by
//! [`MAX_EVAL_DEPTH`].

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::DateTime;
use entity_store::EntitySetRef;
use entity_store::filter::parse_datetime;
use futures::future::BoxFuture;
use regex::RegexBuilder;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{QueryError, Result, StackError};
use crate::tokenizer::{SpannedToken, Token, Tokenizer};
use crate::value::{SType, StackValue};

pub type WordResult = Result<Option<StackValue>>;

/// How deeply macros, async words and child evaluations may nest.
pub const MAX_EVAL_DEPTH: usize = 64;

/// A synchronous word. Receives the word name; a returned value is pushed.
pub type SyncWordFn = fn(&mut QueryStack, &str) -> WordResult;

/// A word that may suspend on entity set I/O.
pub type AsyncWordFn = for<'a> fn(&'a mut QueryStack, &'a str) -> BoxFuture<'a, WordResult>;

#[derive(Clone)]
pub enum WordHandler {
    Sync(SyncWordFn),
    Async(AsyncWordFn),
    /// `define`: the body is evaluated on every reference.
    Macro(Vec<StackValue>),
    /// `let`: the value is pushed verbatim.
    Constant(StackValue),
}

#[derive(Clone)]
pub struct WordEntry {
    /// Expected tags, bottom to top.
    pub signature: Vec<SType>,
    pub handler: WordHandler,
}

impl WordEntry {
    fn matches(&self, items: &[StackValue]) -> bool {
        let n = self.signature.len();
        if items.len() < n {
            return false;
        }
        self.signature
            .iter()
            .zip(&items[items.len() - n..])
            .all(|(ty, item)| ty.accepts(item.stype()))
    }

    /// Longer signatures first, then fewer `Any` slots.
    fn specificity(&self) -> (usize, usize) {
        let concrete = self.signature.iter().filter(|t| **t != SType::Any).count();
        (self.signature.len(), concrete)
    }
}

pub enum Lookup<'a> {
    Found(&'a WordEntry),
    /// The word exists but no signature fits; `needs` is the shortest arity.
    Mismatch { needs: usize },
    /// Nothing is registered under the name. The dispatcher pushes the word
    /// as a string value so bare names can label bindings and map keys.
    NotFound,
}

#[derive(Clone, Default)]
pub struct WordTable {
    words: HashMap<String, Vec<WordEntry>>,
    user: HashMap<String, WordEntry>,
}

impl WordTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a built-in word for one signature.
    pub fn register(&mut self, name: &str, signature: &[SType], handler: WordHandler) {
        let entries = self.words.entry(name.to_string()).or_default();
        entries.push(WordEntry {
            signature: signature.to_vec(),
            handler,
        });
        entries.sort_by_key(|e| std::cmp::Reverse(e.specificity()));
    }

    /// Binds a user word. It shadows every built-in of the same name.
    pub fn define(&mut self, name: &str, handler: WordHandler) {
        self.user.insert(
            name.to_string(),
            WordEntry {
                signature: Vec::new(),
                handler,
            },
        );
    }

    /// The value a user binding pushes for `^name`.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<StackValue> {
        match &self.user.get(name)?.handler {
            WordHandler::Macro(body) => Some(StackValue::List(body.clone())),
            WordHandler::Constant(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The user binding for `name`, ignoring built-ins.
    #[must_use]
    pub fn bound(&self, name: &str) -> Option<&WordEntry> {
        self.user.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.user.contains_key(name) || self.words.contains_key(name)
    }

    pub fn lookup(&self, name: &str, items: &[StackValue]) -> Lookup<'_> {
        if let Some(entry) = self.user.get(name) {
            return Lookup::Found(entry);
        }
        let Some(entries) = self.words.get(name) else {
            return Lookup::NotFound;
        };
        match entries.iter().find(|e| e.matches(items)) {
            Some(entry) => Lookup::Found(entry),
            None => Lookup::Mismatch {
                needs: entries.iter().map(|e| e.signature.len()).min().unwrap_or(0),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Root,
    List,
    Map,
    Eval,
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    items: Vec<StackValue>,
}

impl Frame {
    fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }
}

pub struct QueryStack {
    frames: Vec<Frame>,
    words: WordTable,
    select_es: Option<EntitySetRef>,
    eval_depth: usize,
}

impl Default for QueryStack {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryStack {
    /// An empty stack with no words registered. See
    /// [`crate::words::create_stack`] for the standard library.
    #[must_use]
    pub fn new() -> Self {
        Self::with_words(WordTable::new())
    }

    #[must_use]
    pub fn with_words(words: WordTable) -> Self {
        Self {
            frames: vec![Frame::new(FrameKind::Root)],
            words,
            select_es: None,
            eval_depth: 0,
        }
    }

    pub fn words(&self) -> &WordTable {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut WordTable {
        &mut self.words
    }

    fn top(&self) -> &Frame {
        // the root frame is never popped
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Items of the active frame, bottom to top.
    pub fn items(&self) -> &[StackValue] {
        &self.top().items
    }

    pub fn len(&self) -> usize {
        self.top().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.top().items.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn peek(&self) -> Option<&StackValue> {
        self.top().items.last()
    }

    /// The item `n` places below the top.
    pub fn peek_at(&self, n: usize) -> Option<&StackValue> {
        let items = &self.top().items;
        items.len().checked_sub(n + 1).map(|i| &items[i])
    }

    pub fn pop(&mut self) -> Result<StackValue> {
        self.top_mut().items.pop().ok_or(StackError::Underflow)
    }

    /// Pushes without dispatching.
    pub fn push_raw(&mut self, value: StackValue) {
        self.top_mut().items.push(value);
    }

    /// Drops every frame and item. User bindings are kept.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.frames.push(Frame::new(FrameKind::Root));
        self.select_es = None;
        self.eval_depth = 0;
    }

    /// Empties the active frame only.
    pub fn clear_items(&mut self) {
        self.top_mut().items.clear();
    }

    /// The entity set words operate on: the one being selected from, else
    /// the nearest one on the stack.
    pub fn current_es(&self) -> Option<EntitySetRef> {
        if let Some(es) = &self.select_es {
            return Some(es.clone());
        }
        self.frames.iter().rev().flat_map(|f| f.items.iter().rev()).find_map(|v| match v {
            StackValue::EntitySet(es) => Some(es.clone()),
            _ => None,
        })
    }

    pub fn require_es(&self) -> Result<EntitySetRef> {
        self.current_es().ok_or(StackError::NoEntitySet)
    }

    /// Sets the select context, returning the previous one.
    pub(crate) fn replace_select_es(&mut self, es: Option<EntitySetRef>) -> Option<EntitySetRef> {
        std::mem::replace(&mut self.select_es, es)
    }

    fn in_literal_scope(&self) -> bool {
        matches!(self.top().kind, FrameKind::List | FrameKind::Map)
    }

    /// Number of literal scopes open above the nearest evaluating frame.
    fn literal_depth(&self) -> usize {
        self.frames
            .iter()
            .rev()
            .take_while(|f| matches!(f.kind, FrameKind::List | FrameKind::Map))
            .count()
    }

    fn enter(&mut self) -> Result<()> {
        if self.eval_depth >= MAX_EVAL_DEPTH {
            return Err(StackError::RecursionLimit(MAX_EVAL_DEPTH));
        }
        self.eval_depth += 1;
        Ok(())
    }

    fn leave(&mut self) {
        self.eval_depth = self.eval_depth.saturating_sub(1);
    }

    /// Removes the item `n` places below the top of frame `index`.
    fn take_from(&mut self, index: usize, n: usize) -> Result<StackValue> {
        let items = &mut self.frames[index].items;
        let pos = items.len().checked_sub(n + 1).ok_or(StackError::Underflow)?;
        Ok(items.remove(pos))
    }

    /// Stores a word met inside a literal scope, resolving it first when it
    /// carries one `^` per open scope.
    fn push_literal_word(&mut self, word: String) -> Result<()> {
        if let Some(deferred) = word.strip_prefix('*').filter(|w| w.starts_with('^')) {
            self.push_raw(StackValue::Word(deferred.to_string()));
            return Ok(());
        }
        let carets = word.chars().take_while(|c| *c == '^').count();
        let depth = self.literal_depth();
        if carets == 0 || carets != depth || word.len() == carets {
            self.push_raw(StackValue::Word(word));
            return Ok(());
        }

        let reference = &word[carets..];
        let value = match stack_index(reference) {
            Some(n) => self.take_from(self.frames.len() - 1 - depth, n)?,
            None => {
                let name = reference.strip_prefix('$').unwrap_or(reference);
                self.words
                    .binding(name)
                    .ok_or_else(|| StackError::UnknownWord(name.to_string()))?
            }
        };
        trace!(word = %word, "unquote");
        self.push_raw(value);
        Ok(())
    }

    fn open_scope(&mut self, kind: FrameKind) {
        self.frames.push(Frame::new(kind));
    }

    fn close_scope(&mut self, kind: FrameKind, word: &str) -> Result<()> {
        if self.top().kind != kind {
            return Err(StackError::UnexpectedWord(word.to_string()));
        }
        let Some(frame) = self.frames.pop() else {
            return Err(StackError::UnexpectedWord(word.to_string()));
        };
        let value = match kind {
            FrameKind::Map => StackValue::Map(pairs_to_map(frame.items)?),
            _ => StackValue::List(frame.items),
        };
        self.push_raw(value);
        Ok(())
    }

    /// Pushes one value, dispatching it if it is a word.
    pub fn push(&mut self, value: StackValue) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let StackValue::Word(word) = &value {
                match word.as_str() {
                    "[" => {
                        self.open_scope(FrameKind::List);
                        return Ok(());
                    }
                    "{" => {
                        self.open_scope(FrameKind::Map);
                        return Ok(());
                    }
                    "]" => return self.close_scope(FrameKind::List, "]"),
                    "}" => return self.close_scope(FrameKind::Map, "}"),
                    _ => {}
                }
            }
            match value {
                StackValue::Word(name) if !self.in_literal_scope() => self.dispatch(&name).await,
                StackValue::Word(name) => self.push_literal_word(name),
                other => {
                    self.push_raw(other);
                    Ok(())
                }
            }
        })
    }

    pub async fn push_values(&mut self, values: Vec<StackValue>) -> Result<()> {
        for value in values {
            self.push(value).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, name: &str) -> Result<()> {
        if let Some(bound) = name.strip_prefix('^').filter(|n| !n.is_empty()) {
            if let Some(n) = stack_index(bound) {
                let caller = self
                    .frames
                    .iter()
                    .rposition(|f| f.kind == FrameKind::Eval)
                    .ok_or_else(|| StackError::invalid(format!("{name} has no caller stack")))?;
                let value = self.take_from(caller - 1, n)?;
                self.push_raw(value);
                return Ok(());
            }
            let bound = bound.strip_prefix('$').unwrap_or(bound);
            let value = self
                .words
                .binding(bound)
                .ok_or_else(|| StackError::UnknownWord(bound.to_string()))?;
            self.push_raw(value);
            return Ok(());
        }

        if let Some(reference) = name.strip_prefix('$').filter(|n| !n.is_empty()) {
            if let Some(n) = stack_index(name) {
                let value = self.peek_at(n).cloned().ok_or(StackError::Underflow)?;
                self.push_raw(value);
                return Ok(());
            }
            let entry = self
                .words
                .bound(reference)
                .cloned()
                .ok_or_else(|| StackError::UnknownWord(reference.to_string()))?;
            return self.run_entry(reference, entry).await;
        }

        let entry = match self.words.lookup(name, &self.top().items) {
            Lookup::Found(entry) => entry.clone(),
            Lookup::Mismatch { needs } => {
                let items = self.items();
                if items.len() < needs {
                    return Err(StackError::Underflow);
                }
                let found = items
                    .iter()
                    .rev()
                    .take(3)
                    .rev()
                    .map(|v| v.stype().as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(StackError::SignatureMismatch {
                    word: name.to_string(),
                    found,
                });
            }
            Lookup::NotFound => {
                self.push_raw(StackValue::string(name));
                return Ok(());
            }
        };
        self.run_entry(name, entry).await
    }

    async fn run_entry(&mut self, name: &str, entry: WordEntry) -> Result<()> {
        trace!(word = name, depth = self.frames.len(), nesting = self.eval_depth, "dispatch");
        match entry.handler {
            WordHandler::Sync(f) => {
                if let Some(value) = f(self, name)? {
                    self.push_raw(value);
                }
            }
            WordHandler::Async(f) => {
                self.enter()?;
                let result = f(self, name).await;
                self.leave();
                if let Some(value) = result? {
                    self.push_raw(value);
                }
            }
            WordHandler::Macro(body) => {
                self.enter()?;
                let result = self.push_values(body).await;
                self.leave();
                result?;
            }
            WordHandler::Constant(value) => self.push_raw(value),
        }
        Ok(())
    }

    /// Evaluates `values` in an isolated frame and returns what it left.
    pub async fn eval_child(&mut self, values: Vec<StackValue>) -> Result<Vec<StackValue>> {
        self.eval_with(Vec::new(), values).await
    }

    /// Like [`QueryStack::eval_child`], with `args` pushed undispatched first.
    pub async fn eval_with(&mut self, args: Vec<StackValue>, body: Vec<StackValue>) -> Result<Vec<StackValue>> {
        self.enter()?;
        let depth = self.frames.len();
        let mut frame = Frame::new(FrameKind::Eval);
        frame.items = args;
        self.frames.push(frame);
        let result = self.push_values(body).await;
        self.leave();
        let unclosed = self.frames.len() > depth + 1;
        let items = self.frames.drain(depth..).next().map(|f| f.items).unwrap_or_default();
        result?;
        if unclosed {
            return Err(StackError::UnclosedScope);
        }
        Ok(items)
    }

    /// Tokenizes and executes `text`. On error the stack keeps whatever the
    /// preceding instructions left.
    pub async fn run(&mut self, text: &str) -> std::result::Result<(), QueryError> {
        let tokens = Tokenizer::new(text).tokenize()?;
        debug!(tokens = tokens.len(), "run");
        for spanned in tokens {
            let located = |error| QueryError::At {
                line: spanned.line,
                col: spanned.col,
                token: spanned.token.to_string(),
                error,
            };
            let value = token_to_value(&spanned).map_err(located)?;
            self.push(value).await.map_err(located)?;
        }
        Ok(())
    }

    /// [`QueryStack::run`] bounded by a timeout covering the whole run. On
    /// expiry any scope the run left open is discarded; root items stay.
    pub async fn run_with_timeout(&mut self, text: &str, timeout: Duration) -> std::result::Result<(), QueryError> {
        match tokio::time::timeout(timeout, self.run(text)).await {
            Ok(result) => result,
            Err(_) => {
                self.frames.truncate(1);
                self.select_es = None;
                self.eval_depth = 0;
                Err(QueryError::Timeout(timeout))
            }
        }
    }
}

/// `$3` is the item three places below the top.
fn stack_index(reference: &str) -> Option<usize> {
    let digits = reference.strip_prefix('$')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub(crate) fn pairs_to_map(items: Vec<StackValue>) -> Result<BTreeMap<String, StackValue>> {
    if items.len() % 2 != 0 {
        return Err(StackError::invalid("map literal needs key/value pairs"));
    }
    let mut map = BTreeMap::new();
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        let key = match key {
            StackValue::Value(Value::String(s)) | StackValue::Word(s) => s,
            StackValue::Value(v) => v.to_string(),
            other => return Err(StackError::invalid(format!("invalid map key: {}", other.stype()))),
        };
        map.insert(key, value);
    }
    Ok(map)
}

/// Regex flags are applied through the builder; `g` and `u` are accepted and
/// ignored.
fn build_regex(pattern: &str, flags: &str) -> Result<regex::Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'g' | 'u' => &mut builder,
            other => return Err(StackError::invalid(format!("unknown regex flag: {other}"))),
        };
    }
    builder
        .build()
        .map_err(|e| StackError::invalid(format!("invalid regex: {e}")))
}

fn token_to_value(spanned: &SpannedToken) -> Result<StackValue> {
    let value = match &spanned.token {
        Token::Int(n) => StackValue::Value(Value::from(*n)),
        Token::Float(n) => StackValue::Value(Value::from(*n)),
        Token::Str(s) | Token::Key(s) => StackValue::string(s.clone()),
        Token::Bool(b) => StackValue::Value(Value::Bool(*b)),
        Token::Null => StackValue::Value(Value::Null),
        Token::Regex { pattern, flags } => StackValue::Regex(build_regex(pattern, flags)?),
        Token::Date(text) => {
            let dt = parse_datetime(text)
                .or_else(|| text.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis))
                .ok_or_else(|| StackError::invalid(format!("invalid date: {text}")))?;
            StackValue::DateTime(dt)
        }
        Token::Word(w) => StackValue::Word(w.clone()),
        Token::Eof => return Err(StackError::UnexpectedWord("EOF".into())),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn on_add(stack: &mut QueryStack, _: &str) -> WordResult {
        let b = stack.pop()?.into_value()?;
        let a = stack.pop()?.into_value()?;
        let sum = a.as_i64().unwrap_or_default() + b.as_i64().unwrap_or_default();
        Ok(Some(json!(sum).into()))
    }

    fn on_add_list(stack: &mut QueryStack, _: &str) -> WordResult {
        let item = stack.pop()?;
        let mut list = stack.pop()?.into_list()?;
        list.push(item);
        Ok(Some(StackValue::List(list)))
    }

    fn on_sleep<'a>(_: &'a mut QueryStack, _: &'a str) -> BoxFuture<'a, WordResult> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        })
    }

    fn stack() -> QueryStack {
        let mut words = WordTable::new();
        words.register("+", &[SType::Value, SType::Value], WordHandler::Sync(on_add));
        words.register("+", &[SType::List, SType::Any], WordHandler::Sync(on_add_list));
        QueryStack::with_words(words)
    }

    fn values(stack: &QueryStack) -> Vec<Value> {
        stack.items().iter().map(StackValue::to_json).collect()
    }

    #[tokio::test]
    async fn test_literals_are_not_evaluated() {
        let mut s = stack();
        s.run("[2 3 +]").await.unwrap();
        assert_eq!(s.len(), 1);
        assert_eq!(
            s.peek(),
            Some(&StackValue::List(vec![json!(2).into(), json!(3).into(), StackValue::Word("+".into())]))
        );
    }

    #[tokio::test]
    async fn test_dispatch_by_signature() {
        let mut s = stack();
        s.run("2 3 + [1] 4 +").await.unwrap();
        assert_eq!(values(&s), vec![json!(5), json!([1, 4])]);
    }

    #[tokio::test]
    async fn test_unknown_words_push_strings() {
        let mut s = stack();
        s.run("hello").await.unwrap();
        assert_eq!(s.peek(), Some(&StackValue::string("hello")));
    }

    #[tokio::test]
    async fn test_map_literal() {
        let mut s = stack();
        s.run(r#"{ "@e": 14, name: "x", nested: [1 {a: 2}] }"#).await.unwrap();
        assert_eq!(values(&s), vec![json!({ "@e": 14, "name": "x", "nested": [1, { "a": 2 }] })]);
    }

    #[tokio::test]
    async fn test_odd_map_literal_fails() {
        let mut s = stack();
        let err = s.run("{ a }").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_mismatched_closer() {
        let mut s = stack();
        let err = s.run("[1 2 }").await.unwrap_err();
        let QueryError::At { line, col, token, error } = err else { panic!("expected located error") };
        assert_eq!((line, col, token.as_str()), (1, 6, "}"));
        assert!(matches!(error, StackError::UnexpectedWord(w) if w == "}"));
    }

    #[tokio::test]
    async fn test_underflow_and_mismatch() {
        let mut s = stack();
        let err = s.run("1 +").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::Underflow)));

        let mut s = stack();
        s.run("~r/a/ ~r/b/").await.unwrap();
        let err = s.run("+").await.unwrap_err();
        assert!(matches!(
            err.stack_error(),
            Some(StackError::SignatureMismatch { word, found }) if word == "+" && found == "regex, regex"
        ));
    }

    #[tokio::test]
    async fn test_error_leaves_stack_until_cleared() {
        let mut s = stack();
        assert!(s.run("1 2 [3 ~r/(/").await.is_err());
        assert_eq!(s.depth(), 2);
        s.clear();
        assert_eq!(s.depth(), 1);
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn test_bindings() {
        let mut s = stack();
        s.words_mut().define("two", WordHandler::Constant(json!(2).into()));
        s.words_mut().define("three", WordHandler::Macro(vec![json!(1).into(), json!(2).into(), StackValue::Word("+".into())]));
        s.run("two three ^three").await.unwrap();
        assert_eq!(values(&s), vec![json!(2), json!(3), json!([1, 2, "+"])]);

        let err = s.run("^nope").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::UnknownWord(w)) if w == "nope"));
    }

    #[tokio::test]
    async fn test_dollar_runs_bindings() {
        let mut s = stack();
        s.words_mut().define("two", WordHandler::Constant(json!(2).into()));
        s.words_mut().define("three", WordHandler::Macro(vec![json!(1).into(), json!(2).into(), StackValue::Word("+".into())]));
        s.run("$two $three [ $two ]").await.unwrap();
        assert_eq!(values(&s), vec![json!(2), json!(3), json!(["$two"])]);

        let err = s.run("$nope").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::UnknownWord(w)) if w == "nope"));
    }

    #[tokio::test]
    async fn test_positional_references() {
        let mut s = stack();
        s.run("10 20 30 $2").await.unwrap();
        assert_eq!(values(&s), vec![json!(10), json!(20), json!(30), json!(10)]);
        assert!(matches!(s.run("$9").await.unwrap_err().stack_error(), Some(StackError::Underflow)));
    }

    #[tokio::test]
    async fn test_carets_resolve_while_building_literals() {
        let mut s = stack();
        s.run(r#"11 3 7 [ "member" { channel: ^^$0, client: ^^$0 } ^$0 ^^$0 ]"#).await.unwrap();
        assert_eq!(
            values(&s),
            vec![json!(["member", { "channel": 7, "client": 3 }, 11, "^^$0"])]
        );

        let mut s = stack();
        s.words_mut().define("two", WordHandler::Constant(json!(2).into()));
        s.run("[ ^two ^$two ]").await.unwrap();
        assert_eq!(values(&s), vec![json!([2, 2])]);

        let mut s = stack();
        let err = s.run("[ ^$0 ]").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::Underflow)));
    }

    #[tokio::test]
    async fn test_deferred_caret_reads_the_caller_stack() {
        let mut s = stack();
        s.run("5 [ *^$0 1 + ]").await.unwrap();
        let body = s.pop().unwrap().into_list().unwrap();
        assert_eq!(body[0], StackValue::Word("^$0".into()));

        let out = s.eval_child(body).await.unwrap();
        assert_eq!(out, vec![StackValue::from(json!(6))]);
        assert!(s.is_empty());

        let err = s.run("1 ^$0").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_self_referencing_macro_hits_recursion_limit() {
        let mut s = stack();
        s.words_mut().define("x", WordHandler::Macro(vec![StackValue::Word("x".into())]));
        let err = s.run_with_timeout("x", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::RecursionLimit(MAX_EVAL_DEPTH))));

        // the nesting count unwinds with the error
        s.run("1 2 +").await.unwrap();
        assert_eq!(values(&s), vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_eval_child_is_isolated() {
        let mut s = stack();
        s.run("1").await.unwrap();
        let out = s
            .eval_child(vec![json!(2).into(), json!(3).into(), StackValue::Word("+".into())])
            .await
            .unwrap();
        assert_eq!(out, vec![StackValue::from(json!(5))]);
        assert_eq!(values(&s), vec![json!(1)]);

        let err = s.eval_child(vec![StackValue::Word("[".into())]).await.unwrap_err();
        assert!(matches!(err, StackError::UnclosedScope));
        assert_eq!(s.depth(), 1);
    }

    #[tokio::test]
    async fn test_regex_and_date_literals() {
        let mut s = stack();
        s.run("~r/^Do/i ~d/2021-03-04/").await.unwrap();
        let StackValue::Regex(re) = s.peek_at(1).unwrap() else { panic!("expected regex") };
        assert!(re.is_match("do some shopping"));
        assert_eq!(s.peek().unwrap().to_json(), json!("2021-03-04T00:00:00.000Z"));

        assert!(s.run("~r/x/q").await.is_err());
        assert!(s.run("~d/not a date/").await.is_err());
    }

    #[tokio::test]
    async fn test_run_with_timeout() {
        let mut s = stack();
        s.run_with_timeout("1 2 +", Duration::from_secs(5)).await.unwrap();
        assert_eq!(values(&s), vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_run_with_timeout_expires() {
        let mut s = stack();
        s.words_mut().register("sleep", &[], WordHandler::Async(on_sleep));
        let limit = Duration::from_millis(20);
        let err = s.run_with_timeout("1 sleep 2", limit).await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout(d) if d == limit));
        assert!(err.stack_error().is_none());

        assert_eq!(s.depth(), 1);
        assert_eq!(values(&s), vec![json!(1)]);
        s.run("2 +").await.unwrap();
        assert_eq!(values(&s), vec![json!(3)]);
    }
}
