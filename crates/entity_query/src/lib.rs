//! # entity_query
//!
//! A small stack language for building and querying entity sets.
//!
//! Source text is split by the [`tokenizer`] into literals and words. Literals
//! are pushed onto a [`QueryStack`]; words are looked up in a [`WordTable`]
//! by name and by the types on top of the stack, then run. `[ ]` and `{ }`
//! collect their contents unevaluated into lists and maps.
//!
//! ```text
//! !es
//! [ "/component/title" ["text"] ] !d +
//! [ "/component/title" { text: "get milk" } ] !c +
//! [ /component/title#/text !ca ~r/milk/ == ] select
//! ```
//!
//! Inside `select`, comparisons against a component attribute build
//! [`Filter`] values, which [`filter::compile`] lowers to an
//! [`entity_store::FilterExpr`].

pub mod error;
pub mod filter;
pub mod stack;
pub mod tokenizer;
pub mod value;
pub mod words;

use std::sync::Arc;

use entity_store::EntitySetRef;

pub use error::{QueryError, StackError};
pub use stack::{MAX_EVAL_DEPTH, QueryStack, WordHandler, WordTable};
pub use value::{ComponentAttr, Filter, FilterOp, SType, StackValue};
pub use words::select::select;
pub use words::{create_stack, standard_words};

/// Runs `text` on a fresh stack holding `es` and returns what is left. The
/// entity set itself is dropped from the bottom if it is still there.
pub async fn query(es: EntitySetRef, text: &str) -> Result<Vec<StackValue>, QueryError> {
    let mut stack = create_stack();
    stack.push_raw(StackValue::EntitySet(es.clone()));
    stack.run(text).await?;

    let mut items = stack.items().to_vec();
    if matches!(items.first(), Some(StackValue::EntitySet(first)) if Arc::ptr_eq(first, &es)) {
        items.remove(0);
    }
    Ok(items)
}
