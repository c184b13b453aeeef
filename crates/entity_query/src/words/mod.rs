//! The standard word library.
//!
//! Each module registers its words with [`WordTable::register`], one entry
//! per accepted signature.

pub mod base;
pub mod entity;
pub mod list;
pub mod select;

use crate::stack::{AsyncWordFn, QueryStack, SyncWordFn, WordHandler, WordTable};

pub(crate) fn sync(f: SyncWordFn) -> WordHandler {
    WordHandler::Sync(f)
}

pub(crate) fn suspend(f: AsyncWordFn) -> WordHandler {
    WordHandler::Async(f)
}

/// Every built-in word.
#[must_use]
pub fn standard_words() -> WordTable {
    let mut words = WordTable::new();
    base::register(&mut words);
    list::register(&mut words);
    entity::register(&mut words);
    select::register(&mut words);
    words
}

/// A fresh stack with the standard library loaded.
#[must_use]
pub fn create_stack() -> QueryStack {
    QueryStack::with_words(standard_words())
}
