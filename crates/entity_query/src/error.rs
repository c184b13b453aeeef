use std::time::Duration;

use entity_store::StoreError;
use thiserror::Error;

use crate::tokenizer::LexError;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("unknown word: {0}")]
    UnknownWord(String),

    #[error("no signature of '{word}' matches stack [{found}]")]
    SignatureMismatch { word: String, found: String },

    #[error("stack underflow")]
    Underflow,

    #[error("unexpected word: {0}")]
    UnexpectedWord(String),

    #[error("unclosed scope")]
    UnclosedScope,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no entity set in scope")]
    NoEntitySet,

    #[error("evaluation nested deeper than {0} levels")]
    RecursionLimit(usize),

    #[error("tokenize error: {0}")]
    Tokenize(#[from] LexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StackError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// A failed run, located at the instruction that raised it.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{line}:{col}: '{token}': {error}")]
    At {
        line: usize,
        col: usize,
        token: String,
        #[source]
        error: StackError,
    },

    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

impl QueryError {
    /// The stack error behind a located failure.
    #[must_use]
    pub fn stack_error(&self) -> Option<&StackError> {
        match self {
            Self::At { error, .. } => Some(error),
            Self::Timeout(_) => None,
        }
    }
}

impl From<LexError> for QueryError {
    fn from(err: LexError) -> Self {
        Self::At {
            line: err.line,
            col: err.col,
            token: String::new(),
            error: StackError::Tokenize(err),
        }
    }
}

pub type Result<T, E = StackError> = std::result::Result<T, E>;
