//! Error types for compilation and rendering.
//!
//! Compile-time errors (`Lex`, `Parse`, `ExpressionBoundary`, `Xml`) abort the
//! whole template: no partially usable template is ever produced. Runtime
//! errors carry the position of the IR node that raised them.

use thiserror::Error;

/// All errors surfaced by the compiler, the runtime, and the loader.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{file}:{line}: syntax error near {text:?}")]
    Lex {
        file: String,
        line: usize,
        text: String,
    },

    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}:{line}: cannot find the end of braced expression: {message}")]
    ExpressionBoundary {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}:{line}: malformed markup: {message}")]
    Xml {
        file: String,
        line: usize,
        message: String,
    },

    #[error("unknown template {name:?}: {reason}")]
    UnknownTemplate { name: String, reason: String },

    #[error("cannot resolve {name:?}: template has no loader")]
    NoLoader { name: String },

    #[error("{file}:{line}: {source}")]
    Runtime {
        file: String,
        line: usize,
        #[source]
        source: EvalError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while evaluating an expression or host-code statement.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("name `{0}` is not defined")]
    Undefined(String),

    #[error("`{type_name}` object has no attribute `{attr}`")]
    NoAttribute { type_name: &'static str, attr: String },

    #[error("{0}")]
    Type(String),

    #[error("`{0}` object is not callable")]
    NotCallable(&'static str),

    #[error("{0}")]
    Arguments(String),

    #[error("division by zero")]
    ZeroDivision,

    #[error("{0}")]
    Index(String),

    #[error("integer overflow")]
    Overflow,

    /// A template function called from an expression failed.
    #[error(transparent)]
    Template(Box<Error>),
}

impl From<Error> for EvalError {
    fn from(err: Error) -> Self {
        EvalError::Template(Box::new(err))
    }
}

impl EvalError {
    /// Attach a source position, unwrapping nested template failures so the
    /// innermost position wins.
    pub(crate) fn at(self, file: &str, line: usize) -> Error {
        match self {
            EvalError::Template(inner) => *inner,
            source => Error::Runtime {
                file: file.to_string(),
                line,
                source,
            },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
