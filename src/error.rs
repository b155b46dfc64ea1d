//! Error types shared across the engine.

use thiserror::Error;

/// Position-aware failure while parsing an expression.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("parse error at {line}:{col}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, col: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            col,
            message: message.into(),
        }
    }
}

/// Runtime failure during expression evaluation.
///
/// Caught per evaluation: the owning alarm records it in `last_error` and
/// keeps running. Never propagates past `process_record`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("divide by zero")]
    DivideByZero,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("variable \"{0}\" has no value yet")]
    UnboundVariable(String),

    #[error("{0} requires {1} operand(s)")]
    MissingOperands(&'static str, usize),

    #[error("expression left {0} operands on the stack")]
    Unbalanced(usize),

    #[error("{0}")]
    Function(String),
}

/// Failure while reading configuration XML.
///
/// The manager accumulates these per element and loads what it can.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("missing element <{0}>")]
    MissingElement(&'static str),

    #[error("missing attribute \"{0}\"")]
    MissingAttribute(&'static str),

    #[error("invalid value \"{value}\" for attribute \"{attr}\"")]
    InvalidAttribute { attr: &'static str, value: String },

    #[error("unknown test type \"{0}\"")]
    UnknownTestType(String),

    #[error("unknown action type \"{0}\"")]
    UnknownActionType(String),

    #[error("invalid no data interval specified")]
    InvalidInterval,

    #[error("invalid log baling parameters")]
    InvalidLogParams,

    #[error("alarm \"{name}\": {source}")]
    Alarm {
        name: String,
        #[source]
        source: Box<ConfigError>,
    },

    #[error(transparent)]
    Expression(#[from] ParseError),
}
