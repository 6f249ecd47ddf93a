//! Query error type shared by the compiler, the pipeline and the cursor layer.

use std::fmt;
use thiserror::Error;

/// Result type alias using [`QueryError`]
pub type Result<T> = std::result::Result<T, QueryError>;

/// Error classes reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorCode {
    /// Malformed or unknown arguments
    ParseArgs,
    /// Semantically invalid request
    Inval,
    /// A configured limit was exceeded
    Limit,
    /// Referenced property does not exist
    NoPropKey,
    /// Output name declared more than once
    DupField,
    /// Unknown reducer function
    NoReducer,
    /// Expression failed to parse or evaluate
    Expr,
    /// Query syntax error
    Syntax,
    /// Execution exceeded its time budget
    Timeout,
    /// Request does not match the index it is bound to
    Mismatch,
    /// Name collides with a schema field
    IndexExists,
    /// Cursor id is unknown or expired
    NoCursor,
}

impl fmt::Display for QueryErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryErrorCode::ParseArgs => "Parsing/Evaluating dynamic query arguments failed",
            QueryErrorCode::Inval => "Invalid argument",
            QueryErrorCode::Limit => "Limit exceeded",
            QueryErrorCode::NoPropKey => "Property not loaded nor in schema",
            QueryErrorCode::DupField => "Duplicate field",
            QueryErrorCode::NoReducer => "No such reducer",
            QueryErrorCode::Expr => "Expression error",
            QueryErrorCode::Syntax => "Syntax error",
            QueryErrorCode::Timeout => "Timeout limit was reached",
            QueryErrorCode::Mismatch => "Index mismatch",
            QueryErrorCode::IndexExists => "Property already exists in schema",
            QueryErrorCode::NoCursor => "Cursor not found",
        };
        f.write_str(s)
    }
}

/// A query error with its class and a precise message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct QueryError {
    pub code: QueryErrorCode,
    pub message: String,
}

impl QueryError {
    pub fn new(code: QueryErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            message: msg.into(),
        }
    }

    /// Create an argument parsing error
    pub fn parse_args(msg: impl Into<String>) -> Self {
        Self::new(QueryErrorCode::ParseArgs, msg)
    }

    /// Create an invalid-request error
    pub fn inval(msg: impl Into<String>) -> Self {
        Self::new(QueryErrorCode::Inval, msg)
    }

    /// Create a limit error
    pub fn limit(msg: impl Into<String>) -> Self {
        Self::new(QueryErrorCode::Limit, msg)
    }

    /// Create a missing-property error
    pub fn no_prop(msg: impl Into<String>) -> Self {
        Self::new(QueryErrorCode::NoPropKey, msg)
    }

    /// `Property `name` specified more than once`
    pub fn dup_field(name: &str) -> Self {
        Self::new(
            QueryErrorCode::DupField,
            format!("Property `{}` specified more than once", name),
        )
    }

    /// `Property `name` already exists in schema`
    pub fn index_exists(name: &str) -> Self {
        Self::new(
            QueryErrorCode::IndexExists,
            format!("Property `{}` already exists in schema", name),
        )
    }

    /// Create an expression error
    pub fn expr(msg: impl Into<String>) -> Self {
        Self::new(QueryErrorCode::Expr, msg)
    }

    /// Create a query syntax error
    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::new(QueryErrorCode::Syntax, msg)
    }

    pub fn timeout() -> Self {
        Self::new(QueryErrorCode::Timeout, QueryErrorCode::Timeout.to_string())
    }

    /// `Unknown argument `x` at position n for <ctx>`
    pub fn unknown_arg(arg: &str, pos: usize, context: &str) -> Self {
        Self::parse_args(format!(
            "Unknown argument `{}` at position {} for {}",
            arg, pos, context
        ))
    }

    /// Error code accessor
    pub fn code(&self) -> QueryErrorCode {
        self.code
    }
}
