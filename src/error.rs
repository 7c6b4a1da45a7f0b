//! Engine error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while resolving, dispatching or checking a step.
///
/// Every variant maps onto an [`ErrorKind`] so that a step result can
/// carry a reporting tag without holding on to the error itself.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed definition: bad method, unknown comparator or
    /// operation, missing required field.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("variable not found: ${0}")]
    VariableNotFound(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// A registered or built-in function returned an error.
    #[error("function '{name}' failed: {message}")]
    Function { name: String, message: String },

    /// Transport failure or driver fault.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// A referenced field is missing from the backend outcome.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Raised by assert-style UI operations whose condition does not
    /// hold.
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("case '{0}' quotes itself (cycle: {1})")]
    RecursiveQuote(String, String),

    #[error("case not found: {0}")]
    CaseNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialisable classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    VariableNotFound,
    Function,
    Backend,
    Timeout,
    Extraction,
    Assertion,
    Io,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Configuration(_)
            | EngineError::FunctionNotFound(_)
            | EngineError::RecursiveQuote(..)
            | EngineError::CaseNotFound(_) => ErrorKind::Configuration,
            EngineError::VariableNotFound(_) => ErrorKind::VariableNotFound,
            EngineError::Function { .. } => ErrorKind::Function,
            EngineError::Backend(_) => ErrorKind::Backend,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Extraction(_) => ErrorKind::Extraction,
            EngineError::Assertion(_) => ErrorKind::Assertion,
            EngineError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        EngineError::Backend(message.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
