//! Error types for cosync Core

use thiserror::Error;

/// Core error types
///
/// Every variant is a contract violation: the offending transaction is
/// aborted and nothing is partially applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Unsupported patch: {0}")]
    UnsupportedPatch(String),

    #[error("Full document replacement is not supported by granular sync")]
    FullReplacementUnsupported,

    #[error("Traversal error: {0}")]
    Traversal(String),
}

/// Result type alias for cosync Core operations
pub type Result<T> = std::result::Result<T, Error>;
