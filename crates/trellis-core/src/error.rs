//! Decoder error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// A configuration parameter failed validation at construction.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The decoding graph cannot be searched (e.g. no start state).
    #[error("graph error: {0}")]
    Graph(String),

    /// An operation was called in a state that does not allow it.
    #[error("usage error: {0}")]
    Usage(String),
}
