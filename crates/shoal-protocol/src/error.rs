//! Protocol error types for RESP tokenizing and command extraction.

use thiserror::Error;

/// Errors that can occur when tokenizing the RESP wire format or deriving
/// a command view from a tokenized unit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete unit yet.
    /// Never surfaced through the public scan API; callers see `Ok(None)`.
    #[error("incomplete unit: need more data")]
    Incomplete,

    /// Failed to parse an integer value from a length prefix or `:` line.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared an invalid length (below -1).
    #[error("invalid length prefix: {0}")]
    InvalidLength(i64),

    /// Bulk string payload was not followed by the `\r\n` terminator.
    #[error("missing line terminator after bulk payload")]
    MissingTerminator,

    /// A bulk string declared a length beyond the allowed maximum.
    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    /// Arrays nested beyond the allowed depth.
    #[error("nesting exceeds maximum depth of {0}")]
    NestingTooDeep(usize),

    /// An array declared more elements than the allowed maximum.
    #[error("too many array elements: {0}")]
    TooManyElements(usize),

    /// A top-level unit whose shape can't be read as a command
    /// (e.g. a null or empty array).
    #[error("unit shape is not a recognizable command")]
    UnrecognizedShape,
}
