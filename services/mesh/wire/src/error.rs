//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Body ended before all fields were read
    #[error("incomplete packet")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown packet type
    #[error("unknown type {0}")]
    Type(u8),

    /// Negative or implausible element count
    #[error("invalid count {0}")]
    Count(i32),

    /// Negative link cost
    #[error("invalid cost {0}")]
    Cost(i32),

    /// Unknown link purpose
    #[error("invalid purpose {0}")]
    Purpose(i32),

    /// Name is not valid UTF-8
    #[error("name is not valid utf-8")]
    Utf8,

    /// Hop tree nests deeper than allowed
    #[error("tree deeper than {0} levels")]
    TreeDepth(usize),

    /// Bytes left over after the last field of a body
    #[error("malformed packet")]
    Malformed,
}
