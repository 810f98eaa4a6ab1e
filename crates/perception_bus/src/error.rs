//! Error types for the perception bus.
//!
//! Most filter operations follow a "keep serving" policy: protocol and logic
//! errors are logged and the offending step is skipped. The enums below name
//! those failures so they can be logged consistently, and are returned
//! directly by the `Result`-flavoured decode entry points.

use crate::types::{Oid, SubscriptionHandle};

/// Failures while reading or writing the binary wire format.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WireError {
    /// The buffer ended before a complete value could be read
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    /// A string payload was not valid UTF-8
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    /// A length prefix was negative
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),
    /// A property value carried a type tag this decoder does not know
    #[error("unknown property value tag: {0}")]
    UnknownValueTag(u8),
    /// The format sentinel did not match
    #[error("format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: i32, found: i32 },
    /// A filter update carried an opcode outside ADD/REMOVE/SET
    #[error("unknown filter update opcode: {0}")]
    UnknownOpCode(i32),
    /// A client string triple could not be parsed
    #[error("malformed client property '{key}': {reason}")]
    MalformedClientValue { key: String, reason: String },
}

/// Failures while applying one filter update instruction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UpdateError {
    #[error("unsupported filter update operation {op} on field {field}")]
    UnsupportedOp { op: &'static str, field: &'static str },
    #[error("unknown filter update field id {0}")]
    UnknownField(i32),
    #[error("subject {0} is not present")]
    MissingSubject(Oid),
    #[error("target {0} is not present")]
    MissingTarget(Oid),
    #[error("subject {0} is already present")]
    DuplicateSubject(Oid),
}

/// Errors surfaced by [`crate::bus::LocalBus`].
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionHandle),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
