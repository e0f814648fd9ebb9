//! Error types for dirqueue
//!
//! This module defines the error hierarchy for the queue:
//! - Filesystem errors carrying the failing syscall, path and OS error
//! - Schema and field codec errors
//! - Usage errors (bad options, bad element names, lock misuse)
//!
//! Design philosophy:
//! - Use thiserror for structured error types in library code
//! - Expected races never surface as errors; the primitive layer absorbs
//!   them and reports a sentinel instead
//! - Preserve the originating syscall and path for debugging

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Unexpected filesystem failure
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),

    /// Schema declaration or field codec error
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Invalid construction or purge option
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Element name does not match the `bucket/element` lexicon
    #[error("invalid element name '{name}'")]
    InvalidName { name: String },

    /// Operation needs a schema but the queue was opened without one
    #[error("queue has no schema")]
    NoSchema,

    /// Element vanished and the caller asked for strict behavior
    #[error("no such element '{name}'")]
    NoSuchElement { name: String },

    /// Lock attempt failed in strict mode
    #[error("element '{name}' is already locked")]
    AlreadyLocked { name: String },

    /// Operation requires the caller to hold the element lock
    #[error("element '{name}' is not locked")]
    NotLocked { name: String },
}

impl QueueError {
    /// Check whether this error is a usage error (caller bug) rather
    /// than an environmental failure
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidOption(_)
                | QueueError::InvalidName { .. }
                | QueueError::NoSchema
                | QueueError::AlreadyLocked { .. }
                | QueueError::NotLocked { .. }
        )
    }
}

/// Unexpected filesystem failures
///
/// Expected races (`EEXIST` on create, `ENOENT` on delete) are absorbed
/// by the primitive wrappers and never reach this type.
#[derive(Error, Debug)]
pub enum FsError {
    /// A syscall failed for a reason the queue protocol cannot absorb
    #[error("{op} '{path}' failed: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A path that must be a directory is occupied by something else
    #[error("not a directory: '{path}'")]
    NotADirectory { path: PathBuf },
}

impl FsError {
    /// The OS errno of the underlying failure, when there is one
    pub fn errno(&self) -> Option<i32> {
        match self {
            FsError::Io { source, .. } => source.raw_os_error(),
            FsError::NotADirectory { .. } => None,
        }
    }
}

/// Schema declaration and field codec errors
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The schema declaration itself is invalid
    #[error("bad schema: {reason}")]
    BadSchema { reason: String },

    /// A supplied field is not part of the schema
    #[error("unknown field '{field}'")]
    UnknownField { field: String },

    /// A supplied value does not match the declared field type
    #[error("field '{field}' expects a {expected} value")]
    InvalidField {
        field: String,
        expected: &'static str,
    },

    /// A value's ownership does not match the field's by-reference
    /// declaration
    #[error("field '{field}' must be passed {expected}")]
    ByRefMismatch {
        field: String,
        expected: &'static str,
    },

    /// A mandatory field is absent, at add or at get
    #[error("mandatory field '{field}' is missing")]
    MissingField { field: String },

    /// A table file on disk does not parse as `key \t value` lines
    #[error("malformed table line '{line}'")]
    MalformedTable { line: String },

    /// Bytes on disk are not valid UTF-8 for a text field
    #[error("field '{field}' is not valid UTF-8")]
    InvalidEncoding { field: String },
}

/// Result type alias for QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

/// Result type alias for FsError
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Result type alias for SchemaError
pub type SchemaResult<T> = std::result::Result<T, SchemaError>;
