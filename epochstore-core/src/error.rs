//! Error taxonomy for the persistence layer.
//!
//! One enum covers every failure mode surfaced to callers: precondition
//! failures (`EntityAlreadyExists`, `UnsupportedPredicate`, `ValidationFailed`),
//! optimistic-concurrency loss (`Concurrency`), caller cancellation, engine
//! failures, and aggregates raised when a transaction-scope rollback itself
//! fails alongside the original error.

use std::fmt;

/// Errors surfaced by `epochstore-core`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `Create` was called for a key whose current row is live (not soft-deleted).
    #[error("entity already exists: {table}/{key}")]
    EntityAlreadyExists {
        /// Table the entity belongs to.
        table: &'static str,
        /// Serialised key, for diagnostics.
        key: String,
    },

    /// An `Update` observed a stale version, or its target was soft-deleted,
    /// between the caller's read and the write attempt.
    #[error("concurrency conflict on {table}/{key}: expected version {expected}")]
    Concurrency {
        /// Table the entity belongs to.
        table: &'static str,
        /// Serialised key, for diagnostics.
        key: String,
        /// The version the caller believed was current.
        expected: u64,
    },

    /// A predicate referenced a field or operator the translator does not support.
    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    /// A value failed validation before being persisted.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The caller's `CancellationToken` fired while an operation was in flight.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// Name of the operation that was cancelled.
        operation: &'static str,
    },

    /// The SQL engine reported a failure (I/O, constraint, busy-after-timeout).
    #[error("storage failure during {operation}: {source}")]
    Storage {
        /// The operation that was in flight (`"get"`, `"create"`, `"commit"`, ...).
        operation: &'static str,
        /// Underlying engine error.
        #[source]
        source: rusqlite::Error,
    },

    /// Failure reaching the background SQLite worker thread.
    #[error("connection failure during {operation}: {source}")]
    Connection {
        /// The operation that was in flight.
        operation: &'static str,
        /// Underlying connection error.
        #[source]
        source: tokio_rusqlite::Error,
    },

    /// A value could not be serialised or deserialised by the chosen `ValueSerializer`.
    #[error("serialization failure for type {type_tag}: {message}")]
    Serialization {
        /// The serializer's type tag.
        type_tag: &'static str,
        /// Human-readable detail.
        message: String,
    },

    /// Multiple failures bundled together — the canonical case is a
    /// transaction-scope rollback that itself raised errors alongside the
    /// operation that triggered the rollback.
    #[error("{primary}{}", format_causes(causes))]
    Aggregate {
        /// The error that triggered the rollback.
        primary: Box<Error>,
        /// Any errors raised while attempting to undo already-committed operations.
        causes: Vec<Error>,
    },
}

fn format_causes(causes: &[Error]) -> String {
    if causes.is_empty() {
        return String::new();
    }
    let mut out = String::from(" (rollback also failed: ");
    for (i, c) in causes.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&c.to_string());
    }
    out.push(')');
    out
}

impl Error {
    /// Wraps a `rusqlite::Error` with the operation name that produced it.
    pub fn storage(operation: &'static str, source: rusqlite::Error) -> Self {
        Error::Storage { operation, source }
    }

    /// Wraps a `tokio_rusqlite::Error` with the operation name that produced it.
    pub fn connection(operation: &'static str, source: tokio_rusqlite::Error) -> Self {
        Error::Connection { operation, source }
    }

    /// True if this error represents a lost optimistic-concurrency race.
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Error::Concurrency { .. })
    }

    /// Boxes `self` as a `rusqlite::Error::UserFunctionError`, so a domain
    /// error raised inside a `Connection::call` closure — whose return type
    /// is fixed to `rusqlite::Result<T>` — survives the trip through the
    /// background-thread channel instead of being collapsed into a generic
    /// engine failure.
    pub fn into_call_error(self) -> rusqlite::Error {
        rusqlite::Error::UserFunctionError(Box::new(self))
    }

    /// Unwraps the result of a `Connection::call` whose closure used
    /// [`Error::into_call_error`] to report a domain error, recovering the
    /// original [`Error`] rather than a generic connection failure.
    pub fn from_call_result<T>(result: std::result::Result<T, tokio_rusqlite::Error>) -> Result<T> {
        match result {
            Ok(v) => Ok(v),
            Err(tokio_rusqlite::Error::Error(rusqlite::Error::UserFunctionError(boxed))) => {
                match boxed.downcast::<Error>() {
                    Ok(e) => Err(*e),
                    Err(other) => Err(Error::storage("call", rusqlite::Error::UserFunctionError(other))),
                }
            }
            Err(e) => Err(Error::connection("call", e)),
        }
    }
}

/// A result type aliasing [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Caller provenance captured at the call site via `#[track_caller]`.
///
/// Stands in for the "language facility for source location" named in the
/// distilled specification: Rust's `std::panic::Location` gives file/line,
/// and the member name is passed explicitly since `Location` does not carry it.
#[derive(Debug, Clone, Copy)]
pub struct CallerSite {
    /// Source file of the call site.
    pub file: &'static str,
    /// Line number of the call site.
    pub line: u32,
    /// Column number of the call site.
    pub column: u32,
    /// Name of the operation being performed (`"get"`, `"create"`, ...).
    pub member: &'static str,
}

impl CallerSite {
    /// Captures the caller of the function this is invoked from.
    ///
    /// Must be called from a `#[track_caller]` function for `Location::caller()`
    /// to resolve to the *user's* call site rather than this one.
    #[track_caller]
    pub fn capture(member: &'static str) -> Self {
        let loc = std::panic::Location::caller();
        CallerSite {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
            member,
        }
    }
}

impl fmt::Display for CallerSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{} ({})", self.file, self.line, self.column, self.member)
    }
}
