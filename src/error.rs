//! # Error Taxonomy
//!
//! Every public operation returns a [`Result`] carrying a flat [`Error`]
//! taxonomy. Errors are values, never panics; internal layers propagate them
//! with `?` up to the API boundary.
//!
//! Two variants double as control signals rather than failures:
//!
//! - [`Error::Internal`] is returned when a transaction cursor has been
//!   uncoupled by a commit-flush; the coordinator catches it and re-resolves
//!   the cursor against the btree.
//! - [`Error::KeyNotFound`] from a single op chain only suppresses that
//!   chain; merged traversal continues with the next key.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes surfaced by every public operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested key does not exist (or is erased under the caller's
    /// transaction view).
    #[error("key not found")]
    KeyNotFound,

    /// Insert without `OVERWRITE` hit an existing key.
    #[error("duplicate key")]
    DuplicateKey,

    /// The cursor is not positioned on anything.
    #[error("cursor is nil")]
    CursorIsNil,

    /// Commit, abort or close was attempted while cursors are still
    /// attached.
    #[error("cursor still open")]
    CursorStillOpen,

    /// A caller-supplied parameter is out of range or inconsistent.
    #[error("invalid parameter: {0}")]
    InvParameter(&'static str),

    /// An allocation request could not be satisfied.
    #[error("out of memory")]
    OutOfMemory,

    /// The file backend failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Reserved for the remote protocol shim.
    #[error("network error")]
    NetworkError,

    /// The operation is not available in this build (encryption,
    /// compression, duplicate records).
    #[error("not implemented")]
    NotImplemented,

    /// A consistency signal; callers with a retry path (cursor
    /// re-coupling) recover, everyone else treats it as corruption.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// No database with this name exists in the environment.
    #[error("database {0} not found")]
    DatabaseNotFound(u16),

    /// `create_db` hit a name that is already in the database table.
    #[error("database {0} already exists")]
    DatabaseAlreadyExists(u16),

    /// The key exceeds the width configured for the database.
    #[error("key too large: {size} bytes (limit {limit})")]
    KeyTooLarge { size: usize, limit: usize },
}

impl Error {
    /// True for the deliberate retry signal emitted by uncoupled
    /// transaction cursors.
    pub fn is_retry_signal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}
