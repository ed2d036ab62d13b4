//! Stable error kinds, per spec section 7. Names match the spec exactly so
//! callers (and tests) can match on them without needing string parsing.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no such database: {0}")]
    NoSuchDatabase(String),

    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("no such field: {0}")]
    NoSuchField(String),

    #[error("no current database")]
    NoCurrentDatabase,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("not null violation: field {0}")]
    NotNullViolation(String),

    #[error("varchar too long: max {max}, got {got}")]
    VarcharTooLong { max: usize, got: usize },

    #[error("duplicate key")]
    Duplicate,

    #[error("foreign key references a row that does not exist")]
    ForeignMissing,

    #[error("row is still referenced by a foreign key")]
    ForeignReferenced,

    #[error("corrupted metadata in {0}")]
    CorruptedMeta(String),

    #[error("io error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e.to_string())
    }
}

/// Fatal errors exit the process after cleanup (spec section 7): a
/// signature mismatch on a file known to be populated, or page-pool
/// exhaustion.
impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CorruptedMeta(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
