//! Error types for persist-rs.
//!
//! [`PersistError`] covers the failure classes the persistence layer can
//! surface: statements rejected by the driver, validation failures raised
//! before any SQL is issued, decode failures on stored data, transaction
//! lifecycle errors, and configuration problems.

use std::fmt;

use thiserror::Error;

/// A validation failure detected before any SQL is sent to the database.
///
/// # Examples
///
/// ```
/// use persist_rs_core::error::ValidationError;
///
/// let err = ValidationError::new("Task has no property 'colour'", "unknown_property")
///     .with_subject("Task.colour");
/// assert_eq!(err.code, "unknown_property");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The human-readable message.
    pub message: String,
    /// A short code identifying the failure (e.g. "unknown_entity").
    pub code: String,
    /// The entity, property or relation the failure is about, if any.
    pub subject: Option<String>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            subject: None,
        }
    }

    /// Attaches the name of the offending entity, property or relation.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Coarse classification of a [`PersistError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The driver rejected a statement.
    Statement,
    /// The request was invalid and no SQL was issued.
    Validation,
    /// Stored data could not be decoded.
    Consistency,
    /// A transaction could not be started, committed or rolled back.
    Transaction,
    /// Settings could not be loaded.
    Configuration,
    /// An I/O failure.
    Io,
}

/// The primary error type for persist-rs.
#[derive(Error, Debug)]
pub enum PersistError {
    /// The database rejected a SQL statement.
    #[error("Statement error: {0}")]
    StatementError(String),

    /// A request referenced something the metadata does not describe, or
    /// asked for an operation the metadata forbids.
    #[error("Validation error: {0}")]
    ValidationError(ValidationError),

    /// A stored value could not be decoded (e.g. malformed JSON).
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    /// A transaction lifecycle failure.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PersistError {
    /// Shorthand for building a [`PersistError::ValidationError`].
    pub fn validation(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::ValidationError(ValidationError::new(message, code))
    }

    /// Returns the coarse kind of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::StatementError(_) => ErrorKind::Statement,
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::ConsistencyError(_) => ErrorKind::Consistency,
            Self::TransactionError(_) => ErrorKind::Transaction,
            Self::ConfigurationError(_) => ErrorKind::Configuration,
            Self::IoError(_) => ErrorKind::Io,
        }
    }
}

impl From<ValidationError> for PersistError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationError(err)
    }
}

/// A convenience type alias for `Result<T, PersistError>`.
pub type PersistResult<T> = Result<T, PersistError>;
