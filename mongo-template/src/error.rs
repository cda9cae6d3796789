//! Error types for template operations.

use std::fmt;

use thiserror::Error;

/// Result type for template operations.
pub type MongoResult<T> = Result<T, MongoError>;

/// Errors that can occur during template operations.
#[derive(Error, Debug)]
pub enum MongoError {
    /// MongoDB driver error.
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    /// BSON serialization error.
    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    /// BSON deserialization error.
    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    /// The record type does not name a database.
    #[error("record type `{0}` has no database reference")]
    MissingDatabase(&'static str),

    /// The record type does not name a collection.
    #[error("record type `{0}` has no collection reference")]
    MissingCollection(&'static str),

    /// A document with every field unset was passed where content is required.
    #[error("document is empty")]
    EmptyDocument,

    /// An empty slice was passed where at least one item is required.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Session or transaction error raised outside the driver.
    #[error("session error: {0}")]
    Session(String),

    /// Query execution error.
    #[error("query error: {0}")]
    Query(String),

    /// No document matched the filter.
    #[error("document not found: {0}")]
    NotFound(String),

    /// One or more items of a bulk write failed.
    #[error("{0}")]
    Bulk(BulkWriteFailure),

    /// Configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML.
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MongoError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an empty input error.
    pub fn empty_input(message: impl Into<String>) -> Self {
        Self::EmptyInput(message.into())
    }

    /// Check if this error was raised before any driver call was made.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::MissingDatabase(_)
                | Self::MissingCollection(_)
                | Self::EmptyDocument
                | Self::EmptyInput(_)
                | Self::Config(_)
        )
    }

    /// Check if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Get the per-item failures of a bulk write, if this is one.
    pub fn bulk_failure(&self) -> Option<&BulkWriteFailure> {
        match self {
            Self::Bulk(failure) => Some(failure),
            _ => None,
        }
    }
}

/// A failed item of a bulk write.
#[derive(Debug)]
pub struct BulkItemError {
    /// Position of the item in the input slice.
    pub index: usize,
    /// Why the item failed.
    pub error: MongoError,
}

/// Aggregated failures of a bulk write.
///
/// Items not listed here were written (or at least not rejected).
#[derive(Debug, Default)]
pub struct BulkWriteFailure {
    /// Failed items, in input order.
    pub errors: Vec<BulkItemError>,
    /// Number of items attempted.
    pub attempted: usize,
}

impl BulkWriteFailure {
    /// Indexes of the items that failed.
    pub fn failed_indexes(&self) -> Vec<usize> {
        self.errors.iter().map(|e| e.index).collect()
    }
}

impl fmt::Display for BulkWriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} items failed",
            self.errors.len(),
            self.attempted
        )?;
        for item in &self.errors {
            write!(f, "; index {}: {}", item.index, item.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MongoError::config("invalid URI");
        assert!(matches!(err, MongoError::Config(_)));
        assert!(err.is_config_error());

        let err = MongoError::session("commit failed");
        assert!(!err.is_config_error());

        let err = MongoError::not_found("user");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_error_display() {
        let err = MongoError::config("test error");
        assert_eq!(err.to_string(), "configuration error: test error");

        let err = MongoError::MissingCollection("User");
        assert_eq!(
            err.to_string(),
            "record type `User` has no collection reference"
        );
    }

    #[test]
    fn test_bulk_failure_display_lists_indexes() {
        let failure = BulkWriteFailure {
            errors: vec![
                BulkItemError {
                    index: 1,
                    error: MongoError::EmptyDocument,
                },
                BulkItemError {
                    index: 3,
                    error: MongoError::query("duplicate key"),
                },
            ],
            attempted: 4,
        };

        assert_eq!(failure.failed_indexes(), vec![1, 3]);

        let err = MongoError::Bulk(failure);
        assert_eq!(
            err.to_string(),
            "2 of 4 items failed; index 1: document is empty; index 3: query error: duplicate key"
        );
        assert!(err.bulk_failure().is_some());
    }
}
