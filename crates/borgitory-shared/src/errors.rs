//! # Error Types
//!
//! One library-wide error enum plus the `BorgitoryResult` alias used across
//! both crates. Task executors do not surface these directly to callers:
//! they fold failures into task outcomes and let the composite runner decide
//! the job's terminal status. The variants here cover the API boundary and
//! infrastructure failures.

use std::time::Duration;

/// Result alias used throughout the workspace
pub type BorgitoryResult<T> = Result<T, BorgitoryError>;

/// Library-wide error type
#[derive(Debug, thiserror::Error)]
pub enum BorgitoryError {
    /// Bad input to the public API (unknown repository, malformed task spec).
    /// Surfaced synchronously; no job is created.
    #[error("validation error: {0}")]
    Validation(String),

    /// A child process could not be started
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A blocking operation exceeded its declared deadline
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by a stop request
    #[error("cancelled")]
    Cancelled,

    /// Database read or write failed
    #[error("database error during {operation}: {source}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Credential material could not be decrypted
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Both admission queues are at the absolute backlog cap
    #[error("queue backlog cap reached, job rejected")]
    QueueFull,

    /// IO error outside of child-process handling
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BorgitoryError {
    /// Shorthand for database errors, naming the failed operation
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    /// Shorthand for spawn failures, capturing the program name
    pub fn spawn(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            command: command.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = BorgitoryError::Validation("unknown repository 7".to_string());
        assert_eq!(err.to_string(), "validation error: unknown repository 7");

        let err = BorgitoryError::NotFound {
            entity: "repository",
            id: "7".to_string(),
        };
        assert_eq!(err.to_string(), "repository not found: 7");

        let err = BorgitoryError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().starts_with("timeout after"));
    }

    #[test]
    fn test_spawn_error_carries_command() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = BorgitoryError::spawn("borg", io);
        assert!(err.to_string().contains("borg"));
    }
}
