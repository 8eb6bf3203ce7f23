use std::path::PathBuf;
use thiserror::Error;

use crate::keys::KeySource;

pub type Result<T> = std::result::Result<T, DropVaultError>;

/// Custom error types for DropVault operations
#[derive(Debug, Error)]
pub enum DropVaultError {
    /// The transfer context lacks the field the configured key source needs
    #[error("missing key context: key source '{key_source}' requires {field}")]
    MissingKeyContext {
        key_source: KeySource,
        field: &'static str,
    },

    /// Ciphertext is truncated or carries an unknown format marker
    #[error("corrupt archive input: {0}")]
    CorruptArchiveInput(String),

    /// A source file disappeared between enqueue and archive-append time
    #[error("source file missing: {}", .0.display())]
    SourceFileMissing(PathBuf),

    /// Disk full, permission denied or any other write-side I/O failure
    #[error("write failed for {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Read-side I/O failure
    #[error("read failed for {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Container format errors (bad magic, version mismatch, truncated entries)
    #[error("format error: {0}")]
    Format(String),

    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    #[error("invalid transfer id: {0:?}")]
    InvalidTransferId(String),

    /// A caller-chosen id collides with an existing transfer
    #[error("transfer id already in use: {0}")]
    DuplicateTransferId(String),

    /// The download password is absent or does not match the stored hash
    #[error("wrong or missing password for transfer {0}")]
    WrongPassword(String),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema migration failed while opening the transfer store
    #[error("schema migration failed: {0}")]
    Schema(String),

    /// A blocking task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(String),
}

/// Broad failure classes, so callers can tell misconfiguration from data
/// corruption from environment trouble without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Misconfiguration,
    Corruption,
    Environment,
    NotFound,
}

impl DropVaultError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptArchiveInput(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::WriteFailure {
            path: path.into(),
            source,
        }
    }

    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFailure {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingKeyContext { .. }
            | Self::Config(_)
            | Self::InvalidTransferId(_)
            | Self::DuplicateTransferId(_)
            | Self::WrongPassword(_) => ErrorClass::Misconfiguration,
            Self::CorruptArchiveInput(_) | Self::Format(_) => ErrorClass::Corruption,
            Self::SourceFileMissing(_) | Self::TransferNotFound(_) => ErrorClass::NotFound,
            Self::WriteFailure { .. }
            | Self::ReadFailure { .. }
            | Self::Database(_)
            | Self::Schema(_)
            | Self::Task(_) => ErrorClass::Environment,
        }
    }
}

impl From<tokio::task::JoinError> for DropVaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes_are_distinct() {
        let missing = DropVaultError::MissingKeyContext {
            key_source: KeySource::Email,
            field: "recipient_email",
        };
        let corrupt = DropVaultError::corrupt("too short");
        let write = DropVaultError::write(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );

        assert_eq!(missing.class(), ErrorClass::Misconfiguration);
        assert_eq!(corrupt.class(), ErrorClass::Corruption);
        assert_eq!(write.class(), ErrorClass::Environment);
        assert!(missing.to_string().contains("email"));
    }
}
