//! Error types for the configuration store.
//!
//! Responsibilities:
//! - Define the error variants returned by the store, the backup rotator and
//!   the persistence manager.
//! - Wrap lower-level crypto, format, archive and filesystem errors.
//!
//! Invariants:
//! - Filesystem errors carry the path they occurred on.
//! - Crypto errors never claim to know whether the password was wrong.

use std::path::PathBuf;

use thiserror::Error;

use crate::encryption::CryptoError;
use crate::format::FormatError;

/// Errors returned by store, rotator and manager operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid value: {0}")]
    Validation(String),

    #[error("Configuration '{0}' not found")]
    ConfigNotFound(String),

    #[error("Persistence manager '{0}' not found")]
    ManagerNotFound(String),

    #[error("Configuration '{0}' is already implemented")]
    Duplicate(String),

    #[error("A persistence manager with the identifier '{0}' already exists")]
    DuplicateManager(String),

    #[error("Store is full: at most {limit} configurations can be implemented")]
    Capacity { limit: usize },

    #[error("Configuration '{name}' is not of type {requested}")]
    TypeMismatch { name: String, requested: String },

    #[error("Invalid configuration file at {path}: {source}")]
    InvalidConfigFile {
        path: PathBuf,
        #[source]
        source: FormatError,
    },

    #[error("Both {plain} and {encrypted} exist; refusing to pick one")]
    AmbiguousMigrationState { plain: PathBuf, encrypted: PathBuf },

    #[error("A password is required to read or write encrypted configuration")]
    MissingPassword,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backup archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Unable to determine config directory: {0}")]
    ConfigDirUnavailable(String),

    #[error("There are no backup files")]
    NoBackups,

    #[error("Backups are not enabled for this manager")]
    BackupsDisabled,
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Wraps an I/O error with the path it occurred on.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for errors a lenient registration may downgrade to a warning.
    pub(crate) fn is_registration_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Duplicate(_))
    }
}
