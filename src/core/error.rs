//! Error types for stack operations.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::docker::EngineError;

#[derive(Error, Debug)]
pub enum StackError {
    #[error("No backups found under {}", root.display())]
    NotFound { root: PathBuf },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service '{0}' has no restorable backup")]
    Unavailable(String),

    #[error("{service}: {unit} source missing at {}", path.display())]
    MissingSource {
        service: String,
        unit: String,
        path: PathBuf,
    },

    #[error("Volume '{volume}' is in use by a running container; stop it before restoring")]
    VolumeInUse { volume: String },

    #[error("{service}: helper container for {unit} exited with status {status}")]
    HelperFailed {
        service: String,
        unit: String,
        status: i64,
    },

    #[error("{service}: {unit}: {source}")]
    Engine {
        service: String,
        unit: String,
        #[source]
        source: EngineError,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive {}: {message}", path.display())]
    Archive { path: PathBuf, message: String },

    #[error("Service registry is invalid: {0}")]
    Registry(String),

    #[error("Backup root is locked by {} (remove it if no other stack-cli is running)", path.display())]
    Locked { path: PathBuf },

    #[error("Could not locate project root: {0}")]
    ProjectRootNotFound(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),
}

impl StackError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StackError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn engine(service: &str, unit: &str, source: EngineError) -> Self {
        StackError::Engine {
            service: service.to_string(),
            unit: unit.to_string(),
            source,
        }
    }

    /// Errors that must abort the whole run rather than a single service.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StackError::NotFound { .. }
                | StackError::VolumeInUse { .. }
                | StackError::Locked { .. }
                | StackError::ProjectRootNotFound(_)
                | StackError::Registry(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StackError>;
