#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use buzzer_contracts::ContractViolation;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid input: {0}")]
    Validation(#[from] ContractViolation),

    #[error("no pitch with id {id} found")]
    NotFound { id: String },

    #[error("pitch with id {id} already released")]
    AlreadyReleased { id: String },

    #[error("persistence failed for '{}': {message}", path.display())]
    Persistence { path: PathBuf, message: String },
}

impl StorageError {
    pub(crate) fn persistence(path: &Path, message: impl std::fmt::Display) -> Self {
        StorageError::Persistence {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}
