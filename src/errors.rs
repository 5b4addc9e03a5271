// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestherdError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Project '{project}' depends on unknown project '{dependency}'")]
    UnknownDependency { project: String, dependency: String },

    #[error("Circular dependency detected between projects: {0}")]
    CircularDependency(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Malformed worker message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Failed to launch worker: {0}")]
    WorkerLaunch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TestherdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_participant() {
        let err = TestherdError::CircularDependency("'A' -> 'B' -> 'A'".to_string());
        assert!(err.to_string().contains("Circular dependency"));
        assert!(err.to_string().contains("'A'"));
    }
}
