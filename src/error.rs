// src/error.rs
use std::path::PathBuf;

use thiserror::Error;

use crate::setup::SetupStep;

/// Errors raised by a sandbox implementation.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox failed to boot: {0}")]
    Boot(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no such file or directory '{0}'")]
    NotFound(String),

    #[error("'{0}' is a directory")]
    IsDirectory(String),

    #[error("'{0}' is not a directory")]
    NotADirectory(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("failed to watch '{path}': {reason}")]
    Watch { path: String, reason: String },

    #[error("sandbox has been torn down")]
    TornDown,
}

impl SandboxError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => SandboxError::NotFound(path),
            std::io::ErrorKind::AlreadyExists => SandboxError::AlreadyExists(path),
            _ => SandboxError::Io { path, source },
        }
    }
}

/// Errors raised by the persistent store gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to initialize file store: {0}")]
    Init(String),

    #[error("file store handle is closed")]
    Closed,

    #[error("path '{path}' exceeds the maximum stored length of {max}")]
    PathTooLong { path: String, max: usize },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store task failed: {0}")]
    Task(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// A setup step reported failure; the pipeline halts at that step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step} failed: {reason}")]
pub struct StepFailure {
    pub step: SetupStep,
    pub reason: String,
}

/// A single entry failed during a mirror or restore pass. Logged and counted,
/// never propagated past the walk.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Failure of a debounced editor write; logged, never surfaced to the editor.
#[derive(Debug, Error)]
pub enum WriteBackError {
    #[error("writing to sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("writing to store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Setup(#[from] StepFailure),

    #[error("session has not been started")]
    NotReady,

    #[error("session failed to start ({0}); reset it before retrying")]
    Failed(String),

    #[error("'{0}' is not an editable file under the content directory")]
    NotEditable(String),

    #[error("invalid ready pattern: {0}")]
    ReadyPattern(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
