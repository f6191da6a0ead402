//! # Runtime Errors
//!
//! A single error type shared by the reconciler, the data facade and the
//! built-in modules. Only routing and fetch failures ever reach a data caller;
//! the rest are logged by the reconciler and never escape its scan loop.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    /// The router could not find any provider for the operation.
    #[error("no data provider available to handle '{0}'")]
    ProviderNotFound(String),

    /// A provider was asked for an operation it does not declare.
    #[error("provider '{provider}' does not implement '{operation}'")]
    Unsupported { provider: String, operation: String },

    /// An upstream fetch failed. Never cached.
    #[error("fetch failed for '{key}': {reason}")]
    Fetch { key: String, reason: String },

    /// A definition source could not be parsed or resolved against the catalog.
    #[error("failed to load definition {path}: {reason}")]
    DefinitionLoad { path: PathBuf, reason: String },

    /// Instantiating or initializing a module instance failed.
    #[error("failed to start instance '{instance}': {reason}")]
    InstanceStart { instance: String, reason: String },

    /// Only `interval:<seconds>` schedules are understood.
    #[error("unsupported schedule expression '{0}', expected 'interval:<seconds>'")]
    Schedule(String),

    /// Inbound message addressed to a widget nobody registered.
    #[error("no module instance registered for widget '{0}'")]
    UnknownWidget(String),

    /// Failure raised by module code itself.
    #[error("module error: {0}")]
    Module(String),

    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Shorthand for module code that wants to fail with a message.
    pub fn module(msg: impl Into<String>) -> Self {
        HubError::Module(msg.into())
    }

    /// Shorthand for a failed upstream fetch.
    pub fn fetch(key: impl Into<String>, reason: impl Into<String>) -> Self {
        HubError::Fetch {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
