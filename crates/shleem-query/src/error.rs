use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for source-tree and tap operations
#[derive(Error, Debug)]
pub enum TapError {
    /// The credential store has no entry for the requested server
    #[error("Credentials not found for server: {server}")]
    CredentialsNotFound { server: String },

    /// A parameter slot asked for an argument the caller did not supply
    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    /// Template holds a value with no canonical hash form
    #[error("Unhashable template: {0}")]
    UnhashableTemplate(String),

    /// Template has the wrong shape for the operation
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    /// Credential file missing or malformed
    #[error("Credential file {path}: {message}")]
    CredentialFile { path: PathBuf, message: String },

    /// Dotted path could not be mapped onto the source tree
    #[error("Invalid source path: {0}")]
    InvalidPath(String),

    /// Error raised by the underlying database driver, passed through untouched
    #[error("{0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl TapError {
    /// Wrap a driver error without altering its message
    pub fn driver(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        TapError::Driver(err.into())
    }

    pub fn missing_parameter(name: impl Into<String>) -> Self {
        TapError::MissingParameter { name: name.into() }
    }

    pub fn credentials_not_found(server: impl Into<String>) -> Self {
        TapError::CredentialsNotFound {
            server: server.into(),
        }
    }

    pub fn invalid_template(msg: impl Into<String>) -> Self {
        TapError::InvalidTemplate(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, TapError>;
