//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("host key generation failed: {0}")]
    KeyGeneration(String),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("identity mismatch for user '{0}'")]
    IdentityMismatch(String),

    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl ServerError {
    /// Returns whether this error must abort the whole process.
    ///
    /// Everything else is scoped to a single connection or channel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::KeyGeneration(_) | ServerError::Bind { .. } | ServerError::Config(_)
        )
    }
}
