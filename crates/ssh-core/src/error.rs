use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while preparing SSH key material and process-wide plumbing
#[derive(Error, Debug)]
pub enum SshCoreError {
    /// Host key file could not be read
    #[error("failed to read host key {path}: {source}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Host key file was read but is not a usable private key
    #[error("failed to parse host key {path}: {message}")]
    KeyParse { path: PathBuf, message: String },

    /// Encrypted key supplied without a passphrase
    #[error("encrypted private key requires a passphrase")]
    PassphraseRequired,

    /// Unknown log level name
    #[error("unknown log level '{0}' (expected error, warn, info, debug or trace)")]
    InvalidLevel(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Result type alias for SSH core operations
pub type SshResult<T> = Result<T, SshCoreError>;

impl SshCoreError {
    pub fn key_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::KeyParse {
            path: path.into(),
            message: message.into(),
        }
    }
}
