use thiserror::Error;

/// Failure taxonomy for one bastion connection and its relay session.
///
/// Only startup failures (configuration, host key, listener bind) are fatal to the process;
/// every other variant is contained to the connection, channel or request that produced it.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("authentication failed for '{0}'")]
    AuthenticationFailed(String),

    #[error("no backend target configured for '{0}'")]
    AuthorizationDenied(String),

    #[error("backend {address} unreachable: {reason}")]
    BackendUnreachable { address: String, reason: String },

    #[error("backend {address} rejected credentials for '{username}'")]
    BackendAuthRejected { address: String, username: String },

    #[error("unsupported channel type '{0}'")]
    UnsupportedChannelType(String),

    #[error("forwarding '{kind}' request failed: {reason}")]
    RequestForwarding { kind: String, reason: String },

    #[error("audit decode error: {0}")]
    AuditDecode(String),

    #[error("stream terminated: {0}")]
    StreamTerminated(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH core error: {0}")]
    SshCore(#[from] ssh_core::SshCoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn unreachable(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendUnreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn forwarding(kind: impl Into<String>, reason: impl ToString) -> Self {
        Self::RequestForwarding {
            kind: kind.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short, stable label used as the `kind` field in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::AuthorizationDenied(_) => "authorization_denied",
            Self::BackendUnreachable { .. } => "backend_unreachable",
            Self::BackendAuthRejected { .. } => "backend_auth_rejected",
            Self::UnsupportedChannelType(_) => "unsupported_channel_type",
            Self::RequestForwarding { .. } => "request_forwarding",
            Self::AuditDecode(_) => "audit_decode",
            Self::StreamTerminated(_) => "stream_terminated",
            Self::Config(_) => "config",
            Self::Ssh(_) => "ssh",
            Self::SshCore(_) => "ssh_core",
            Self::Io(_) => "io",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
