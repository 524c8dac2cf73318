//! Bastion configuration: a TOML file with CLI overrides applied by the binary.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 6001
//! host_key_path = "config/sshfm"
//!
//! [audit]
//! bulk_transfer_programs = ["scp"]
//!
//! [[principals]]
//! name = "hago"
//! backend_address = "10.21.16.202:22"
//! ```
//!
//! The backend leg accepts any host key unless a principal pins one with `host_key`. That is a
//! trust boundary for backends on a private segment; pin keys anywhere else.
//!
//! Bulk-transfer detection only looks at the first word of an exec command. Quoting, aliases or a
//! wrapper shell all evade it, so treat `bulk_transfer_programs` as a convenience filter rather
//! than an enforcement point.

use std::{
    collections::HashSet, path::{Path, PathBuf}, time::Duration
};

use serde::Deserialize;
use tracing::info;

use crate::{
    error::{RelayError, RelayResult}, identity::split_host_port
};

/// Upper bound on the static allow-list.
pub const MAX_PRINCIPALS: usize = 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FortressConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub principals: Vec<PrincipalEntry>,
}

/// `[server]` section: the inbound listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    #[serde(default)]
    pub host_key_passphrase: Option<String>,
    /// Delay before answering a failed password attempt.
    #[serde(default = "default_auth_rejection_ms")]
    pub auth_rejection_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            host_key_path: default_host_key_path(),
            host_key_passphrase: None,
            auth_rejection_ms: default_auth_rejection_ms(),
            log_level: default_log_level(),
        }
    }
}

/// `[backend]` section: the outbound leg.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// How long a forwarded request may wait for the backend's reply.
    #[serde(default = "default_reply_timeout")]
    pub request_reply_timeout_secs: u64,
    /// Offer older kex/cipher suites when dialing backends.
    #[serde(default)]
    pub legacy_crypto: bool,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_secs: default_keepalive(),
            request_reply_timeout_secs: default_reply_timeout(),
            legacy_crypto: false,
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditSection {
    #[serde(default = "default_bulk_programs")]
    pub bulk_transfer_programs: Vec<String>,
    #[serde(default = "default_suppressed_subsystems")]
    pub suppressed_subsystems: Vec<String>,
    /// Chunks buffered between the output tee and the line decoder.
    #[serde(default = "default_tap_capacity")]
    pub tap_capacity: usize,
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Optional JSON-lines transcript in addition to the log output.
    #[serde(default)]
    pub json_log_path: Option<PathBuf>,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            bulk_transfer_programs: default_bulk_programs(),
            suppressed_subsystems: default_suppressed_subsystems(),
            tap_capacity: default_tap_capacity(),
            max_line_bytes: default_max_line_bytes(),
            json_log_path: None,
        }
    }
}

/// One `[[principals]]` entry: a local user and the single backend it relays to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrincipalEntry {
    pub name: String,
    /// `host:port` of the backend.
    pub backend_address: String,
    /// Backend login; defaults to `name`.
    #[serde(default)]
    pub backend_user: Option<String>,
    /// Pinned backend host key as an OpenSSH public key line.
    #[serde(default)]
    pub host_key: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    6001
}
fn default_host_key_path() -> PathBuf {
    PathBuf::from("config/sshfm")
}
fn default_auth_rejection_ms() -> u64 {
    250
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_keepalive() -> u64 {
    30
}
fn default_reply_timeout() -> u64 {
    15
}
fn default_bulk_programs() -> Vec<String> {
    vec!["scp".to_string()]
}
fn default_suppressed_subsystems() -> Vec<String> {
    vec!["sftp".to_string()]
}
fn default_tap_capacity() -> usize {
    256
}
fn default_max_line_bytes() -> usize {
    16 * 1024
}

impl FortressConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> RelayResult<Self> {
        info!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> RelayResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| RelayError::config(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RelayResult<()> {
        if self.principals.is_empty() {
            return Err(RelayError::config("at least one [[principals]] entry is required"));
        }
        if self.principals.len() > MAX_PRINCIPALS {
            return Err(RelayError::config(format!(
                "{} principals configured; the limit is {MAX_PRINCIPALS}",
                self.principals.len()
            )));
        }

        let mut seen = HashSet::new();
        for principal in &self.principals {
            if principal.name.trim().is_empty() {
                return Err(RelayError::config("principal name must not be empty"));
            }
            if !seen.insert(principal.name.as_str()) {
                return Err(RelayError::config(format!("duplicate principal '{}'", principal.name)));
            }
            if split_host_port(&principal.backend_address).is_none() {
                return Err(RelayError::config(format!(
                    "principal '{}': backend_address '{}' is not host:port",
                    principal.name, principal.backend_address
                )));
            }
        }

        if self.audit.tap_capacity == 0 {
            return Err(RelayError::config("audit.tap_capacity must be greater than zero"));
        }
        if self.audit.max_line_bytes == 0 {
            return Err(RelayError::config("audit.max_line_bytes must be greater than zero"));
        }
        if self.backend.connect_timeout_secs == 0 {
            return Err(RelayError::config("backend.connect_timeout_secs must be greater than zero"));
        }
        if self.backend.request_reply_timeout_secs == 0 {
            return Err(RelayError::config("backend.request_reply_timeout_secs must be greater than zero"));
        }
        Ok(())
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_reply_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.connect_timeout_secs)
    }

    pub fn auth_rejection_time(&self) -> Duration {
        Duration::from_millis(self.server.auth_rejection_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
