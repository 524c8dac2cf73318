use std::path::Path;

use russh::keys;
use tracing::info;

use crate::error::{SshCoreError, SshResult};

/// Load a private key from string data, supporting OpenSSH and PKCS#8 PEM encodings.
///
/// If the key is encrypted, provide `passphrase` or an error is returned.
pub fn load_private_key_from_str(data: &str, passphrase: Option<&str>) -> SshResult<keys::PrivateKey> {
    if passphrase.is_none()
        && let Ok(key) = keys::PrivateKey::from_openssh(data)
    {
        return Ok(key);
    }

    match keys::decode_secret_key(data, passphrase) {
        Ok(key) => Ok(key),
        Err(keys::Error::KeyIsEncrypted) => Err(SshCoreError::PassphraseRequired),
        Err(e) => Err(SshCoreError::key_parse("<inline>", e.to_string())),
    }
}

/// Read and parse the listener's host key. Any failure here is meant to abort startup.
pub fn load_host_key(path: &Path, passphrase: Option<&str>) -> SshResult<keys::PrivateKey> {
    let data = std::fs::read_to_string(path).map_err(|source| SshCoreError::KeyRead {
        path: path.to_path_buf(),
        source,
    })?;

    let key = load_private_key_from_str(&data, passphrase).map_err(|e| match e {
        SshCoreError::KeyParse { message, .. } => SshCoreError::key_parse(path, message),
        other => other,
    })?;

    info!(
        path = %path.display(),
        algorithm = %key.algorithm(),
        fingerprint = %key.public_key().fingerprint(keys::HashAlg::Sha256),
        "loaded host key"
    );
    Ok(key)
}
