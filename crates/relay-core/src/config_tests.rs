use std::io::Write;

use super::*;

const MINIMAL: &str = r#"
[[principals]]
name = "hago"
backend_address = "10.21.16.202:22"
"#;

#[test]
fn minimal_config_uses_defaults() {
    let config = FortressConfig::from_toml_str(MINIMAL).unwrap();
    assert_eq!(config.server.bind, "0.0.0.0");
    assert_eq!(config.server.port, 6001);
    assert_eq!(config.audit.bulk_transfer_programs, vec!["scp".to_string()]);
    assert_eq!(config.audit.suppressed_subsystems, vec!["sftp".to_string()]);
    assert_eq!(config.reply_timeout(), Duration::from_secs(15));
    assert!(config.audit.json_log_path.is_none());
    assert_eq!(config.principals[0].backend_user, None);
}

#[test]
fn full_config_parses() {
    let raw = r#"
[server]
bind = "127.0.0.1"
port = 2022
host_key_path = "/etc/fortress/host_key"
log_level = "debug"

[backend]
connect_timeout_secs = 3
legacy_crypto = true

[audit]
bulk_transfer_programs = ["scp", "rsync"]
tap_capacity = 8
json_log_path = "/var/log/fortress/audit.jsonl"

[[principals]]
name = "alice"
backend_address = "db01.internal:2222"
backend_user = "ops"
host_key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB0Ddf7H4dZjeYqg0mT7mN7I1d0n1Q8cY3b8C7o5Qc7k"
"#;
    let config = FortressConfig::from_toml_str(raw).unwrap();
    assert_eq!(config.server.port, 2022);
    assert_eq!(config.connect_timeout(), Duration::from_secs(3));
    assert!(config.backend.legacy_crypto);
    assert_eq!(config.audit.tap_capacity, 8);
    let alice = &config.principals[0];
    assert_eq!(alice.backend_user.as_deref(), Some("ops"));
    assert!(alice.host_key.is_some());
}

#[test]
fn empty_allow_list_is_rejected() {
    let err = FortressConfig::from_toml_str("[server]\nport = 1\n").unwrap_err();
    assert!(matches!(err, RelayError::Config(_)));
}

#[test]
fn duplicate_principal_is_rejected() {
    let raw = format!("{MINIMAL}\n{MINIMAL}");
    let err = FortressConfig::from_toml_str(&raw).unwrap_err();
    assert!(err.to_string().contains("duplicate principal"));
}

#[test]
fn malformed_backend_address_is_rejected() {
    let raw = r#"
[[principals]]
name = "hago"
backend_address = "10.21.16.202"
"#;
    let err = FortressConfig::from_toml_str(raw).unwrap_err();
    assert!(err.to_string().contains("not host:port"));
}

#[test]
fn zero_tap_capacity_is_rejected() {
    let raw = format!("[audit]\ntap_capacity = 0\n{MINIMAL}");
    assert!(FortressConfig::from_toml_str(&raw).is_err());
}

#[test]
fn zero_timeouts_are_rejected() {
    for field in ["connect_timeout_secs", "request_reply_timeout_secs"] {
        let raw = format!("[backend]\n{field} = 0\n{MINIMAL}");
        let err = FortressConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains(field), "{err}");
    }
}

#[test]
fn unknown_keys_are_rejected() {
    let raw = format!("[server]\nprot = 22\n{MINIMAL}");
    assert!(FortressConfig::from_toml_str(&raw).is_err());
}

#[test]
fn too_many_principals_are_rejected() {
    let mut raw = String::new();
    for i in 0..=MAX_PRINCIPALS {
        raw.push_str(&format!("[[principals]]\nname = \"u{i}\"\nbackend_address = \"10.0.0.1:22\"\n"));
    }
    let err = FortressConfig::from_toml_str(&raw).unwrap_err();
    assert!(err.to_string().contains("limit"));
}

#[test]
fn load_reads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MINIMAL.as_bytes()).unwrap();
    let config = FortressConfig::load(file.path()).unwrap();
    assert_eq!(config.principals.len(), 1);
}
