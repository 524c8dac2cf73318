//! Per-command decision on whether stdout is worth transcribing.

use std::path::Path;

use crate::config::AuditSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Auditable,
    Suppressed,
}

impl Classification {
    pub fn audit_enabled(self) -> bool {
        matches!(self, Self::Auditable)
    }
}

/// Pure predicate consulted whenever an exec or subsystem request passes through the relay.
pub trait CommandPolicy: Send + Sync {
    fn classify(&self, command: &str) -> Classification;

    fn classify_subsystem(&self, _name: &str) -> Classification {
        Classification::Auditable
    }
}

/// Suppresses capture for known bulk-transfer programs, matched on the first word of the command.
///
/// Anything it does not recognise stays auditable, including empty commands.
#[derive(Debug, Clone)]
pub struct PrefixPolicy {
    programs: Vec<String>,
    subsystems: Vec<String>,
}

impl PrefixPolicy {
    pub fn new(programs: impl IntoIterator<Item = String>, subsystems: impl IntoIterator<Item = String>) -> Self {
        Self {
            programs: programs.into_iter().filter(|p| !p.is_empty()).collect(),
            subsystems: subsystems.into_iter().filter(|s| !s.is_empty()).collect(),
        }
    }

    pub fn from_config(audit: &AuditSection) -> Self {
        Self::new(audit.bulk_transfer_programs.iter().cloned(), audit.suppressed_subsystems.iter().cloned())
    }

    fn is_bulk_program(&self, word: &str) -> bool {
        let base = Path::new(word).file_name().and_then(|n| n.to_str()).unwrap_or(word);
        self.programs.iter().any(|p| p == word || p == base)
    }
}

impl Default for PrefixPolicy {
    fn default() -> Self {
        Self::new(["scp".to_string()], ["sftp".to_string()])
    }
}

impl CommandPolicy for PrefixPolicy {
    fn classify(&self, command: &str) -> Classification {
        match command.split_whitespace().next() {
            Some(word) if self.is_bulk_program(word) => Classification::Suppressed,
            _ => Classification::Auditable,
        }
    }

    fn classify_subsystem(&self, name: &str) -> Classification {
        if self.subsystems.iter().any(|s| s == name.trim()) {
            Classification::Suppressed
        } else {
            Classification::Auditable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scp_sink_and_source_are_suppressed() {
        let policy = PrefixPolicy::default();
        assert_eq!(policy.classify("scp -t /tmp/x"), Classification::Suppressed);
        assert_eq!(policy.classify("scp -f /etc/hosts"), Classification::Suppressed);
        assert_eq!(policy.classify("  scp -t ."), Classification::Suppressed);
        assert_eq!(policy.classify("/usr/bin/scp -t ."), Classification::Suppressed);
    }

    #[test]
    fn other_commands_stay_auditable() {
        let policy = PrefixPolicy::default();
        assert_eq!(policy.classify("ls -la"), Classification::Auditable);
        assert_eq!(policy.classify("scpx -t ."), Classification::Auditable);
        assert_eq!(policy.classify("echo scp"), Classification::Auditable);
        assert_eq!(policy.classify(""), Classification::Auditable);
        assert_eq!(policy.classify("   "), Classification::Auditable);
    }

    #[test]
    fn configured_programs_replace_defaults() {
        let policy = PrefixPolicy::new(["rsync".to_string()], Vec::new());
        assert_eq!(policy.classify("rsync --server -vlogDtpre.iLsfxC . /srv"), Classification::Suppressed);
        assert_eq!(policy.classify("scp -t /tmp"), Classification::Auditable);
        assert_eq!(policy.classify_subsystem("sftp"), Classification::Auditable);
    }

    #[test]
    fn sftp_subsystem_is_suppressed_by_default() {
        let policy = PrefixPolicy::default();
        assert_eq!(policy.classify_subsystem("sftp"), Classification::Suppressed);
        assert_eq!(policy.classify_subsystem("netconf"), Classification::Auditable);
    }

    #[test]
    fn empty_program_names_are_ignored() {
        let policy = PrefixPolicy::new([String::new()], [String::new()]);
        assert_eq!(policy.classify(""), Classification::Auditable);
        assert_eq!(policy.classify_subsystem(""), Classification::Auditable);
    }
}
