use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::FortressConfig;

const DEFAULT_CONFIG_PATH: &str = "fortress.toml";

#[derive(Debug, Parser)]
#[command(name = "fortress", about = "Auditing SSH bastion that relays each user to a fixed backend")]
struct RawArgs {
    /// Path to the TOML config file
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Override the listen address from the config file
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
    /// Override the listen port from the config file
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,
    /// Override the server host key path
    #[arg(long, value_name = "PATH")]
    host_key: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace); RUST_LOG still wins when set
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Command-line overrides layered on top of the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub host_key: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Overrides {
    pub fn apply(self, config: &mut FortressConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.host_key {
            config.server.host_key_path = path;
        }
        if let Some(level) = self.log_level {
            config.server.log_level = level;
        }
    }
}

/// Parse the command line, load the config file and apply the overrides.
pub fn load() -> Result<FortressConfig> {
    let args = RawArgs::parse();
    let (path, overrides) = split(args);
    let mut config = FortressConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))?;
    overrides.apply(&mut config);
    Ok(config)
}

fn split(args: RawArgs) -> (PathBuf, Overrides) {
    let overrides = Overrides {
        bind: args.bind,
        port: args.port,
        host_key: args.host_key,
        log_level: args.log_level,
    };
    (args.config, overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> (PathBuf, Overrides) {
        split(RawArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults_to_local_config_file() {
        let (path, overrides) = parse(&["fortress"]);
        assert_eq!(path, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(overrides, Overrides::default());
    }

    #[test]
    fn flags_override_config_values() {
        let (path, overrides) = parse(&[
            "fortress",
            "--config",
            "/etc/fortress.toml",
            "--bind",
            "127.0.0.1",
            "-p",
            "2200",
            "--host-key",
            "/etc/fortress/host_key",
            "--log-level",
            "debug",
        ]);
        assert_eq!(path, PathBuf::from("/etc/fortress.toml"));

        let mut config = FortressConfig::default();
        overrides.apply(&mut config);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 2200);
        assert_eq!(config.server.host_key_path, PathBuf::from("/etc/fortress/host_key"));
        assert_eq!(config.server.log_level, "debug");
    }

    #[test]
    fn absent_flags_keep_file_values() {
        let (_, overrides) = parse(&["fortress", "--port", "7000"]);
        let mut config = FortressConfig::default();
        let bind = config.server.bind.clone();
        overrides.apply(&mut config);
        assert_eq!(config.server.bind, bind);
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(RawArgs::try_parse_from(["fortress", "--port", "ssh"]).is_err());
    }
}
