mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::{
    FortressConfig, StaticResolver, audit::{AuditSink, FanoutAuditSink, JsonLinesAuditSink, TracingAuditSink}, run_ssh_server
};
use ssh_core::logging::{init_tracing, parse_level};
use tracing::info;

/// Records queued for the JSON transcript writer before new ones are dropped.
const JSON_SINK_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::load()?;
    let level = parse_level(&config.server.log_level).context("invalid log level")?;
    init_tracing(level);

    #[cfg(unix)]
    spawn_verbosity_signals();

    let (sink, transcript) = build_audit_sink(&config)?;
    let resolver = Arc::new(StaticResolver::from_config(&config));
    info!(principals = resolver.len(), "allow-list loaded");

    let served = tokio::select! {
        res = run_ssh_server(&config, resolver, sink) => res.context("SSH server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };
    if let Some(transcript) = transcript {
        transcript.shutdown().await;
    }
    served
}

/// Returns the combined sink and, when configured, the transcript file that must be flushed on exit.
fn build_audit_sink(config: &FortressConfig) -> Result<(Arc<dyn AuditSink>, Option<Arc<JsonLinesAuditSink>>)> {
    let mut fanout = FanoutAuditSink::new().with(Arc::new(TracingAuditSink));
    let mut transcript = None;
    if let Some(path) = &config.audit.json_log_path {
        let json = Arc::new(JsonLinesAuditSink::open(path, JSON_SINK_CAPACITY).context("failed to open audit transcript")?);
        fanout = fanout.with(json.clone());
        transcript = Some(json);
    }
    Ok((Arc::new(fanout), transcript))
}

/// SIGUSR1 raises and SIGUSR2 lowers the log level at runtime.
#[cfg(unix)]
fn spawn_verbosity_signals() {
    use ssh_core::logging::{decrease_verbosity, increase_verbosity};
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut up), Ok(mut down)) = (signal(SignalKind::user_defined1()), signal(SignalKind::user_defined2())) else {
        tracing::warn!("cannot install verbosity signal handlers");
        return;
    };
    tokio::spawn(async move {
        loop {
            let changed = tokio::select! {
                _ = up.recv() => increase_verbosity(),
                _ = down.recv() => decrease_verbosity(),
            };
            match changed {
                Some(level) => info!(%level, "log level changed"),
                None => info!("log level is fixed by RUST_LOG"),
            }
        }
    });
}
