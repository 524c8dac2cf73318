use std::sync::atomic::{AtomicI32, Ordering};

use once_cell::sync::OnceCell;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

use crate::error::{SshCoreError, SshResult};

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();
static CURRENT_IDX: AtomicI32 = AtomicI32::new(2); // 0=error,1=warn,2=info,3=debug,4=trace

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set and non-empty; otherwise `default_level` applies and can later be
/// changed through [`set_level`].
pub fn init_tracing(default_level: LevelFilter) {
    let (filter, from_env) = match std::env::var("RUST_LOG") {
        Ok(s) if !s.trim().is_empty() => (EnvFilter::new(s), true),
        _ => (EnvFilter::new(level_to_str(default_level)), false),
    };

    let (filter, handle) = reload::Layer::new(filter);
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed && !from_env {
        set_reload_handle(handle, default_level);
    }
}

pub fn set_reload_handle(handle: reload::Handle<EnvFilter, Registry>, initial: LevelFilter) {
    let _ = RELOAD.set(handle);
    CURRENT_IDX.store(level_to_idx(initial), Ordering::Relaxed);
}

/// Apply a new level at runtime. No-op when logging is driven by `RUST_LOG`.
pub fn set_level(level: LevelFilter) -> Option<LevelFilter> {
    let handle = RELOAD.get()?;
    CURRENT_IDX.store(level_to_idx(level), Ordering::Relaxed);
    let _ = handle.reload(EnvFilter::new(level_to_str(level)));
    Some(level)
}

pub fn increase_verbosity() -> Option<LevelFilter> {
    adjust_by(1)
}

pub fn decrease_verbosity() -> Option<LevelFilter> {
    adjust_by(-1)
}

fn adjust_by(delta: i32) -> Option<LevelFilter> {
    let idx = (CURRENT_IDX.load(Ordering::Relaxed) + delta).clamp(0, 4);
    set_level(LEVELS[idx as usize])
}

/// Parse a config/CLI level name.
pub fn parse_level(name: &str) -> SshResult<LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" => Ok(LevelFilter::ERROR),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        _ => Err(SshCoreError::InvalidLevel(name.to_string())),
    }
}

fn level_to_idx(level: LevelFilter) -> i32 {
    match level {
        LevelFilter::ERROR => 0,
        LevelFilter::WARN => 1,
        LevelFilter::INFO => 2,
        LevelFilter::DEBUG => 3,
        LevelFilter::TRACE => 4,
        _ => 2,
    }
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        LevelFilter::TRACE => "trace",
        _ => "info",
    }
}
