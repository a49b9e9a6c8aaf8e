use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Handle for changing the file logger's level at runtime.
pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Initialize structured JSON logging with hourly rolling files and runtime log-level reload.
/// `dir` – log directory, `level` – initial log level.
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init(dir: &Path, level: Level) -> Result<(ReloadHandle, WorkerGuard)> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::new(Rotation::HOURLY, dir, "tallyd.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let (filter, handle) = reload::Layer::new(filter_for(level));
    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .json()
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry().with(filter).with(fmt_layer).try_init()?;
    Ok((handle, guard))
}

/// Swap the level of a logger installed by [`init`].
pub fn set_level(handle: &ReloadHandle, level: Level) -> Result<()> {
    handle.reload(filter_for(level))?;
    Ok(())
}

/// Plain stderr logging for CLI use, filtered by `RUST_LOG` (default `info`).
pub fn init_stdout() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e))
}

/// Parse `trace`, `debug`, `info`, `warn` or `error` (any case).
pub fn parse_level(s: &str) -> Result<Level> {
    Level::from_str(s).map_err(|_| anyhow!("unknown log level {s:?}"))
}

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(level.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels() {
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("warn").unwrap(), Level::WARN);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn reload_changes_filter() {
        let (layer, handle) = reload::Layer::<EnvFilter, Registry>::new(filter_for(Level::INFO));
        let _subscriber = tracing_subscriber::registry().with(layer);
        set_level(&handle, Level::DEBUG).unwrap();
        let current = handle.with_current(|f| f.to_string()).unwrap();
        assert!(current.contains("debug"), "{current}");
    }
}
