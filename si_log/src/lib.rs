use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

/// Handle used to change the log filter of a running process.
pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

fn filter_for(level: Level) -> EnvFilter {
    EnvFilter::default().add_directive(LevelFilter::from_level(level).into())
}

/// Initialize structured JSON logging with rolling files and runtime log-level reload.
/// `dir` – log directory, `level` – initial log level.
pub fn init(dir: &str, level: Level) -> Result<ReloadHandle> {
    let file_appender = RollingFileAppender::new(Rotation::HOURLY, dir, "sidb.log");
    let (filter, handle) = reload::Layer::new(filter_for(level));
    let fmt_layer = fmt::layer()
        .with_writer(file_appender)
        .json()
        .with_current_span(false)
        .with_span_list(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(handle)
}

/// Change the active level through a handle returned by [`init`].
pub fn set_level(handle: &ReloadHandle, level: Level) -> Result<()> {
    handle.reload(filter_for(level))?;
    Ok(())
}

/// Human-readable stdout logging for the CLI. `RUST_LOG` overrides `level`.
pub fn init_stdout(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_accepts_level_reload() {
        let dir = std::env::temp_dir().join("si_log_test");
        std::fs::create_dir_all(&dir).unwrap();
        let handle = init(dir.to_str().unwrap(), Level::INFO).unwrap();
        tracing::info!("before reload");
        set_level(&handle, Level::DEBUG).unwrap();
        tracing::debug!("after reload");
        // Only one global subscriber per process.
        assert!(init_stdout(Level::INFO).is_err());
    }
}
