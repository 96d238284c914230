//! Subscriber setup: a console layer on stderr and an optional file layer.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tessera_training::config::LogLevel;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Off => LevelFilter::OFF,
    }
}

/// The console level: `--log-level` wins over the configuration.
pub fn console_level(flag: Option<&str>, configured: LogLevel) -> Result<LevelFilter> {
    match flag {
        Some(raw) => raw
            .parse::<LevelFilter>()
            .map_err(|_| anyhow::anyhow!("invalid log level '{raw}'")),
        None => Ok(level_filter(configured)),
    }
}

/// Installs the global subscriber. `RUST_LOG` refines the console layer.
pub fn init(console: LevelFilter, file: Option<(&Path, LogLevel)>) -> Result<()> {
    let console_filter = EnvFilter::builder()
        .with_default_directive(console.into())
        .from_env_lossy();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = match file {
        Some((path, level)) => {
            let handle = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(handle))
                    .with_ansi(false)
                    .with_filter(level_filter(level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_overrides_config() {
        assert_eq!(console_level(Some("debug"), LogLevel::Error).unwrap(), LevelFilter::DEBUG);
        assert_eq!(console_level(None, LogLevel::Warn).unwrap(), LevelFilter::WARN);
        assert_eq!(console_level(Some("off"), LogLevel::Info).unwrap(), LevelFilter::OFF);
        assert!(console_level(Some("loud"), LogLevel::Info).is_err());
    }
}
