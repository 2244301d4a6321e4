//! Tracing subscriber setup

use crate::config::{LogFileConfig, LogRotation, LoggingConfig};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the file writer alive. Dropping it flushes buffered lines.
#[derive(Debug)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    installed: bool,
    _file: Option<WorkerGuard>,
}

impl LoggingGuard {
    /// Whether this call installed the global subscriber
    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `config.level`
/// when `RUST_LOG` is unset, plus a rotating file layer when
/// `config.file` is set.
///
/// A file that cannot be opened is reported on stderr and skipped. When a
/// global subscriber was already installed the existing one stays in place.
pub fn init(config: &LoggingConfig) -> LoggingGuard {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).unwrap_or_else(|e| {
            eprintln!("invalid log level '{}': {}; using info", config.level, e);
            EnvFilter::new("info")
        }),
    };

    let (file_layer, file_guard) = match config.file.as_ref().map(rolling_writer) {
        Some(Ok((writer, guard))) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(config.with_target)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("cannot open log file: {}; logging to stdout only", e);
            (None, None)
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(config.with_target),
        )
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            level = %config.level,
            file = ?config.file.as_ref().map(|f| f.directory.join(&f.file_name)),
            "Logging system initialized"
        );
    }
    LoggingGuard {
        installed,
        _file: file_guard,
    }
}

/// Non-blocking writer over a rotating file in `config.directory`
fn rolling_writer(config: &LogFileConfig) -> Result<(NonBlocking, WorkerGuard), String> {
    std::fs::create_dir_all(&config.directory)
        .map_err(|e| format!("{}: {}", config.directory.display(), e))?;

    let rotation = match config.rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(config.file_name.as_str());
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&config.directory).map_err(|e| e.to_string())?;
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_repeated_init_is_tolerated() {
        let config = LoggingConfig {
            level: "debug".into(),
            with_target: false,
            ..LoggingConfig::default()
        };
        let _first = init(&config);
        assert!(!init(&config).is_installed());
    }

    #[test]
    fn test_file_writer_creates_directory_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogFileConfig {
            directory: dir.path().join("nested/logs"),
            file_name: "server.log".into(),
            rotation: LogRotation::Never,
            max_files: None,
        };

        let (mut writer, guard) = rolling_writer(&config).unwrap();
        writer.write_all(b"hello from the log file\n").unwrap();
        drop(guard);

        let contents: String = std::fs::read_dir(&config.directory)
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert!(contents.contains("hello from the log file"));
    }
}
