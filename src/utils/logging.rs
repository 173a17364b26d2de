use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{
        format::{FmtSpan, Writer},
        time::{FormatTime, SystemTime},
        writer::BoxMakeWriter,
    },
    EnvFilter,
};

use crate::config::MonitoringConfig;
use crate::error::{EngineError, Result};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Whether to include timestamps
    pub timestamps: bool,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span close events with their timings
    pub log_spans: bool,
    /// Output file, appended to (None for stdout)
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: true,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

impl From<&MonitoringConfig> for LogConfig {
    fn from(monitoring: &MonitoringConfig) -> Self {
        Self {
            level: monitoring.log_level.into(),
            source_location: monitoring.verbose,
            log_spans: monitoring.verbose,
            ..Default::default()
        }
    }
}

struct Timestamps(bool);

impl FormatTime for Timestamps {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        if self.0 {
            SystemTime.format_time(w)
        } else {
            Ok(())
        }
    }
}

/// Initialize the global subscriber. Only the first call has any effect.
pub fn setup_logging(config: LogConfig) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });

    result
}

fn setup_logging_internal(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::from_level(config.level).into());

    let writer = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_timer(Timestamps(config.timestamps))
        .with_ansi(config.file_path.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|e| EngineError::config("logging", format!("Failed to set global subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_config_from_monitoring() {
        let monitoring = MonitoringConfig {
            log_level: LogLevel::Debug,
            verbose: true,
        };
        let config = LogConfig::from(&monitoring);
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.source_location);
        assert!(config.file_path.is_none());
    }

    #[test]
    fn test_setup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_path: Some(dir.path().join("engine.log")),
            ..Default::default()
        };
        let first = setup_logging(config.clone());
        assert!(setup_logging(config).is_ok());
        if first.is_ok() {
            tracing::info!("logging initialized");
        }
    }
}
