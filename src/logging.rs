//! Process-wide tracing setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

const LOG_PREFIX: &str = "agentdock";

/// Install the global subscriber.
///
/// Console output is compact text, or JSON lines when `json` is set. When
/// `[logging] dir` is configured a daily-rolling JSON file is written as well;
/// the returned guard must live until exit or buffered lines are lost.
pub fn init(logging: &LoggingSection, json: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, guard) = match &logging.dir {
        Some(dir) => {
            let (writer, guard) = rolling_writer(dir)?;
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };
    let file_layer = writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_current_span(false)
            .with_span_list(false)
    });

    let json_console = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_span_list(false)
    });
    let text_console =
        (!json).then(|| tracing_subscriber::fmt::layer().compact().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(text_console)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}

fn rolling_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(dir)
        .context("Failed to create rolling log file")?;
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");
        let (_writer, _guard) = rolling_writer(&logs).unwrap();
        assert!(logs.is_dir());
    }
}
