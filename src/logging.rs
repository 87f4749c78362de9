use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::LoggingConfig;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Where log lines go, parsed from `logging.output`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogOutput {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl LogOutput {
    fn parse(output: &str) -> Self {
        match output.trim() {
            "" | "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            "discard" => LogOutput::Discard,
            path => LogOutput::File(PathBuf::from(path)),
        }
    }

    fn writer(&self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
            LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
            LogOutput::Discard => tracing_appender::non_blocking(io::sink()),
            LogOutput::File(path) => tracing_appender::non_blocking(file_appender(path)?),
        };
        Ok(pair)
    }
}

// Appends to a single file; missing parent directories are created.
fn file_appender(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let name = path
        .file_name()
        .with_context(|| format!("logging: {} is not a file path", path.display()))?;
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .with_context(|| format!("logging: open {}", path.display()))
}

fn default_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::INFO)
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level(&cfg.level).into())
        .from_env_lossy();

    let output = LogOutput::parse(&cfg.output);
    let (writer, guard) = output.writer()?;
    let json = cfg.format.trim().eq_ignore_ascii_case("json");

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json && output == LogOutput::Stderr)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    let fmt = if json { fmt.json().boxed() } else { fmt.boxed() };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}
