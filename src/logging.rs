// ABOUTME: tracing subscriber setup for the CLI
// ABOUTME: RUST_LOG overrides --log; optional rotated plain-text log file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// How often the log file is rolled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl LogRotation {
    fn rotation(self) -> Rotation {
        match self {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Where the file copy of the logs goes.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub rotation: LogRotation,
    /// Rotated files kept, the active one included.
    pub max_files: usize,
}

/// Appender for `log_file`.
///
/// `relay.log` stays `relay.log` without rotation and becomes
/// `relay.<date>.log` with it.
pub fn file_appender(log_file: &LogFile) -> Result<RollingFileAppender> {
    let path = &log_file.path;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .with_context(|| format!("Log file path {} has no file name", path.display()))?;

    let mut builder = RollingFileAppender::builder().rotation(log_file.rotation.rotation());
    builder = match log_file.rotation {
        LogRotation::Never => builder.filename_prefix(name.to_string_lossy()),
        _ => {
            let stem = Path::new(name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let builder = builder
                .filename_prefix(stem)
                .max_log_files(log_file.max_files.max(1));
            match Path::new(name).extension() {
                Some(ext) => builder.filename_suffix(ext.to_string_lossy()),
                None => builder,
            }
        }
    };

    builder
        .build(dir)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Install the global subscriber.
///
/// 1. RUST_LOG has highest precedence
/// 2. `level` (from --log / LOG_LEVEL) otherwise
///
/// Console output goes to stderr so command output on stdout stays clean.
/// The returned guard flushes the file writer when dropped and must be held
/// until the process exits.
pub fn init(level: &str, log_file: Option<&LogFile>) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match log_file {
        Some(log_file) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(log_file)?);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}
