//! Structured logging: three JSON-lines sinks with size-based rotation.
//!
//! Sinks:
//! - `main.log` - info and above
//! - `debug.log` - everything admitted by the configured level
//! - `errors.log` - error and above
//!
//! Rotation is by size (default 10 MB per file, 10 files kept): `main.log`
//! is renamed to `main.log.1`, existing rotations shift up, and the oldest
//! is deleted. Writes go through `tracing_appender::non_blocking` so the hot
//! path never blocks on disk.

use crate::settings::LoggingSettings;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// File writer that rotates when the current file exceeds `max_bytes`
pub struct RotatingFileWriter {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    pub fn new(path: PathBuf, max_bytes: u64, keep: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            keep: keep.max(2),
            file,
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;

        // Shift main.log.(n) -> main.log.(n+1), dropping the oldest
        let oldest = self.rotated_path(self.keep - 1);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.keep - 1).rev() {
            let from = self.rotated_path(n);
            if from.exists() {
                std::fs::rename(&from, self.rotated_path(n + 1))?;
            }
        }
        std::fs::rename(&self.path, self.rotated_path(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn rotated_path(&self, n: usize) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(format!(".{n}"));
        PathBuf::from(os)
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Keeps the non-blocking workers alive; dropping this flushes the sinks
pub struct LogGuards {
    _main: tracing_appender::non_blocking::WorkerGuard,
    _debug: tracing_appender::non_blocking::WorkerGuard,
    _error: tracing_appender::non_blocking::WorkerGuard,
}

/// Initialize the global tracing subscriber with the three file sinks plus a
/// compact stderr layer. Returns guards the caller must hold for the life of
/// the process.
pub fn init(settings: &LoggingSettings) -> Result<LogGuards, std::io::Error> {
    let max_bytes = settings.rotate_size_mb * 1024 * 1024;
    let keep = settings.rotate_keep;

    let sink = |name: &str| -> std::io::Result<RotatingFileWriter> {
        RotatingFileWriter::new(settings.dir.join(name), max_bytes, keep)
    };

    let (main_writer, main_guard) = tracing_appender::non_blocking(sink("main.log")?);
    let (debug_writer, debug_guard) = tracing_appender::non_blocking(sink("debug.log")?);
    let (error_writer, error_guard) = tracing_appender::non_blocking(sink("errors.log")?);

    let base_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let main_layer = fmt::layer()
        .json()
        .with_writer(main_writer)
        .with_target(true)
        .with_current_span(true)
        .with_filter(LevelFilter::INFO);

    let debug_layer = fmt::layer()
        .json()
        .with_writer(debug_writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(base_filter);

    let error_layer = fmt::layer()
        .json()
        .with_writer(error_writer)
        .with_target(true)
        .with_current_span(true)
        .with_filter(LevelFilter::ERROR);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(main_layer)
        .with(debug_layer)
        .with(error_layer)
        .with(stderr_layer)
        .init();

    tracing::info!(dir = %settings.dir.display(), "logging initialized");

    Ok(LogGuards {
        _main: main_guard,
        _debug: debug_guard,
        _error: error_guard,
    })
}

/// Root span for one crawl run; every record emitted inside carries the
/// run's trace id.
pub fn run_span(trace_id: &str) -> tracing::Span {
    tracing::info_span!("run", trace_id = %trace_id)
}

/// Generate a fresh trace id for a run
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Verify the log directory is writable before the run starts
pub fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".write_probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)
}
