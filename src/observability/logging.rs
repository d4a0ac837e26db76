use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Severity levels honored by the dynamic log-level override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the canonical uppercase representation.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rotation policy (default mirrors 1 GiB × 10 files).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotationPolicy {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for LogRotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_files: 10,
        }
    }
}

/// Accumulated log lines for a rotated segment.
#[derive(Debug, Default, Clone)]
pub struct LogFile {
    lines: Vec<String>,
    bytes_written: usize,
}

impl LogFile {
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    ts: u64,
    level: &'a str,
    module: &'a str,
    leaf_hub: &'a str,
    message: &'a str,
}

/// JSON-line logger with deterministic rotation semantics. Components log
/// through a shared [`LogHandle`]; lines are retained in rotated segments
/// and optionally echoed to stderr.
#[derive(Debug, Clone)]
pub struct JsonLineLogger {
    policy: LogRotationPolicy,
    current_level: LogLevel,
    files: VecDeque<LogFile>,
    active: LogFile,
    echo_stderr: bool,
}

impl JsonLineLogger {
    pub fn new(policy: LogRotationPolicy) -> Self {
        Self {
            policy,
            current_level: LogLevel::Info,
            files: VecDeque::new(),
            active: LogFile::default(),
            echo_stderr: false,
        }
    }

    pub fn with_stderr_echo(mut self) -> Self {
        self.echo_stderr = true;
        self
    }

    pub fn level(&self) -> LogLevel {
        self.current_level
    }

    /// Applies a dynamic log-level override.
    pub fn set_level(&mut self, level: LogLevel) {
        self.current_level = level;
    }

    /// Emits a JSON-line log entry.
    pub fn log(
        &mut self,
        ts_ms: u64,
        level: LogLevel,
        module: &str,
        leaf_hub: &str,
        message: &str,
    ) -> Result<(), LoggingError> {
        if level < self.current_level {
            return Ok(());
        }
        let record = LogRecord {
            ts: ts_ms,
            level: level.as_str(),
            module,
            leaf_hub,
            message,
        };
        let line = serde_json::to_string(&record).map_err(LoggingError::Serialize)?;
        if self.echo_stderr {
            eprintln!("{line}");
        }
        self.rotate_if_needed(line.len());
        self.active.bytes_written = self.active.bytes_written.saturating_add(line.len());
        self.active.lines.push(line);
        Ok(())
    }

    /// Returns rotated history plus the active segment.
    pub fn files(&self) -> impl Iterator<Item = &LogFile> {
        self.files.iter().chain(std::iter::once(&self.active))
    }

    fn rotate_if_needed(&mut self, next_line_len: usize) {
        if self.active.bytes_written + next_line_len <= self.policy.max_bytes {
            return;
        }
        if !self.active.lines.is_empty() {
            self.files.push_back(std::mem::take(&mut self.active));
            while self.files.len() > self.policy.max_files {
                self.files.pop_front();
            }
        }
        self.active = LogFile::default();
    }
}

/// Errors surfaced while serializing JSON-line logs.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to serialize log record: {0}")]
    Serialize(serde_json::Error),
}

/// Cloneable handle sharing one logger across pipeline components.
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<Mutex<JsonLineLogger>>,
}

impl Default for LogHandle {
    fn default() -> Self {
        Self::new(JsonLineLogger::new(LogRotationPolicy::default()))
    }
}

impl LogHandle {
    pub fn new(logger: JsonLineLogger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
        }
    }

    /// Logs with the current wall-clock timestamp; serialization failures
    /// are swallowed (logging must never take the pipeline down).
    pub fn log(&self, level: LogLevel, module: &str, leaf_hub: &str, message: &str) {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0);
        let mut logger = self.inner.lock().unwrap();
        let _ = logger.log(ts_ms, level, module, leaf_hub, message);
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.lock().unwrap().set_level(level);
    }

    pub fn level(&self) -> LogLevel {
        self.inner.lock().unwrap().level()
    }

    /// Flattened copy of every retained line, oldest first.
    pub fn lines(&self) -> Vec<String> {
        let logger = self.inner.lock().unwrap();
        logger
            .files()
            .flat_map(|file| file.lines().iter().cloned())
            .collect()
    }
}
