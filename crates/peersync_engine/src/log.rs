//! Progress reporting.
//!
//! Every user-visible line goes to the injected [`LogSink`] with a
//! `[HH:MM:SS]` prefix and is mirrored to `tracing` at the matching level.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Callback receiving human-readable progress lines.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Returns the current time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Formats Unix milliseconds as a UTC wall-clock time.
pub fn format_clock(millis: u64) -> String {
    let secs = millis / 1000;
    let (h, m, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    format!("{h:02}:{m:02}:{s:02}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

/// Cloneable handle to the log sink.
#[derive(Clone)]
pub struct SyncLog {
    sink: Option<LogSink>,
}

impl SyncLog {
    /// Creates a log that forwards to `sink`.
    pub fn new(sink: LogSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// Creates a log that only emits `tracing` events.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Reports progress.
    pub fn info(&self, message: impl fmt::Display) {
        self.emit(Level::Info, message);
    }

    /// Reports a recoverable problem.
    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(Level::Warn, message);
    }

    /// Reports a failure.
    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Level::Error, message);
    }

    fn emit(&self, level: Level, message: impl fmt::Display) {
        let message = message.to_string();
        match level {
            Level::Info => tracing::info!("{message}"),
            Level::Warn => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }
        if let Some(sink) = &self.sink {
            sink(&format!("[{}] {}", format_clock(now_millis()), message));
        }
    }
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Debug for SyncLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncLog")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Collects sink lines for assertions.
    #[derive(Clone, Default)]
    pub struct CapturedLog {
        pub lines: Arc<Mutex<Vec<String>>>,
    }

    impl CapturedLog {
        pub fn sink(&self) -> LogSink {
            let lines = Arc::clone(&self.lines);
            Arc::new(move |line: &str| lines.lock().push(line.to_string()))
        }

        pub fn log(&self) -> SyncLog {
            SyncLog::new(self.sink())
        }

        pub fn contains(&self, needle: &str) -> bool {
            self.lines.lock().iter().any(|l| l.contains(needle))
        }
    }
}
