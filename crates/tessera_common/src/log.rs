//! Progress and diagnostic sinks.
//!
//! Library code never prints. It reports progress through a [`LogSink`]
//! supplied by the caller; the CLI plugs in [`TracingSink`], tests use
//! [`MemorySink`] to assert on what was reported.

use std::sync::Mutex;

/// Severity of a recorded log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Routine progress.
    Info,
    /// Something unexpected that does not stop processing.
    Warning,
}

/// Destination for progress and diagnostic messages.
pub trait LogSink {
    /// Records a progress message.
    fn log(&self, message: &str);

    /// Records a warning. Defaults to a prefixed [`log`](Self::log) line.
    fn warn(&self, message: &str) {
        self.log(&format!("Warning: {message}"));
    }
}

/// Forwards messages to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }
}

/// Discards every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}
}

/// Records messages in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded message in order, regardless of level.
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Returns only the recorded warnings.
    pub fn warnings(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == LogLevel::Warning)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Returns `true` if any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(_, m)| m.contains(needle))
    }

    fn push(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warning, message);
    }
}

impl<T: LogSink + ?Sized> LogSink for &T {
    fn log(&self, message: &str) {
        (**self).log(message);
    }

    fn warn(&self, message: &str) {
        (**self).warn(message);
    }
}
