//! Progress message sinks.
//!
//! Listeners do not know how messages are shown; they paint transient
//! progress text and report one terminal status per logical request.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

/// Destination for progress and status messages.
pub trait ProgressSink: Send + Sync {
    /// Replace the transient progress text.
    fn paint(&self, message: &str);

    /// Report the terminal status of one logical request.
    fn done(&self, message: &str, success: bool) {
        let _ = success;
        self.paint(message);
    }
}

/// Terminal status line: a spinner showing the latest progress text, with
/// terminal statuses printed above it.
pub struct StatusLine {
    bar: ProgressBar,
    failures: AtomicUsize,
}

impl StatusLine {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["[=   ]", "[ =  ]", "[  = ]", "[   =]", "[  = ]", "[ =  ]", "[====]"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            failures: AtomicUsize::new(0),
        }
    }

    /// Number of failed requests reported so far.
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    /// Stderr writer for log output that the spinner cannot draw over.
    pub fn log_writer(&self) -> SuspendedStderr {
        SuspendedStderr(self.bar.clone())
    }
}

/// Writes to stderr with the status line cleared for the duration.
#[derive(Clone)]
pub struct SuspendedStderr(ProgressBar);

impl Write for SuspendedStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.suspend(|| io::stderr().write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.suspend(|| io::stderr().write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for StatusLine {
    fn paint(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn done(&self, message: &str, success: bool) {
        let line = if success {
            message.green().to_string()
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
            message.red().to_string()
        };
        // A hidden bar (no terminal) drops `println`.
        if self.bar.is_hidden() {
            eprintln!("{line}");
        } else {
            self.bar.println(line);
        }
        self.bar.set_message(String::new());
    }
}

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    painted: Mutex<Vec<String>>,
    finished: Mutex<Vec<(String, bool)>>,
}

impl RecordingSink {
    pub fn painted(&self) -> Vec<String> {
        self.painted.lock().clone()
    }

    pub fn finished(&self) -> Vec<(String, bool)> {
        self.finished.lock().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn paint(&self, message: &str) {
        self.painted.lock().push(message.to_string());
    }

    fn done(&self, message: &str, success: bool) {
        self.finished.lock().push((message.to_string(), success));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_separates_progress_and_status() {
        let sink = RecordingSink::default();
        sink.paint("uploading [10%]");
        sink.done("Uploaded!", true);
        assert_eq!(sink.painted(), vec!["uploading [10%]"]);
        assert_eq!(sink.finished(), vec![("Uploaded!".to_string(), true)]);
    }

    #[test]
    fn test_status_line_counts_failures() {
        let status = StatusLine::new();
        status.paint("working");
        status.done("ok", true);
        status.done("nope", false);
        status.finish();
        assert_eq!(status.failures(), 1);
    }

    #[test]
    fn test_log_writer_passes_bytes_through() {
        let status = StatusLine::new();
        let mut writer = status.log_writer();
        writer.write_all(b"").unwrap();
        assert_eq!(writer.write(b"").unwrap(), 0);
        writer.flush().unwrap();
        status.finish();
    }
}
