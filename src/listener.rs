//! Observers attached to queued tasks.
//!
//! Every hook runs on the task-queue worker thread (or on one of a process'
//! output reader threads), never on the thread that enqueued the task, so
//! implementations only forward messages to a [`ProgressSink`] and keep
//! their own state behind a mutex.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::progress::ProgressSink;
use crate::task::TaskOutcome;

/// Progress/result hooks of a task. All hooks default to no-ops.
pub trait TaskListener: Send + Sync {
    /// Called once before the task starts; `cmd` is empty for function tasks.
    fn on_start(&self, _cmd: &[String]) {}

    /// One line of standard output (or forwarded data of a function task).
    fn on_data(&self, _line: &str) {}

    /// One line of standard error.
    fn on_error(&self, _line: &str) {}

    /// Called exactly once after the task ended.
    fn on_finished(&self, _outcome: &TaskOutcome) {}
}

/// Listener used when a task has none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl TaskListener for NoopListener {}

// =============================================================================
// Progress line parsing
// =============================================================================

/// One parsed progress line of the copy tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub file: String,
    pub percent: Option<u8>,
}

/// Parse `"<file> | <size> | <rate> | ETA: <time> | <percent>%"`.
///
/// Returns `None` for blank lines and lines that are not progress reports.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let mut fields = line.split('|').map(str::trim);
    let file = fields.next()?;
    if file.is_empty() {
        return None;
    }
    let rest: Vec<&str> = fields.collect();
    if rest.is_empty() {
        return None;
    }
    let percent = rest
        .last()
        .and_then(|field| field.strip_suffix('%'))
        .and_then(|num| num.trim().parse::<u8>().ok());
    Some(ProgressLine {
        file: file.to_string(),
        percent,
    })
}

/// Source and destination of a copy tool command line (its last two args).
fn copy_endpoints(cmd: &[String]) -> Option<(&str, &str)> {
    match cmd {
        [_, .., from, to] => Some((from.as_str(), to.as_str())),
        _ => None,
    }
}

fn copy_label(from: &str, to: &str) -> String {
    format!("SCP copy {from} --> {to}")
}

fn status_word(success: bool) -> &'static str {
    if success { "OK" } else { "Failed!" }
}

// =============================================================================
// Remote command
// =============================================================================

/// Remote shell command (remove, mkdir, rename, ...).
///
/// The command fails if it exits nonzero, or if it printed to stderr but
/// produced no stdout.
pub struct CommandListener {
    label: String,
    sink: Arc<dyn ProgressSink>,
    output: Mutex<CommandOutputState>,
}

#[derive(Default)]
struct CommandOutputState {
    saw_stdout: bool,
    stderr: Vec<String>,
}

impl CommandListener {
    pub fn new(label: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            label: label.into(),
            sink,
            output: Mutex::new(CommandOutputState::default()),
        }
    }

    /// Collected stderr lines.
    pub fn errors(&self) -> Vec<String> {
        self.output.lock().stderr.clone()
    }
}

impl TaskListener for CommandListener {
    fn on_start(&self, _cmd: &[String]) {
        self.sink.paint(&format!("{} ...", self.label));
    }

    fn on_data(&self, line: &str) {
        if !line.trim().is_empty() {
            self.output.lock().saw_stdout = true;
        }
    }

    fn on_error(&self, line: &str) {
        let line = line.trim();
        if !line.is_empty() {
            self.output.lock().stderr.push(line.to_string());
        }
    }

    fn on_finished(&self, outcome: &TaskOutcome) {
        let state = self.output.lock();
        let stderr_only = !state.stderr.is_empty() && !state.saw_stdout;
        let success = outcome.is_success() && !stderr_only;
        if !success {
            tracing::warn!(label = %self.label, errors = ?state.stderr, "remote command failed");
        }
        self.sink
            .done(&format!("{} {}", self.label, status_word(success)), success);
    }
}

// =============================================================================
// Single file copy
// =============================================================================

/// Copy of a single file; reports the transfer percentage.
pub struct CopyFileListener {
    sink: Arc<dyn ProgressSink>,
    label: Mutex<String>,
}

impl CopyFileListener {
    /// Listener whose label is taken from the command line at start.
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            label: Mutex::new("SCP copy".to_string()),
        }
    }

    /// Listener for a function task, which has no command line to label from.
    pub fn with_endpoints(from: String, to: String, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            label: Mutex::new(copy_label(&from, &to)),
        }
    }
}

impl TaskListener for CopyFileListener {
    fn on_start(&self, cmd: &[String]) {
        let mut label = self.label.lock();
        if let Some((from, to)) = copy_endpoints(cmd) {
            *label = copy_label(from, to);
        }
        self.sink.paint(&format!("{label} ..."));
    }

    fn on_data(&self, line: &str) {
        if let Some(ProgressLine {
            percent: Some(percent),
            ..
        }) = parse_progress_line(line)
        {
            self.sink
                .paint(&format!("{} [{percent}%] ...", self.label.lock()));
        }
    }

    fn on_finished(&self, outcome: &TaskOutcome) {
        let success = outcome.is_success();
        self.sink.done(
            &format!("{} {}", self.label.lock(), status_word(success)),
            success,
        );
    }
}

// =============================================================================
// Recursive directory copy
// =============================================================================

/// Recursive copy; tracks which file the copy tool is currently sending.
pub struct CopyDirListener {
    sink: Arc<dyn ProgressSink>,
    state: Mutex<CopyDirState>,
}

#[derive(Default)]
struct CopyDirState {
    current: Option<String>,
    completed: Vec<String>,
}

impl CopyDirListener {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(CopyDirState::default()),
        }
    }

    /// File currently being transferred.
    pub fn current_file(&self) -> Option<String> {
        self.state.lock().current.clone()
    }

    /// Files whose transfer finished, in order.
    pub fn completed_files(&self) -> Vec<String> {
        self.state.lock().completed.clone()
    }
}

impl TaskListener for CopyDirListener {
    fn on_start(&self, cmd: &[String]) {
        if let Some((from, to)) = copy_endpoints(cmd) {
            self.sink.paint(&format!("{} ...", copy_label(from, to)));
        }
    }

    fn on_data(&self, line: &str) {
        let Some(progress) = parse_progress_line(line) else {
            return;
        };
        let mut state = self.state.lock();
        if state.current.as_deref() != Some(progress.file.as_str()) {
            if let Some(previous) = state.current.take() {
                self.sink.paint(&format!("{previous} done"));
                state.completed.push(previous);
            }
            state.current = Some(progress.file.clone());
        }
        match progress.percent {
            Some(percent) => self.sink.paint(&format!("{} [{percent}%] ...", progress.file)),
            None => self.sink.paint(&format!("{} ...", progress.file)),
        }
    }

    fn on_finished(&self, outcome: &TaskOutcome) {
        let success = outcome.is_success();
        let mut state = self.state.lock();
        if success && let Some(last) = state.current.take() {
            state.completed.push(last);
        }
        let count = state.completed.len();
        self.sink.done(
            &format!("SCP copied {count} file(s) {}", status_word(success)),
            success,
        );
    }
}

// =============================================================================
// Directory listing
// =============================================================================

/// Remote directory listing; collects output and reports it at the end.
pub struct ListDirListener {
    sink: Arc<dyn ProgressSink>,
    lines: Mutex<Vec<String>>,
}

impl ListDirListener {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl TaskListener for ListDirListener {
    fn on_data(&self, line: &str) {
        self.lines.lock().push(line.trim_end().to_string());
    }

    fn on_finished(&self, outcome: &TaskOutcome) {
        let success = outcome.is_success();
        let listing = self.lines.lock().join("\n");
        if success {
            self.sink.done(&listing, true);
        } else {
            self.sink.done("SCP list directory Failed!", false);
        }
    }
}

// =============================================================================
// Archive transfer progress
// =============================================================================

/// Percentage reporter for the archive leg of a bulk transfer.
///
/// Only paints; the bulk operation itself reports the terminal status.
pub struct ArchiveProgress {
    verb: &'static str,
    sink: Arc<dyn ProgressSink>,
}

impl ArchiveProgress {
    pub fn new(verb: &'static str, sink: Arc<dyn ProgressSink>) -> Self {
        Self { verb, sink }
    }
}

impl TaskListener for ArchiveProgress {
    fn on_data(&self, line: &str) {
        if let Some(ProgressLine {
            percent: Some(percent),
            ..
        }) = parse_progress_line(line)
        {
            self.sink
                .paint(&format!("SCP: {} archive [{percent}%] ...", self.verb));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::RecordingSink;

    fn cmd(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_progress_line() {
        let parsed =
            parse_progress_line("cp1250.py                 | 4 kB |   4.0 kB/s | ETA: 00:00:02 |  29%")
                .unwrap();
        assert_eq!(parsed.file, "cp1250.py");
        assert_eq!(parsed.percent, Some(29));
    }

    #[test]
    fn test_parse_progress_line_rejects_noise() {
        assert_eq!(parse_progress_line(""), None);
        assert_eq!(parse_progress_line("\n"), None);
        assert_eq!(parse_progress_line("Using username \"guest\"."), None);
        assert_eq!(parse_progress_line(" | 4 kB | 1%"), None);
    }

    #[test]
    fn test_parse_progress_line_without_percent() {
        let parsed = parse_progress_line("data.bin | 1 MB | stalled").unwrap();
        assert_eq!(parsed.file, "data.bin");
        assert_eq!(parsed.percent, None);
    }

    #[test]
    fn test_copy_dir_listener_file_transition() {
        let sink = Arc::new(RecordingSink::default());
        let listener = CopyDirListener::new(sink.clone());

        listener.on_data("cp1250.py | 4 kB | 4.0 kB/s | ETA: 00:00:02 | 29%");
        assert_eq!(listener.current_file().as_deref(), Some("cp1250.py"));
        assert!(listener.completed_files().is_empty());

        listener.on_data("cp1250.py | 14 kB | 4.0 kB/s | ETA: 00:00:00 | 100%");
        assert!(listener.completed_files().is_empty());

        listener.on_data("cp1251.py | 2 kB | 2.0 kB/s | ETA: 00:00:01 | 50%");
        assert_eq!(listener.completed_files(), vec!["cp1250.py".to_string()]);
        assert_eq!(listener.current_file().as_deref(), Some("cp1251.py"));

        let painted = sink.painted();
        let done_at = painted.iter().position(|m| m == "cp1250.py done").unwrap();
        let next_at = painted
            .iter()
            .position(|m| m.starts_with("cp1251.py"))
            .unwrap();
        assert!(done_at < next_at);
    }

    #[test]
    fn test_copy_dir_listener_finish_counts_last_file() {
        let sink = Arc::new(RecordingSink::default());
        let listener = CopyDirListener::new(sink.clone());
        listener.on_data("a.txt | 1 kB | 1 kB/s | ETA: 00:00:00 | 100%");
        listener.on_data("b.txt | 1 kB | 1 kB/s | ETA: 00:00:00 | 100%");
        listener.on_finished(&TaskOutcome::Exit(0));

        assert_eq!(listener.completed_files(), vec!["a.txt", "b.txt"]);
        assert_eq!(sink.finished(), vec![("SCP copied 2 file(s) OK".to_string(), true)]);
    }

    #[test]
    fn test_command_listener_stderr_without_stdout_fails() {
        let sink = Arc::new(RecordingSink::default());
        let listener = CommandListener::new("SCP remove /srv/x", sink.clone());
        listener.on_start(&cmd(&["plink", "rm -r /srv/x"]));
        listener.on_error("rm: cannot remove '/srv/x': No such file or directory");
        listener.on_finished(&TaskOutcome::Exit(0));

        assert_eq!(
            sink.finished(),
            vec![("SCP remove /srv/x Failed!".to_string(), false)]
        );
        assert_eq!(listener.errors().len(), 1);
    }

    #[test]
    fn test_command_listener_success() {
        let sink = Arc::new(RecordingSink::default());
        let listener = CommandListener::new("SCP mkdir /srv/x", sink.clone());
        listener.on_start(&[]);
        listener.on_finished(&TaskOutcome::Exit(0));
        assert_eq!(sink.painted()[0], "SCP mkdir /srv/x ...");
        assert_eq!(sink.finished(), vec![("SCP mkdir /srv/x OK".to_string(), true)]);
    }

    #[test]
    fn test_copy_file_listener_reports_endpoints() {
        let sink = Arc::new(RecordingSink::default());
        let listener = CopyFileListener::new(sink.clone());
        listener.on_start(&cmd(&["pscp", "-batch", "/w/a.py", "guest@h:/srv/a.py"]));
        listener.on_data("a.py | 4 kB | 4.0 kB/s | ETA: 00:00:01 | 50%");
        listener.on_finished(&TaskOutcome::Exit(1));

        assert_eq!(sink.painted()[0], "SCP copy /w/a.py --> guest@h:/srv/a.py ...");
        assert!(sink.painted()[1].contains("[50%]"));
        assert_eq!(
            sink.finished(),
            vec![("SCP copy /w/a.py --> guest@h:/srv/a.py Failed!".to_string(), false)]
        );
    }

    #[test]
    fn test_copy_file_listener_keeps_preset_label() {
        let sink = Arc::new(RecordingSink::default());
        let listener =
            CopyFileListener::with_endpoints("/w/a.py".into(), "guest@h:/srv/a.py".into(), sink.clone());
        listener.on_start(&[]);
        listener.on_finished(&TaskOutcome::Done);
        assert_eq!(sink.painted()[0], "SCP copy /w/a.py --> guest@h:/srv/a.py ...");
        assert_eq!(
            sink.finished(),
            vec![("SCP copy /w/a.py --> guest@h:/srv/a.py OK".to_string(), true)]
        );
    }

    #[test]
    fn test_list_dir_listener_collects_lines() {
        let sink = Arc::new(RecordingSink::default());
        let listener = ListDirListener::new(sink.clone());
        listener.on_data("drwxr-xr-x 2 guest guest 4096 .\n");
        listener.on_data("-rw-r--r-- 1 guest guest   12 a.txt\n");
        listener.on_finished(&TaskOutcome::Exit(0));
        assert_eq!(listener.lines().len(), 2);
        assert_eq!(sink.finished().len(), 1);
        assert!(sink.finished()[0].0.ends_with("a.txt"));
    }
}
