//! External process execution.
//!
//! [`AsyncProcess`] spawns a command with piped output and forwards each
//! stdout line to a listener's `on_data` and each stderr line to `on_error`,
//! from two reader threads. Copy tools redraw their progress line with `\r`,
//! so carriage returns also end a line.
//!
//! [`CommandRunner`] is the seam between remote clients and real processes:
//! [`SystemRunner`] runs them, tests substitute a scripted runner.
//!
//! Killing is scoped to the thread that started a process. Code running
//! under [`with_abort`] attaches every process it starts to an
//! [`AbortHandle`]; processes started elsewhere (a handshake on the caller's
//! thread) are out of its reach.

use std::cell::RefCell;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::error::{Result, ScpError};
use crate::listener::TaskListener;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_LINE: usize = 1 << 16;

/// Command line plus optional working directory and environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// Command line safe for logging.
    pub fn display(&self) -> String {
        redact_args(&self.argv).join(" ")
    }
}

/// Replace password arguments (`-pw <secret>`) with `***`.
pub fn redact_args(argv: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(argv.len());
    let mut hide_next = false;
    for arg in argv {
        if hide_next {
            redacted.push("***".to_string());
            hide_next = false;
        } else {
            hide_next = arg == "-pw";
            redacted.push(arg.clone());
        }
    }
    redacted
}

/// Exit code of a finished process; killed processes yield the negated signal.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        -status.signal().unwrap_or(1)
    }
    #[cfg(not(unix))]
    {
        -1
    }
}

#[cfg(windows)]
fn hide_console(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    command.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console(_command: &mut Command) {}

/// A running subprocess.
pub struct AsyncProcess {
    program: String,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl AsyncProcess {
    /// Spawn `spec`. Output is only captured when a listener is attached.
    pub fn start(spec: &ProcessSpec, listener: Option<Arc<dyn TaskListener>>) -> Result<Self> {
        let program = spec.program().to_string();
        let Some((exe, args)) = spec.argv.split_first() else {
            return Err(ScpError::Spawn {
                program,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
            });
        };

        let mut command = Command::new(exe);
        command.args(args).stdin(Stdio::piped());
        if listener.is_some() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        hide_console(&mut command);

        tracing::debug!(command = %spec.display(), "spawning process");
        let mut child = command.spawn().map_err(|source| ScpError::Spawn {
            program: program.clone(),
            source,
        })?;

        let mut readers = Vec::new();
        if let Some(listener) = listener {
            if let Some(stdout) = child.stdout.take() {
                let listener = Arc::clone(&listener);
                readers.push(spawn_reader(stdout, move |line| listener.on_data(line)));
            }
            if let Some(stderr) = child.stderr.take() {
                let listener = Arc::clone(&listener);
                readers.push(spawn_reader(stderr, move |line| listener.on_error(line)));
            }
        }
        let stdin = child.stdin.take();

        Ok(Self {
            program,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            readers: Mutex::new(readers),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> u32 {
        self.child.lock().id()
    }

    /// Whether the process is still running.
    pub fn poll(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }

    /// Block until the process exits and return its exit code.
    ///
    /// The child lock is only held while polling, so `kill` from another
    /// thread is never blocked by a waiter.
    pub fn wait(&self) -> Result<i32> {
        loop {
            if let Some(status) = self.child.lock().try_wait()? {
                return Ok(exit_code(status));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Terminate the process and wait for it to exit.
    pub fn kill(&self) -> Result<i32> {
        if let Err(e) = self.child.lock().kill() {
            tracing::debug!(program = %self.program, error = %e, "kill failed");
        }
        self.wait()
    }

    /// Write to the process' standard input. A broken pipe kills the process.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock();
        let Some(pipe) = stdin.as_mut() else {
            return Ok(());
        };
        match pipe.write_all(data).and_then(|()| pipe.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                stdin.take();
                drop(stdin);
                self.kill()?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for both output streams to close, then for the exit code.
    pub fn finish(&self) -> Result<i32> {
        // Closing stdin lets tools waiting for input (password prompts) exit.
        self.stdin.lock().take();
        let readers: Vec<_> = self.readers.lock().drain(..).collect();
        for reader in readers {
            if reader.join().is_err() {
                tracing::warn!(program = %self.program, "output reader panicked");
            }
        }
        self.wait()
    }
}

fn spawn_reader<R, F>(stream: R, forward: F) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(&str) + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::with_capacity(MAX_LINE, stream);
        for chunk in reader.split(b'\n') {
            let Ok(chunk) = chunk else {
                break;
            };
            let text = String::from_utf8_lossy(&chunk);
            for line in text.split('\r').filter(|l| !l.is_empty()) {
                forward(line);
            }
        }
    })
}

// =============================================================================
// Command runners
// =============================================================================

/// Collected result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Zero exit and no error text without accompanying output.
    pub fn succeeded(&self) -> bool {
        self.code == 0 && (self.stderr.trim().is_empty() || !self.stdout.trim().is_empty())
    }
}

/// Runs a command to completion on the calling thread.
pub trait CommandRunner: Send + Sync {
    /// Run `spec`, forwarding output lines to `listener` as they arrive.
    ///
    /// Inside [`with_abort`] the process must honour the scope's handle.
    fn run(&self, spec: &ProcessSpec, listener: &dyn TaskListener) -> Result<CommandOutput>;
}

enum OutputLine {
    Stdout(String),
    Stderr(String),
}

struct ChannelListener(Sender<OutputLine>);

impl TaskListener for ChannelListener {
    fn on_data(&self, line: &str) {
        let _ = self.0.send(OutputLine::Stdout(line.to_string()));
    }

    fn on_error(&self, line: &str) {
        let _ = self.0.send(OutputLine::Stderr(line.to_string()));
    }
}

/// Kill switch for the processes one owner runs.
///
/// Once aborted, the attached process is killed and so is every process
/// attached afterwards, until [`reset`](Self::reset).
#[derive(Clone, Default)]
pub struct AbortHandle {
    state: Arc<Mutex<AbortState>>,
}

#[derive(Default)]
struct AbortState {
    aborted: bool,
    process: Option<Arc<AsyncProcess>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the attached process, if any. Returns whether one was killed.
    pub fn abort(&self) -> bool {
        let process = {
            let mut state = self.state.lock();
            state.aborted = true;
            state.process.take()
        };
        match process {
            Some(process) => {
                kill_attached(&process);
                true
            }
            None => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.aborted = false;
        state.process = None;
    }

    /// Process id of the attached process.
    pub fn pid(&self) -> Option<u32> {
        self.state.lock().process.as_ref().map(|process| process.id())
    }

    fn attach(&self, process: &Arc<AsyncProcess>) {
        let mut state = self.state.lock();
        if state.aborted {
            drop(state);
            kill_attached(process);
        } else {
            state.process = Some(Arc::clone(process));
        }
    }

    fn detach(&self, process: &Arc<AsyncProcess>) {
        let mut state = self.state.lock();
        if state
            .process
            .as_ref()
            .is_some_and(|attached| Arc::ptr_eq(attached, process))
        {
            state.process = None;
        }
    }
}

fn kill_attached(process: &AsyncProcess) {
    tracing::info!(program = %process.program(), "aborting running process");
    if let Err(e) = process.kill() {
        tracing::warn!(error = %e, "abort failed");
    }
}

thread_local! {
    static ABORT_SCOPE: RefCell<Option<AbortHandle>> = const { RefCell::new(None) };
}

/// Run `body` with `handle` governing the processes it starts on this thread.
pub fn with_abort<R>(handle: &AbortHandle, body: impl FnOnce() -> R) -> R {
    let previous = ABORT_SCOPE.with(|scope| scope.replace(Some(handle.clone())));
    // Restores the outer scope even when `body` unwinds.
    struct Restore(Option<AbortHandle>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            ABORT_SCOPE.with(|scope| *scope.borrow_mut() = previous);
        }
    }
    let _restore = Restore(previous);
    body()
}

fn current_abort() -> Option<AbortHandle> {
    ABORT_SCOPE.with(|scope| scope.borrow().clone())
}

/// Runs real subprocesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &ProcessSpec, listener: &dyn TaskListener) -> Result<CommandOutput> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let process = Arc::new(AsyncProcess::start(
            spec,
            Some(Arc::new(ChannelListener(tx))),
        )?);
        let abort = current_abort();
        if let Some(abort) = &abort {
            abort.attach(&process);
        }

        let mut output = CommandOutput::default();
        // Ends once both reader threads dropped their sender.
        for line in rx.iter() {
            match line {
                OutputLine::Stdout(line) => {
                    listener.on_data(&line);
                    output.stdout.push_str(&line);
                    output.stdout.push('\n');
                }
                OutputLine::Stderr(line) => {
                    listener.on_error(&line);
                    output.stderr.push_str(&line);
                    output.stderr.push('\n');
                }
            }
        }

        let code = process.finish();
        if let Some(abort) = &abort {
            abort.detach(&process);
        }
        output.code = code?;
        tracing::debug!(command = %spec.display(), code = output.code, "process finished");
        Ok(output)
    }
}
