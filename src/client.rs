//! Remote client: one negotiated connection's command templates.
//!
//! Construction runs a synchronous handshake probe (`date` on the remote
//! shell). Unknown host keys are accepted only when the mapping's `hostkey`
//! is the `*` wildcard; the accepted fingerprint is appended to every later
//! command line.
//!
//! Primitives (`remove`, `mkdir`, `list_dir`, `put_file`, ...) never block:
//! they enqueue a task with the matching listener and return. `shell` and
//! `copy` run synchronously and are meant for code already running on the
//! task-queue worker.

use std::path::Path;
use std::sync::Arc;

use crate::config::{HOSTKEY_AUTO_ACCEPT, MappingConfig, Settings};
use crate::error::{Result, ScpError};
use crate::listener::{
    CommandListener, CopyDirListener, CopyFileListener, ListDirListener, NoopListener,
    TaskListener,
};
use crate::process::{CommandOutput, CommandRunner, ProcessSpec};
use crate::progress::ProgressSink;
use crate::task::{Task, TaskQueue};

/// Trivial remote command used to validate connectivity and host identity.
pub const PROBE_COMMAND: &str = "date";

/// Minimum number of colon separated bytes in a host-key fingerprint.
const FINGERPRINT_MIN_BYTES: usize = 16;

/// Find a colon-delimited lowercase hex fingerprint (at least 16 bytes)
/// anywhere in `text`. The leftmost and then longest run wins.
pub fn find_fingerprint(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let is_pair = |at: usize| {
        bytes
            .get(at..at + 2)
            .is_some_and(|pair| pair.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
    };
    (0..bytes.len()).find_map(|start| {
        let mut pairs = 0;
        while is_pair(start + pairs * 3) && bytes.get(start + pairs * 3 + 2) == Some(&b':') {
            pairs += 1;
        }
        let bytes_found = if is_pair(start + pairs * 3) {
            pairs + 1
        } else {
            // Trailing colon: the last pair ends the fingerprint.
            pairs
        };
        (bytes_found >= FINGERPRINT_MIN_BYTES).then(|| &text[start..start + bytes_found * 3 - 1])
    })
}

/// Quote a remote path for embedding in a remote shell command.
pub fn quote(path: &str) -> String {
    shell_words::quote(path).into_owned()
}

fn remote_parent(remote: &str) -> &str {
    match remote.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => "/",
        Some((parent, _)) => parent,
        None => ".",
    }
}

fn check_output(output: CommandOutput) -> Result<String> {
    if output.succeeded() {
        return Ok(output.stdout);
    }
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        Err(ScpError::Command(format!("exit code {}", output.code)))
    } else {
        Err(ScpError::Command(stderr.to_string()))
    }
}

/// Command-line prefixes for one host.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Templates {
    shell: Vec<String>,
    copy: Vec<String>,
}

impl Templates {
    fn build(settings: &Settings, config: &MappingConfig, hostkeys: &[String]) -> Self {
        let mut options = vec!["-P".to_string(), config.port.to_string()];
        if let Some(passwd) = config.passwd.as_deref().filter(|p| !p.is_empty()) {
            options.extend(["-pw".to_string(), passwd.to_string()]);
        }
        for key in hostkeys {
            options.extend(["-hostkey".to_string(), key.clone()]);
        }

        let mut shell = vec![
            settings.shell_program.clone(),
            "-ssh".to_string(),
            "-batch".to_string(),
        ];
        shell.extend(options.iter().cloned());
        shell.push(format!("{}@{}", config.user, config.host));

        let mut copy = vec![
            settings.copy_program.clone(),
            "-scp".to_string(),
            "-batch".to_string(),
        ];
        copy.extend(options);

        Self { shell, copy }
    }

    fn shell_spec(&self, command: &str) -> ProcessSpec {
        let mut argv = self.shell.clone();
        argv.push(command.to_string());
        ProcessSpec::new(argv)
    }

    fn copy_spec<S: AsRef<str>>(&self, args: &[S]) -> ProcessSpec {
        let mut argv = self.copy.clone();
        argv.extend(args.iter().map(|a| a.as_ref().to_string()));
        ProcessSpec::new(argv)
    }
}

/// An accepted connection to one remote host.
pub struct RemoteClient {
    host: String,
    port: u16,
    user: String,
    hostkeys: Vec<String>,
    templates: Templates,
    server_time: String,
    runner: Arc<dyn CommandRunner>,
    queue: Arc<TaskQueue>,
    sink: Arc<dyn ProgressSink>,
}

impl RemoteClient {
    /// Run the handshake probe and build the client.
    ///
    /// Fails with [`ScpError::Connection`] unless the probe eventually
    /// succeeds. Each retry requires a fingerprint not seen before.
    pub fn connect(
        config: &MappingConfig,
        settings: &Settings,
        runner: Arc<dyn CommandRunner>,
        queue: Arc<TaskQueue>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let auto_accept = config.auto_accept_hostkey();
        let mut hostkeys: Vec<String> = config
            .hostkey
            .iter()
            .filter(|key| !key.is_empty() && key.as_str() != HOSTKEY_AUTO_ACCEPT)
            .cloned()
            .collect();

        let server_time = loop {
            let templates = Templates::build(settings, config, &hostkeys);
            let spec = templates.shell_spec(PROBE_COMMAND);
            tracing::debug!(host = %config.host, command = %spec.display(), "handshake probe");
            let error = match runner.run(&spec, &NoopListener).and_then(check_output) {
                Ok(time) => break time.trim().to_string(),
                Err(ScpError::Command(error)) => error,
                Err(e) => return Err(ScpError::Connection(e.to_string())),
            };
            let Some(fingerprint) = find_fingerprint(&error) else {
                tracing::warn!(host = %config.host, error = %error, "handshake failed");
                return Err(ScpError::Connection("connection failed!".to_string()));
            };
            if !auto_accept {
                return Err(ScpError::Connection(format!(
                    "invalid fingerprint {fingerprint}!"
                )));
            }
            if hostkeys.iter().any(|key| key == fingerprint) {
                return Err(ScpError::Connection(format!(
                    "host key {fingerprint} rejected after acceptance!"
                )));
            }
            tracing::warn!(
                host = %config.host,
                fingerprint = %fingerprint,
                "using unknown host fingerprint"
            );
            hostkeys.push(fingerprint.to_string());
        };

        tracing::info!(host = %config.host, port = config.port, user = %config.user, "connected");
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            templates: Templates::build(settings, config, &hostkeys),
            hostkeys,
            server_time,
            runner,
            queue,
            sink,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Output of the handshake probe (remote clock).
    pub fn server_time(&self) -> &str {
        &self.server_time
    }

    /// Last host-key fingerprint trusted by this client, if any.
    pub fn accepted_hostkey(&self) -> Option<&str> {
        self.hostkeys.last().map(String::as_str)
    }

    pub fn sink(&self) -> &Arc<dyn ProgressSink> {
        &self.sink
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// `user@host:remote` endpoint for the copy tool.
    pub fn scp_url(&self, remote: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, remote)
    }

    // -------------------------------------------------------------------------
    // Synchronous helpers (worker thread)
    // -------------------------------------------------------------------------

    /// Run a remote shell command and return its stdout.
    pub fn shell(&self, command: &str) -> Result<String> {
        let spec = self.templates.shell_spec(command);
        self.runner.run(&spec, &NoopListener).and_then(check_output)
    }

    /// Run the copy tool with `args`, streaming its output to `listener`.
    pub fn copy<S: AsRef<str>>(&self, args: &[S], listener: &dyn TaskListener) -> Result<()> {
        let spec = self.templates.copy_spec(args);
        let output = self.runner.run(&spec, listener)?;
        if output.code != 0 {
            let stderr = output.stderr.trim();
            return Err(ScpError::Command(if stderr.is_empty() {
                format!("exit code {}", output.code)
            } else {
                stderr.to_string()
            }));
        }
        Ok(())
    }

    /// Upload `local` to `remote`, creating the remote parent on failure.
    pub fn copy_up(&self, local: &Path, remote: &str, listener: &dyn TaskListener) -> Result<()> {
        let local = local.to_string_lossy().into_owned();
        let url = self.scp_url(remote);
        match self.copy(&[local.as_str(), url.as_str()], listener) {
            Ok(()) => Ok(()),
            Err(ScpError::Command(error)) => {
                tracing::debug!(remote = %remote, error = %error, "upload failed, creating remote parent");
                self.shell(&format!("mkdir -p {}", quote(remote_parent(remote))))?;
                self.copy(&[local.as_str(), url.as_str()], listener)
            }
            Err(e) => Err(e),
        }
    }

    /// Download `remote` to `local`.
    pub fn copy_down(&self, remote: &str, local: &Path, listener: &dyn TaskListener) -> Result<()> {
        let local = local.to_string_lossy().into_owned();
        self.copy(&[self.scp_url(remote), local], listener)
    }

    /// Kill the process the queue's active task is running.
    ///
    /// Processes started on other threads, such as another client's
    /// handshake, are left alone.
    pub fn abort(&self) -> bool {
        self.queue.abort_active()
    }

    // -------------------------------------------------------------------------
    // Queued primitives
    // -------------------------------------------------------------------------

    fn enqueue_shell(&self, command: String, label: String) {
        let listener = Arc::new(CommandListener::new(label, Arc::clone(&self.sink)));
        self.queue
            .enqueue(Task::process(self.templates.shell_spec(&command)).with_listener(listener));
    }

    /// Remove remote paths recursively, in one remote command.
    pub fn remove<S: AsRef<str>>(&self, remote: &[S]) {
        if remote.is_empty() {
            return;
        }
        let command = remote
            .iter()
            .map(|path| format!("rm -r {}", quote(path.as_ref())))
            .collect::<Vec<_>>()
            .join("; ");
        self.enqueue_shell(command, format!("SCP remove {}", join_paths(remote)));
    }

    /// Create remote directories (with parents), in one remote command.
    pub fn mkdir<S: AsRef<str>>(&self, remote: &[S]) {
        if remote.is_empty() {
            return;
        }
        let command = remote
            .iter()
            .map(|path| format!("mkdir -p {}", quote(path.as_ref())))
            .collect::<Vec<_>>()
            .join("; ");
        self.enqueue_shell(command, format!("SCP mkdir {}", join_paths(remote)));
    }

    /// Move `from` to `to`, creating the target's parent first.
    pub fn rename(&self, from: &str, to: &str) {
        let command = format!(
            "mkdir -p {}; mv {} {}",
            quote(remote_parent(to)),
            quote(from),
            quote(to)
        );
        self.enqueue_shell(command, format!("SCP rename {from} --> {to}"));
    }

    /// List a remote directory through the copy tool.
    pub fn list_dir(&self, remote: &str) {
        let spec = self.templates.copy_spec(&["-ls".to_string(), self.scp_url(remote)]);
        let listener = Arc::new(ListDirListener::new(Arc::clone(&self.sink)));
        self.queue.enqueue(Task::process(spec).with_listener(listener));
    }

    /// Upload a single file. Retries once after creating the remote parent.
    pub fn put_file(self: &Arc<Self>, local: &Path, remote: &str) {
        let listener = Arc::new(CopyFileListener::with_endpoints(
            local.display().to_string(),
            self.scp_url(remote),
            Arc::clone(&self.sink),
        ));
        let client = Arc::clone(self);
        let local = local.to_path_buf();
        let remote = remote.to_string();
        self.queue.enqueue(
            Task::function(format!("put {}", local.display()), move |listener| {
                client.copy_up(&local, &remote, listener)
            })
            .with_listener(listener),
        );
    }

    /// Download a single file.
    pub fn get_file(&self, remote: &str, local: &Path) {
        let spec = self
            .templates
            .copy_spec(&[self.scp_url(remote), local.to_string_lossy().into_owned()]);
        let listener = Arc::new(CopyFileListener::new(Arc::clone(&self.sink)));
        self.queue.enqueue(Task::process(spec).with_listener(listener));
    }

    /// Recursively upload directory `local` into `remote_parent`.
    pub fn put_dir(&self, local: &Path, remote_parent: &str) {
        let spec = self.templates.copy_spec(&[
            "-r".to_string(),
            local.to_string_lossy().into_owned(),
            self.scp_url(remote_parent),
        ]);
        let listener = Arc::new(CopyDirListener::new(Arc::clone(&self.sink)));
        self.queue.enqueue(Task::process(spec).with_listener(listener));
    }

    /// Recursively download `remote` into local directory `local_parent`.
    pub fn get_dir(&self, remote: &str, local_parent: &Path) {
        let spec = self.templates.copy_spec(&[
            "-r".to_string(),
            self.scp_url(remote),
            local_parent.to_string_lossy().into_owned(),
        ]);
        let listener = Arc::new(CopyDirListener::new(Arc::clone(&self.sink)));
        self.queue.enqueue(Task::process(spec).with_listener(listener));
    }
}

fn join_paths<S: AsRef<str>>(paths: &[S]) -> String {
    paths
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ")
}
