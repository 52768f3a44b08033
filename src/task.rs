//! Serialized task execution.
//!
//! A [`TaskQueue`] owns exactly one worker thread that drains a FIFO of
//! [`Task`]s. Tasks never run concurrently, even when they belong to
//! different connections, so remote tools sharing temp-file naming schemes
//! cannot collide.
//!
//! State transitions:
//! ```text
//! idle ──enqueue──> draining ──pop──> running ──finish──> draining | idle
//!                                        │
//!                                        └──cancel_all──> (process killed) ──> finish
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::listener::{NoopListener, TaskListener};
use crate::process::{AbortHandle, CommandRunner, ProcessSpec, with_abort};

/// Result of a finished task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Process task exited with this code (negative: killed by signal).
    Exit(i32),
    /// Function task returned successfully.
    Done,
    /// Function task failed, panicked, or the process could not start.
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exit(0) | Self::Done)
    }

    /// Process-style exit code for any outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exit(code) => *code,
            Self::Done => 0,
            Self::Failed(_) => 1,
        }
    }
}

/// Body of a function task. Receives the task's listener to forward data.
pub type TaskFn = Box<dyn FnOnce(&dyn TaskListener) -> Result<()> + Send>;

/// What a task executes.
pub enum TaskKind {
    Function(TaskFn),
    Process(ProcessSpec),
}

/// One unit of deferred work.
pub struct Task {
    label: String,
    kind: TaskKind,
    listener: Option<Arc<dyn TaskListener>>,
}

impl Task {
    pub fn function<F>(label: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&dyn TaskListener) -> Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            kind: TaskKind::Function(Box::new(body)),
            listener: None,
        }
    }

    pub fn process(spec: ProcessSpec) -> Self {
        Self {
            label: spec.display(),
            kind: TaskKind::Process(spec),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

struct Queued {
    task: Task,
    generation: u64,
}

struct Shared {
    tasks: Receiver<Queued>,
    shutdown: Receiver<()>,
    runner: Arc<dyn CommandRunner>,
    /// Label of the executing task. The generation check happens under this
    /// lock so `cancel_all` either sees the task or the task sees the bump.
    active: Mutex<Option<String>>,
    /// Bumped by `cancel_all`; tasks queued under an older generation are dropped.
    generation: AtomicU64,
    /// Kills the processes the active task starts on the worker thread.
    abort: AbortHandle,
    pending: Mutex<usize>,
    idle: Condvar,
    completed: AtomicU64,
}

impl Shared {
    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn run(&self) {
        loop {
            crossbeam_channel::select! {
                recv(self.tasks) -> queued => {
                    let Ok(Queued { task, generation }) = queued else {
                        break;
                    };
                    if self.activate(&task.label, generation) {
                        with_abort(&self.abort, || self.execute(task));
                        self.completed.fetch_add(1, Ordering::SeqCst);
                    } else {
                        tracing::debug!(task = %task.label, "dropping cancelled task");
                    }
                    self.finish_one();
                }
                recv(self.shutdown) -> _ => break,
            }
        }
        tracing::debug!("task queue worker stopped");
    }

    /// Mark `label` active unless a cancel arrived after it was queued.
    fn activate(&self, label: &str, generation: u64) -> bool {
        let mut active = self.active.lock();
        if generation < self.generation.load(Ordering::SeqCst) {
            return false;
        }
        self.abort.reset();
        *active = Some(label.to_string());
        true
    }

    fn execute(&self, task: Task) {
        let Task {
            label,
            kind,
            listener,
        } = task;
        let listener: Arc<dyn TaskListener> = listener.unwrap_or_else(|| Arc::new(NoopListener));

        let started = Instant::now();

        let outcome = match kind {
            TaskKind::Function(body) => {
                listener.on_start(&[]);
                match catch_unwind(AssertUnwindSafe(|| body(listener.as_ref()))) {
                    Ok(Ok(())) => TaskOutcome::Done,
                    Ok(Err(e)) => {
                        tracing::warn!(task = %label, error = %e, "task failed");
                        TaskOutcome::Failed(e.to_string())
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(task = %label, panic = %message, "task panicked");
                        TaskOutcome::Failed(message)
                    }
                }
            }
            TaskKind::Process(spec) => {
                listener.on_start(&spec.argv);
                match self.runner.run(&spec, listener.as_ref()) {
                    Ok(output) => TaskOutcome::Exit(output.code),
                    Err(e) => {
                        tracing::warn!(command = %spec.display(), error = %e, "process failed to start");
                        TaskOutcome::Failed(e.to_string())
                    }
                }
            }
        };

        if catch_unwind(AssertUnwindSafe(|| listener.on_finished(&outcome))).is_err() {
            tracing::error!(task = %label, "listener panicked in on_finished");
        }
        *self.active.lock() = None;
        tracing::debug!(
            task = %label,
            success = outcome.is_success(),
            duration_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

/// FIFO work queue drained by a single worker thread.
pub struct TaskQueue {
    tasks: Sender<Queued>,
    shutdown: Sender<()>,
    shared: Arc<Shared>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create the queue and start its worker thread. Process tasks run
    /// through `runner`.
    pub fn start(runner: Arc<dyn CommandRunner>) -> std::io::Result<Self> {
        let (tasks_tx, tasks_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let shared = Arc::new(Shared {
            tasks: tasks_rx,
            shutdown: shutdown_rx,
            runner,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            abort: AbortHandle::new(),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            completed: AtomicU64::new(0),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("scp-task-queue".to_string())
                .spawn(move || shared.run())?
        };
        Ok(Self {
            tasks: tasks_tx,
            shutdown: shutdown_tx,
            shared,
            running: AtomicBool::new(true),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Append a task. Never blocks.
    pub fn enqueue(&self, task: Task) {
        if !self.running.load(Ordering::SeqCst) {
            tracing::warn!(task = %task.label, "task queue stopped; task discarded");
            return;
        }
        *self.shared.pending.lock() += 1;
        let generation = self.shared.generation.load(Ordering::SeqCst);
        tracing::debug!(task = %task.label, "task queued");
        if let Err(e) = self.tasks.send(Queued { task, generation }) {
            tracing::warn!(task = %e.into_inner().task.label, "task queue closed; task discarded");
            self.shared.finish_one();
        }
    }

    /// Enqueue a function task.
    pub fn call_func<F>(&self, label: impl Into<String>, body: F)
    where
        F: FnOnce(&dyn TaskListener) -> Result<()> + Send + 'static,
    {
        self.enqueue(Task::function(label, body));
    }

    /// Drop all queued tasks and kill the process the active task is
    /// running, if any.
    ///
    /// Does not wait for the killed task's `on_finished`; it still arrives on
    /// the worker thread. Returns the number of discarded tasks.
    pub fn cancel_all(&self) -> usize {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let mut discarded = 0;
        while let Ok(queued) = self.shared.tasks.try_recv() {
            tracing::debug!(task = %queued.task.label, "discarding queued task");
            discarded += 1;
            self.shared.finish_one();
        }

        self.abort_active();
        if discarded > 0 {
            tracing::info!(discarded, "cancelled queued tasks");
        }
        discarded
    }

    /// Kill the process the active task is running, leaving the queue
    /// intact. Processes the task starts afterwards are killed as well.
    /// Returns whether a task was active.
    pub fn abort_active(&self) -> bool {
        let active = self.shared.active.lock();
        let Some(label) = active.as_ref() else {
            return false;
        };
        tracing::info!(task = %label, "killing active task");
        self.shared.abort.abort();
        true
    }

    /// Whether a task is currently executing.
    pub fn busy(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Number of tasks that ran to completion (cancelled ones excluded).
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Block until every enqueued task finished or was discarded.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) with an upper bound. Returns
    /// `false` on timeout.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            if self.shared.idle.wait_until(&mut pending, deadline).timed_out() {
                return *pending == 0;
            }
        }
        true
    }

    /// Stop the worker after its current task. Queued tasks are discarded.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.try_send(());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
            && worker.join().is_err()
        {
            tracing::error!("task queue worker panicked");
        }
        while self.shared.tasks.try_recv().is_ok() {
            self.shared.finish_one();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
