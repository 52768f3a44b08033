//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::MappingConfig;
use crate::error::Result;
use crate::listener::TaskListener;
use crate::process::{CommandOutput, CommandRunner, ProcessSpec};
use crate::task::TaskQueue;

type Hook = Box<dyn Fn(&ProcessSpec) + Send + Sync>;

/// Command runner answering from a script instead of spawning tools.
///
/// Responses are consumed in order; once the script is exhausted every
/// command succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<CommandOutput>>,
    calls: Mutex<Vec<Vec<String>>>,
    hook: Mutex<Option<Hook>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, output: CommandOutput) {
        self.responses.lock().push_back(output);
    }

    pub fn push_ok(&self, stdout: &str) {
        self.push(CommandOutput {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }

    pub fn push_err(&self, stderr: &str) {
        self.push(CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    /// Run `hook` for every command before its scripted answer is returned.
    pub fn on_run(&self, hook: impl Fn(&ProcessSpec) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Command lines run so far.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &ProcessSpec, listener: &dyn TaskListener) -> Result<CommandOutput> {
        self.calls.lock().push(spec.argv.clone());
        if let Some(hook) = self.hook.lock().as_ref() {
            hook(spec);
        }
        let output = self.responses.lock().pop_front().unwrap_or_default();
        for line in output.stdout.lines() {
            listener.on_data(line);
        }
        for line in output.stderr.lines() {
            listener.on_error(line);
        }
        Ok(output)
    }
}

/// Mapping of the local test root onto `guest@example.org:/srv`.
pub fn mapping_config() -> MappingConfig {
    MappingConfig::parse(r#"{"host": "example.org", "user": "guest", "path": "/srv"}"#)
        .expect("valid test mapping")
}

/// Queue whose process tasks run through `runner`.
pub fn test_queue(runner: Arc<ScriptedRunner>) -> Arc<TaskQueue> {
    Arc::new(TaskQueue::start(runner).expect("start task queue"))
}
