//! Registry of live folder mappings.
//!
//! Lookups pick the mapping with the deepest root that owns a path, so a
//! nested `.scp` marker shadows its parent for everything below it. The
//! collection is read from the worker thread while the caller connects and
//! disconnects, so it sits behind a `RwLock`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{Settings, find_root};
use crate::error::{Result, ScpError};
use crate::mapping::FolderMapping;
use crate::process::CommandRunner;
use crate::progress::ProgressSink;
use crate::task::TaskQueue;

/// Live connections plus the shared queue and runner they submit work to.
pub struct ConnectionRegistry {
    mappings: RwLock<Vec<Arc<FolderMapping>>>,
    settings: Settings,
    runner: Arc<dyn CommandRunner>,
    queue: Arc<TaskQueue>,
    sink: Arc<dyn ProgressSink>,
}

impl ConnectionRegistry {
    pub fn new(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        queue: Arc<TaskQueue>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            mappings: RwLock::new(Vec::new()),
            settings,
            runner,
            queue,
            sink,
        }
    }

    /// Start a queue on `runner` and build a registry around it.
    pub fn start(
        settings: Settings,
        runner: Arc<dyn CommandRunner>,
        sink: Arc<dyn ProgressSink>,
    ) -> std::io::Result<Self> {
        let queue = Arc::new(TaskQueue::start(Arc::clone(&runner))?);
        Ok(Self::new(settings, runner, queue, sink))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn sink(&self) -> &Arc<dyn ProgressSink> {
        &self.sink
    }

    fn lookup(&self, path: &Path) -> Option<Arc<FolderMapping>> {
        self.mappings
            .read()
            .iter()
            .filter(|mapping| mapping.owns(path))
            .max_by_key(|mapping| mapping.paths().depth())
            .cloned()
    }

    /// Connection owning `path`, connecting its mapped folder on demand.
    ///
    /// Returns `None` when `path` is not inside a mapped folder or the
    /// handshake fails; the error is logged and painted, not returned.
    pub fn connect(&self, path: &Path) -> Option<Arc<FolderMapping>> {
        match self.try_connect(path) {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "connect failed");
                self.sink.paint(&e.to_string());
                None
            }
        }
    }

    /// Like [`connect`](Self::connect), reporting why it failed.
    pub fn try_connect(&self, path: &Path) -> Result<Arc<FolderMapping>> {
        let Some(root) = find_root(path) else {
            return self.connection(path);
        };
        if let Some(mapping) = self.lookup(path)
            && mapping.paths().depth() >= crate::mapping::normalize(&root).components().count()
        {
            return Ok(mapping);
        }

        let mapping = Arc::new(FolderMapping::open(
            &root,
            &self.settings,
            Arc::clone(&self.runner),
            Arc::clone(&self.queue),
            Arc::clone(&self.sink),
        )?);

        let mut mappings = self.mappings.write();
        // Another caller may have connected the same root meanwhile.
        if let Some(existing) = mappings.iter().find(|m| m.is_root(mapping.root())) {
            return Ok(Arc::clone(existing));
        }
        mappings.push(Arc::clone(&mapping));
        tracing::debug!(root = %root.display(), live = mappings.len(), "connection registered");
        Ok(mapping)
    }

    /// Drop every mapping owning `path`. No-op when nothing matches.
    ///
    /// Tasks already queued keep the client they captured.
    pub fn disconnect(&self, path: &Path) -> usize {
        let mut mappings = self.mappings.write();
        let before = mappings.len();
        mappings.retain(|mapping| !mapping.owns(path));
        let removed = before - mappings.len();
        if removed > 0 {
            tracing::info!(path = %path.display(), removed, "disconnected");
        }
        removed
    }

    pub fn is_connected(&self, path: &Path) -> bool {
        self.lookup(path).is_some()
    }

    /// Live mapping owning `path`.
    pub fn connection(&self, path: &Path) -> Result<Arc<FolderMapping>> {
        self.lookup(path).ok_or_else(|| ScpError::not_connected(path))
    }

    /// Snapshot of every live mapping.
    pub fn mappings(&self) -> Vec<Arc<FolderMapping>> {
        self.mappings.read().clone()
    }

    /// Drop queued work and kill the running transfer.
    pub fn cancel_all(&self) -> usize {
        self.queue.cancel_all()
    }

    /// Forget all connections and stop the worker.
    pub fn shutdown(&self) {
        self.mappings.write().clear();
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAPPING_FILE;
    use crate::error::ErrorKind;
    use crate::progress::RecordingSink;
    use crate::test_support::{ScriptedRunner, test_queue};
    use std::fs;
    use std::path::PathBuf;

    struct Fixture {
        _tmp: tempfile::TempDir,
        outer: PathBuf,
        inner: PathBuf,
        runner: Arc<ScriptedRunner>,
        sink: Arc<RecordingSink>,
        registry: ConnectionRegistry,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();
        fs::write(
            outer.join(MAPPING_FILE),
            r#"{"host": "outer.example.org", "path": "/srv/outer"}"#,
        )
        .unwrap();
        fs::write(
            inner.join(MAPPING_FILE),
            r#"{"host": "inner.example.org", "path": "/srv/inner"}"#,
        )
        .unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = ConnectionRegistry::new(
            Settings::default(),
            runner.clone(),
            test_queue(runner.clone()),
            sink.clone(),
        );
        Fixture {
            _tmp: tmp,
            outer,
            inner,
            runner,
            sink,
            registry,
        }
    }

    #[test]
    fn test_connect_reuses_live_mapping() {
        let f = fixture();
        let first = f.registry.connect(&f.outer.join("a.txt")).unwrap();
        let second = f.registry.connect(&f.outer.join("b/c.txt")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.client().host(), "outer.example.org");
        // One handshake only.
        assert_eq!(f.runner.calls().len(), 1);
        assert_eq!(f.registry.mappings().len(), 1);
    }

    #[test]
    fn test_deepest_root_wins() {
        let f = fixture();
        let outer = f.registry.connect(&f.outer.join("a.txt")).unwrap();
        let inner = f.registry.connect(&f.inner.join("x.txt")).unwrap();
        assert_eq!(inner.client().host(), "inner.example.org");
        assert_eq!(f.registry.mappings().len(), 2);

        let owner = f.registry.connection(&f.inner.join("deep/y.txt")).unwrap();
        assert!(Arc::ptr_eq(&owner, &inner));
        assert_eq!(
            owner.to_remote_path(&f.inner.join("deep/y.txt")).unwrap(),
            "/srv/inner/deep/y.txt"
        );
        let owner = f.registry.connection(&f.outer.join("a.txt")).unwrap();
        assert!(Arc::ptr_eq(&owner, &outer));
    }

    #[test]
    fn test_nested_marker_connects_even_when_parent_is_live() {
        let f = fixture();
        f.registry.connect(&f.outer.join("a.txt")).unwrap();
        let inner = f.registry.connect(&f.inner.join("x.txt")).unwrap();
        assert_eq!(inner.root(), crate::mapping::normalize(&f.inner));
    }

    #[test]
    fn test_connect_failure_is_not_registered() {
        let f = fixture();
        f.runner.push_err("FATAL ERROR: Network error: Connection refused\n");
        assert!(f.registry.connect(&f.outer.join("a.txt")).is_none());
        assert!(!f.registry.is_connected(&f.outer.join("a.txt")));
        assert_eq!(f.sink.painted(), vec!["SCP: connection failed!".to_string()]);
    }

    #[test]
    fn test_unmapped_path_is_not_connected() {
        let f = fixture();
        let unmapped = f.outer.parent().unwrap().join("elsewhere/file.txt");
        assert!(f.registry.connect(&unmapped).is_none());
        let err = f.registry.connection(&unmapped).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(f.runner.calls().is_empty());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let f = fixture();
        let path = f.outer.join("a.txt");
        f.registry.connect(&path).unwrap();
        assert!(f.registry.is_connected(&path));
        assert_eq!(f.registry.disconnect(&path), 1);
        assert!(!f.registry.is_connected(&path));
        assert_eq!(f.registry.disconnect(&path), 0);
    }

    #[test]
    fn test_cancel_all_drops_queued_work() {
        let f = fixture();
        let mapping = f.registry.connect(&f.outer.join("a.txt")).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        f.registry.queue().call_func("blocker", move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(())
        });
        started_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .unwrap();
        mapping.remove(&[f.outer.join("a.txt")]).unwrap();
        mapping.mkdir(&[f.outer.join("b")]).unwrap();

        assert_eq!(f.registry.cancel_all(), 2);
        release_tx.send(()).unwrap();
        f.registry.queue().wait_idle();
        // Only the handshake reached the runner.
        assert_eq!(f.runner.calls().len(), 1);
    }
}
