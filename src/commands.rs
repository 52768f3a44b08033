//! Editor-level operations on local paths.
//!
//! Each call is one logical request: it resolves paths to their
//! connections, queues the work and returns. Every request ends with exactly
//! one [`ProgressSink::done`], either from the listener of the queued task
//! or, when nothing could be queued, from here.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bulk::BulkTransfer;
use crate::config::{find_root, write_template};
use crate::error::{Result, ScpError};
use crate::mapping::FolderMapping;
use crate::progress::ProgressSink;
use crate::registry::ConnectionRegistry;

const NOTHING_TO_TRANSFER: &str = "SCP: Nothing to transfer";

/// Paths grouped by the connection owning them, in first-seen order.
type Groups = Vec<(Arc<FolderMapping>, Vec<PathBuf>)>;

pub struct SyncCommands {
    registry: Arc<ConnectionRegistry>,
}

impl SyncCommands {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn sink(&self) -> &Arc<dyn ProgressSink> {
        self.registry.sink()
    }

    fn fail(&self, error: &ScpError) {
        tracing::warn!(error = %error, "request failed");
        self.sink().done(&error.to_string(), false);
    }

    /// Group connected, non-ignored paths by owning connection.
    fn group(&self, paths: &[PathBuf]) -> Groups {
        let mut groups: Groups = Vec::new();
        for path in paths {
            if self.registry.settings().is_ignored(path) {
                tracing::debug!(path = %path.display(), "ignored");
                continue;
            }
            let mapping = match self.registry.connection(path) {
                Ok(mapping) => mapping,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping");
                    continue;
                }
            };
            match groups.iter_mut().find(|(m, _)| Arc::ptr_eq(m, &mapping)) {
                Some((_, group)) => group.push(path.clone()),
                None => groups.push((mapping, vec![path.clone()])),
            }
        }
        groups
    }

    /// Replace a mapped root by its children; copy tools cannot target a
    /// directory onto itself.
    fn expand_roots(&self, mapping: &FolderMapping, paths: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
        let mut expanded = Vec::with_capacity(paths.len());
        for path in paths {
            if !mapping.is_root(&path) {
                expanded.push(path);
                continue;
            }
            let mut children = fs::read_dir(&path)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()?;
            children.sort();
            expanded.extend(
                children
                    .into_iter()
                    .filter(|child| !self.registry.settings().is_ignored(child)),
            );
        }
        Ok(expanded)
    }

    fn nothing_connected(&self, paths: &[PathBuf]) {
        let path = paths.first().cloned().unwrap_or_default();
        self.fail(&ScpError::NotConnected { path });
    }

    fn bulk(&self, mapping: Arc<FolderMapping>) -> BulkTransfer {
        BulkTransfer::new(mapping, self.registry.settings().clone())
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    /// Upload `paths`. A single regular file goes through the copy tool
    /// directly, anything else as one bulk archive per connection.
    pub fn put(&self, paths: &[PathBuf]) {
        let groups = self.group(paths);
        if groups.is_empty() {
            self.nothing_connected(paths);
            return;
        }
        for (mapping, paths) in groups {
            let queued = self.expand_roots(&mapping, paths).and_then(|paths| {
                if let [single] = paths.as_slice()
                    && single.is_file()
                {
                    return mapping.put_file(single);
                }
                if paths.is_empty() {
                    self.sink().done(NOTHING_TO_TRANSFER, true);
                } else {
                    self.bulk(Arc::clone(&mapping)).put(paths);
                }
                Ok(())
            });
            if let Err(e) = queued {
                self.fail(&e);
            }
        }
    }

    /// Download `paths`. Mirrors [`put`](Self::put).
    pub fn get(&self, paths: &[PathBuf]) {
        let groups = self.group(paths);
        if groups.is_empty() {
            self.nothing_connected(paths);
            return;
        }
        for (mapping, paths) in groups {
            let queued = self.expand_roots(&mapping, paths).and_then(|paths| {
                if let [single] = paths.as_slice()
                    && !single.is_dir()
                {
                    return mapping.get_file(single);
                }
                if paths.is_empty() {
                    self.sink().done(NOTHING_TO_TRANSFER, true);
                } else {
                    self.bulk(Arc::clone(&mapping)).get(paths);
                }
                Ok(())
            });
            if let Err(e) = queued {
                self.fail(&e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Remote file management
    // -------------------------------------------------------------------------

    /// Remove `paths` remotely; one remote command per connection.
    pub fn delete(&self, paths: &[PathBuf]) {
        let groups = self.group(paths);
        if groups.is_empty() {
            self.nothing_connected(paths);
            return;
        }
        for (mapping, paths) in groups {
            if let Err(e) = mapping.remove(&paths) {
                self.fail(&e);
            }
        }
    }

    /// Move `from` to `to` on the remote side. Both must share a connection.
    pub fn rename(&self, from: &Path, to: &Path) {
        let queued = self.registry.connection(from).and_then(|mapping| {
            if !mapping.owns(to) {
                return Err(ScpError::invalid_path(to, "not in the same mapped folder"));
            }
            mapping.rename(from, to)
        });
        if let Err(e) = queued {
            self.fail(&e);
        }
    }

    pub fn mkdir(&self, paths: &[PathBuf]) {
        let groups = self.group(paths);
        if groups.is_empty() {
            self.nothing_connected(paths);
            return;
        }
        for (mapping, paths) in groups {
            if let Err(e) = mapping.mkdir(&paths) {
                self.fail(&e);
            }
        }
    }

    /// List the remote directory of `path`.
    pub fn list(&self, path: &Path) {
        if let Err(e) = self
            .registry
            .connection(path)
            .and_then(|mapping| mapping.list_dir(path))
        {
            self.fail(&e);
        }
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    /// Connect the mapped folders of `paths`; true if all succeeded.
    pub fn connect(&self, paths: &[PathBuf]) -> bool {
        self.sink().paint("Connecting...");
        let results: Vec<bool> = paths
            .iter()
            .map(|path| self.registry.connect(path).is_some())
            .collect();
        let connected = !results.is_empty() && results.iter().all(|ok| *ok);
        if connected {
            self.sink().done("SCP: Connected!", true);
        } else {
            self.sink().done("SCP: Connection failed!", false);
        }
        connected
    }

    pub fn disconnect(&self, paths: &[PathBuf]) {
        for path in paths {
            self.registry.disconnect(path);
        }
        self.sink().done("SCP: Disconnected!", true);
    }

    /// Whether a transfer is running; gates the abort action.
    pub fn busy(&self) -> bool {
        self.registry.queue().busy()
    }

    /// Drop queued work and kill the running transfer.
    pub fn cancel(&self) -> usize {
        let discarded = self.registry.cancel_all();
        self.sink().done("SCP: Aborted!", true);
        discarded
    }

    /// Write a `.scp` template into `dir` unless it is already mapped.
    pub fn map_to_remote(&self, dir: &Path) -> Result<PathBuf> {
        if let Some(root) = find_root(dir) {
            let existing = root.join(crate::config::MAPPING_FILE);
            self.sink()
                .done(&format!("SCP: already mapped by {}", existing.display()), true);
            return Ok(existing);
        }
        match write_template(dir) {
            Ok(path) => {
                self.sink()
                    .done(&format!("SCP: edit {} to map this folder", path.display()), true);
                Ok(path)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Upload a saved file when auto upload is on and its folder is
    /// connected. Returns whether an upload was queued.
    pub fn on_post_save(&self, path: &Path) -> bool {
        if !self.registry.settings().auto_upload || self.registry.settings().is_ignored(path) {
            return false;
        }
        match self.registry.connection(path) {
            Ok(mapping) if mapping.paths().is_included(path) => {
                self.put(&[path.to_path_buf()]);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAPPING_FILE, Settings};
    use crate::progress::RecordingSink;
    use crate::test_support::{ScriptedRunner, test_queue};
    use std::time::Duration;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        runner: Arc<ScriptedRunner>,
        sink: Arc<RecordingSink>,
        commands: SyncCommands,
    }

    fn fixture_with(settings: Settings, mapping: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("site");
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join(MAPPING_FILE), mapping).unwrap();
        fs::write(root.join("index.html"), "<html>").unwrap();
        fs::write(root.join("a/x.txt"), "x").unwrap();
        fs::write(root.join("a/b/y.txt"), "y").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = ConnectionRegistry::new(
            settings,
            runner.clone(),
            test_queue(runner.clone()),
            sink.clone(),
        );
        Fixture {
            _tmp: tmp,
            root,
            runner,
            sink,
            commands: SyncCommands::new(Arc::new(registry)),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            Settings::default(),
            r#"{"host": "example.org", "path": "/srv"}"#,
        )
    }

    impl Fixture {
        fn connect(&self) {
            assert!(self.commands.connect(&[self.root.clone()]));
        }

        fn drain(&self) {
            assert!(
                self.commands
                    .registry()
                    .queue()
                    .wait_idle_timeout(Duration::from_secs(10))
            );
        }

        fn statuses(&self) -> Vec<(String, bool)> {
            self.sink.finished()
        }
    }

    #[test]
    fn test_connect_reports_once() {
        let f = fixture();
        f.connect();
        assert_eq!(f.statuses(), vec![("SCP: Connected!".to_string(), true)]);
    }

    #[test]
    fn test_connect_failure() {
        let f = fixture();
        f.runner.push_err("Access denied\n");
        assert!(!f.commands.connect(&[f.root.join("index.html")]));
        assert_eq!(
            f.statuses(),
            vec![("SCP: Connection failed!".to_string(), false)]
        );
    }

    #[test]
    fn test_transfer_of_root_with_only_ignored_children_reports_once() {
        let f = fixture();
        fs::remove_file(f.root.join("index.html")).unwrap();
        fs::remove_dir_all(f.root.join("a")).unwrap();
        fs::create_dir_all(f.root.join(".git")).unwrap();
        f.connect();

        f.commands.put(&[f.root.clone()]);
        f.commands.get(&[f.root.clone()]);
        f.drain();
        assert_eq!(
            f.statuses()[1..],
            [
                (NOTHING_TO_TRANSFER.to_string(), true),
                (NOTHING_TO_TRANSFER.to_string(), true),
            ]
        );
        // Only the handshake ran.
        assert_eq!(f.runner.calls().len(), 1);
    }

    #[test]
    fn test_put_single_file_uses_copy_tool() {
        let f = fixture();
        f.connect();
        f.commands.put(&[f.root.join("index.html")]);
        f.drain();

        let calls = f.runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1][0], "pscp");
        assert_eq!(
            calls[1].last().map(String::as_str),
            Some("guest@example.org:/srv/index.html")
        );
        assert_eq!(f.statuses().len(), 2);
        assert!(f.statuses()[1].1);
    }

    #[test]
    fn test_put_many_files_is_one_bulk_request() {
        let f = fixture();
        f.connect();
        f.commands
            .put(&[f.root.join("a/x.txt"), f.root.join("a/b/y.txt")]);
        f.drain();

        let calls = f.runner.calls();
        // Handshake, archive upload, remote extraction.
        assert_eq!(calls.len(), 3);
        assert!(calls[2].last().unwrap().starts_with("mkdir -p /srv/a && tar -C /srv/a"));
        assert_eq!(
            f.statuses()[1..],
            [("SCP upload 2 path(s) OK".to_string(), true)]
        );
    }

    #[test]
    fn test_put_root_expands_children() {
        let f = fixture();
        f.connect();
        f.commands.put(&[f.root.clone()]);
        f.drain();

        let calls = f.runner.calls();
        assert_eq!(calls.len(), 3);
        // Children of the root share the root as base directory.
        assert!(calls[2].last().unwrap().starts_with("mkdir -p /srv && tar -C /srv"));
        assert_eq!(
            f.statuses()[1..],
            [("SCP upload 2 path(s) OK".to_string(), true)]
        );
    }

    #[test]
    fn test_put_unconnected_fails_without_commands() {
        let f = fixture();
        f.commands.put(&[f.root.join("index.html")]);
        f.drain();
        assert!(f.runner.calls().is_empty());
        let statuses = f.statuses();
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].1);
        assert!(statuses[0].0.starts_with("No SCP connection for"));
    }

    #[test]
    fn test_put_skips_ignored() {
        let f = fixture();
        f.connect();
        f.commands.put(&[f.root.join(MAPPING_FILE)]);
        f.drain();
        assert_eq!(f.runner.calls().len(), 1);
        assert!(!f.statuses()[1].1);
    }

    #[test]
    fn test_delete_batches_per_connection() {
        let f = fixture();
        f.connect();
        f.commands
            .delete(&[f.root.join("a/x.txt"), f.root.join("a/b")]);
        f.drain();
        let calls = f.runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1].last().map(String::as_str),
            Some("rm -r /srv/a/x.txt; rm -r /srv/a/b")
        );
        assert_eq!(f.statuses().len(), 2);
    }

    #[test]
    fn test_rename_outside_mapping_is_rejected() {
        let f = fixture();
        f.connect();
        f.commands
            .rename(&f.root.join("index.html"), Path::new("/elsewhere/index.html"));
        f.drain();
        assert_eq!(f.runner.calls().len(), 1);
        assert!(!f.statuses()[1].1);
    }

    #[test]
    fn test_rename_queues_mv() {
        let f = fixture();
        f.connect();
        f.commands
            .rename(&f.root.join("index.html"), &f.root.join("old/index.html"));
        f.drain();
        assert_eq!(
            f.runner.calls()[1].last().map(String::as_str),
            Some("mkdir -p /srv/old; mv /srv/index.html /srv/old/index.html")
        );
    }

    #[test]
    fn test_map_to_remote_writes_template_once() {
        let f = fixture();
        let dir = f.root.parent().unwrap().join("other");
        let path = f.commands.map_to_remote(&dir).unwrap();
        assert_eq!(path, dir.join(MAPPING_FILE));
        assert!(path.is_file());

        // Already mapped folders keep their file.
        let existing = f.commands.map_to_remote(&f.root.join("a")).unwrap();
        assert_eq!(existing, f.root.join(MAPPING_FILE));
        assert!(f.statuses().iter().all(|(_, ok)| *ok));
    }

    #[test]
    fn test_on_post_save_respects_settings() {
        let f = fixture();
        assert!(!f.commands.on_post_save(&f.root.join("index.html")));
        f.connect();
        assert!(f.commands.on_post_save(&f.root.join("index.html")));
        f.drain();
        assert_eq!(f.runner.calls().len(), 2);

        let settings = Settings {
            auto_upload: false,
            ..Settings::default()
        };
        let f = fixture_with(settings, r#"{"host": "example.org"}"#);
        f.connect();
        assert!(!f.commands.on_post_save(&f.root.join("index.html")));
    }

    #[test]
    fn test_on_post_save_skips_excluded_files() {
        let f = fixture_with(
            Settings::default(),
            r#"{"host": "example.org", "include": ["*.py"]}"#,
        );
        f.connect();
        assert!(!f.commands.on_post_save(&f.root.join("index.html")));
    }

    #[test]
    fn test_cancel_reports_aborted() {
        let f = fixture();
        assert!(!f.commands.busy());
        assert_eq!(f.commands.cancel(), 0);
        assert_eq!(f.statuses(), vec![("SCP: Aborted!".to_string(), true)]);
    }
}
