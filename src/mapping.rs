//! Folder mappings: a remote client bound to a local root directory.
//!
//! Path translation lives in [`RemotePaths`], which is pure and owns no
//! connection, so it can be checked without a remote host. [`FolderMapping`]
//! pairs it with a [`RemoteClient`] and exposes the client primitives in
//! terms of local paths.
//!
//! Translation of `<root>/a/b/c.txt` with remote root `/srv`:
//!
//! ```text
//! relative path   a/b/c.txt        (".." escapes are rejected)
//! remap           a/b -> www       (first rule matching a leading run of
//!                                   the directory part; the name is kept)
//! remote path     /srv/www/c.txt
//! ```
//!
//! [`RemotePaths::to_remote_dir`] treats the whole relative path as a
//! directory, so the folder `a/b` itself maps to `/srv/www`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use glob::{MatchOptions, Pattern};

use crate::client::RemoteClient;
use crate::config::{MAPPING_FILE, MappingConfig, Settings};
use crate::error::{Result, ScpError};
use crate::process::CommandRunner;
use crate::progress::ProgressSink;
use crate::task::TaskQueue;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Resolve `.` and `..` components without touching the filesystem.
///
/// A `..` that would climb above the start of a relative path is kept.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let climbable = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if climbable {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Comparison key for local paths; file systems on Windows ignore case.
fn path_key(path: &Path) -> PathBuf {
    let path = normalize(path);
    if cfg!(windows) {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path
    }
}

fn join_remote(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        base.to_string()
    } else if base.ends_with('/') {
        format!("{base}{relative}")
    } else {
        format!("{base}/{relative}")
    }
}

fn remote_dirname(remote: &str) -> String {
    let trimmed = remote.trim_end_matches('/');
    if trimmed.is_empty() && remote.starts_with('/') {
        return "/".to_string();
    }
    match trimmed.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

/// One compiled `remap` rule.
#[derive(Debug, Clone)]
struct RemapRule {
    pattern: Pattern,
    replacement: String,
}

fn compile(pattern: &str, source: &Path) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| ScpError::Config {
        path: source.to_path_buf(),
        reason: format!("invalid pattern {pattern:?}: {e}"),
    })
}

/// Local-to-remote path translation for one mapped root.
#[derive(Debug, Clone)]
pub struct RemotePaths {
    root: PathBuf,
    key: PathBuf,
    remote_root: String,
    remaps: Vec<RemapRule>,
    include: Vec<Pattern>,
}

impl RemotePaths {
    /// Build the translator for `root`, compiling the mapping's globs.
    pub fn new(root: &Path, config: &MappingConfig) -> Result<Self> {
        let source = root.join(MAPPING_FILE);
        let remaps = config
            .remap
            .iter()
            .map(|spec| {
                Ok(RemapRule {
                    pattern: compile(&spec.pattern, &source)?,
                    replacement: spec.replacement.trim_matches('/').to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let include = config
            .include
            .iter()
            .map(|pattern| compile(pattern, &source))
            .collect::<Result<Vec<_>>>()?;
        let root = normalize(root);
        Ok(Self {
            key: path_key(&root),
            root,
            remote_root: config.path.clone(),
            remaps,
            include,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn remote_root(&self) -> &str {
        &self.remote_root
    }

    /// Number of components of the local root; deeper roots win lookups.
    pub fn depth(&self) -> usize {
        self.root.components().count()
    }

    /// Whether `path` is the root or lies below it.
    pub fn owns(&self, path: &Path) -> bool {
        path_key(path).starts_with(&self.key)
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path_key(path) == self.key
    }

    /// Whether `path` lies strictly below the root.
    pub fn is_child(&self, path: &Path) -> bool {
        self.owns(path) && !self.is_root(path)
    }

    /// Components of `path` relative to the root.
    fn relative(&self, path: &Path) -> Result<Vec<String>> {
        let normalized = normalize(path);
        let key = path_key(&normalized);
        let Ok(relative) = key.strip_prefix(&self.key) else {
            return Err(ScpError::invalid_path(path, "outside of the mapped folder"));
        };
        // Take the names from the original spelling so case survives on Windows.
        let skip = self.root.components().count();
        let names: Vec<String> = normalized
            .components()
            .skip(skip)
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        debug_assert_eq!(names.len(), relative.components().count());
        if names.iter().any(|name| name == "..") {
            return Err(ScpError::invalid_path(path, "escapes the mapped folder"));
        }
        Ok(names)
    }

    /// Apply the first remap rule matching a leading run of the directory
    /// names `dirs`.
    ///
    /// Longer prefixes are tried first, so a rule for `a/b` beats the same
    /// rule matching just `a`.
    fn remap(&self, dirs: &[String]) -> Vec<String> {
        for rule in &self.remaps {
            for len in (1..=dirs.len()).rev() {
                let prefix = dirs[..len].join("/");
                if rule.pattern.matches_with(&prefix, MATCH_OPTIONS) {
                    let mut mapped: Vec<String> = rule
                        .replacement
                        .split('/')
                        .filter(|part| !part.is_empty())
                        .map(str::to_string)
                        .collect();
                    mapped.extend(dirs[len..].iter().cloned());
                    return mapped;
                }
            }
        }
        dirs.to_vec()
    }

    /// Remote path for a local path under the root.
    ///
    /// The root maps to the remote root verbatim. Remap rules see the
    /// directory part only; the final name is appended unchanged.
    pub fn to_remote_path(&self, path: &Path) -> Result<String> {
        if self.is_root(path) {
            return Ok(self.remote_root.clone());
        }
        let mut names = self.relative(path)?;
        let name = names.pop();
        let mut mapped = self.remap(&names);
        mapped.extend(name);
        self.join_checked(path, &mapped)
    }

    /// Remote location of the directory `path`, remapping every component.
    pub fn to_remote_dir(&self, path: &Path) -> Result<String> {
        if self.is_root(path) {
            return Ok(self.remote_root.clone());
        }
        let names = self.relative(path)?;
        self.join_checked(path, &self.remap(&names))
    }

    fn join_checked(&self, path: &Path, names: &[String]) -> Result<String> {
        let remote = join_remote(&self.remote_root, &names.join("/"));
        if remote.split('/').any(|part| part == "..") {
            return Err(ScpError::invalid_path(path, "remote path escapes the remote root"));
        }
        Ok(remote)
    }

    /// Remote directory containing `path`; the root yields the parent of
    /// the remote root.
    pub fn to_remote_parent(&self, path: &Path) -> Result<String> {
        if self.is_root(path) {
            return Ok(remote_dirname(&self.remote_root));
        }
        match normalize(path).parent() {
            Some(parent) => self.to_remote_dir(parent),
            None => Err(ScpError::invalid_path(path, "has no parent")),
        }
    }

    /// Whether a file passes the `include` globs (all files when unset).
    pub fn is_included(&self, path: &Path) -> bool {
        if self.include.is_empty() {
            return true;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative = self.relative(path).map(|names| names.join("/")).unwrap_or_default();
        self.include.iter().any(|pattern| {
            pattern.matches_with(&name, MATCH_OPTIONS)
                || pattern.matches_with(&relative, MATCH_OPTIONS)
        })
    }

    /// [`to_remote_path`](Self::to_remote_path) for a file transfer; files
    /// excluded by `include` are rejected.
    pub fn to_remote_file(&self, path: &Path) -> Result<String> {
        if !self.is_included(path) {
            return Err(ScpError::invalid_path(path, "not matched by include patterns"));
        }
        self.to_remote_path(path)
    }
}

/// A connected local folder.
pub struct FolderMapping {
    paths: RemotePaths,
    client: Arc<RemoteClient>,
}

impl FolderMapping {
    pub fn new(paths: RemotePaths, client: Arc<RemoteClient>) -> Self {
        Self { paths, client }
    }

    /// Load `root/.scp`, run the handshake and bind the client to `root`.
    pub fn open(
        root: &Path,
        settings: &Settings,
        runner: Arc<dyn CommandRunner>,
        queue: Arc<TaskQueue>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let config = MappingConfig::load(root)?;
        let paths = RemotePaths::new(root, &config)?;
        let client = RemoteClient::connect(&config, settings, runner, queue, sink)?;
        tracing::info!(
            root = %root.display(),
            remote = %client.scp_url(paths.remote_root()),
            "folder mapped"
        );
        Ok(Self::new(paths, Arc::new(client)))
    }

    pub fn paths(&self) -> &RemotePaths {
        &self.paths
    }

    pub fn client(&self) -> &Arc<RemoteClient> {
        &self.client
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn owns(&self, path: &Path) -> bool {
        self.paths.owns(path)
    }

    pub fn is_root(&self, path: &Path) -> bool {
        self.paths.is_root(path)
    }

    pub fn is_child(&self, path: &Path) -> bool {
        self.paths.is_child(path)
    }

    pub fn to_remote_path(&self, path: &Path) -> Result<String> {
        self.paths.to_remote_path(path)
    }

    pub fn to_remote_dir(&self, path: &Path) -> Result<String> {
        self.paths.to_remote_dir(path)
    }

    pub fn to_remote_parent(&self, path: &Path) -> Result<String> {
        self.paths.to_remote_parent(path)
    }

    /// Directory or file translation, picked by what `path` is locally.
    fn to_remote_entry(&self, path: &Path) -> Result<String> {
        if path.is_dir() {
            self.to_remote_dir(path)
        } else {
            self.to_remote_path(path)
        }
    }

    pub fn to_remote_file(&self, path: &Path) -> Result<String> {
        self.paths.to_remote_file(path)
    }

    /// `user@host:<remote path of path>`.
    pub fn scp_url(&self, path: &Path) -> Result<String> {
        Ok(self.client.scp_url(&self.to_remote_path(path)?))
    }

    // -------------------------------------------------------------------------
    // Primitives on local paths. Path errors surface before anything is queued.
    // -------------------------------------------------------------------------

    pub fn remove(&self, paths: &[PathBuf]) -> Result<()> {
        let remote = paths
            .iter()
            .map(|path| self.to_remote_entry(path))
            .collect::<Result<Vec<_>>>()?;
        self.client.remove(remote.as_slice());
        Ok(())
    }

    pub fn mkdir(&self, paths: &[PathBuf]) -> Result<()> {
        let remote = paths
            .iter()
            .map(|path| self.to_remote_dir(path))
            .collect::<Result<Vec<_>>>()?;
        self.client.mkdir(remote.as_slice());
        Ok(())
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        // The source is usually gone already; the target tells what moved.
        let (from, to) = if to.is_dir() {
            (self.to_remote_dir(from)?, self.to_remote_dir(to)?)
        } else {
            (self.to_remote_path(from)?, self.to_remote_path(to)?)
        };
        self.client.rename(&from, &to);
        Ok(())
    }

    pub fn list_dir(&self, path: &Path) -> Result<()> {
        self.client.list_dir(&self.to_remote_dir(path)?);
        Ok(())
    }

    pub fn put_file(&self, path: &Path) -> Result<()> {
        let remote = self.to_remote_file(path)?;
        self.client.put_file(path, &remote);
        Ok(())
    }

    pub fn get_file(&self, path: &Path) -> Result<()> {
        let remote = self.to_remote_file(path)?;
        self.client.get_file(&remote, path);
        Ok(())
    }

    pub fn put_dir(&self, path: &Path) -> Result<()> {
        let parent = self.to_remote_parent(path)?;
        self.client.put_dir(path, &parent);
        Ok(())
    }

    pub fn get_dir(&self, path: &Path) -> Result<()> {
        let remote = self.to_remote_path(path)?;
        let local_parent = normalize(path)
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ScpError::invalid_path(path, "has no parent"))?;
        self.client.get_dir(&remote, &local_parent);
        Ok(())
    }
}

impl std::fmt::Debug for FolderMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderMapping")
            .field("root", &self.paths.root)
            .field("remote", &self.client.scp_url(&self.paths.remote_root))
            .finish()
    }
}
