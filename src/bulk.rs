//! Archive based multi-file transfers.
//!
//! Uploading many small files one copy-tool call at a time pays the SSH
//! negotiation for every file. A bulk upload instead packs the files into one
//! tar archive, copies that once and unpacks it remotely. Entries are named
//! after their remote paths relative to the deepest remote directory they
//! share, so remap rules hold exactly as for single-file copies:
//!
//! ```text
//! local  scp_XXXX.tar  ──copy──>  <remote tmp>/scp_XXXX.tar
//! remote mkdir -p <target> && tar -C <target> -xf <tmp> && rm -f <tmp>
//! ```
//!
//! The local archive is a [`tempfile::NamedTempFile`] and is removed when the
//! transfer returns, successful or not. A failed extraction triggers one
//! best-effort `rm -f` of the remote archive.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::client::quote;
use crate::config::Settings;
use crate::error::{Result, ScpError};
use crate::listener::{ArchiveProgress, CommandListener};
use crate::mapping::{FolderMapping, normalize};
use crate::task::Task;

const ARCHIVE_OWNER: &str = "root";

/// Deepest directory containing every path (each path's parent counts, so
/// a single directory yields its parent).
pub fn common_dir(paths: &[PathBuf]) -> Option<PathBuf> {
    let mut parents = paths
        .iter()
        .map(|path| normalize(path).parent().map(Path::to_path_buf));
    let mut common = parents.next()??;
    for parent in parents {
        let parent = parent?;
        while !parent.starts_with(&common) {
            if !common.pop() {
                return None;
            }
        }
    }
    Some(common)
}

fn archive_header(metadata: &fs::Metadata) -> io::Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(metadata);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username(ARCHIVE_OWNER)?;
    header.set_groupname(ARCHIVE_OWNER)?;
    Ok(header)
}

/// One file or directory headed for an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: PathBuf,
    pub is_dir: bool,
}

/// Walk `paths` (recursing into directories) and name every entry with
/// `name_of`. Files rejected by `keep` are left out, as are repeated names.
pub fn collect_entries<N, F>(paths: &[PathBuf], name_of: N, keep: F) -> Result<Vec<ArchiveEntry>>
where
    N: Fn(&Path, bool) -> Result<String>,
    F: Fn(&Path) -> bool,
{
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    for input in paths {
        let input = normalize(input);
        for entry in WalkDir::new(&input).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let path = entry.path();
            let is_dir = entry.file_type().is_dir();
            if !is_dir && !keep(path) {
                tracing::debug!(path = %path.display(), "skipping excluded file");
                continue;
            }
            let name = name_of(path, is_dir)?;
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            entries.push(ArchiveEntry {
                name,
                source: path.to_path_buf(),
                is_dir,
            });
        }
    }
    Ok(entries)
}

/// Split remote paths into their deepest common directory and each path's
/// name below it.
pub fn split_remote_common(remote: &[String]) -> Option<(String, Vec<String>)> {
    let split: Vec<Vec<&str>> = remote
        .iter()
        .map(|path| path.trim_end_matches('/').split('/').collect())
        .collect();
    let first = split.first()?;
    let mut common = first.len().saturating_sub(1);
    for parts in &split {
        common = first[..common.min(parts.len().saturating_sub(1))]
            .iter()
            .zip(parts)
            .take_while(|(a, b)| a == b)
            .count();
    }
    let dir = match first[..common].join("/") {
        dir if !dir.is_empty() => dir,
        _ if first.first() == Some(&"") => "/".to_string(),
        _ => ".".to_string(),
    };
    let names = split.iter().map(|parts| parts[common..].join("/")).collect();
    Some((dir, names))
}

/// Write `entries` as a tar archive to `out`. Ownership is normalized to
/// `root:root`.
pub fn build_archive<W: Write>(out: W, entries: &[ArchiveEntry]) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    for entry in entries {
        let metadata = fs::metadata(&entry.source)?;
        let mut header = archive_header(&metadata)?;
        if entry.is_dir {
            header.set_size(0);
            builder.append_data(&mut header, &entry.name, io::empty())?;
        } else {
            builder.append_data(&mut header, &entry.name, File::open(&entry.source)?)?;
        }
    }
    builder.into_inner()?.flush()?;
    Ok(())
}

/// Local destination of the archive entry `name`: the member it equals or
/// lies below, followed by the rest of the name. Entries trying to climb
/// out are refused.
fn locate(members: &[(String, PathBuf)], name: &Path) -> Option<PathBuf> {
    let parts = name
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    members
        .iter()
        .filter_map(|(member, local)| {
            let member: Vec<&str> = member.split('/').collect();
            let matches = parts.len() >= member.len()
                && member.iter().zip(&parts).all(|(a, b)| *a == b.as_str());
            matches.then(|| {
                let mut target = local.clone();
                target.extend(&parts[member.len()..]);
                (member.len(), target)
            })
        })
        .max_by_key(|(depth, _)| *depth)
        .map(|(_, target)| target)
}

/// Unpack `archive`, placing every entry below the local path of the
/// member it belongs to. `members` pairs archive names with local paths.
/// Entries `keep` rejects are skipped. Returns the number of files written.
pub fn unpack_archive<F>(archive: &Path, members: &[(String, PathBuf)], keep: F) -> Result<usize>
where
    F: Fn(&Path) -> bool,
{
    let mut archive = tar::Archive::new(File::open(archive)?);
    archive.set_overwrite(true);
    archive.set_preserve_permissions(false);
    let mut unpacked = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let Some(target) = locate(members, &name) else {
            tracing::warn!(entry = %name.display(), "skipping unexpected archive entry");
            continue;
        };
        if !keep(&target) {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        if entry.header().entry_type().is_file() {
            unpacked += 1;
        }
    }
    Ok(unpacked)
}

fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

fn local_name(archive: &NamedTempFile) -> String {
    archive
        .path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "scp_archive.tar".to_string())
}

/// Bulk transfers between one folder mapping and its remote root.
#[derive(Clone)]
pub struct BulkTransfer {
    mapping: Arc<FolderMapping>,
    settings: Settings,
    local_tmp: PathBuf,
}

impl BulkTransfer {
    pub fn new(mapping: Arc<FolderMapping>, settings: Settings) -> Self {
        Self {
            mapping,
            settings,
            local_tmp: std::env::temp_dir(),
        }
    }

    /// Directory receiving local temporary archives.
    pub fn with_local_tmp(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_tmp = dir.into();
        self
    }

    fn temp_archive(&self) -> Result<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("scp_")
            .suffix(".tar")
            .tempfile_in(&self.local_tmp)?)
    }

    fn wanted(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        paths
            .iter()
            .filter(|path| !self.settings.is_ignored(path))
            .cloned()
            .collect()
    }

    fn keep(&self, path: &Path) -> bool {
        !self.settings.is_ignored(path) && self.mapping.paths().is_included(path)
    }

    /// Queue [`put_tree`](Self::put_tree) as one task with one status report.
    pub fn put(&self, paths: Vec<PathBuf>) {
        let label = format!("SCP upload {} path(s)", paths.len());
        self.enqueue(label, move |bulk| bulk.put_tree(&paths).map(drop));
    }

    /// Queue [`get_tree`](Self::get_tree) as one task with one status report.
    pub fn get(&self, paths: Vec<PathBuf>) {
        let label = format!("SCP download {} path(s)", paths.len());
        self.enqueue(label, move |bulk| bulk.get_tree(&paths).map(drop));
    }

    fn enqueue<F>(&self, label: String, body: F)
    where
        F: FnOnce(&BulkTransfer) -> Result<()> + Send + 'static,
    {
        let sink = Arc::clone(self.mapping.client().sink());
        let listener = Arc::new(CommandListener::new(label.clone(), Arc::clone(&sink)));
        let bulk = self.clone();
        self.mapping.client().queue().enqueue(
            Task::function(label, move |_| {
                body(&bulk).inspect_err(|e| sink.paint(&e.to_string()))
            })
            .with_listener(listener),
        );
    }

    /// Remote location of a local entry; directories remap as a whole.
    fn remote_entry(&self, path: &Path, is_dir: bool) -> Result<String> {
        if is_dir {
            self.mapping.to_remote_dir(path)
        } else {
            self.mapping.to_remote_path(path)
        }
    }

    /// Upload `paths` through one archive. Returns the number of entries.
    ///
    /// Entries are named after their remote paths, so remap rules apply to
    /// each of them, and the archive is unpacked in the deepest remote
    /// directory they share. Runs synchronously; call it from the task
    /// worker.
    pub fn put_tree(&self, paths: &[PathBuf]) -> Result<usize> {
        let paths = self.wanted(paths);
        let Some(base) = common_dir(&paths) else {
            return Ok(0);
        };
        let fail = |reason: String| ScpError::Bulk {
            dir: base.clone(),
            reason,
        };

        let mut entries = collect_entries(
            &paths,
            |path, is_dir| self.remote_entry(path, is_dir),
            |path| self.keep(path),
        )?;
        let remote: Vec<String> = entries.iter().map(|entry| entry.name.clone()).collect();
        let Some((target, names)) = split_remote_common(&remote) else {
            return Ok(0);
        };
        for (entry, name) in entries.iter_mut().zip(names) {
            entry.name = name;
        }
        entries.retain(|entry| !entry.name.is_empty());
        if entries.is_empty() {
            return Ok(0);
        }

        let archive = self.temp_archive()?;
        build_archive(archive.as_file(), &entries)
            .map_err(|e| fail(format!("building archive: {e}")))?;
        tracing::debug!(base = %base.display(), remote = %target, entries = entries.len(), "archive built");

        let client = self.mapping.client();
        let remote_archive = remote_join(&self.settings.remote_tmp_dir, &local_name(&archive));
        let progress = ArchiveProgress::new("uploading", Arc::clone(client.sink()));
        client
            .copy(
                &[
                    archive.path().to_string_lossy().into_owned(),
                    client.scp_url(&remote_archive),
                ],
                &progress,
            )
            .map_err(|e| fail(format!("uploading archive: {e}")))?;

        let extract = format!(
            "mkdir -p {target} && tar -C {target} -xf {tmp} && rm -f {tmp}",
            target = quote(&target),
            tmp = quote(&remote_archive),
        );
        if let Err(e) = client.shell(&extract) {
            if let Err(cleanup) = client.shell(&format!("rm -f {}", quote(&remote_archive))) {
                tracing::warn!(remote = %remote_archive, error = %cleanup, "remote archive left behind");
            }
            return Err(fail(format!("extracting archive: {e}")));
        }

        tracing::info!(
            host = %client.host(),
            remote = %target,
            entries = entries.len(),
            "bulk upload finished"
        );
        Ok(entries.len())
    }

    /// Download `paths` through one archive built remotely. Returns the
    /// number of files unpacked.
    pub fn get_tree(&self, paths: &[PathBuf]) -> Result<usize> {
        let paths = self.wanted(paths);
        let Some(base) = common_dir(&paths) else {
            return Ok(0);
        };
        let fail = |reason: String| ScpError::Bulk {
            dir: base.clone(),
            reason,
        };
        let locals: Vec<PathBuf> = paths.iter().map(|path| normalize(path)).collect();
        let remote = locals
            .iter()
            .map(|local| self.remote_entry(local, local.is_dir()))
            .collect::<Result<Vec<_>>>()?;
        let Some((source, names)) = split_remote_common(&remote) else {
            return Ok(0);
        };
        let members: Vec<(String, PathBuf)> = names
            .into_iter()
            .zip(locals)
            .filter(|(name, _)| !name.is_empty())
            .collect();

        let archive = self.temp_archive()?;
        let client = self.mapping.client();
        let remote_archive = remote_join(&self.settings.remote_tmp_dir, &local_name(&archive));
        let pack = format!(
            "tar -C {} -cf {} {}",
            quote(&source),
            quote(&remote_archive),
            members
                .iter()
                .map(|(name, _)| quote(name))
                .collect::<Vec<_>>()
                .join(" ")
        );

        let progress = ArchiveProgress::new("downloading", Arc::clone(client.sink()));
        let fetched = client
            .shell(&pack)
            .map_err(|e| fail(format!("packing remote archive: {e}")))
            .and_then(|_| {
                client
                    .copy_down(&remote_archive, archive.path(), &progress)
                    .map_err(|e| fail(format!("downloading archive: {e}")))
            });
        if let Err(e) = client.shell(&format!("rm -f {}", quote(&remote_archive))) {
            tracing::warn!(remote = %remote_archive, error = %e, "remote archive left behind");
        }
        fetched?;

        let unpacked = unpack_archive(archive.path(), &members, |p| !self.settings.is_ignored(p))
            .map_err(|e| fail(format!("unpacking archive: {e}")))?;
        tracing::info!(host = %client.host(), remote = %source, unpacked, "bulk download finished");
        Ok(unpacked)
    }
}
