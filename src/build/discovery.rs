//! Tree building: mirror the source directory into an [`AssetTree`] and keep
//! it in sync with individual filesystem changes.

use crate::asset::{AssetId, AssetTree};
use crate::pipe::options::{match_options, path_key};
use glob::{Pattern, PatternError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Compiled ignore globs, matched against `/`-separated paths relative to
/// the source root.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
    excluded: Vec<PathBuf>,
}

impl IgnoreSet {
    pub fn new(patterns: &[String]) -> Result<Self, PatternError> {
        let patterns = patterns.iter().map(|p| Pattern::new(p)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns, excluded: Vec::new() })
    }

    /// Exclude whole directories (the output or cache directory when nested in the source root).
    pub fn with_excluded(mut self, dirs: Vec<PathBuf>) -> Self {
        self.excluded = dirs;
        self
    }

    /// Whether the path or any of its ancestors is ignored.
    pub fn is_ignored(&self, relative: &Path) -> bool {
        if self.excluded.iter().any(|dir| relative.starts_with(dir)) {
            return true;
        }
        let mut current = Some(relative);
        while let Some(path) = current {
            if path.as_os_str().is_empty() {
                break;
            }
            let key = path_key(path);
            if self.patterns.iter().any(|p| p.matches_with(&key, match_options())) {
                return true;
            }
            current = path.parent();
        }
        false
    }
}

/// How a filesystem change affected the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    Added(PathBuf),
    Changed(PathBuf),
    Removed(PathBuf),
}

impl TreeChange {
    pub fn path(&self) -> &Path {
        match self {
            TreeChange::Added(p) | TreeChange::Changed(p) | TreeChange::Removed(p) => p,
        }
    }
}

/// Scan `tree`'s source root into the tree, hashing every file and folder.
pub fn discover(tree: &mut AssetTree, ignore: &IgnoreSet) -> io::Result<()> {
    let root = tree.root();
    scan_folder(tree, root, ignore)?;
    tree.refresh_ancestor_hashes(root);
    Ok(())
}

/// Recursively insert the directory contents of `folder`, then hash it.
fn scan_folder(tree: &mut AssetTree, folder: AssetId, ignore: &IgnoreSet) -> io::Result<()> {
    let dir = tree.absolute_path(folder);
    let mut names: Vec<(String, bool)> = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let is_dir = entry.file_type()?.is_dir();
        names.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
    }
    names.sort();

    for (name, is_dir) in names {
        let relative = tree[folder].path().join(&name);
        if ignore.is_ignored(&relative) {
            continue;
        }
        let id = tree.insert_source(folder, &name, is_dir);
        if is_dir {
            scan_folder(tree, id, ignore)?;
        } else {
            tree.refresh_source_hash(id)?;
        }
    }
    tree.refresh_folder_hash(folder);
    Ok(())
}

/// Reconcile one path with the filesystem.
///
/// Returns `None` when the path is ignored, unknown and absent, or when its
/// content hash did not change.
pub fn sync_path(
    tree: &mut AssetTree,
    ignore: &IgnoreSet,
    relative: &Path,
) -> io::Result<Option<TreeChange>> {
    if relative.as_os_str().is_empty() || ignore.is_ignored(relative) {
        return Ok(None);
    }

    let absolute = tree.source_root().join(relative);
    let existing = tree.find_by_path(relative);
    let metadata = match fs::metadata(&absolute) {
        Ok(metadata) => Some(metadata),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    match (existing, metadata) {
        (None, None) => Ok(None),
        (Some(id), None) => {
            tree.remove(id);
            Ok(Some(TreeChange::Removed(relative.to_path_buf())))
        }
        (Some(id), Some(metadata)) if tree[id].is_folder() != metadata.is_dir() => {
            tree.remove(id);
            insert_new(tree, ignore, relative, metadata.is_dir())?;
            Ok(Some(TreeChange::Changed(relative.to_path_buf())))
        }
        (None, Some(metadata)) => {
            insert_new(tree, ignore, relative, metadata.is_dir())?;
            Ok(Some(TreeChange::Added(relative.to_path_buf())))
        }
        (Some(id), Some(metadata)) if metadata.is_dir() => {
            let before = tree[id].hash().map(str::to_string);
            reconcile_folder(tree, id, ignore)?;
            tree.refresh_ancestor_hashes(id);
            if tree[id].hash() == before.as_deref() {
                Ok(None)
            } else {
                Ok(Some(TreeChange::Changed(relative.to_path_buf())))
            }
        }
        (Some(id), Some(_)) => {
            if tree.refresh_source_hash(id)? {
                tree.refresh_ancestor_hashes(id);
                Ok(Some(TreeChange::Changed(relative.to_path_buf())))
            } else {
                Ok(None)
            }
        }
    }
}

fn insert_new(tree: &mut AssetTree, ignore: &IgnoreSet, relative: &Path, is_dir: bool) -> io::Result<()> {
    let id = tree.insert_source_path(relative, is_dir);
    if is_dir {
        scan_folder(tree, id, ignore)?;
    } else {
        tree.refresh_source_hash(id)?;
    }
    tree.refresh_ancestor_hashes(id);
    Ok(())
}

/// Bring a folder's children in line with the directory listing.
fn reconcile_folder(tree: &mut AssetTree, folder: AssetId, ignore: &IgnoreSet) -> io::Result<()> {
    let dir = tree.absolute_path(folder);
    let mut on_disk = Vec::new();
    for entry in fs::read_dir(&dir)? {
        on_disk.push(entry?.file_name().to_string_lossy().into_owned());
    }

    let stale: Vec<AssetId> = tree[folder]
        .children()
        .iter()
        .copied()
        .filter(|c| !on_disk.iter().any(|name| name == tree[*c].filename()))
        .collect();
    for id in stale {
        tree.remove(id);
    }

    let folder_path = tree[folder].path().to_path_buf();
    for name in on_disk {
        let relative = folder_path.join(&name);
        if tree.find_by_path(&relative).is_none() && !ignore.is_ignored(&relative) {
            let is_dir = dir.join(&name).is_dir();
            insert_new(tree, ignore, &relative, is_dir)?;
        }
    }
    tree.refresh_folder_hash(folder);
    Ok(())
}
