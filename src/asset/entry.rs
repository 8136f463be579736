//! A single node of the asset tree.

use crate::tags::{parse_tags, TagValue, Tags};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Stable handle to an entry in an [`AssetTree`](super::AssetTree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub(crate) usize);

impl AssetId {
    /// Raw arena index, mostly useful for logging.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-pipe option overrides, keyed by pipe name.
pub type PipeSettings = BTreeMap<String, Value>;

/// Derived entries registered on a source entry by one pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformGroup {
    /// Name of the pipe that produced the entries
    pub pipe: String,
    /// Derived entries in registration order
    pub children: Vec<AssetId>,
}

/// One file or folder in the managed tree, or an entry derived from one.
///
/// Source entries mirror the filesystem under the source root and are linked
/// through `parent`/`children`. Derived entries are created by pipes and hang
/// off their source through `transform_parent` and the per-pipe transform
/// groups.
#[derive(Debug, Clone)]
pub struct AssetEntry {
    pub(crate) path: PathBuf,
    pub(crate) filename: String,
    pub(crate) extension: String,
    pub(crate) is_folder: bool,
    pub(crate) meta_data: Tags,
    pub(crate) settings: Option<PipeSettings>,
    pub(crate) content: Option<Vec<u8>>,
    pub(crate) backing: Option<PathBuf>,
    pub(crate) hash: Option<String>,
    pub(crate) parent: Option<AssetId>,
    pub(crate) children: Vec<AssetId>,
    pub(crate) transform_parent: Option<AssetId>,
    pub(crate) transform_groups: Vec<TransformGroup>,
    pub(crate) skip: Option<String>,
    pub(crate) skip_children: Option<String>,
    pub(crate) transform_data: serde_json::Map<String, Value>,
    pub(crate) fresh: bool,
}

impl AssetEntry {
    pub(crate) fn new(path: PathBuf, is_folder: bool) -> Self {
        let filename =
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let extension = extension_of(&filename, is_folder);
        let meta_data = parse_tags(&filename);

        Self {
            path,
            filename,
            extension,
            is_folder,
            meta_data,
            settings: None,
            content: None,
            backing: None,
            hash: None,
            parent: None,
            children: Vec::new(),
            transform_parent: None,
            transform_groups: Vec::new(),
            skip: None,
            skip_children: None,
            transform_data: serde_json::Map::new(),
            fresh: false,
        }
    }

    /// Path relative to the source root (derived entries live beside their source).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File or folder name, including tag blocks.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Lowercase extension without the dot; empty for folders.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    /// Tags parsed from this entry's own name, plus injected tags.
    pub fn meta_data(&self) -> &Tags {
        &self.meta_data
    }

    /// Path-matched option overrides, keyed by pipe name.
    pub fn settings(&self) -> Option<&PipeSettings> {
        self.settings.as_ref()
    }

    /// Content hash (hex sha256), `None` until computed.
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// The first eight hex digits of the content hash, as embedded in hash-named outputs.
    pub fn short_hash(&self) -> Option<&str> {
        self.hash.as_deref().map(|h| &h[..h.len().min(8)])
    }

    pub fn parent(&self) -> Option<AssetId> {
        self.parent
    }

    pub fn children(&self) -> &[AssetId] {
        &self.children
    }

    /// The entry this one was derived from, if any.
    pub fn transform_parent(&self) -> Option<AssetId> {
        self.transform_parent
    }

    pub fn transform_groups(&self) -> &[TransformGroup] {
        &self.transform_groups
    }

    /// Derived entries registered by a specific pipe.
    pub fn transform_children(&self, pipe: &str) -> &[AssetId] {
        self.transform_groups
            .iter()
            .find(|g| g.pipe == pipe)
            .map(|g| g.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_transform_children(&self) -> bool {
        self.transform_groups.iter().any(|g| !g.children.is_empty())
    }

    /// Whether default pass-through output is suppressed.
    pub fn is_skipped(&self) -> bool {
        self.skip.is_some()
    }

    /// Whether descent into the children is suppressed.
    pub fn skips_children(&self) -> bool {
        self.skip_children.is_some()
    }

    /// Free-form data attached by the pipe that produced this entry.
    pub fn transform_data(&self) -> &serde_json::Map<String, Value> {
        &self.transform_data
    }

    pub fn is_derived(&self) -> bool {
        self.transform_parent.is_some()
    }

    /// Whether the in-memory content has not been written to the output tree yet.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Own tag lookup.
    pub fn tag(&self, key: &str) -> Option<&TagValue> {
        self.meta_data.get(key)
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.path.set_file_name(name);
        self.filename = name.to_string();
        self.extension = extension_of(name, self.is_folder);
    }
}

fn extension_of(filename: &str, is_folder: bool) -> String {
    if is_folder {
        return String::new();
    }
    Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_parses_name() {
        let entry = AssetEntry::new(PathBuf::from("ui/hero{fix}.PNG"), false);
        assert_eq!(entry.filename(), "hero{fix}.PNG");
        assert_eq!(entry.extension(), "png");
        assert_eq!(entry.meta_data()["fix"], TagValue::Bool(true));
        assert!(!entry.is_folder());
    }

    #[test]
    fn test_folder_has_no_extension() {
        let entry = AssetEntry::new(PathBuf::from("sheet.v2{tps}"), true);
        assert_eq!(entry.extension(), "");
        assert!(entry.meta_data().contains_key("tps"));
    }

    #[test]
    fn test_set_name_updates_extension() {
        let mut entry = AssetEntry::new(PathBuf::from("a/b.json"), false);
        entry.set_name("b-1234abcd.png");
        assert_eq!(entry.path(), Path::new("a/b-1234abcd.png"));
        assert_eq!(entry.extension(), "png");
    }

    #[test]
    fn test_short_hash() {
        let mut entry = AssetEntry::new(PathBuf::from("a.png"), false);
        assert_eq!(entry.short_hash(), None);
        entry.hash = Some("0123456789abcdef".to_string());
        assert_eq!(entry.short_hash(), Some("01234567"));
    }
}
