//! Arena holding every source and derived entry of one source root.

use super::{content_hash, AssetEntry, AssetId, TransformGroup};
use crate::pipe::options::merge_options;
use crate::pipe::AssetSettings;
use crate::tags::{parse_tags, strip_path_tags, Tags};
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::ops::Index;
use std::path::{Path, PathBuf};

/// The managed tree.
///
/// Entries are never moved once allocated; removing an entry leaves an empty
/// slot so that outstanding ids of other entries stay valid. Empty slots are
/// reused by later allocations, so an id must not be kept past the removal of
/// its entry.
#[derive(Debug, Clone)]
pub struct AssetTree {
    entries: Vec<Option<AssetEntry>>,
    free: Vec<usize>,
    root: AssetId,
    source_root: PathBuf,
    by_path: HashMap<PathBuf, AssetId>,
    overrides: Vec<AssetSettings>,
}

impl AssetTree {
    /// Create a tree holding only the root folder entry.
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        let source_root = source_root.into();
        let mut root = AssetEntry::new(PathBuf::new(), true);
        if let Some(name) = source_root.file_name() {
            root.filename = name.to_string_lossy().into_owned();
            root.meta_data = parse_tags(&root.filename);
        }

        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), AssetId(0));

        Self {
            entries: vec![Some(root)],
            free: Vec::new(),
            root: AssetId(0),
            source_root,
            by_path,
            overrides: Vec::new(),
        }
    }

    /// Attach path overrides. They apply to the root immediately and to every
    /// entry inserted afterwards.
    pub fn with_overrides(mut self, overrides: Vec<AssetSettings>) -> Self {
        self.overrides = overrides;
        let root = self.root;
        self.apply_overrides(root);
        self
    }

    pub fn overrides(&self) -> &[AssetSettings] {
        &self.overrides
    }

    pub fn root(&self) -> AssetId {
        self.root
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn get(&self, id: AssetId) -> Option<&AssetEntry> {
        self.entries.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: AssetId) -> Option<&mut AssetEntry> {
        self.entries.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live entries, derived ones included.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of allocated slots, empty ones included.
    pub fn slot_count(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over every live entry.
    pub fn iter(&self) -> impl Iterator<Item = (AssetId, &AssetEntry)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| e.as_ref().map(|e| (AssetId(i), e)))
    }

    /// Look up a source entry by its path relative to the source root.
    pub fn find_by_path(&self, relative: &Path) -> Option<AssetId> {
        self.by_path.get(relative).copied()
    }

    /// Location of a source entry on disk.
    pub fn absolute_path(&self, id: AssetId) -> PathBuf {
        self.source_root.join(&self[id].path)
    }

    /// Insert a source file or folder under `parent`, keeping children sorted
    /// by name. Inserting an existing path returns the existing id.
    pub fn insert_source(&mut self, parent: AssetId, name: &str, is_folder: bool) -> AssetId {
        let path = self[parent].path.join(name);
        if let Some(existing) = self.by_path.get(&path) {
            return *existing;
        }

        let mut entry = AssetEntry::new(path.clone(), is_folder);
        entry.parent = Some(parent);
        let id = self.alloc(entry);
        self.apply_overrides(id);

        let position = {
            let entries = &self.entries;
            self[parent].children.partition_point(|child| {
                entries[child.0].as_ref().map(|c| c.filename.as_str() < name).unwrap_or(true)
            })
        };
        if let Some(parent_entry) = self.get_mut(parent) {
            parent_entry.children.insert(position, id);
        }
        self.by_path.insert(path, id);
        id
    }

    /// Insert a source entry by relative path, creating missing intermediate folders.
    pub fn insert_source_path(&mut self, relative: &Path, is_folder: bool) -> AssetId {
        let components: Vec<String> =
            relative.iter().map(|c| c.to_string_lossy().into_owned()).collect();
        let mut current = self.root;
        for (i, name) in components.iter().enumerate() {
            let last = i + 1 == components.len();
            current = self.insert_source(current, name, if last { is_folder } else { true });
        }
        current
    }

    /// Create a derived entry beside `parent` and register it under `pipe`.
    ///
    /// Tags are parsed fresh from `name`; option overrides are inherited from
    /// the parent. The new entry holds `content` in memory until written.
    pub fn derive_at(&mut self, parent: AssetId, pipe: &str, name: &str, content: Vec<u8>) -> AssetId {
        let id = self.derive_entry(parent, pipe, name);
        self.set_content(id, content);
        id
    }

    /// Re-create a derived entry whose content lives in a blob file.
    pub(crate) fn derive_restored(
        &mut self,
        parent: AssetId,
        pipe: &str,
        name: &str,
        meta_data: Tags,
        hash: String,
        backing: PathBuf,
        transform_data: serde_json::Map<String, serde_json::Value>,
    ) -> AssetId {
        let id = self.derive_entry(parent, pipe, name);
        if let Some(entry) = self.get_mut(id) {
            entry.meta_data = meta_data;
            entry.hash = Some(hash);
            entry.backing = Some(backing);
            entry.transform_data = transform_data;
        }
        id
    }

    fn derive_entry(&mut self, parent: AssetId, pipe: &str, name: &str) -> AssetId {
        let parent_entry = &self[parent];
        let path = parent_entry.path.parent().map(|dir| dir.join(name)).unwrap_or_else(|| PathBuf::from(name));

        let mut entry = AssetEntry::new(path, false);
        entry.settings = parent_entry.settings.clone();
        entry.transform_parent = Some(parent);
        let id = self.alloc(entry);

        if let Some(parent_entry) = self.get_mut(parent) {
            match parent_entry.transform_groups.iter_mut().find(|g| g.pipe == pipe) {
                Some(group) => group.children.push(id),
                None => parent_entry
                    .transform_groups
                    .push(TransformGroup { pipe: pipe.to_string(), children: vec![id] }),
            }
        }
        id
    }

    fn alloc(&mut self, entry: AssetEntry) -> AssetId {
        if let Some(index) = self.free.pop() {
            self.entries[index] = Some(entry);
            return AssetId(index);
        }
        self.entries.push(Some(entry));
        AssetId(self.entries.len() - 1)
    }

    fn release(&mut self, id: AssetId) -> Option<AssetEntry> {
        let entry = self.entries.get_mut(id.0).and_then(Option::take)?;
        self.free.push(id.0);
        Some(entry)
    }

    fn apply_overrides(&mut self, id: AssetId) {
        let Some(entry) = self.entries.get_mut(id.0).and_then(Option::as_mut) else {
            return;
        };
        for settings in self.overrides.iter().filter(|o| o.matches(&entry.path)) {
            let merged = entry.settings.get_or_insert_with(Default::default);
            for (pipe, value) in settings.settings() {
                let next = match merged.get(pipe) {
                    Some(existing) => merge_options(existing, value),
                    None => value.clone(),
                };
                merged.insert(pipe.clone(), next);
            }
            for (key, value) in settings.tags() {
                entry.meta_data.insert(key.clone(), value.clone());
            }
        }
    }

    /// Tags of every ancestor merged root first, the entry's own tags applied last.
    ///
    /// Derived entries inherit through their transform parent, so a sprite
    /// sheet produced from `ui{m}/sheet{tps}` still sees both tags.
    pub fn all_meta_data(&self, id: AssetId) -> Tags {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            chain.push(cur);
            let entry = &self[cur];
            current = entry.transform_parent.or(entry.parent);
        }

        let mut merged = Tags::new();
        for cur in chain.into_iter().rev() {
            for (key, value) in &self[cur].meta_data {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// The leaf set reached by following transform children to the end of
    /// every chain. An entry that was never transformed resolves to itself.
    pub fn final_transformed_children(&self, id: AssetId) -> Vec<AssetId> {
        let mut leaves = Vec::new();
        let mut seen = HashSet::new();
        self.collect_final(id, &mut leaves, &mut seen);
        leaves
    }

    fn collect_final(&self, id: AssetId, leaves: &mut Vec<AssetId>, seen: &mut HashSet<AssetId>) {
        let entry = &self[id];
        if !entry.has_transform_children() {
            if seen.insert(id) {
                leaves.push(id);
            }
            return;
        }
        for group in &entry.transform_groups {
            for &child in &group.children {
                self.collect_final(child, leaves, seen);
            }
        }
    }

    /// Source entries below and including `from`, depth first in child order.
    pub fn walk(&self, from: AssetId) -> Vec<AssetId> {
        let mut order = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self[id].children.iter().rev().copied());
        }
        order
    }

    /// Every entry under `from` matching `predicate`, derived entries included.
    pub fn find(&self, from: AssetId, predicate: impl Fn(&AssetEntry) -> bool) -> Vec<AssetId> {
        let mut found = Vec::new();
        for id in self.walk(from) {
            let mut chain = vec![id];
            while let Some(cur) = chain.pop() {
                let entry = &self[cur];
                if predicate(entry) {
                    found.push(cur);
                }
                for group in entry.transform_groups.iter().rev() {
                    chain.extend(group.children.iter().rev().copied());
                }
            }
        }
        found
    }

    /// Raw bytes of an entry. Folders have no content.
    pub fn content(&self, id: AssetId) -> io::Result<Cow<'_, [u8]>> {
        let entry = &self[id];
        if entry.is_folder {
            return Ok(Cow::Borrowed(&[]));
        }
        if let Some(content) = &entry.content {
            return Ok(Cow::Borrowed(content));
        }
        let location = match &entry.backing {
            Some(backing) => backing.clone(),
            None => self.source_root.join(&entry.path),
        };
        fs::read(location).map(Cow::Owned)
    }

    /// Replace an entry's content, recompute its hash and mark it for writing.
    pub fn set_content(&mut self, id: AssetId, content: Vec<u8>) {
        if let Some(entry) = self.get_mut(id) {
            entry.hash = Some(content_hash(&content));
            entry.content = Some(content);
            entry.backing = None;
            entry.fresh = true;
        }
    }

    /// Rename an entry in place. Source entries keep their lookup key.
    pub fn rename(&mut self, id: AssetId, name: &str) {
        if let Some(entry) = self.get_mut(id) {
            entry.set_name(name);
            entry.fresh = true;
        }
    }

    pub fn meta_data_mut(&mut self, id: AssetId) -> Option<&mut Tags> {
        self.get_mut(id).map(|e| &mut e.meta_data)
    }

    pub fn transform_data_mut(
        &mut self,
        id: AssetId,
    ) -> Option<&mut serde_json::Map<String, serde_json::Value>> {
        self.get_mut(id).map(|e| &mut e.transform_data)
    }

    pub(crate) fn set_skip(&mut self, id: AssetId, pipe: &str) {
        if let Some(entry) = self.get_mut(id) {
            entry.skip = Some(pipe.to_string());
        }
    }

    pub(crate) fn set_skip_children(&mut self, id: AssetId, pipe: &str) {
        if let Some(entry) = self.get_mut(id) {
            entry.skip_children = Some(pipe.to_string());
        }
    }

    pub(crate) fn mark_written(&mut self, id: AssetId) {
        if let Some(entry) = self.get_mut(id) {
            entry.fresh = false;
        }
    }

    /// Re-read a source file and update its hash. Returns whether the hash changed.
    pub fn refresh_source_hash(&mut self, id: AssetId) -> io::Result<bool> {
        let location = self.absolute_path(id);
        let bytes = fs::read(&location)?;
        let hash = content_hash(&bytes);
        let Some(entry) = self.get_mut(id) else {
            return Ok(false);
        };
        let changed = entry.hash.as_deref() != Some(hash.as_str());
        entry.hash = Some(hash);
        Ok(changed)
    }

    /// Recompute the hash of a folder from its children's names and hashes.
    pub fn refresh_folder_hash(&mut self, id: AssetId) {
        let mut hasher = Sha256::new();
        for &child in &self[id].children {
            let child = &self[child];
            hasher.update(child.filename.as_bytes());
            hasher.update([0]);
            hasher.update(child.hash.as_deref().unwrap_or_default().as_bytes());
            hasher.update(b"\n");
        }
        let hash = format!("{:x}", hasher.finalize());
        if let Some(entry) = self.get_mut(id) {
            entry.hash = Some(hash);
        }
    }

    /// Recompute folder hashes from `id` up to the root.
    pub fn refresh_ancestor_hashes(&mut self, id: AssetId) {
        let mut current = Some(id);
        while let Some(cur) = current {
            if self[cur].is_folder {
                self.refresh_folder_hash(cur);
            }
            current = self[cur].parent;
        }
    }

    /// Recompute every folder hash bottom up. File hashes must already be set.
    pub fn refresh_all_folder_hashes(&mut self) {
        for id in self.walk(self.root).into_iter().rev() {
            if self[id].is_folder {
                self.refresh_folder_hash(id);
            }
        }
    }

    /// Remove a source entry, its source descendants and every derived entry
    /// hanging off them. Returns the relative paths of removed source entries.
    pub fn remove(&mut self, id: AssetId) -> Vec<PathBuf> {
        if id == self.root || !self.contains(id) {
            return Vec::new();
        }

        let parent = self[id].parent;
        let subtree = self.walk(id);
        let mut removed = Vec::with_capacity(subtree.len());
        for &cur in subtree.iter().rev() {
            self.clear_transforms(cur);
            if let Some(entry) = self.release(cur) {
                self.by_path.remove(&entry.path);
                removed.push(entry.path);
            }
        }

        if let Some(parent) = parent {
            if let Some(parent_entry) = self.get_mut(parent) {
                parent_entry.children.retain(|c| *c != id);
            }
            self.refresh_ancestor_hashes(parent);
        }
        removed.reverse();
        removed
    }

    /// Drop every derived entry and skip flag of a source entry.
    pub fn clear_transforms(&mut self, id: AssetId) {
        let Some(entry) = self.get_mut(id) else {
            return;
        };
        let groups = std::mem::take(&mut entry.transform_groups);
        entry.skip = None;
        entry.skip_children = None;
        for group in groups {
            for child in group.children {
                self.free_chain(child);
            }
        }
    }

    fn free_chain(&mut self, id: AssetId) {
        if let Some(entry) = self.release(id) {
            for group in entry.transform_groups {
                for child in group.children {
                    self.free_chain(child);
                }
            }
        }
    }

    /// Output location relative to the output root: the entry path with tag blocks stripped.
    pub fn output_relative_path(&self, id: AssetId) -> PathBuf {
        strip_path_tags(&self[id].path)
    }

    /// Output location under `output_root`.
    pub fn output_path(&self, id: AssetId, output_root: &Path) -> PathBuf {
        output_root.join(self.output_relative_path(id))
    }
}

impl Index<AssetId> for AssetTree {
    type Output = AssetEntry;

    fn index(&self, id: AssetId) -> &AssetEntry {
        match self.get(id) {
            Some(entry) => entry,
            None => panic!("asset entry {} was removed", id.0),
        }
    }
}
