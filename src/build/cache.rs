//! Content-hash cache for incremental runs.
//!
//! The store persists, per source path, the content hash seen on the last run,
//! the output paths emitted for it and a snapshot of the transform chain built
//! by the reusable stages of the pipeline. Derived content is kept in a flat
//! hash-named blob directory so restored entries can be read again.
//!
//! # Layout
//!
//! ```text
//! .assetpipe-cache/
//!   3f2a…e1.json      <- records for one pipeline signature
//!   blobs/
//!     9b71…0c         <- derived content, named by its sha256
//! ```
//!
//! ```json
//! {
//!   "version": 1,
//!   "signature": "3f2a…e1",
//!   "output_root": "/project/public",
//!   "records": {
//!     "ui/icon.png": {
//!       "hash": "5d41…",
//!       "outputs": ["ui/icon-5d41402a.png"],
//!       "groups": [{ "pipe": "cache-buster", "children": [ … ] }]
//!     }
//!   }
//! }
//! ```
//!
//! A file whose version or signature does not match is discarded as a whole.
//! Cache files left by other pipeline signatures are read once when the
//! store is opened: the engine deletes the outputs they recorded, then the
//! files themselves are removed on the next save.

use crate::asset::{AssetId, AssetTree};
use crate::pipe::AssetSettings;
use crate::tags::Tags;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current cache format version.
const CACHE_VERSION: u32 = 1;

/// Blob sub-directory name.
const BLOB_DIR: &str = "blobs";

/// Error reading or writing the persistent cache. Always recovered by the
/// engine by discarding the cache.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Structurally invalid cache content
    #[error("Corrupt cache: {0}")]
    Corrupt(String),
    /// The cache belongs to another pipeline configuration
    #[error("Cache signature mismatch: expected {expected}, found {found}")]
    SignatureMismatch { expected: String, found: String },
}

/// Snapshot of one derived entry and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedSnapshot {
    pub name: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub transform_data: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_children: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupSnapshot>,
}

/// Derived entries one pipe registered on an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub pipe: String,
    pub children: Vec<DerivedSnapshot>,
}

/// Everything remembered about one source path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Content hash of the source entry on the last run; empty when unknown
    pub hash: String,
    /// Output paths (relative to the output root) emitted for the entry
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_children: Option<String>,
    /// Transform chain produced by the reusable stages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    signature: String,
    /// Output root the recorded outputs are relative to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_root: Option<PathBuf>,
    records: BTreeMap<String, CacheRecord>,
}

/// Cache file written for another pipeline signature.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleCache {
    pub path: PathBuf,
    /// Output root recorded in the file, if any
    pub output_root: Option<PathBuf>,
    /// Every output the file recorded, relative to its output root
    pub outputs: Vec<String>,
}

/// Hash of the parts of a pipeline configuration that affect outputs.
///
/// Covers the ordered pipe list with each pipe's default options, the output
/// root, the ignore list and the path overrides. Cache enablement and
/// location, job count, watch and logging settings are deliberately left out.
pub fn pipeline_signature(
    pipes: &[(&str, &Value)],
    output_root: &Path,
    ignore: &[String],
    overrides: &[AssetSettings],
) -> String {
    let pipes: Vec<Value> = pipes.iter().map(|(name, options)| json!([name, options])).collect();
    let overrides: Vec<Value> = overrides
        .iter()
        .map(|o| json!({ "files": o.files(), "settings": o.settings(), "tags": o.tags() }))
        .collect();
    let canonical = json!({
        "pipes": pipes,
        "output": output_root.to_string_lossy(),
        "ignore": ignore,
        "assets": overrides,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

/// Records for one pipeline signature, optionally persisted under a cache directory.
#[derive(Debug)]
pub struct CacheStore {
    dir: Option<PathBuf>,
    signature: String,
    output_root: Option<PathBuf>,
    records: BTreeMap<String, CacheRecord>,
    stale: Vec<StaleCache>,
}

impl CacheStore {
    /// A store that lives only as long as the process.
    pub fn in_memory(signature: impl Into<String>) -> Self {
        Self {
            dir: None,
            signature: signature.into(),
            output_root: None,
            records: BTreeMap::new(),
            stale: Vec::new(),
        }
    }

    /// Open the persistent store under `dir`. An unreadable, corrupt or
    /// mismatched cache file is discarded with a warning.
    pub fn open(dir: impl Into<PathBuf>, signature: impl Into<String>) -> Self {
        let dir = dir.into();
        let signature = signature.into();
        let path = dir.join(format!("{}.json", signature));

        let records = match Self::load(&path, &signature) {
            Ok(Some(records)) => {
                debug!(path = %path.display(), records = records.len(), "loaded cache");
                records
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unusable cache");
                let _ = fs::remove_file(&path);
                BTreeMap::new()
            }
        };
        let stale = Self::find_stale(&dir, &path);

        Self { dir: Some(dir), signature, output_root: None, records, stale }
    }

    /// Record the output root written into the cache file on save.
    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = Some(output_root.into());
        self
    }

    /// Collect cache files of other signatures in `dir`. Unreadable ones are
    /// kept with no outputs so they are still removed on save.
    fn find_stale(dir: &Path, current: &Path) -> Vec<StaleCache> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p != current && p.extension().is_some_and(|x| x == "json"))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                let file = File::open(&path)
                    .map_err(CacheError::from)
                    .and_then(|f| Ok(serde_json::from_reader::<_, CacheFile>(BufReader::new(f))?));
                match file {
                    Ok(cache) => {
                        let mut outputs: Vec<String> =
                            cache.records.into_values().flat_map(|r| r.outputs).collect();
                        outputs.sort();
                        outputs.dedup();
                        debug!(path = %path.display(), outputs = outputs.len(), "found cache of another pipeline");
                        StaleCache { path, output_root: cache.output_root, outputs }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unreadable cache of another pipeline");
                        StaleCache { path, output_root: None, outputs: Vec::new() }
                    }
                }
            })
            .collect()
    }

    /// Cache files of other pipeline signatures found when the store was opened.
    pub fn stale(&self) -> &[StaleCache] {
        &self.stale
    }

    /// Take the stale caches' outputs for pruning. The files stay listed
    /// until the next successful save removes them.
    pub fn take_stale_outputs(&mut self) -> Vec<(Option<PathBuf>, Vec<String>)> {
        self.stale
            .iter_mut()
            .map(|s| (s.output_root.clone(), std::mem::take(&mut s.outputs)))
            .filter(|(_, outputs)| !outputs.is_empty())
            .collect()
    }

    /// Read a cache file. Returns `Ok(None)` if the file doesn't exist.
    fn load(path: &Path, signature: &str) -> Result<Option<BTreeMap<String, CacheRecord>>, CacheError> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path)?;
        let cache: CacheFile = serde_json::from_reader(BufReader::new(file))?;

        if cache.version != CACHE_VERSION {
            return Err(CacheError::Corrupt(format!(
                "version {} (expected {})",
                cache.version, CACHE_VERSION
            )));
        }
        if cache.signature != signature {
            return Err(CacheError::SignatureMismatch {
                expected: signature.to_string(),
                found: cache.signature,
            });
        }
        Ok(Some(cache.records))
    }

    /// Write the records to disk. A no-op for in-memory stores.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some(path) = self.cache_file() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let cache = CacheFile {
            version: CACHE_VERSION,
            signature: self.signature.clone(),
            output_root: self.output_root.clone(),
            records: self.records.clone(),
        };
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(writer, &cache)?;
        Ok(())
    }

    /// Delete the cache files of other signatures whose outputs have been
    /// taken. Returns how many were removed.
    pub fn remove_stale_files(&mut self) -> usize {
        let mut removed = 0;
        self.stale.retain(|stale| {
            if !stale.outputs.is_empty() {
                return true;
            }
            match fs::remove_file(&stale.path) {
                Ok(()) => {
                    removed += 1;
                    false
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    warn!(path = %stale.path.display(), error = %e, "failed to remove stale cache");
                    true
                }
            }
        });
        removed
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    /// Location of the cache file, if persistent.
    pub fn cache_file(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", self.signature)))
    }

    pub fn get(&self, key: &str) -> Option<&CacheRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheRecord> {
        self.records.get_mut(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, record: CacheRecord) {
        self.records.insert(key.into(), record);
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheRecord> {
        self.records.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Path of the blob holding content with `hash`.
    pub fn blob_path(&self, hash: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(BLOB_DIR).join(hash))
    }

    /// Store derived content under its hash. Existing blobs are left alone.
    pub fn store_blob(&self, hash: &str, content: &[u8]) -> Result<(), CacheError> {
        let Some(path) = self.blob_path(hash) else {
            return Ok(());
        };
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Delete blobs no record references any more. Returns how many were removed.
    pub fn prune_blobs(&self) -> Result<usize, CacheError> {
        let Some(dir) = self.dir.as_ref().map(|d| d.join(BLOB_DIR)) else {
            return Ok(0);
        };
        if !dir.exists() {
            return Ok(0);
        }

        let mut live = HashSet::new();
        for record in self.records.values() {
            collect_hashes(&record.groups, &mut live);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !live.contains(&name) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn collect_hashes(groups: &[GroupSnapshot], into: &mut HashSet<String>) {
    for group in groups {
        for child in &group.children {
            into.insert(child.hash.clone());
            collect_hashes(&child.groups, into);
        }
    }
}

/// Capture the transform chain of a source entry, storing derived content as blobs.
pub fn snapshot_entry(
    tree: &AssetTree,
    id: AssetId,
    store: &CacheStore,
) -> Result<CacheRecord, CacheError> {
    let entry = &tree[id];
    Ok(CacheRecord {
        hash: entry.hash().unwrap_or_default().to_string(),
        outputs: Vec::new(),
        skip: entry.skip.clone(),
        skip_children: entry.skip_children.clone(),
        groups: snapshot_groups(tree, id, store)?,
    })
}

fn snapshot_groups(
    tree: &AssetTree,
    id: AssetId,
    store: &CacheStore,
) -> Result<Vec<GroupSnapshot>, CacheError> {
    let mut groups = Vec::new();
    for group in tree[id].transform_groups() {
        let mut children = Vec::with_capacity(group.children.len());
        for &child in &group.children {
            let entry = &tree[child];
            let hash = entry.hash().unwrap_or_default().to_string();
            store.store_blob(&hash, &tree.content(child)?)?;
            children.push(DerivedSnapshot {
                name: entry.filename().to_string(),
                hash,
                tags: entry.meta_data().clone(),
                transform_data: entry.transform_data().clone(),
                skip: entry.skip.clone(),
                skip_children: entry.skip_children.clone(),
                groups: snapshot_groups(tree, child, store)?,
            });
        }
        groups.push(GroupSnapshot { pipe: group.pipe.clone(), children });
    }
    Ok(groups)
}

/// Rebuild a source entry's transform chain from its record.
///
/// Returns `false`, leaving the entry without transforms, if any referenced
/// blob is missing.
pub fn restore_entry(tree: &mut AssetTree, id: AssetId, record: &CacheRecord, store: &CacheStore) -> bool {
    if !blobs_present(&record.groups, store) {
        return false;
    }
    if let Some(entry) = tree.get_mut(id) {
        entry.skip = record.skip.clone();
        entry.skip_children = record.skip_children.clone();
    }
    restore_groups(tree, id, &record.groups, store);
    true
}

fn blobs_present(groups: &[GroupSnapshot], store: &CacheStore) -> bool {
    groups.iter().flat_map(|g| &g.children).all(|child| {
        store.blob_path(&child.hash).map(|p| p.exists()).unwrap_or(false)
            && blobs_present(&child.groups, store)
    })
}

fn restore_groups(tree: &mut AssetTree, parent: AssetId, groups: &[GroupSnapshot], store: &CacheStore) {
    for group in groups {
        for child in &group.children {
            let Some(backing) = store.blob_path(&child.hash) else {
                continue;
            };
            let id = tree.derive_restored(
                parent,
                &group.pipe,
                &child.name,
                child.tags.clone(),
                child.hash.clone(),
                backing,
                child.transform_data.clone(),
            );
            if let Some(entry) = tree.get_mut(id) {
                entry.skip = child.skip.clone();
                entry.skip_children = child.skip_children.clone();
            }
            restore_groups(tree, id, &child.groups, store);
        }
    }
}
