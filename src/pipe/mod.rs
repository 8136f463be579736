//! The contract every transformation stage implements.
//!
//! A pipe is a named stage run over the tree in declared order. Per run the
//! engine calls `start` once, then `test`/`transform` for every eligible
//! entry, then `finish` once with mutable access to the whole tree.
//!
//! `test` and `transform` receive a read-only [`AssetView`] and may run on
//! several worker threads at once; transforms describe their effect as a
//! [`TransformOutput`] which the engine applies to the tree in traversal
//! order. Pipe-local accumulation state therefore lives behind a lock inside
//! the pipe and is reset in `start`.

pub mod options;

pub use options::{AssetSettings, PipeOptions};

use crate::asset::{AssetEntry, AssetId, AssetTree};
use crate::tags::Tags;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

/// Error raised by a pipe callback.
#[derive(Debug)]
pub struct PipeError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    /// Wrap an underlying error with context.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { message: message.into(), source: Some(Box::new(source)) }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for PipeError {
    fn from(err: std::io::Error) -> Self {
        PipeError::with_source("io error", err)
    }
}

/// Which optional callbacks a pipe implements. Read once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipeCapabilities {
    pub start: bool,
    pub transform: bool,
    pub finish: bool,
}

impl PipeCapabilities {
    /// A pipe that only transforms entries.
    pub fn transform() -> Self {
        Self { start: false, transform: true, finish: false }
    }

    /// A pipe that only patches the tree at the end of its stage.
    pub fn finish() -> Self {
        Self { start: false, transform: false, finish: true }
    }

    pub fn with_start(mut self) -> Self {
        self.start = true;
        self
    }
}

/// Paths exposed to `finish`.
#[derive(Debug, Clone)]
pub struct FinishContext {
    pub output_root: PathBuf,
    pub source_root: PathBuf,
}

/// Read-only view of one entry handed to `test` and `transform`.
#[derive(Clone, Copy)]
pub struct AssetView<'a> {
    tree: &'a AssetTree,
    id: AssetId,
}

impl<'a> AssetView<'a> {
    pub fn new(tree: &'a AssetTree, id: AssetId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn tree(&self) -> &'a AssetTree {
        self.tree
    }

    pub fn entry(&self) -> &'a AssetEntry {
        &self.tree[self.id]
    }

    pub fn path(&self) -> &'a Path {
        self.entry().path()
    }

    pub fn filename(&self) -> &'a str {
        self.entry().filename()
    }

    pub fn extension(&self) -> &'a str {
        self.entry().extension()
    }

    pub fn is_folder(&self) -> bool {
        self.entry().is_folder()
    }

    /// Tags inherited from ancestors merged with the entry's own.
    pub fn all_meta_data(&self) -> Tags {
        self.tree.all_meta_data(self.id)
    }

    /// Whether `tag` is set (truthy) on the entry or any ancestor.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.all_meta_data().get(tag).map(|v| v.is_truthy()).unwrap_or(false)
    }

    pub fn content(&self) -> Result<Cow<'a, [u8]>, PipeError> {
        self.tree
            .content(self.id)
            .map_err(|e| PipeError::with_source(format!("failed to read {}", self.path().display()), e))
    }
}

impl fmt::Debug for AssetView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetView").field("id", &self.id).field("path", &self.path()).finish()
    }
}

/// A new entry to create beside the transformed one.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedAsset {
    pub name: String,
    pub content: Vec<u8>,
    /// Tags set on top of those parsed from `name`
    pub tags: Tags,
    pub transform_data: serde_json::Map<String, Value>,
}

impl DerivedAsset {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self { name: name.into(), content, tags: Tags::new(), transform_data: serde_json::Map::new() }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<crate::tags::TagValue>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.transform_data.insert(key.into(), value);
        self
    }
}

/// What a transform did to one entry.
///
/// An empty output leaves the entry as is: it stays its own final child and
/// is copied through to the output tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOutput {
    pub derived: Vec<DerivedAsset>,
    /// Suppress the default pass-through copy of the entry
    pub skip: bool,
    /// Do not descend into the entry's children
    pub skip_children: bool,
}

impl TransformOutput {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn derived(derived: Vec<DerivedAsset>) -> Self {
        Self { derived, ..Self::default() }
    }

    pub fn with_skip(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn with_skip_children(mut self) -> Self {
        self.skip_children = true;
        self
    }

    pub fn is_unchanged(&self) -> bool {
        self.derived.is_empty() && !self.skip && !self.skip_children
    }
}

/// A transformation stage.
pub trait Pipe: Send + Sync {
    /// Unique name within a pipeline; also the key for path-matched settings.
    fn name(&self) -> &str;

    /// Whether the pipe operates on folder entries rather than files.
    fn folder(&self) -> bool {
        false
    }

    /// Default option record, already merged with any configured options.
    fn default_options(&self) -> Value;

    fn capabilities(&self) -> PipeCapabilities;

    /// Check an option record against the pipe's schema.
    fn validate_options(&self, _options: &PipeOptions) -> Result<(), PipeError> {
        Ok(())
    }

    /// Whether `transform` applies to the entry. Must not have side effects.
    fn test(&self, asset: &AssetView<'_>, options: &PipeOptions) -> Result<bool, PipeError>;

    /// Reset per-run state. Called once per run before any entry is visited.
    fn start(&mut self) -> Result<(), PipeError> {
        Ok(())
    }

    fn transform(
        &self,
        _asset: &AssetView<'_>,
        _options: &PipeOptions,
    ) -> Result<TransformOutput, PipeError> {
        Ok(TransformOutput::unchanged())
    }

    /// Whole-run patch step with mutable access to the tree.
    fn finish(
        &mut self,
        _tree: &mut AssetTree,
        _root: AssetId,
        _options: &PipeOptions,
        _context: &FinishContext,
    ) -> Result<(), PipeError> {
        Ok(())
    }
}
