//! Pipe option records and path-matched overrides.
//!
//! Every pipe declares a default option record. Entries whose relative path
//! matches an [`AssetSettings`] glob carry per-pipe overrides, which are merged
//! recursively over the defaults (defaults < path override).

use crate::asset::{AssetEntry, PipeSettings};
use crate::pipe::PipeError;
use crate::tags::Tags;
use glob::{MatchOptions, Pattern, PatternError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;

/// Resolved options handed to a pipe callback.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeOptions(Value);

impl PipeOptions {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The merged option record.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Top-level option lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Deserialize the record into a pipe's typed option schema.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, PipeError> {
        serde_json::from_value(self.0.clone())
            .map_err(|e| PipeError::new(format!("invalid options: {}", e)))
    }

    /// Name of a configurable tag: `options.tags.<key>`, falling back to `key`.
    pub fn tag_name(&self, key: &str) -> String {
        self.0
            .get("tags")
            .and_then(|tags| tags.get(key))
            .and_then(Value::as_str)
            .unwrap_or(key)
            .to_string()
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self(Value::Object(serde_json::Map::new()))
    }
}

/// Merge `overrides` into `base`. Objects merge key by key, anything else is replaced.
pub fn merge_options(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in override_map {
                let next = match merged.get(key) {
                    Some(existing) => merge_options(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

/// Resolve the options a pipe sees for one entry.
pub fn resolve_options(pipe_name: &str, defaults: &Value, entry: &AssetEntry) -> PipeOptions {
    match entry.settings().and_then(|s| s.get(pipe_name)) {
        Some(overrides) => PipeOptions::new(merge_options(defaults, overrides)),
        None => PipeOptions::new(defaults.clone()),
    }
}

/// Glob options shared by every path match in the crate: `*` stays within one
/// path component, `**` crosses them.
pub fn match_options() -> MatchOptions {
    MatchOptions { case_sensitive: true, require_literal_separator: true, require_literal_leading_dot: false }
}

/// `/`-separated form of a relative path, as used for glob matching and cache keys.
pub fn path_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A path-override configuration entry.
#[derive(Debug, Clone)]
pub struct AssetSettings {
    files: Vec<String>,
    patterns: Vec<Pattern>,
    settings: PipeSettings,
    tags: Tags,
}

impl AssetSettings {
    /// Compile the glob list. Fails on the first invalid pattern.
    pub fn new(files: Vec<String>, settings: PipeSettings, tags: Tags) -> Result<Self, PatternError> {
        let patterns = files.iter().map(|f| Pattern::new(f)).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { files, patterns, settings, tags })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Option overrides keyed by pipe name.
    pub fn settings(&self) -> &PipeSettings {
        &self.settings
    }

    /// Tags injected into matching entries.
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Whether a source-relative path is covered by this override.
    pub fn matches(&self, relative: &Path) -> bool {
        let key = path_key(relative);
        self.patterns.iter().any(|p| p.matches_with(&key, match_options()))
    }
}
