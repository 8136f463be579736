//! Asset manifest emission.
//!
//! Writes a Pixi-style manifest listing every transformed entry:
//!
//! ```json
//! {
//!   "bundles": [
//!     {
//!       "name": "default",
//!       "assets": [
//!         { "alias": ["icon.png"], "src": ["icon-3f2a9c1b.png"], "data": { "tags": {} } }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Folders tagged `{m}` or `{manifest}` open a new bundle for everything
//! below them. Aliases claimed by more than one entry are dropped from all of
//! them.

use crate::asset::{AssetId, AssetTree};
use crate::pipe::options::path_key;
use crate::pipe::{AssetView, FinishContext, Pipe, PipeCapabilities, PipeError, PipeOptions};
use crate::tags::{strip_path_tags, strip_tags, Tags};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const NAME: &str = "manifest";

#[derive(Debug, Clone, Deserialize)]
struct ManifestOptions {
    output: PathBuf,
    create_shortcuts: bool,
    trim_extensions: bool,
    include_meta_data: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub bundles: Vec<Bundle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub assets: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub alias: Vec<String>,
    pub src: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EntryData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryData {
    pub tags: Tags,
}

/// Finish pipe writing the manifest into the output root.
#[derive(Debug, Clone)]
pub struct ManifestPipe {
    defaults: Value,
}

impl ManifestPipe {
    pub fn new() -> Self {
        Self {
            defaults: json!({
                "output": "manifest.json",
                "create_shortcuts": false,
                "trim_extensions": false,
                "include_meta_data": true
            }),
        }
    }

    pub fn with_options(options: &Value) -> Self {
        Self { defaults: super::with_defaults(Self::new().defaults, options) }
    }
}

impl Default for ManifestPipe {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the manifest for the tree below `root`.
fn build_manifest(tree: &AssetTree, root: AssetId, options: &ManifestOptions) -> Manifest {
    let mut bundles = vec![Bundle { name: "default".to_string(), assets: Vec::new() }];
    collect_assets(tree, root, options, &mut bundles, 0);
    filter_unique_names(&mut bundles);
    Manifest { bundles }
}

fn collect_assets(
    tree: &AssetTree,
    id: AssetId,
    options: &ManifestOptions,
    bundles: &mut Vec<Bundle>,
    bundle: usize,
) {
    let entry = &tree[id];
    if entry.is_skipped() {
        return;
    }

    let opens_bundle = ["m", "manifest"]
        .iter()
        .any(|tag| entry.tag(tag).map(|v| v.is_truthy()).unwrap_or(false));
    let bundle = if opens_bundle {
        bundles.push(Bundle { name: strip_tags(entry.filename()), assets: Vec::new() });
        bundles.len() - 1
    } else {
        bundle
    };

    if entry.has_transform_children() {
        let mut src: Vec<String> = tree
            .final_transformed_children(id)
            .into_iter()
            .filter(|leaf| !tree[*leaf].is_skipped() && !tree[*leaf].is_folder())
            .map(|leaf| path_key(&tree.output_relative_path(leaf)))
            .collect();
        src.sort_by(|a, b| b.cmp(a));

        bundles[bundle].assets.push(ManifestEntry {
            alias: short_names(&path_key(&strip_path_tags(entry.path())), options),
            src,
            data: options.include_meta_data.then(|| EntryData { tags: tree.all_meta_data(id) }),
        });
    }

    for &child in entry.children() {
        collect_assets(tree, child, options, bundles, bundle);
    }
}

/// Every alias an entry is reachable under.
fn short_names(name: &str, options: &ManifestOptions) -> Vec<String> {
    let mut names = vec![name.to_string()];
    let basename = name.rsplit('/').next().unwrap_or(name);
    if options.trim_extensions {
        names.push(trim_extension(name).to_string());
    }
    if options.create_shortcuts {
        names.push(basename.to_string());
        if options.trim_extensions {
            names.push(trim_extension(basename).to_string());
        }
    }
    let mut unique = Vec::with_capacity(names.len());
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}

fn trim_extension(name: &str) -> &str {
    let file_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name[file_start..].rfind('.') {
        Some(dot) if dot > 0 => &name[..file_start + dot],
        _ => name,
    }
}

/// Drop aliases that more than one entry claims.
fn filter_unique_names(bundles: &mut [Bundle]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for asset in bundles.iter().flat_map(|b| b.assets.iter()) {
        for alias in &asset.alias {
            *counts.entry(alias.clone()).or_default() += 1;
        }
    }
    for asset in bundles.iter_mut().flat_map(|b| b.assets.iter_mut()) {
        asset.alias.retain(|alias| counts.get(alias).copied().unwrap_or(0) <= 1);
    }
}

fn manifest_path(output: &Path, output_root: &Path) -> PathBuf {
    if output.is_absolute() {
        output.to_path_buf()
    } else {
        output_root.join(output)
    }
}

impl Pipe for ManifestPipe {
    fn name(&self) -> &str {
        NAME
    }

    fn default_options(&self) -> Value {
        self.defaults.clone()
    }

    fn capabilities(&self) -> PipeCapabilities {
        PipeCapabilities::finish()
    }

    fn validate_options(&self, options: &PipeOptions) -> Result<(), PipeError> {
        let parsed: ManifestOptions = options.parse()?;
        if parsed.output.as_os_str().is_empty() {
            return Err(PipeError::new("output must be a non-empty path"));
        }
        Ok(())
    }

    fn test(&self, _asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
        Ok(false)
    }

    fn finish(
        &mut self,
        tree: &mut AssetTree,
        root: AssetId,
        options: &PipeOptions,
        context: &FinishContext,
    ) -> Result<(), PipeError> {
        let parsed: ManifestOptions = options.parse()?;
        let manifest = build_manifest(tree, root, &parsed);
        let target = manifest_path(&parsed.output, &context.output_root);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipeError::with_source(format!("failed to create {}", parent.display()), e))?;
        }
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| PipeError::with_source("failed to serialize manifest", e))?;
        fs::write(&target, json)
            .map_err(|e| PipeError::with_source(format!("failed to write {}", target.display()), e))?;

        debug!(
            pipe = NAME,
            path = %target.display(),
            bundles = manifest.bundles.len(),
            "wrote manifest"
        );
        Ok(())
    }
}
