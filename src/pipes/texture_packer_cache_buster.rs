//! Re-point sprite sheet descriptors at hash-named textures.
//!
//! Runs after `cache-buster`: by then every sheet texture has a hash-named
//! final child, but the descriptors still reference the names the packer
//! gave them. Rewriting a descriptor changes its own content hash, so its
//! hash-named file name is updated as well.

use crate::asset::{AssetId, AssetTree};
use crate::pipe::{AssetView, FinishContext, Pipe, PipeCapabilities, PipeError, PipeOptions};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

pub const NAME: &str = "texture-packer-cache-buster";

#[derive(Debug, Clone)]
pub struct TexturePackerCacheBusterPipe {
    defaults: Value,
}

impl TexturePackerCacheBusterPipe {
    pub fn new() -> Self {
        Self { defaults: json!({ "tags": { "tps": "tps" } }) }
    }

    pub fn with_options(options: &Value) -> Self {
        Self { defaults: super::with_defaults(Self::new().defaults, options) }
    }
}

impl Default for TexturePackerCacheBusterPipe {
    fn default() -> Self {
        Self::new()
    }
}

/// Final JSON leaves carrying `tag`, in traversal order. Skipped entries and
/// the children of `skip_children` entries are not visited.
fn sheet_descriptors(tree: &AssetTree, root: AssetId, tag: &str) -> Vec<AssetId> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let entry = &tree[id];
        if entry.is_skipped() {
            continue;
        }
        if !entry.skips_children() {
            stack.extend(entry.children().iter().rev().copied());
        }
        for leaf in tree.final_transformed_children(id) {
            let leaf_entry = &tree[leaf];
            if leaf_entry.is_folder() || leaf_entry.extension() != "json" {
                continue;
            }
            let tagged = tree.all_meta_data(leaf).get(tag).map(|v| v.is_truthy()).unwrap_or(false);
            if tagged && seen.insert(leaf) {
                found.push(leaf);
            }
        }
    }
    found
}

/// File name of the final child of the entry named `filename` beside `near`.
fn final_name(tree: &AssetTree, root: AssetId, near: &Path, filename: &str) -> Option<String> {
    let dir = near.parent();
    let candidates = tree.find(root, |e| e.filename() == filename);
    let source = candidates
        .iter()
        .copied()
        .find(|id| tree[*id].path().parent() == dir)
        .or_else(|| candidates.first().copied())?;
    let leaf = tree.final_transformed_children(source).into_iter().next()?;
    Some(tree[leaf].filename().to_string())
}

impl Pipe for TexturePackerCacheBusterPipe {
    fn name(&self) -> &str {
        NAME
    }

    fn default_options(&self) -> Value {
        self.defaults.clone()
    }

    fn capabilities(&self) -> PipeCapabilities {
        PipeCapabilities::finish()
    }

    fn test(&self, _asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
        Ok(false)
    }

    fn finish(
        &mut self,
        tree: &mut AssetTree,
        root: AssetId,
        options: &PipeOptions,
        _context: &FinishContext,
    ) -> Result<(), PipeError> {
        let descriptors = sheet_descriptors(tree, root, &options.tag_name("tps"));

        // Back to front, so multi-pack pages referenced by earlier pages are renamed first
        for id in descriptors.into_iter().rev() {
            let path = tree[id].path().to_path_buf();
            let mut sheet: Value = {
                let content = tree
                    .content(id)
                    .map_err(|e| PipeError::with_source(format!("failed to read {}", path.display()), e))?;
                serde_json::from_slice(&content)
                    .map_err(|e| PipeError::with_source(format!("invalid sprite sheet {}", path.display()), e))?
            };

            let Some(image) = sheet.pointer("/meta/image").and_then(Value::as_str).map(str::to_string) else {
                debug!(pipe = NAME, path = %path.display(), "json has no meta.image, leaving it alone");
                continue;
            };
            match final_name(tree, root, &path, &image) {
                Some(name) => sheet["meta"]["image"] = Value::String(name),
                None => {
                    warn!(pipe = NAME, path = %path.display(), texture = %image, "sprite sheet texture not found");
                    continue;
                }
            }

            if let Some(packs) = sheet.pointer("/meta/related_multi_packs").and_then(Value::as_array).cloned() {
                let renamed: Vec<Value> = packs
                    .into_iter()
                    .map(|pack| match pack.as_str().and_then(|p| final_name(tree, root, &path, p)) {
                        Some(name) => Value::String(name),
                        None => pack,
                    })
                    .collect();
                sheet["meta"]["related_multi_packs"] = Value::Array(renamed);
            }

            let old_hash = tree[id].short_hash().map(str::to_string);
            let rewritten = serde_json::to_vec(&sheet)
                .map_err(|e| PipeError::with_source("failed to serialize sprite sheet", e))?;
            tree.set_content(id, rewritten);

            if let (Some(old), Some(new)) = (old_hash, tree[id].short_hash().map(str::to_string)) {
                let filename = tree[id].filename().to_string();
                if old != new && filename.contains(&old) {
                    let renamed = filename.replacen(&old, &new, 1);
                    debug!(pipe = NAME, from = %filename, to = %renamed, "re-hashed sprite sheet");
                    tree.rename(id, &renamed);
                }
            }
        }
        Ok(())
    }
}
