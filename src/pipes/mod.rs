//! Built-in pipes
//!
//! Each pipe is selected by name from `[[pipes]]` in `assetpipe.toml`; its
//! configured options are merged over the pipe's built-in defaults one option
//! group at a time and the result becomes the pipe's default option record.
//!
//! | Name | Kind | Effect |
//! |------|------|--------|
//! | `json` | file | minify `.json` files not tagged `{nc}` |
//! | `texture-packer` | folder | pack `{tps}` folders into sprite sheets |
//! | `cache-buster` | file | append a content hash to every file name |
//! | `texture-packer-cache-buster` | finish | point sheet JSON at hash-named textures |
//! | `manifest` | finish | write a manifest of every output |

pub mod cache_buster;
pub mod json;
pub mod manifest;
pub mod texture_packer;
pub mod texture_packer_cache_buster;

pub use cache_buster::CacheBusterPipe;
pub use json::JsonPipe;
pub use manifest::ManifestPipe;
pub use texture_packer::TexturePackerPipe;
pub use texture_packer_cache_buster::TexturePackerCacheBusterPipe;

use crate::config::PipeConfig;
use crate::pipe::{Pipe, PipeError};
use serde_json::Value;

/// Names accepted by [`create_pipe`], in default pipeline order.
pub const PIPE_NAMES: &[&str] = &[
    json::NAME,
    texture_packer::NAME,
    cache_buster::NAME,
    texture_packer_cache_buster::NAME,
    manifest::NAME,
];

/// Instantiate a built-in pipe with `options` merged over its defaults.
pub fn create_pipe(name: &str, options: &Value) -> Result<Box<dyn Pipe>, PipeError> {
    if !options.is_object() {
        return Err(PipeError::new(format!("options for pipe '{}' must be a table", name)));
    }
    let pipe: Box<dyn Pipe> = match name {
        json::NAME => Box::new(JsonPipe::with_options(options)),
        texture_packer::NAME => Box::new(TexturePackerPipe::with_options(options)),
        cache_buster::NAME => Box::new(CacheBusterPipe::with_options(options)),
        texture_packer_cache_buster::NAME => Box::new(TexturePackerCacheBusterPipe::with_options(options)),
        manifest::NAME => Box::new(ManifestPipe::with_options(options)),
        other => {
            return Err(PipeError::new(format!(
                "unknown pipe '{}' (available: {})",
                other,
                PIPE_NAMES.join(", ")
            )))
        }
    };
    Ok(pipe)
}

/// The pipeline used when no pipes are configured.
pub fn default_pipes() -> Vec<Box<dyn Pipe>> {
    vec![
        Box::new(JsonPipe::new()),
        Box::new(TexturePackerPipe::new()),
        Box::new(CacheBusterPipe::new()),
        Box::new(TexturePackerCacheBusterPipe::new()),
        Box::new(ManifestPipe::new()),
    ]
}

/// Build the configured pipeline, or the default one when `configs` is empty.
pub fn pipes_from_config(configs: &[PipeConfig]) -> Result<Vec<Box<dyn Pipe>>, PipeError> {
    if configs.is_empty() {
        return Ok(default_pipes());
    }
    configs.iter().map(|c| create_pipe(&c.name, &c.options)).collect()
}

/// Merge user options over a pipe's built-in defaults.
///
/// Keys of a configured group replace the same keys of the default group.
/// Values nested deeper, such as the resolution map, replace the default
/// value as a whole.
pub(crate) fn with_defaults(defaults: Value, options: &Value) -> Value {
    let Value::Object(mut merged) = defaults else {
        return options.clone();
    };
    let Some(options) = options.as_object() else {
        return Value::Object(merged);
    };
    for (group, value) in options {
        let next = match (merged.get(group), value) {
            (Some(Value::Object(base)), Value::Object(configured)) => {
                let mut group_options = base.clone();
                group_options.extend(configured.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(group_options)
            }
            _ => value.clone(),
        };
        merged.insert(group.clone(), next);
    }
    Value::Object(merged)
}

/// Case-insensitive extension check.
pub(crate) fn has_extension(filename: &str, extensions: &[&str]) -> bool {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
