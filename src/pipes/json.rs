//! Minify JSON files.

use crate::pipe::{AssetView, DerivedAsset, Pipe, PipeCapabilities, PipeError, PipeOptions, TransformOutput};
use serde_json::{json, Value};
use tracing::warn;

pub const NAME: &str = "json";

/// Re-serializes `.json` files without whitespace. Files tagged `{nc}` are
/// copied untouched; files that fail to parse are logged and passed through.
#[derive(Debug, Clone)]
pub struct JsonPipe {
    defaults: Value,
}

impl JsonPipe {
    pub fn new() -> Self {
        Self { defaults: json!({ "tags": { "nc": "nc" } }) }
    }

    pub fn with_options(options: &Value) -> Self {
        let base = Self::new();
        Self { defaults: super::with_defaults(base.defaults, options) }
    }
}

impl Default for JsonPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for JsonPipe {
    fn name(&self) -> &str {
        NAME
    }

    fn default_options(&self) -> Value {
        self.defaults.clone()
    }

    fn capabilities(&self) -> PipeCapabilities {
        PipeCapabilities::transform()
    }

    fn test(&self, asset: &AssetView<'_>, options: &PipeOptions) -> Result<bool, PipeError> {
        let no_compress = asset.entry().tag(&options.tag_name("nc")).map(|v| v.is_truthy()).unwrap_or(false);
        Ok(!no_compress && super::has_extension(asset.filename(), &["json"]))
    }

    fn transform(&self, asset: &AssetView<'_>, _options: &PipeOptions) -> Result<TransformOutput, PipeError> {
        let content = asset.content()?;
        let parsed: Value = match serde_json::from_slice(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(pipe = NAME, path = %asset.path().display(), error = %e, "failed to minify json");
                return Ok(TransformOutput::unchanged());
            }
        };
        let minified = serde_json::to_vec(&parsed)
            .map_err(|e| PipeError::with_source("failed to serialize json", e))?;
        Ok(TransformOutput::derived(vec![DerivedAsset::new(asset.filename(), minified)]))
    }
}
