//! Hash-named outputs.

use crate::asset::content_hash;
use crate::pipe::{AssetView, DerivedAsset, Pipe, PipeCapabilities, PipeError, PipeOptions, TransformOutput};
use serde_json::{json, Value};

pub const NAME: &str = "cache-buster";

/// Number of hash digits embedded in a file name.
pub const HASH_LENGTH: usize = 8;

/// Renames every file to `<stem>-<hash>.<ext>` so a changed file gets a new URL.
#[derive(Debug, Clone)]
pub struct CacheBusterPipe {
    defaults: Value,
}

impl CacheBusterPipe {
    pub fn new() -> Self {
        Self { defaults: json!({}) }
    }

    pub fn with_options(options: &Value) -> Self {
        Self { defaults: super::with_defaults(Self::new().defaults, options) }
    }
}

impl Default for CacheBusterPipe {
    fn default() -> Self {
        Self::new()
    }
}

/// `<stem>-<hash>.<ext>`; names without an extension get the hash appended.
pub fn hashed_name(filename: &str, hash: &str) -> String {
    let short = &hash[..hash.len().min(HASH_LENGTH)];
    match filename.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &filename[..dot], short, &filename[dot..]),
        _ => format!("{}-{}", filename, short),
    }
}

impl Pipe for CacheBusterPipe {
    fn name(&self) -> &str {
        NAME
    }

    fn default_options(&self) -> Value {
        self.defaults.clone()
    }

    fn capabilities(&self) -> PipeCapabilities {
        PipeCapabilities::transform()
    }

    fn test(&self, asset: &AssetView<'_>, _options: &PipeOptions) -> Result<bool, PipeError> {
        Ok(!asset.is_folder())
    }

    fn transform(&self, asset: &AssetView<'_>, _options: &PipeOptions) -> Result<TransformOutput, PipeError> {
        let content = asset.content()?.into_owned();
        let hash = match asset.entry().hash() {
            Some(hash) => hash.to_string(),
            None => content_hash(&content),
        };
        let name = hashed_name(asset.filename(), &hash);
        Ok(TransformOutput::derived(vec![DerivedAsset::new(name, content)]))
    }
}
