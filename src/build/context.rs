//! Build context containing the paths and settings for a pipeline run.

use crate::config::AssetpipeConfig;
use crate::pipe::AssetSettings;
use std::path::{Path, PathBuf};

/// Default cache directory name, relative to the project root.
pub const DEFAULT_CACHE_DIR: &str = ".assetpipe-cache";

/// Default number of parallel jobs (uses available parallelism).
pub fn default_jobs() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Paths and settings for a pipeline.
///
/// The context is the filesystem-facing contract of the engine: where the
/// source tree lives, where outputs go, where the persistent cache is kept and
/// what to ignore.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Source (entry) root
    source_root: PathBuf,
    /// Output root
    output_root: PathBuf,
    /// Persistent cache directory
    cache_dir: PathBuf,
    /// Whether the cache is consulted and persisted
    cache_enabled: bool,
    /// Ignore globs, relative to the source root
    ignore: Vec<String>,
    /// Path-matched overrides
    overrides: Vec<AssetSettings>,
    /// Worker count for transforms within one stage
    jobs: usize,
}

impl BuildContext {
    /// Create a context with caching enabled and the cache directory placed
    /// beside the source root.
    pub fn new(source_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        let source_root = source_root.into();
        let cache_dir = source_root
            .parent()
            .map(|p| p.join(DEFAULT_CACHE_DIR))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
        Self {
            source_root,
            output_root: output_root.into(),
            cache_dir,
            cache_enabled: true,
            ignore: Vec::new(),
            overrides: Vec::new(),
            jobs: default_jobs(),
        }
    }

    /// Build a context from a loaded configuration, resolving relative paths
    /// against `project_root`.
    pub fn from_config(config: &AssetpipeConfig, project_root: &Path) -> Result<Self, String> {
        let resolve = |path: &Path| {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                project_root.join(path)
            }
        };

        let overrides = config
            .assets
            .iter()
            .map(|a| {
                AssetSettings::new(a.files.clone(), a.settings.clone(), a.tags.clone())
                    .map_err(|e| format!("invalid asset pattern in {:?}: {}", a.files, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source_root: resolve(&config.project.entry),
            output_root: resolve(&config.project.output),
            cache_dir: resolve(&config.cache.location),
            cache_enabled: config.cache.enabled,
            ignore: config.build.ignore.clone(),
            overrides,
            jobs: config.build.jobs.unwrap_or_else(default_jobs).max(1),
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn ignore(&self) -> &[String] {
        &self.ignore
    }

    pub fn overrides(&self) -> &[AssetSettings] {
        &self.overrides
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn with_source_root(mut self, source_root: impl Into<PathBuf>) -> Self {
        self.source_root = source_root.into();
        self
    }

    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    /// Enable or disable the persistent cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn with_ignore(mut self, ignore: Vec<String>) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_overrides(mut self, overrides: Vec<AssetSettings>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Set the number of parallel jobs.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Resolve relative roots against `base`.
    pub fn resolved_against(mut self, base: &Path) -> Self {
        for path in [&mut self.source_root, &mut self.output_root, &mut self.cache_dir] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }

    /// Directories the engine writes into that live inside the source root,
    /// relative to it. These are never treated as sources.
    pub fn nested_generated_dirs(&self) -> Vec<PathBuf> {
        [&self.output_root, &self.cache_dir]
            .into_iter()
            .filter_map(|dir| dir.strip_prefix(&self.source_root).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect()
    }
}
