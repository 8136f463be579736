//! Configuration schema types for `assetpipe.toml`
//!
//! Defines the structure and validation rules for an asset pipeline project.
//!
//! ```toml
//! [project]
//! entry = "assets"
//! output = "public"
//!
//! [cache]
//! enabled = true
//!
//! [build]
//! ignore = ["**/*.psd"]
//!
//! [[pipes]]
//! name = "texture-packer"
//! options = { resolution_options = { resolutions = { default = 1, low = 0.5 } } }
//!
//! [[pipes]]
//! name = "cache-buster"
//!
//! [[assets]]
//! files = ["ui/**"]
//! tags = { m = true }
//! ```

use crate::asset::PipeSettings;
use crate::tags::Tags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Project paths section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Source (entry) directory
    #[serde(default = "default_entry")]
    pub entry: PathBuf,
    /// Output directory
    #[serde(default = "default_output")]
    pub output: PathBuf,
}

fn default_entry() -> PathBuf {
    PathBuf::from("assets")
}

fn default_output() -> PathBuf {
    PathBuf::from("public")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self { entry: default_entry(), output: default_output() }
    }
}

/// Persistent cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Reuse transform results across runs
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cache directory
    #[serde(default = "default_cache_location")]
    pub location: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_cache_location() -> PathBuf {
    PathBuf::from(crate::build::DEFAULT_CACHE_DIR)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true, location: default_cache_location() }
    }
}

/// Build settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BuildConfig {
    /// Worker threads per stage (defaults to available parallelism)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<usize>,
    /// Glob patterns, relative to the entry directory, never treated as sources
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// Watch mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Debounce delay in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u32,
    /// Clear terminal between rebuilds
    #[serde(default = "default_true")]
    pub clear_screen: bool,
}

fn default_debounce_ms() -> u32 {
    100
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 100, clear_screen: true }
    }
}

/// One pipe of the pipeline, in declared order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Built-in pipe name
    pub name: String,
    /// Options merged over the pipe's built-in defaults
    #[serde(default = "empty_object")]
    pub options: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Path override: settings and tags applied to entries matching `files`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssetOverrideConfig {
    /// Glob patterns relative to the entry directory
    pub files: Vec<String>,
    /// Option overrides keyed by pipe name
    #[serde(default)]
    pub settings: PipeSettings,
    /// Tags injected into matching entries
    #[serde(default)]
    pub tags: Tags,
}

/// Complete assetpipe.toml configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssetpipeConfig {
    /// Source and output paths
    #[serde(default)]
    pub project: ProjectConfig,
    /// Cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Build settings
    #[serde(default)]
    pub build: BuildConfig,
    /// Watch mode settings
    #[serde(default)]
    pub watch: WatchConfig,
    /// Ordered pipe list; empty means the default pipeline
    #[serde(default)]
    pub pipes: Vec<PipeConfig>,
    /// Path overrides
    #[serde(default)]
    pub assets: Vec<AssetOverrideConfig>,
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    /// Path to the invalid field (e.g., "pipes[1].name")
    pub field: String,
    /// Error message
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "assetpipe.toml: '{}' {}", self.field, self.message)
    }
}

impl AssetpipeConfig {
    /// Validate the configuration and return any errors
    pub fn validate(&self) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if self.project.entry.as_os_str().is_empty() {
            errors.push(ConfigValidationError {
                field: "project.entry".to_string(),
                message: "must be a non-empty path".to_string(),
            });
        }
        if self.project.output.as_os_str().is_empty() {
            errors.push(ConfigValidationError {
                field: "project.output".to_string(),
                message: "must be a non-empty path".to_string(),
            });
        }
        if self.project.entry == self.project.output {
            errors.push(ConfigValidationError {
                field: "project.output".to_string(),
                message: "must differ from project.entry".to_string(),
            });
        }

        if self.build.jobs == Some(0) {
            errors.push(ConfigValidationError {
                field: "build.jobs".to_string(),
                message: "must be a positive integer".to_string(),
            });
        }
        for (i, pattern) in self.build.ignore.iter().enumerate() {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(ConfigValidationError {
                    field: format!("build.ignore[{}]", i),
                    message: format!("invalid glob '{}': {}", pattern, e),
                });
            }
        }

        for (i, pipe) in self.pipes.iter().enumerate() {
            if pipe.name.is_empty() {
                errors.push(ConfigValidationError {
                    field: format!("pipes[{}].name", i),
                    message: "must be a non-empty string".to_string(),
                });
            }
            if self.pipes[..i].iter().any(|p| p.name == pipe.name) {
                errors.push(ConfigValidationError {
                    field: format!("pipes[{}].name", i),
                    message: format!("duplicate pipe '{}'", pipe.name),
                });
            }
            if !pipe.options.is_object() {
                errors.push(ConfigValidationError {
                    field: format!("pipes[{}].options", i),
                    message: "must be a table".to_string(),
                });
            }
        }

        for (i, asset) in self.assets.iter().enumerate() {
            if asset.files.is_empty() {
                errors.push(ConfigValidationError {
                    field: format!("assets[{}].files", i),
                    message: "must contain at least one glob pattern".to_string(),
                });
            }
            for (pipe, value) in &asset.settings {
                if !value.is_object() {
                    errors.push(ConfigValidationError {
                        field: format!("assets[{}].settings.{}", i, pipe),
                        message: "must be a table".to_string(),
                    });
                }
            }
        }

        errors
    }

    /// Check if validation passed
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagValue;

    #[test]
    fn test_parse_minimal_config() {
        let config: AssetpipeConfig = toml::from_str("").unwrap();
        assert_eq!(config.project.entry, PathBuf::from("assets"));
        assert_eq!(config.project.output, PathBuf::from("public"));
        assert!(config.cache.enabled);
        assert_eq!(config.watch.debounce_ms, 100);
        assert!(config.pipes.is_empty());
        assert!(config.is_valid());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[project]
entry = "raw"
output = "dist"

[cache]
enabled = false
location = "tmp/cache"

[build]
jobs = 4
ignore = ["**/*.psd"]

[watch]
debounce_ms = 250
clear_screen = false

[[pipes]]
name = "json"

[[pipes]]
name = "texture-packer"
options = { resolution_options = { resolutions = { default = 1, low = 0.5 } } }

[[assets]]
files = ["ui/**"]
tags = { m = true, scale = 2 }
settings = { json = { tags = { nc = "raw" } } }
"#;
        let config: AssetpipeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.project.entry, PathBuf::from("raw"));
        assert!(!config.cache.enabled);
        assert_eq!(config.build.jobs, Some(4));
        assert_eq!(config.watch.debounce_ms, 250);
        assert_eq!(config.pipes.len(), 2);
        assert_eq!(config.pipes[0].options, empty_object());
        assert_eq!(
            config.pipes[1].options["resolution_options"]["resolutions"]["low"].as_f64(),
            Some(0.5)
        );
        assert_eq!(config.assets[0].tags["m"], TagValue::Bool(true));
        assert_eq!(config.assets[0].tags["scale"], TagValue::from(2i64));
        assert!(config.assets[0].settings.contains_key("json"));
        assert!(config.is_valid());
    }

    #[test]
    fn test_validate_reports_each_problem() {
        let mut config = AssetpipeConfig::default();
        config.build.jobs = Some(0);
        config.build.ignore.push("[".to_string());
        config.pipes.push(PipeConfig { name: "json".to_string(), options: empty_object() });
        config.pipes.push(PipeConfig { name: "json".to_string(), options: Value::Bool(true) });
        config.assets.push(AssetOverrideConfig::default());

        let errors = config.validate();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"build.jobs"));
        assert!(fields.contains(&"build.ignore[0]"));
        assert!(fields.contains(&"pipes[1].name"));
        assert!(fields.contains(&"pipes[1].options"));
        assert!(fields.contains(&"assets[0].files"));
    }

    #[test]
    fn test_validate_entry_equals_output() {
        let mut config = AssetpipeConfig::default();
        config.project.output = config.project.entry.clone();
        assert!(!config.is_valid());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ConfigValidationError {
            field: "build.jobs".to_string(),
            message: "must be a positive integer".to_string(),
        };
        assert_eq!(err.to_string(), "assetpipe.toml: 'build.jobs' must be a positive integer");
    }
}
