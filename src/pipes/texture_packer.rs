//! Sprite sheet generation for `{tps}` folders.
//!
//! Every png/jpg/gif below a tagged folder is packed into one sheet per
//! configured resolution. Each page produces an image and a JSON descriptor
//! in the hash format Pixi loads:
//!
//! ```json
//! {
//!   "frames": {
//!     "hero/idle.png": {
//!       "frame": { "x": 0, "y": 0, "w": 32, "h": 32 },
//!       "rotated": false,
//!       "trimmed": false,
//!       "spriteSourceSize": { "x": 0, "y": 0, "w": 32, "h": 32 },
//!       "sourceSize": { "w": 32, "h": 32 }
//!     }
//!   },
//!   "meta": { "image": "sprites@0.5x.png", "format": "RGBA8888", "size": { "w": 64, "h": 32 }, "scale": 0.5 }
//! }
//! ```
//!
//! Sheets are written beside the folder: `sprites{tps}/` becomes
//! `sprites.png`, `sprites.json`, `sprites@0.5x.png`, `sprites@0.5x.json`.
//! When a sheet exceeds the maximum texture size it is split into pages
//! named `sprites-0`, `sprites-1`, ... whose descriptors list each other in
//! `meta.related_multi_packs`.
//!
//! Frame names shared between sheets are reported with a warning. The check
//! only compares folders packed in the same run: a folder restored from the
//! cache is not packed again, so it was checked on the run that packed it.

use crate::atlas::{pack_atlas, AtlasConfig, AtlasFrame, AtlasPage, SpriteInput};
use crate::pipe::options::path_key;
use crate::pipe::{AssetView, DerivedAsset, Pipe, PipeCapabilities, PipeError, PipeOptions, TransformOutput};
use crate::tags::{strip_path_tags, strip_tags};
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::sync::Mutex;
use tracing::{debug, warn};

pub const NAME: &str = "texture-packer";

const SPRITE_EXTENSIONS: &[&str] = &["png", "jpg", "gif"];

#[derive(Debug, Clone, Deserialize)]
struct TexturePackerOptions {
    resolution_options: ResolutionOptions,
    texture_packer: PackOptions,
}

#[derive(Debug, Clone, Deserialize)]
struct ResolutionOptions {
    /// Suffix template; `%%` is replaced by the resolution
    template: String,
    resolutions: BTreeMap<String, f64>,
    /// Resolution used for folders tagged `{fix}`
    fixed_resolution: String,
    maximum_texture_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct PackOptions {
    padding: u32,
    name_style: NameStyle,
    #[serde(default)]
    power_of_two: bool,
    /// Sheet name; defaults to the folder name without tags
    #[serde(default)]
    texture_name: Option<String>,
}

/// How frames are keyed in the sheet descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NameStyle {
    /// Path relative to the packed folder
    Relative,
    /// File name only
    Short,
}

#[derive(Debug, Serialize)]
struct SheetJson {
    frames: BTreeMap<String, SheetFrame>,
    meta: SheetMeta,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SheetFrame {
    frame: AtlasFrame,
    rotated: bool,
    trimmed: bool,
    sprite_source_size: AtlasFrame,
    source_size: SheetSize,
}

#[derive(Debug, Serialize)]
struct SheetSize {
    w: u32,
    h: u32,
}

#[derive(Debug, Serialize)]
struct SheetMeta {
    app: &'static str,
    version: &'static str,
    image: String,
    format: &'static str,
    size: SheetSize,
    scale: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    related_multi_packs: Vec<String>,
}

/// Folder pipe packing tagged folders into sprite sheets.
#[derive(Debug)]
pub struct TexturePackerPipe {
    defaults: Value,
    /// Frame names of the folders packed this run, for clash warnings
    frame_names: Mutex<HashSet<String>>,
}

impl TexturePackerPipe {
    pub fn new() -> Self {
        Self {
            defaults: json!({
                "resolution_options": {
                    "template": "@%%x",
                    "resolutions": { "default": 1, "low": 0.5 },
                    "fixed_resolution": "default",
                    "maximum_texture_size": 4096
                },
                "texture_packer": {
                    "padding": 2,
                    "name_style": "relative"
                },
                "tags": { "tps": "tps", "fix": "fix", "jpg": "jpg" }
            }),
            frame_names: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_options(options: &Value) -> Self {
        let base = Self::new();
        Self { defaults: super::with_defaults(base.defaults, options), ..base }
    }

    fn check_frame_clashes<'a>(&self, folder: &str, names: impl Iterator<Item = &'a String>) {
        let mut seen = self.frame_names.lock().unwrap_or_else(|e| e.into_inner());
        let clashes: Vec<&str> = names.filter(|n| !seen.insert((*n).clone())).map(String::as_str).collect();
        if !clashes.is_empty() {
            warn!(
                pipe = NAME,
                path = folder,
                clashes = %clashes.join(", "),
                "sprite sheets share frame names; rename the files or use name_style = \"relative\""
            );
        }
    }
}

impl Default for TexturePackerPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipe for TexturePackerPipe {
    fn name(&self) -> &str {
        NAME
    }

    fn folder(&self) -> bool {
        true
    }

    fn default_options(&self) -> Value {
        self.defaults.clone()
    }

    fn capabilities(&self) -> PipeCapabilities {
        PipeCapabilities::transform().with_start()
    }

    fn validate_options(&self, options: &PipeOptions) -> Result<(), PipeError> {
        let parsed: TexturePackerOptions = options.parse()?;
        let resolution = &parsed.resolution_options;
        if resolution.resolutions.is_empty() {
            return Err(PipeError::new("resolution_options.resolutions must not be empty"));
        }
        if let Some((name, _)) = resolution.resolutions.iter().find(|(_, r)| !(r.is_finite() && **r > 0.0)) {
            return Err(PipeError::new(format!("resolution '{}' must be a positive number", name)));
        }
        if !resolution.resolutions.contains_key(&resolution.fixed_resolution) {
            return Err(PipeError::new(format!(
                "fixed_resolution '{}' is not one of the configured resolutions",
                resolution.fixed_resolution
            )));
        }
        if resolution.maximum_texture_size == 0 {
            return Err(PipeError::new("maximum_texture_size must be positive"));
        }
        if !resolution.template.contains("%%") {
            return Err(PipeError::new("resolution template must contain '%%'"));
        }
        Ok(())
    }

    fn test(&self, asset: &AssetView<'_>, options: &PipeOptions) -> Result<bool, PipeError> {
        let tps = options.tag_name("tps");
        Ok(asset.is_folder() && asset.entry().tag(&tps).map(|v| v.is_truthy()).unwrap_or(false))
    }

    fn start(&mut self) -> Result<(), PipeError> {
        self.frame_names.get_mut().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn transform(&self, asset: &AssetView<'_>, options: &PipeOptions) -> Result<TransformOutput, PipeError> {
        let parsed: TexturePackerOptions = options.parse()?;
        let resolution_options = &parsed.resolution_options;
        let tree = asset.tree();
        let folder = asset.entry();

        let largest = resolution_options.resolutions.values().copied().fold(f64::MIN, f64::max);
        let fixed = asset.all_meta_data().get(&options.tag_name("fix")).map(|v| v.is_truthy()).unwrap_or(false);
        let mut resolutions: Vec<f64> = if fixed {
            resolution_options
                .resolutions
                .get(&resolution_options.fixed_resolution)
                .copied()
                .into_iter()
                .collect()
        } else {
            resolution_options.resolutions.values().copied().collect()
        };
        resolutions.sort_by(|a, b| b.total_cmp(a));
        resolutions.dedup();

        let mut sprites = Vec::new();
        for id in tree.walk(asset.id()).into_iter().skip(1) {
            let entry = &tree[id];
            if entry.is_folder() || !super::has_extension(entry.filename(), SPRITE_EXTENSIONS) {
                continue;
            }
            let relative = entry.path().strip_prefix(folder.path()).unwrap_or(entry.path());
            let name = match parsed.texture_packer.name_style {
                NameStyle::Relative => path_key(&strip_path_tags(relative)),
                NameStyle::Short => strip_tags(entry.filename()),
            };
            let content = tree
                .content(id)
                .map_err(|e| PipeError::with_source(format!("failed to read {}", entry.path().display()), e))?;
            let image = image::load_from_memory(&content)
                .map_err(|e| PipeError::with_source(format!("failed to decode {}", entry.path().display()), e))?
                .to_rgba8();
            sprites.push(SpriteInput { name, image });
        }

        if sprites.is_empty() {
            debug!(pipe = NAME, path = %folder.path().display(), "no sprites to pack");
            return Ok(TransformOutput::unchanged().with_skip_children());
        }

        let texture_name =
            parsed.texture_packer.texture_name.clone().unwrap_or_else(|| strip_tags(folder.filename()));
        let jpg = folder.tag(&options.tag_name("jpg")).map(|v| v.is_truthy()).unwrap_or(false);
        let atlas_config = AtlasConfig {
            max_size: (resolution_options.maximum_texture_size, resolution_options.maximum_texture_size),
            padding: parsed.texture_packer.padding,
            power_of_two: parsed.texture_packer.power_of_two,
        };

        let mut derived = Vec::new();
        for (index, resolution) in resolutions.iter().copied().enumerate() {
            let scale = resolution / largest;
            let scaled: Vec<SpriteInput> = sprites.iter().map(|s| scale_sprite(s, scale)).collect();
            let pages = pack_atlas(&scaled, &atlas_config)
                .map_err(|e| PipeError::with_source(format!("failed to pack {}", folder.path().display()), e))?;

            if index == 0 {
                self.check_frame_clashes(
                    &path_key(folder.path()),
                    pages.iter().flat_map(|p| p.frames.keys()),
                );
            }

            let suffix = if resolution == 1.0 {
                String::new()
            } else {
                resolution_options.template.replace("%%", &resolution.to_string())
            };
            let base_names: Vec<String> = if pages.len() == 1 {
                vec![format!("{}{}", texture_name, suffix)]
            } else {
                (0..pages.len()).map(|i| format!("{}-{}{}", texture_name, i, suffix)).collect()
            };
            let extension = if jpg { "jpg" } else { "png" };

            for (page_index, page) in pages.iter().enumerate() {
                let image_name = format!("{}.{}", base_names[page_index], extension);
                let related: Vec<String> = base_names
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != page_index)
                    .map(|(_, n)| format!("{}.json", n))
                    .collect();

                let texture = encode_page(page, jpg)?;
                let descriptor = sheet_json(page, &image_name, resolution, related)?;

                derived.push(DerivedAsset::new(image_name, texture).with_tag(options.tag_name("fix"), true));
                derived.push(
                    DerivedAsset::new(format!("{}.json", base_names[page_index]), descriptor)
                        .with_data("page", json!(page_index)),
                );
            }
        }

        debug!(
            pipe = NAME,
            path = %folder.path().display(),
            sprites = sprites.len(),
            outputs = derived.len(),
            "packed sprite sheets"
        );
        Ok(TransformOutput::derived(derived).with_skip_children())
    }
}

fn scale_sprite(sprite: &SpriteInput, scale: f64) -> SpriteInput {
    if scale == 1.0 {
        return sprite.clone();
    }
    let (w, h) = sprite.image.dimensions();
    let scaled_w = ((w as f64 * scale).round() as u32).max(1);
    let scaled_h = ((h as f64 * scale).round() as u32).max(1);
    let image: RgbaImage = image::imageops::resize(&sprite.image, scaled_w, scaled_h, FilterType::Triangle);
    SpriteInput { name: sprite.name.clone(), image }
}

fn encode_page(page: &AtlasPage, jpg: bool) -> Result<Vec<u8>, PipeError> {
    let mut buffer = Cursor::new(Vec::new());
    let result = if jpg {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(page.image.clone()).to_rgb8())
            .write_to(&mut buffer, ImageOutputFormat::Jpeg(90))
    } else {
        DynamicImage::ImageRgba8(page.image.clone()).write_to(&mut buffer, ImageOutputFormat::Png)
    };
    result.map_err(|e| PipeError::with_source("failed to encode sprite sheet", e))?;
    Ok(buffer.into_inner())
}

fn sheet_json(page: &AtlasPage, image: &str, scale: f64, related: Vec<String>) -> Result<Vec<u8>, PipeError> {
    let frames = page
        .frames
        .iter()
        .map(|(name, frame)| {
            let sheet_frame = SheetFrame {
                frame: *frame,
                rotated: false,
                trimmed: false,
                sprite_source_size: AtlasFrame { x: 0, y: 0, w: frame.w, h: frame.h },
                source_size: SheetSize { w: frame.w, h: frame.h },
            };
            (name.clone(), sheet_frame)
        })
        .collect();
    let (w, h) = page.size();
    let sheet = SheetJson {
        frames,
        meta: SheetMeta {
            app: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            image: image.to_string(),
            format: "RGBA8888",
            size: SheetSize { w, h },
            scale,
            related_multi_packs: related,
        },
    };
    serde_json::to_vec_pretty(&sheet).map_err(|e| PipeError::with_source("failed to serialize sprite sheet", e))
}
