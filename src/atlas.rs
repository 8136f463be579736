//! Atlas packing - combines multiple sprites into texture pages
//!
//! Implements shelf bin packing. Sprites that do not fit within the maximum
//! page size spill onto additional pages.

use image::{Rgba, RgbaImage};
use serde::Serialize;
use std::collections::BTreeMap;

/// Configuration for atlas packing
#[derive(Debug, Clone)]
pub struct AtlasConfig {
    /// Maximum page dimensions (width, height)
    pub max_size: (u32, u32),
    /// Padding between sprites in pixels
    pub padding: u32,
    /// Force power-of-two dimensions
    pub power_of_two: bool,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self { max_size: (4096, 4096), padding: 0, power_of_two: false }
    }
}

/// A sprite's position and size within a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AtlasFrame {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// One packed texture page
#[derive(Debug)]
pub struct AtlasPage {
    pub image: RgbaImage,
    /// Frames keyed by sprite name
    pub frames: BTreeMap<String, AtlasFrame>,
}

impl AtlasPage {
    pub fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A sprite to be packed
#[derive(Debug, Clone)]
pub struct SpriteInput {
    pub name: String,
    pub image: RgbaImage,
}

/// Sprite larger than a page can ever hold
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sprite '{name}' ({width}x{height}) does not fit in a {max_width}x{max_height} page")]
pub struct OversizedSprite {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Debug)]
struct Shelf {
    y: u32,
    height: u32,
    width_used: u32,
}

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Pack sprites into one or more pages.
///
/// Sprites are sorted by height (tallest first, then by name) and placed into
/// horizontal shelves. Output is fully determined by the input set.
pub fn pack_atlas(sprites: &[SpriteInput], config: &AtlasConfig) -> Result<Vec<AtlasPage>, OversizedSprite> {
    if sprites.is_empty() {
        return Ok(Vec::new());
    }

    let mut sorted: Vec<&SpriteInput> = sprites.iter().collect();
    sorted.sort_by(|a, b| b.image.height().cmp(&a.image.height()).then_with(|| a.name.cmp(&b.name)));

    let mut pages: Vec<(Vec<Shelf>, Vec<(&SpriteInput, AtlasFrame)>)> = Vec::new();

    for sprite in sorted {
        let (sprite_w, sprite_h) = sprite.image.dimensions();

        let mut placed = false;
        for (shelves, placements) in pages.iter_mut() {
            if let Some((x, y)) = try_place_in_shelves(shelves, sprite_w, sprite_h, config.padding, config.max_size) {
                placements.push((sprite, AtlasFrame { x, y, w: sprite_w, h: sprite_h }));
                placed = true;
                break;
            }
        }

        if !placed {
            let mut shelves = Vec::new();
            match try_place_in_shelves(&mut shelves, sprite_w, sprite_h, config.padding, config.max_size) {
                Some((x, y)) => {
                    pages.push((shelves, vec![(sprite, AtlasFrame { x, y, w: sprite_w, h: sprite_h })]));
                }
                None => {
                    return Err(OversizedSprite {
                        name: sprite.name.clone(),
                        width: sprite_w,
                        height: sprite_h,
                        max_width: config.max_size.0,
                        max_height: config.max_size.1,
                    })
                }
            }
        }
    }

    Ok(pages
        .into_iter()
        .map(|(shelves, placements)| {
            let (width, height) = calculate_atlas_size(&shelves, config);
            let mut image = RgbaImage::from_pixel(width, height, TRANSPARENT);
            let mut frames = BTreeMap::new();
            for (sprite, frame) in placements {
                image::imageops::replace(&mut image, &sprite.image, frame.x.into(), frame.y.into());
                frames.insert(sprite.name.clone(), frame);
            }
            AtlasPage { image, frames }
        })
        .collect())
}

fn try_place_in_shelves(
    shelves: &mut Vec<Shelf>,
    sprite_w: u32,
    sprite_h: u32,
    padding: u32,
    max_size: (u32, u32),
) -> Option<(u32, u32)> {
    // Trailing padding is trimmed from the page, so only the sprite itself must fit
    for shelf in shelves.iter_mut() {
        if sprite_h + padding <= shelf.height && shelf.width_used + sprite_w <= max_size.0 {
            let x = shelf.width_used;
            let y = shelf.y;
            shelf.width_used += sprite_w + padding;
            return Some((x, y));
        }
    }

    let new_shelf_y = shelves.last().map(|s| s.y + s.height).unwrap_or(0);
    if new_shelf_y + sprite_h <= max_size.1 && sprite_w <= max_size.0 {
        shelves.push(Shelf { y: new_shelf_y, height: sprite_h + padding, width_used: sprite_w + padding });
        return Some((0, new_shelf_y));
    }

    None
}

fn calculate_atlas_size(shelves: &[Shelf], config: &AtlasConfig) -> (u32, u32) {
    if shelves.is_empty() {
        return (1, 1);
    }

    let max_width = shelves.iter().map(|s| s.width_used).max().unwrap_or(1);
    let total_height = shelves.last().map(|s| s.y + s.height).unwrap_or(1);

    // Padding is between sprites, not on edges
    let width = if config.padding > 0 && max_width > config.padding {
        max_width - config.padding
    } else {
        max_width.max(1)
    };
    let height = if config.padding > 0 && total_height > config.padding {
        total_height - config.padding
    } else {
        total_height.max(1)
    };

    if config.power_of_two {
        (next_power_of_two(width), next_power_of_two(height))
    } else {
        (width, height)
    }
}

fn next_power_of_two(n: u32) -> u32 {
    n.max(1).next_power_of_two()
}
