//! Values computed from the run configuration before launch.

use crate::config::{BatchConfig, FinetuneConfig, PixelConfig};
use crate::error::VistuneError;
use serde::{Deserialize, Serialize};

/// Image pixel bounds handed to the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBounds {
    pub min_pixels: u64,
    pub max_pixels: u64,
}

/// Everything the fine-tune stage derives rather than reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedValues {
    pub gradient_accumulation_steps: u32,
    pub pixels: PixelBounds,
}

impl DerivedValues {
    pub fn from_config(config: &FinetuneConfig) -> Result<Self, VistuneError> {
        Ok(Self {
            gradient_accumulation_steps: accumulation_for(&config.batch)?,
            pixels: bounds_for(&config.pixels)?,
        })
    }
}

/// Gradient-accumulation steps: `global / (per_device * devices)`.
///
/// The division must be exact. A global batch smaller than one optimizer
/// step's worth of samples is reported as indivisible too.
pub fn gradient_accumulation_steps(
    global: u32,
    per_device: u32,
    devices: u32,
) -> Result<u32, VistuneError> {
    if global == 0 {
        return Err(VistuneError::config("global_batch_size must be positive"));
    }
    if per_device == 0 {
        return Err(VistuneError::config("batch_per_device must be positive"));
    }
    if devices == 0 {
        return Err(VistuneError::config("num_devices must be positive"));
    }
    let per_step = per_device.checked_mul(devices).ok_or_else(|| {
        VistuneError::config(format!(
            "batch_per_device ({per_device}) x num_devices ({devices}) overflows"
        ))
    })?;
    if global % per_step != 0 {
        return Err(VistuneError::IndivisibleBatch {
            global,
            per_device,
            devices,
        });
    }
    Ok(global / per_step)
}

pub fn accumulation_for(batch: &BatchConfig) -> Result<u32, VistuneError> {
    gradient_accumulation_steps(
        batch.global_batch_size,
        batch.batch_per_device,
        batch.num_devices,
    )
}

/// Pixel bounds from tile counts: `tiles * tile_size^2`.
pub fn pixel_bounds(
    min_tiles: u64,
    max_tiles: u64,
    tile_size: u64,
) -> Result<PixelBounds, VistuneError> {
    if tile_size == 0 {
        return Err(VistuneError::config("tile_size must be positive"));
    }
    if min_tiles == 0 || max_tiles == 0 {
        return Err(VistuneError::config("tile counts must be positive"));
    }
    if min_tiles > max_tiles {
        return Err(VistuneError::config(format!(
            "min_tiles ({min_tiles}) exceeds max_tiles ({max_tiles})"
        )));
    }
    let area = tile_size
        .checked_mul(tile_size)
        .ok_or_else(|| VistuneError::config("tile area overflows"))?;
    let scale = |tiles: u64| {
        tiles
            .checked_mul(area)
            .ok_or_else(|| VistuneError::config(format!("{tiles} tiles overflow the pixel count")))
    };
    Ok(PixelBounds {
        min_pixels: scale(min_tiles)?,
        max_pixels: scale(max_tiles)?,
    })
}

pub fn bounds_for(pixels: &PixelConfig) -> Result<PixelBounds, VistuneError> {
    pixel_bounds(pixels.min_tiles, pixels.max_tiles, pixels.tile_size)
}
