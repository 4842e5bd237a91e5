//! JPEG re-encoding to keep training images under a byte budget.

use crate::error::VistuneError;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const START_QUALITY: u8 = 95;
pub const QUALITY_STEP: u8 = 5;
pub const MIN_QUALITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Compression {
    /// Already within the budget; left untouched.
    WithinLimit,
    /// Re-encoded at this quality.
    Reencoded { quality: u8, bytes: u64 },
}

pub(crate) fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, VistuneError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).write_image(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}

/// Re-encode `path` at decreasing quality until it fits in `max_bytes`.
pub fn compress_jpeg(path: &Path, max_bytes: u64) -> Result<Compression, VistuneError> {
    if std::fs::metadata(path)?.len() <= max_bytes {
        return Ok(Compression::WithinLimit);
    }
    let image = image::open(path)?;

    let mut quality = START_QUALITY;
    while quality >= MIN_QUALITY {
        let encoded = encode_jpeg(&image, quality)?;
        let bytes = encoded.len() as u64;
        if bytes <= max_bytes {
            let temp = path.with_extension("temp.jpg");
            std::fs::write(&temp, &encoded)?;
            std::fs::rename(&temp, path)?;
            debug!(path = %path.display(), quality, bytes, "Re-encoded");
            return Ok(Compression::Reencoded { quality, bytes });
        }
        quality -= QUALITY_STEP;
    }
    Err(VistuneError::dataset(format!(
        "{} cannot be reduced to {max_bytes} bytes",
        path.display()
    )))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressReport {
    pub within_limit: usize,
    pub reencoded: Vec<(PathBuf, u8)>,
    pub failed: Vec<(PathBuf, String)>,
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
}

/// Compress every JPEG directly inside `dir`, `concurrency` files at a time.
pub async fn compress_dir(
    dir: &Path,
    max_bytes: u64,
    concurrency: usize,
) -> Result<CompressReport, VistuneError> {
    if !dir.is_dir() {
        return Err(VistuneError::not_found(format!("directory {}", dir.display())));
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_jpeg(p))
        .collect();
    files.sort();

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for path in files {
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(|e| VistuneError::dataset(e.to_string()))?;
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let result = compress_jpeg(&path, max_bytes);
            (path, result)
        });
    }

    let mut report = CompressReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Compression::WithinLimit))) => report.within_limit += 1,
            Ok((path, Ok(Compression::Reencoded { quality, .. }))) => {
                report.reencoded.push((path, quality))
            }
            Ok((path, Err(e))) => {
                warn!(path = %path.display(), error = %e, "Compression failed");
                report.failed.push((path, e.to_string()));
            }
            Err(e) => return Err(VistuneError::dataset(format!("worker panicked: {e}"))),
        }
    }
    report.reencoded.sort();
    report.failed.sort();
    Ok(report)
}
