//! Background removal for stickers rendered on a pure black canvas.
//!
//! The background is the set of near-black pixels reachable from the image
//! border (4-connected flood fill). Pixels of the subject that touch the
//! background get their alpha from their own brightness, which turns the
//! generator's anti-aliased fade-to-black rim into a fade-to-transparent one.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbaImage};
use thiserror::Error;
use tracing::{debug, warn};

/// Max Euclidean RGB distance from `#000000` still counted as background.
pub const NEAR_BLACK_TOLERANCE: u32 = 20;
/// Spacing of fallback seeds along the edges when no corner is near-black.
pub const EDGE_SEED_STRIDE: usize = 10;

#[derive(Debug, Error)]
pub enum MattingError {
    #[error("image of {width}x{height} pixels is too large to matte")]
    TooLarge { width: u32, height: u32 },
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferMismatch { expected: usize, actual: usize },
    #[error("decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("png encode failed: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MattingStats {
    pub background_pixels: usize,
    pub edge_pixels: usize,
    pub seeds: usize,
    /// Seeds came from the edge scan because no corner was near-black.
    pub edge_seeded: bool,
}

/// Makes the reachable black background transparent.
///
/// Never fails: on any internal error the input is returned unchanged.
pub fn remove_background(image: &RgbaImage) -> RgbaImage {
    match try_remove_background(image) {
        Ok((matted, stats)) => {
            debug!(
                width = image.width(),
                height = image.height(),
                background = stats.background_pixels,
                edge = stats.edge_pixels,
                seeds = stats.seeds,
                edge_seeded = stats.edge_seeded,
                "background removed"
            );
            matted
        }
        Err(err) => {
            warn!(error = %err, "matting failed; returning original image");
            image.clone()
        }
    }
}

/// Decodes `bytes`, mattes them and re-encodes as PNG.
pub fn matte_to_png(bytes: &[u8]) -> Result<Vec<u8>, MattingError> {
    let decoded = image::load_from_memory(bytes).map_err(MattingError::Decode)?;
    let (matted, _) = try_remove_background(&decoded.to_rgba8())?;
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(matted)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(MattingError::Encode)?;
    Ok(out)
}

/// Byte-level variant of [`remove_background`]; returns `bytes` untouched when
/// they cannot be decoded or re-encoded.
pub fn matte_png(bytes: &[u8]) -> Vec<u8> {
    match matte_to_png(bytes) {
        Ok(out) => out,
        Err(err) => {
            warn!(error = %err, "matting failed; returning original bytes");
            bytes.to_vec()
        }
    }
}

pub fn try_remove_background(image: &RgbaImage) -> Result<(RgbaImage, MattingStats), MattingError> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    if width == 0 || height == 0 {
        return Ok((image.clone(), MattingStats::default()));
    }

    let (visited, mut stats) = flood_background(image)?;
    debug_assert_eq!(visited.len(), width * height);

    let mut out = image.clone();
    for (idx, pixel) in out.chunks_exact_mut(4).enumerate() {
        if visited[idx] {
            pixel[3] = 0;
            stats.background_pixels += 1;
            continue;
        }
        if borders_background(&visited, idx, width, height) {
            pixel[3] = pixel[0].max(pixel[1]).max(pixel[2]);
            stats.edge_pixels += 1;
        }
    }
    Ok((out, stats))
}

/// Pass 1: marks every near-black pixel reachable from the seeds.
fn flood_background(image: &RgbaImage) -> Result<(Vec<bool>, MattingStats), MattingError> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let pixel_count = width
        .checked_mul(height)
        .ok_or(MattingError::TooLarge {
            width: image.width(),
            height: image.height(),
        })?;
    let samples = image.as_raw();
    let expected = pixel_count
        .checked_mul(4)
        .ok_or(MattingError::TooLarge {
            width: image.width(),
            height: image.height(),
        })?;
    if samples.len() != expected {
        return Err(MattingError::BufferMismatch {
            expected,
            actual: samples.len(),
        });
    }

    let near_black = |idx: usize| is_near_black(&samples[idx * 4..idx * 4 + 3]);
    let mut visited = vec![false; pixel_count];
    // Every pixel is enqueued at most once, so head/tail indices over a flat
    // vector replace a ring buffer.
    let mut queue: Vec<usize> = Vec::new();
    let seed = |idx: usize, visited: &mut [bool], queue: &mut Vec<usize>| {
        if !visited[idx] && near_black(idx) {
            visited[idx] = true;
            queue.push(idx);
        }
    };

    let corners = [
        0,
        width - 1,
        (height - 1) * width,
        pixel_count - 1,
    ];
    for corner in corners {
        seed(corner, &mut visited, &mut queue);
    }

    let mut edge_seeded = false;
    if queue.is_empty() {
        edge_seeded = true;
        for x in (0..width).step_by(EDGE_SEED_STRIDE) {
            seed(x, &mut visited, &mut queue);
            seed((height - 1) * width + x, &mut visited, &mut queue);
        }
        for y in (0..height).step_by(EDGE_SEED_STRIDE) {
            seed(y * width, &mut visited, &mut queue);
            seed(y * width + width - 1, &mut visited, &mut queue);
        }
    }
    let seeds = queue.len();

    let mut head = 0;
    while head < queue.len() {
        let idx = queue[head];
        head += 1;
        let x = idx % width;
        let y = idx / width;
        if y > 0 {
            seed(idx - width, &mut visited, &mut queue);
        }
        if y + 1 < height {
            seed(idx + width, &mut visited, &mut queue);
        }
        if x > 0 {
            seed(idx - 1, &mut visited, &mut queue);
        }
        if x + 1 < width {
            seed(idx + 1, &mut visited, &mut queue);
        }
    }

    Ok((
        visited,
        MattingStats {
            seeds,
            edge_seeded,
            ..MattingStats::default()
        },
    ))
}

fn is_near_black(rgb: &[u8]) -> bool {
    let sum: u32 = rgb
        .iter()
        .map(|channel| u32::from(*channel) * u32::from(*channel))
        .sum();
    sum <= NEAR_BLACK_TOLERANCE * NEAR_BLACK_TOLERANCE
}

fn borders_background(visited: &[bool], idx: usize, width: usize, height: usize) -> bool {
    let x = idx % width;
    let y = idx / width;
    (y > 0 && visited[idx - width])
        || (y + 1 < height && visited[idx + width])
        || (x > 0 && visited[idx - 1])
        || (x + 1 < width && visited[idx + 1])
}
