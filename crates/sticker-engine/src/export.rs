use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use sticker_contracts::errors::StickerError;
use sticker_contracts::stickers::ExportBlob;
use tracing::debug;

/// Side of the square canvas chat apps expect for stickers.
pub const EXPORT_CANVAS_SIZE: u32 = 512;
pub const EXPORT_MAX_BYTES: usize = 99 * 1024;
pub const EXPORT_MIME: &str = "image/webp";

/// Quality schedule in tenths: 0.9 down to the 0.1 floor.
const START_QUALITY_TENTHS: u8 = 9;
const FLOOR_QUALITY_TENTHS: u8 = 1;

/// Re-encodes a sticker onto a 512x512 transparent canvas as lossy WebP,
/// lowering quality until the payload fits [`EXPORT_MAX_BYTES`].
pub fn export_for_sharing(image: &DynamicImage) -> Result<ExportBlob, StickerError> {
    let canvas = fit_to_canvas(image, EXPORT_CANVAS_SIZE);
    encode_within_budget(&canvas, EXPORT_MAX_BYTES, encode_webp)
}

pub fn export_bytes_for_sharing(bytes: &[u8]) -> Result<ExportBlob, StickerError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| StickerError::Decode(err.to_string()))?;
    export_for_sharing(&decoded)
}

/// Scales `image` by `min(size/w, size/h)` and centers it on a cleared
/// `size`x`size` canvas.
pub fn fit_to_canvas(image: &DynamicImage, size: u32) -> RgbaImage {
    let mut canvas = RgbaImage::new(size, size);
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return canvas;
    }

    let scale = (f64::from(size) / f64::from(width)).min(f64::from(size) / f64::from(height));
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, size);
    let (target_width, target_height) = (scaled(width), scaled(height));
    // Filter in premultiplied space so transparent black does not darken edges.
    let mut source = image.to_rgba8();
    premultiply(&mut source);
    let mut resized =
        image::imageops::resize(&source, target_width, target_height, FilterType::Triangle);
    unpremultiply(&mut resized);

    let offset_x = i64::from((size - target_width) / 2);
    let offset_y = i64::from((size - target_height) / 2);
    image::imageops::replace(&mut canvas, &resized, offset_x, offset_y);
    canvas
}

fn premultiply(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let alpha = u32::from(pixel[3]);
        for channel in &mut pixel.0[..3] {
            *channel = ((u32::from(*channel) * alpha + 127) / 255) as u8;
        }
    }
}

fn unpremultiply(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let alpha = u32::from(pixel[3]);
        if alpha == 0 {
            pixel.0 = [0, 0, 0, 0];
            continue;
        }
        for channel in &mut pixel.0[..3] {
            *channel = ((u32::from(*channel) * 255 + alpha / 2) / alpha).min(255) as u8;
        }
    }
}

/// Steps quality down from 0.9 by 0.1 until the encoding fits `max_bytes`;
/// the 0.1 floor result is returned even when it is still too large.
pub fn encode_within_budget<E>(
    canvas: &RgbaImage,
    max_bytes: usize,
    encode: E,
) -> Result<ExportBlob, StickerError>
where
    E: Fn(&RgbaImage, f32) -> Result<Vec<u8>, StickerError>,
{
    let mut tenths = START_QUALITY_TENTHS;
    loop {
        let quality = f32::from(tenths) / 10.0;
        let bytes = encode(canvas, quality)?;
        if bytes.is_empty() {
            return Err(StickerError::Encode(format!(
                "encoder returned no bytes at quality {quality:.1}"
            )));
        }
        debug!(quality, bytes = bytes.len(), max_bytes, "export encode pass");
        if bytes.len() <= max_bytes || tenths <= FLOOR_QUALITY_TENTHS {
            return Ok(ExportBlob {
                bytes,
                mime_type: EXPORT_MIME.to_string(),
                quality,
            });
        }
        tenths -= 1;
    }
}

fn encode_webp(canvas: &RgbaImage, quality: f32) -> Result<Vec<u8>, StickerError> {
    let encoder = webp::Encoder::from_rgba(canvas.as_raw(), canvas.width(), canvas.height());
    let memory = encoder
        .encode_simple(false, quality * 100.0)
        .map_err(|err| StickerError::Encode(format!("webp encode failed: {err:?}")))?;
    Ok(memory.to_vec())
}
