use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{Rgb, RgbImage, RgbaImage};
use sticker_contracts::errors::StickerError;
use sticker_contracts::stickers::InputImage;

/// Longest side of an uploaded photo after preprocessing.
pub const MAX_UPLOAD_DIMENSION: u32 = 1024;
/// JPEG quality for uploads (0.92 on a unit scale).
pub const UPLOAD_JPEG_QUALITY: u8 = 92;
pub const UPLOAD_MIME: &str = "image/jpeg";

/// Normalizes an arbitrary user photo into an opaque, bounded JPEG payload.
///
/// Transparency is flattened onto white so downstream matting, which assumes
/// opaque input, never sees undefined alpha.
pub fn preprocess_image(bytes: &[u8]) -> Result<InputImage, StickerError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| StickerError::Decode(err.to_string()))?;
    let flattened = flatten_onto_white(&decoded.to_rgba8());
    let (width, height) = fit_within(flattened.width(), flattened.height(), MAX_UPLOAD_DIMENSION);
    let resized = if (width, height) == flattened.dimensions() {
        flattened
    } else {
        image::imageops::resize(&flattened, width, height, FilterType::Triangle)
    };

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, UPLOAD_JPEG_QUALITY);
    encoder
        .encode_image(&resized)
        .map_err(|err| StickerError::Encode(err.to_string()))?;
    if out.is_empty() {
        return Err(StickerError::Encode("jpeg encoder returned no bytes".to_string()));
    }
    Ok(InputImage::new(out, UPLOAD_MIME))
}

pub(crate) fn flatten_onto_white(rgba: &RgbaImage) -> RgbImage {
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

/// Scales `(width, height)` down so the longest side is at most `max_side`.
/// Never upscales; both sides stay at least one pixel.
pub(crate) fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (width, height);
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, max_side);
    (scaled(width), scaled(height))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use sticker_contracts::errors::StickerError;

    use super::{fit_within, preprocess_image, UPLOAD_MIME};

    fn png_bytes(image: RgbaImage) -> anyhow::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }

    #[test]
    fn fit_within_preserves_aspect_and_never_upscales() {
        assert_eq!(fit_within(2048, 1024, 1024), (1024, 512));
        assert_eq!(fit_within(1000, 3000, 1024), (341, 1024));
        assert_eq!(fit_within(640, 480, 1024), (640, 480));
        assert_eq!(fit_within(5000, 1, 1024), (1024, 1));
    }

    #[test]
    fn large_photo_is_bounded_and_jpeg_encoded() -> anyhow::Result<()> {
        let input = png_bytes(RgbaImage::from_pixel(2000, 1500, Rgba([30, 120, 200, 255])))?;
        let prepared = preprocess_image(&input)?;
        assert_eq!(prepared.mime_type, UPLOAD_MIME);
        assert_eq!(image::guess_format(&prepared.bytes)?, ImageFormat::Jpeg);

        let decoded = image::load_from_memory(&prepared.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (1024, 768));
        Ok(())
    }

    #[test]
    fn transparency_is_flattened_onto_white() -> anyhow::Result<()> {
        let input = png_bytes(RgbaImage::from_pixel(32, 32, Rgba([0, 0, 0, 0])))?;
        let prepared = preprocess_image(&input)?;
        let decoded = image::load_from_memory(&prepared.bytes)?.to_rgb8();
        let center = decoded.get_pixel(16, 16);
        assert!(center.0.iter().all(|channel| *channel >= 250), "{center:?}");
        Ok(())
    }

    #[test]
    fn undecodable_bytes_fail_with_decode_error() {
        let err = preprocess_image(b"definitely not an image").err();
        assert!(matches!(err, Some(StickerError::Decode(_))), "{err:?}");
    }
}
