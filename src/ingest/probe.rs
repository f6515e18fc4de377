//! Header-only image validation
//!
//! Identifies the codec from magic bytes and reads dimensions without
//! decoding pixel data, so oversized images are refused cheaply.

use crate::error::{ForgeError, ForgeResult};
use crate::transform::{ImageInfo, InputFormat};
use image::ImageReader;
use std::io::Cursor;

/// Sniff format and dimensions, enforcing the pixel limit
pub fn probe(bytes: &[u8], max_pixels: u64) -> ForgeResult<ImageInfo> {
    if bytes.is_empty() {
        return Err(ForgeError::validation("empty payload"));
    }

    let sniffed = image::guess_format(bytes)
        .map_err(|_| ForgeError::UnsupportedFormat("unrecognized image data".to_string()))?;
    let format = InputFormat::from_image(sniffed)
        .ok_or_else(|| ForgeError::UnsupportedFormat(format!("{:?}", sniffed).to_lowercase()))?;

    let (width, height) = ImageReader::with_format(Cursor::new(bytes), sniffed)
        .into_dimensions()
        .map_err(|e| ForgeError::validation(format!("unreadable {} header: {}", format, e)))?;
    if width == 0 || height == 0 {
        return Err(ForgeError::validation("image has zero dimension"));
    }

    let info = ImageInfo {
        width,
        height,
        format,
    };
    if info.pixels() > max_pixels {
        return Err(ForgeError::TooManyPixels {
            megapixels: info.pixels() as f64 / 1_000_000.0,
            limit: max_pixels as f64 / 1_000_000.0,
        });
    }
    Ok(info)
}

/// Whether a declared MIME type agrees with the sniffed format
///
/// Declarations are advisory; only a present, different image type counts
/// as a mismatch.
pub fn mime_matches(declared: &str, format: InputFormat) -> bool {
    let declared = declared
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if !declared.starts_with("image/") {
        return true;
    }
    declared == format.mime() || (declared == "image/jpg" && format == InputFormat::Jpeg)
}
