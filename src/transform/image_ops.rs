//! Raster transform built on the `image` crate

use super::{NormalizedParams, OutputFormat, Step, Transform, TransformOutput};
use crate::error::{ForgeError, ForgeResult};
use crate::ingest::RawImage;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const NAME: &str = "raster";
const VERSION: u32 = 1;

/// Decode, apply one step, encode
pub struct ImageTransform {
    max_pixels: u64,
}

impl ImageTransform {
    pub fn new(max_pixels: u64) -> Self {
        Self { max_pixels }
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> ForgeResult<()> {
        if cancel.is_cancelled() {
            Err(ForgeError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn failed(&self, reason: impl std::fmt::Display) -> ForgeError {
        ForgeError::Transform {
            transform: NAME.to_string(),
            reason: reason.to_string(),
        }
    }

    fn decode(&self, input: &RawImage) -> ForgeResult<DynamicImage> {
        let mut reader =
            ImageReader::with_format(Cursor::new(&input.bytes[..]), input.info.format.to_image());
        reader.limits(raster_limits(self.max_pixels));
        reader
            .decode()
            .map_err(|e| self.failed(format!("decoding {}: {}", input.info.format, e)))
    }

    fn encode(&self, image: &DynamicImage, params: &NormalizedParams) -> ForgeResult<Vec<u8>> {
        let mut bytes = Vec::new();
        let result = match params.format {
            OutputFormat::Png => {
                image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            }
            OutputFormat::Webp => {
                let rgba = image.to_rgba8();
                image::codecs::webp::WebPEncoder::new_lossless(&mut bytes).encode(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    image::ExtendedColorType::Rgba8,
                )
            }
            OutputFormat::Jpeg => {
                let rgb = image.to_rgb8();
                let quality = params.quality.unwrap_or(super::DEFAULT_JPEG_QUALITY);
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality).encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    image::ExtendedColorType::Rgb8,
                )
            }
        };
        result.map_err(|e| self.failed(format!("encoding {}: {}", params.format, e)))?;
        Ok(bytes)
    }
}

fn raster_limits(max_pixels: u64) -> image::Limits {
    let max_dim = max_pixels.min(u32::MAX as u64) as u32;
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(max_dim);
    limits.max_image_height = Some(max_dim);
    limits.max_alloc = Some(max_pixels.saturating_mul(8));
    limits
}

impl Transform for ImageTransform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn version(&self) -> u32 {
        VERSION
    }

    fn apply(
        &self,
        input: &RawImage,
        params: &NormalizedParams,
        cancel: &CancellationToken,
    ) -> ForgeResult<TransformOutput> {
        self.checkpoint(cancel)?;
        let image = self.decode(input)?;
        self.checkpoint(cancel)?;

        let image = match params.step {
            Step::Identity => image,
            Step::Resize {
                width,
                height,
                crop: true,
            } => image.resize_to_fill(width, height, FilterType::Lanczos3),
            Step::Resize { width, height, .. } => {
                image.resize_exact(width, height, FilterType::Lanczos3)
            }
            Step::Rotate(1) => image.rotate90(),
            Step::Rotate(2) => image.rotate180(),
            Step::Rotate(_) => image.rotate270(),
            Step::Grayscale => image.grayscale(),
        };
        self.checkpoint(cancel)?;

        let (width, height) = (image.width(), image.height());
        let bytes = self.encode(&image, params)?;
        debug!(
            "Encoded {}x{} {} ({} bytes)",
            width,
            height,
            params.format,
            bytes.len()
        );

        Ok(TransformOutput {
            bytes: Bytes::from(bytes),
            format: params.format,
            width,
            height,
        })
    }
}
