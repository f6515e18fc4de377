//! Image transforms
//!
//! A transform is a pure function from input bytes plus parameters to output
//! bytes. Requests arrive as [`TransformParams`] and are normalized against
//! the probed input into [`NormalizedParams`] before fingerprinting, so two
//! requests that would produce the same output share a fingerprint.

mod format;
mod image_ops;

pub use format::{InputFormat, OutputFormat};
pub use image_ops::ImageTransform;

use crate::error::{ForgeError, ForgeResult};
use crate::ingest::RawImage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// JPEG quality used when the caller does not pick one
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Dimensions and codec of a probed input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub format: InputFormat,
}

impl ImageInfo {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// How a resize fits the target box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFit {
    /// Scale to fit inside the box, preserving aspect ratio
    #[default]
    Contain,
    /// Scale to cover the box and crop the overflow
    Cover,
    /// Stretch to exactly the box
    Fill,
}

impl FromStr for ResizeFit {
    type Err = ForgeError;

    fn from_str(s: &str) -> ForgeResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "contain" => Ok(Self::Contain),
            "cover" => Ok(Self::Cover),
            "fill" => Ok(Self::Fill),
            other => Err(ForgeError::validation(format!(
                "unknown fit '{}'. Valid values: contain, cover, fill",
                other
            ))),
        }
    }
}

impl fmt::Display for ResizeFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Contain => "contain",
            Self::Cover => "cover",
            Self::Fill => "fill",
        };
        write!(f, "{}", name)
    }
}

/// Requested pixel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Resize { width: u32, height: u32, fit: ResizeFit },
    Thumbnail { max_edge: u32 },
    Rotate { quarter_turns: u8 },
    Grayscale,
    /// Re-encode only
    Convert,
}

/// Caller-supplied transform parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformParams {
    pub operation: Operation,
    /// Output codec; defaults to the input codec when it can be encoded
    pub format: Option<OutputFormat>,
    /// JPEG quality 1-100
    pub quality: Option<u8>,
}

impl TransformParams {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            format: None,
            quality: None,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Resolve defaults and clamp the request against the probed input
    ///
    /// The result is canonical: every request that produces identical output
    /// for this input normalizes to the same value.
    pub fn normalize(&self, input: &ImageInfo, allow_upsampling: bool) -> ForgeResult<NormalizedParams> {
        let format = self
            .format
            .unwrap_or_else(|| input.format.preferred_output());

        let quality = match (format, self.quality) {
            (OutputFormat::Jpeg, Some(q)) if (1..=100).contains(&q) => Some(q),
            (OutputFormat::Jpeg, Some(q)) => {
                return Err(ForgeError::validation(format!(
                    "quality {} outside 1-100",
                    q
                )))
            }
            (OutputFormat::Jpeg, None) => Some(DEFAULT_JPEG_QUALITY),
            _ => None,
        };

        let (src_w, src_h) = (input.width, input.height);
        let step = match self.operation {
            Operation::Resize { width, height, fit } => {
                if width == 0 || height == 0 {
                    return Err(ForgeError::validation("resize dimensions must be non-zero"));
                }
                resize_step(src_w, src_h, width, height, fit, allow_upsampling)
            }
            Operation::Thumbnail { max_edge } => {
                if max_edge == 0 {
                    return Err(ForgeError::validation("thumbnail edge must be non-zero"));
                }
                resize_step(src_w, src_h, max_edge, max_edge, ResizeFit::Contain, allow_upsampling)
            }
            Operation::Rotate { quarter_turns } => match quarter_turns % 4 {
                0 => Step::Identity,
                turns => Step::Rotate(turns),
            },
            Operation::Grayscale => Step::Grayscale,
            Operation::Convert => Step::Identity,
        };

        let (width, height) = match step {
            Step::Resize { width, height, .. } => (width, height),
            Step::Rotate(1) | Step::Rotate(3) => (src_h, src_w),
            _ => (src_w, src_h),
        };

        Ok(NormalizedParams {
            step,
            format,
            quality,
            width,
            height,
        })
    }
}

/// Concrete pixel step after normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Identity,
    /// Exact target size; `crop` scales to cover then center-crops
    Resize { width: u32, height: u32, crop: bool },
    Rotate(u8),
    Grayscale,
}

fn resize_step(
    src_w: u32,
    src_h: u32,
    box_w: u32,
    box_h: u32,
    fit: ResizeFit,
    allow_upsampling: bool,
) -> Step {
    let (sw, sh) = (f64::from(src_w), f64::from(src_h));
    let (bw, bh) = (f64::from(box_w), f64::from(box_h));

    let (width, height, crop) = match fit {
        ResizeFit::Contain => {
            let mut scale = (bw / sw).min(bh / sh);
            if !allow_upsampling {
                scale = scale.min(1.0);
            }
            (scaled(sw, scale), scaled(sh, scale), false)
        }
        ResizeFit::Fill => {
            if allow_upsampling {
                (box_w, box_h, false)
            } else {
                (box_w.min(src_w), box_h.min(src_h), false)
            }
        }
        ResizeFit::Cover => {
            // Shrink the box, keeping its aspect, until it fits in the source
            let shrink = if allow_upsampling {
                1.0
            } else {
                (sw / bw).min(sh / bh).min(1.0)
            };
            (scaled(bw, shrink), scaled(bh, shrink), true)
        }
    };

    if width == src_w && height == src_h {
        Step::Identity
    } else {
        Step::Resize {
            width,
            height,
            crop: crop
                && u64::from(width) * u64::from(src_h) != u64::from(height) * u64::from(src_w),
        }
    }
}

fn scaled(len: f64, scale: f64) -> u32 {
    ((len * scale).round() as u32).max(1)
}

/// Canonical transform parameters, ready for fingerprinting and execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedParams {
    pub step: Step,
    pub format: OutputFormat,
    pub quality: Option<u8>,
    /// Output width after the step
    pub width: u32,
    /// Output height after the step
    pub height: u32,
}

impl NormalizedParams {
    pub fn output_pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    /// Stable byte encoding used in fingerprints
    pub fn canonical(&self) -> String {
        let step = match self.step {
            Step::Identity => "identity".to_string(),
            Step::Resize {
                width,
                height,
                crop,
            } => format!("resize:{}x{}:{}", width, height, if crop { "crop" } else { "scale" }),
            Step::Rotate(turns) => format!("rotate:{}", turns),
            Step::Grayscale => "grayscale".to_string(),
        };
        let quality = self
            .quality
            .map(|q| q.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{}|{}|q={}", step, self.format, quality)
    }
}

/// Encoded transform result
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Bytes,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

/// Estimated work for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformCost {
    pub input_pixels: u64,
    pub output_pixels: u64,
}

/// A versioned image transform
///
/// `apply` runs on a blocking thread and must poll `cancel` between stages;
/// once it is set the result is discarded, so returning early is always
/// correct.
pub trait Transform: Send + Sync {
    /// Identifier that takes part in fingerprints
    fn name(&self) -> &'static str;

    /// Bumped whenever output bytes for the same input could change
    fn version(&self) -> u32;

    fn cost(&self, input: &ImageInfo, params: &NormalizedParams) -> TransformCost {
        TransformCost {
            input_pixels: input.pixels(),
            output_pixels: params.output_pixels(),
        }
    }

    fn apply(
        &self,
        input: &RawImage,
        params: &NormalizedParams,
        cancel: &CancellationToken,
    ) -> ForgeResult<TransformOutput>;
}
