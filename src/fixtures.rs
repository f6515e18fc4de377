//! Test images built in memory

use crate::fingerprint::ContentHash;
use crate::ingest::RawImage;
use crate::transform::{ImageInfo, InputFormat};
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// Encode a gradient so distinct sizes have distinct bytes
pub fn image_bytes(width: u32, height: u32, format: ImageFormat) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    Bytes::from(buf)
}

pub fn png(width: u32, height: u32) -> Bytes {
    image_bytes(width, height, ImageFormat::Png)
}

pub fn raw_png(width: u32, height: u32) -> RawImage {
    let bytes = png(width, height);
    RawImage {
        content_hash: ContentHash::of(&bytes),
        info: ImageInfo {
            width,
            height,
            format: InputFormat::Png,
        },
        declared_mime: Some("image/png".to_string()),
        bytes,
    }
}
