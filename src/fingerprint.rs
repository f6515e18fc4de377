//! Content-addressed job identity
//!
//! A fingerprint is the SHA256 of the input content hash, the transform
//! identity and version, and the canonical normalized parameters. Equal
//! fingerprints mean equal outputs, which is what lets the engine collapse
//! duplicate work and the cache serve repeat requests.

use crate::transform::NormalizedParams;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix for all output keys in the storage backend
pub const OUTPUT_PREFIX: &str = "outputs";

/// SHA256 of raw input bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

/// Identity of one transform output
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(
        content: &ContentHash,
        transform: &str,
        version: u32,
        params: &NormalizedParams,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"imgforge/v1\0");
        hasher.update(content.0);
        // Length-prefix variable fields so adjacent values cannot run together
        hasher.update((transform.len() as u32).to_be_bytes());
        hasher.update(transform.as_bytes());
        hasher.update(version.to_be_bytes());
        let canonical = params.canonical();
        hasher.update((canonical.len() as u32).to_be_bytes());
        hasher.update(canonical.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Inverse of [`Fingerprint::storage_key`]: the fingerprint and extension
    /// of an output key, or `None` for any other key
    pub fn parse_storage_key(key: &str) -> Option<(Self, &str)> {
        let rest = key.strip_prefix(OUTPUT_PREFIX)?.strip_prefix('/')?;
        let (shard, file) = rest.split_once('/')?;
        let (hex, extension) = file.split_once('.')?;
        let fp = Self::from_hex(hex)?;
        (hex.len() == 64 && hex == fp.to_hex() && shard == &hex[..2]).then_some((fp, extension))
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Storage key holding the output for this fingerprint
    ///
    /// Keys are sharded by the first byte to keep local directories small.
    pub fn storage_key(&self, extension: &str) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}.{}", OUTPUT_PREFIX, &hex[..2], hex, extension)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| de::Error::custom("invalid fingerprint"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::validate_key;
    use crate::transform::{ImageInfo, InputFormat, Operation, OutputFormat, TransformParams};

    fn params(op: Operation) -> NormalizedParams {
        let info = ImageInfo {
            width: 100,
            height: 100,
            format: InputFormat::Png,
        };
        TransformParams::new(op).normalize(&info, false).unwrap()
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let content = ContentHash::of(b"pixels");
        let a = Fingerprint::compute(&content, "raster", 1, &params(Operation::Grayscale));
        let b = Fingerprint::compute(&content, "raster", 1, &params(Operation::Grayscale));
        assert_eq!(a, b);
    }

    #[test]
    fn every_component_matters() {
        let content = ContentHash::of(b"pixels");
        let base = Fingerprint::compute(&content, "raster", 1, &params(Operation::Grayscale));

        let other_content = ContentHash::of(b"pixels!");
        assert_ne!(
            base,
            Fingerprint::compute(&other_content, "raster", 1, &params(Operation::Grayscale))
        );
        assert_ne!(
            base,
            Fingerprint::compute(&content, "raster", 2, &params(Operation::Grayscale))
        );
        assert_ne!(
            base,
            Fingerprint::compute(&content, "vector", 1, &params(Operation::Grayscale))
        );
        assert_ne!(
            base,
            Fingerprint::compute(&content, "raster", 1, &params(Operation::Convert))
        );
    }

    #[test]
    fn storage_key_is_valid_and_sharded() {
        let content = ContentHash::of(b"pixels");
        let fp = Fingerprint::compute(&content, "raster", 1, &params(Operation::Convert));
        let key = fp.storage_key(OutputFormat::Png.extension());
        validate_key(&key).unwrap();
        let hex = fp.to_hex();
        assert_eq!(key, format!("outputs/{}/{}.png", &hex[..2], hex));
    }

    #[test]
    fn storage_key_parses_back() {
        let fp = Fingerprint::compute(
            &ContentHash::of(b"x"),
            "raster",
            1,
            &params(Operation::Grayscale),
        );
        let key = fp.storage_key("webp");
        assert_eq!(Fingerprint::parse_storage_key(&key), Some((fp, "webp")));

        let hex = fp.to_hex();
        for other in [
            format!("outputs/zz/{}.png", hex),
            format!("outputs/{}/{}.png", &hex[..2], &hex[..40]),
            format!("outputs/{}/{}.png", &hex[..2], hex.to_uppercase()),
            format!("cache/{}/{}.png", &hex[..2], hex),
            "outputs/ab/not-hex.png".to_string(),
        ] {
            assert!(Fingerprint::parse_storage_key(&other).is_none(), "{}", other);
        }
    }

    #[test]
    fn serde_uses_hex() {
        let fp = Fingerprint::compute(
            &ContentHash::of(b"x"),
            "raster",
            1,
            &params(Operation::Convert),
        );
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn short_is_prefix() {
        let fp = Fingerprint::compute(
            &ContentHash::of(b"x"),
            "raster",
            1,
            &params(Operation::Convert),
        );
        assert!(fp.to_hex().starts_with(&fp.short()));
        assert_eq!(fp.short().len(), 12);
    }
}
