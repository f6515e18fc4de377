//! imgforge - image transform job engine
//!
//! Runs resize, thumbnail, rotate and format-conversion jobs on a bounded
//! worker pool, deduplicates identical requests, and keeps outputs in a
//! content-addressed cache over local or S3 storage. Remote inputs are
//! fetched behind an SSRF guard.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod ingest;
pub mod storage;
pub mod transform;
pub mod ui;

#[cfg(test)]
mod fixtures;

pub use error::{ForgeError, ForgeResult};
