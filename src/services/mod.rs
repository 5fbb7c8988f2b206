//! External collaborators: object detection, descriptor computation and the
//! class-partitioned similarity index.
//!
//! The pipeline only talks to these traits. [`HttpCvClient`] implements all
//! three against the CV HTTP service; tests substitute in-process doubles.

pub mod envelope;
pub mod http;
pub mod multipart;

pub use http::HttpCvClient;

use serde::{Deserialize, Serialize};

use crate::db::DescriptorSet;
use crate::error::Result;
use crate::geometry::{BoundingBox, Dimensions};

/// Encoded raster bytes with the name they were uploaded under.
#[derive(Debug, Clone, Copy)]
pub struct Raster<'a> {
    pub filename: &'a str,
    pub bytes: &'a [u8],
}

impl<'a> Raster<'a> {
    pub fn new(filename: &'a str, bytes: &'a [u8]) -> Self {
        Self { filename, bytes }
    }
}

/// Result of one detection call: the logical frame and the boxes in it.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub dimensions: Dimensions,
    pub objects: Vec<DetectedObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedObject {
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// One vector submitted to the similarity index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexItem {
    pub image_id: i64,
    pub detection_id: i64,
    pub vector: Vec<f32>,
}

/// One neighbor returned by a class-scoped query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Neighbor {
    pub image_id: i64,
    #[serde(default)]
    pub detection_id: Option<i64>,
    /// Score as reported by the index. Result order is the index's own.
    pub score: f32,
}

pub trait DetectionService: Send + Sync {
    fn detect(&self, raster: Raster<'_>) -> Result<DetectionResult>;
}

pub trait DescriptionService: Send + Sync {
    /// Compute descriptors for the region `bbox` of `raster`.
    fn describe(&self, raster: Raster<'_>, bbox: &BoundingBox) -> Result<DescriptorSet>;
}

pub trait SimilarityIndex: Send + Sync {
    /// Add a batch of vectors to the shard of `class_id`. The batch either
    /// succeeds as a whole or is reported failed.
    fn add(&self, class_id: i64, items: &[IndexItem]) -> Result<()>;

    fn search(&self, class_id: i64, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>>;
}
