//! Derived images: resize a whole raster or crop one detection's region.
//!
//! Detection boxes live in the image's logical space. The stored raster may
//! decode to a different size, so crops are projected onto the decoded
//! pixels with [`map_to_raster`]. A derived image's logical and actual
//! dimensions are identical, and detections are never copied onto it.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use std::io::Cursor;
use std::path::Path;

use crate::config::TransformConfig;
use crate::db::{Database, Image, NewImage};
use crate::error::{Error, Result};
use crate::geometry::{map_to_raster, Dimensions};
use crate::storage::{self, BlobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformRequest {
    /// Missing dimensions default to the decoded raster's own.
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
    Crop { detection_id: Option<i64> },
}

pub struct TransformEngine<'a> {
    db: &'a Database,
    blobs: &'a dyn BlobStore,
    config: TransformConfig,
}

impl<'a> TransformEngine<'a> {
    pub fn new(db: &'a Database, blobs: &'a dyn BlobStore, config: TransformConfig) -> Self {
        Self { db, blobs, config }
    }

    pub fn resize(&self, image_id: i64, width: Option<u32>, height: Option<u32>) -> Result<Image> {
        self.apply(image_id, TransformRequest::Resize { width, height })
    }

    pub fn crop(&self, image_id: i64, detection_id: Option<i64>) -> Result<Image> {
        self.apply(image_id, TransformRequest::Crop { detection_id })
    }

    /// Derive a new image from `image_id` and record it.
    pub fn apply(&self, image_id: i64, request: TransformRequest) -> Result<Image> {
        let source = self.db.require_image(image_id)?;

        // Cheap argument checks come before touching the raster.
        let selection = match request {
            TransformRequest::Resize { width, height } => {
                self.check_dimension("width", width)?;
                self.check_dimension("height", height)?;
                None
            }
            TransformRequest::Crop { detection_id } => {
                let detection_id = detection_id.ok_or_else(|| {
                    Error::InvalidSelection("crop requires a detection".to_string())
                })?;
                let detection = self
                    .db
                    .get_detection(detection_id)?
                    .filter(|d| d.image_id == source.id)
                    .ok_or_else(|| {
                        Error::InvalidSelection(format!(
                            "detection {} does not belong to image {}",
                            detection_id, source.id
                        ))
                    })?;
                Some(detection)
            }
        };

        let raster = self.decode(&source)?;
        let (file_width, file_height) = raster.dimensions();
        let actual = Dimensions::new(file_width, file_height);

        let derived = match (request, selection) {
            (TransformRequest::Resize { width, height }, _) => {
                let target_w = width.unwrap_or(actual.width);
                let target_h = height.unwrap_or(actual.height);
                if (target_w, target_h) == (actual.width, actual.height) {
                    raster
                } else {
                    raster.resize_exact(target_w, target_h, FilterType::CatmullRom)
                }
            }
            (TransformRequest::Crop { .. }, Some(detection)) => {
                let region = map_to_raster(&detection.bbox, source.dimensions(), actual)?;
                tracing::debug!(
                    image_id,
                    detection_id = detection.id,
                    x = region.x,
                    y = region.y,
                    width = region.width,
                    height = region.height,
                    "Mapped crop region"
                );
                raster.crop_imm(region.x, region.y, region.width, region.height)
            }
            (TransformRequest::Crop { .. }, None) => {
                return Err(Error::InvalidSelection("crop requires a detection".to_string()))
            }
        };

        self.store(&source, derived)
    }

    fn check_dimension(&self, name: &str, value: Option<u32>) -> Result<()> {
        match value {
            Some(v) if v == 0 || v > self.config.max_dimension => Err(Error::ValidationFailure(
                format!("{} must be between 1 and {}, got {}", name, self.config.max_dimension, v),
            )),
            _ => Ok(()),
        }
    }

    fn decode(&self, source: &Image) -> Result<DynamicImage> {
        let unreadable = |reason: String| Error::SourceUnreadable {
            image_id: source.id,
            reason,
        };

        match self.blobs.exists(&source.path) {
            Ok(true) => {}
            Ok(false) => return Err(unreadable(format!("stored file {} is missing", source.path))),
            Err(e) => return Err(unreadable(e.to_string())),
        }

        let bytes = self
            .blobs
            .read(&source.path)
            .map_err(|e| unreadable(e.to_string()))?;
        image::load_from_memory(&bytes)
            .map_err(|e| unreadable(format!("cannot decode {}: {}", source.path, e)))
    }

    /// Encode as JPEG, write the blob, then record the image. The blob is
    /// removed again if the record cannot be written.
    fn store(&self, source: &Image, derived: DynamicImage) -> Result<Image> {
        let dimensions = Dimensions::new(derived.width(), derived.height());

        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, self.config.jpeg_quality);
        DynamicImage::ImageRgb8(derived.to_rgb8())
            .write_with_encoder(encoder)
            .map_err(|e| Error::WriteFailed {
                path: source.path.clone(),
                reason: format!("JPEG encoding failed: {}", e),
            })?;
        let bytes = buf.into_inner();

        let path = format!(
            "images/generated_{}_{}.jpg",
            source.id,
            storage::content_tag(&bytes)
        );
        self.blobs
            .write(&path, &bytes)
            .map_err(|e| Error::WriteFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let stem = Path::new(&source.original_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("image_{}", source.id));
        let record = NewImage {
            original_name: format!("generated_{}.jpg", stem),
            path: path.clone(),
            dimensions,
            is_generated: true,
            parent_image_id: self.config.record_parent.then_some(source.id),
        };

        let image_id = match self.db.insert_image(&record, &[]) {
            Ok(id) => id,
            Err(e) => {
                let _ = self.blobs.delete(&path);
                return Err(e);
            }
        };

        tracing::info!(
            source_id = source.id,
            image_id,
            width = dimensions.width,
            height = dimensions.height,
            "Derived image stored"
        );
        self.db.require_image(image_id)
    }
}
