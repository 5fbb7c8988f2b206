//! First-pass ingestion: detect objects in uploaded rasters and record the
//! image with its detections.
//!
//! Each file is an independent unit. A file that cannot be read, detected or
//! stored is logged and skipped; nothing is written for it because the image
//! row and its detections are only inserted after a successful detection
//! response.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::db::{Database, NewDetection, NewImage};
use crate::error::{Error, Result};
use crate::services::{DetectionService, Raster};
use crate::storage::{self, BlobStore};

#[derive(Debug, Default)]
pub struct IngestReport {
    pub ingested: Vec<i64>,
    pub failed: Vec<(PathBuf, String)>,
}

impl IngestReport {
    /// Number of images successfully ingested.
    pub fn count(&self) -> usize {
        self.ingested.len()
    }
}

pub struct Ingestor<'a> {
    db: &'a Database,
    blobs: &'a dyn BlobStore,
    detector: &'a dyn DetectionService,
}

impl<'a> Ingestor<'a> {
    pub fn new(db: &'a Database, blobs: &'a dyn BlobStore, detector: &'a dyn DetectionService) -> Self {
        Self { db, blobs, detector }
    }

    /// Ingest every file, continuing past per-file failures.
    pub fn ingest_files(&self, paths: &[PathBuf]) -> IngestReport {
        let mut report = IngestReport::default();

        for path in paths {
            match self.ingest_file(path) {
                Ok(image_id) => report.ingested.push(image_id),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping image");
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            ingested = report.ingested.len(),
            failed = report.failed.len(),
            "Ingestion finished"
        );
        report
    }

    pub fn ingest_file(&self, path: &Path) -> Result<i64> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::ValidationFailure(format!("cannot read {}: {}", path.display(), e))
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        self.ingest_bytes(&filename, &bytes)
    }

    /// Detect, store the raster, then record the image and its detections.
    pub fn ingest_bytes(&self, filename: &str, bytes: &[u8]) -> Result<i64> {
        let detected = self.detector.detect(Raster::new(filename, bytes))?;
        if detected.dimensions.is_empty() {
            return Err(Error::ValidationFailure(format!(
                "detection service reported empty dimensions for {}",
                filename
            )));
        }

        let extension = Path::new(filename)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "bin".to_string());
        let blob_path = storage::content_path(bytes, &extension);

        // Identical uploads share one blob; only a blob written here is ours to undo.
        let existed = self.blobs.exists(&blob_path).unwrap_or(false);
        if !existed {
            self.blobs
                .write(&blob_path, bytes)
                .map_err(|e| Error::WriteFailed {
                    path: blob_path.clone(),
                    reason: e.to_string(),
                })?;
        }

        let image = NewImage {
            original_name: filename.to_string(),
            path: blob_path.clone(),
            dimensions: detected.dimensions,
            is_generated: false,
            parent_image_id: None,
        };
        let detections: Vec<NewDetection> = detected
            .objects
            .into_iter()
            .map(|o| NewDetection {
                class_id: o.class_id,
                class_name: o.class_name,
                confidence: o.confidence,
                bbox: o.bbox,
            })
            .collect();

        match self.db.insert_image(&image, &detections) {
            Ok(image_id) => {
                tracing::info!(
                    image_id,
                    filename,
                    detections = detections.len(),
                    "Image ingested"
                );
                Ok(image_id)
            }
            Err(e) => {
                if !existed {
                    let _ = self.blobs.delete(&blob_path);
                }
                Err(e)
            }
        }
    }
}

/// Expand `inputs` into image files: files are kept as given, directories
/// are walked recursively and filtered by extension.
pub fn discover_images(inputs: &[PathBuf], extensions: &[String]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(input)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| e.into_path())
                .filter(|p| p.is_file() && has_extension(p, extensions))
                .collect();
            // Sort by path for consistent ordering
            found.sort();
            images.extend(found);
        } else {
            images.push(input.clone());
        }
    }

    images
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|e| e.to_lowercase() == ext)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory_db;
    use crate::geometry::{BoundingBox, Dimensions};
    use crate::services::{DetectedObject, DetectionResult};
    use crate::storage::FsBlobStore;
    use std::fs::{self, File};
    use tempfile::tempdir;

    /// Fails for files whose name contains "broken".
    struct FakeDetector;

    impl DetectionService for FakeDetector {
        fn detect(&self, raster: Raster<'_>) -> Result<DetectionResult> {
            if raster.filename.contains("broken") {
                return Err(Error::upstream("detection", "inference failed"));
            }
            Ok(DetectionResult {
                dimensions: Dimensions::new(200, 100),
                objects: vec![
                    DetectedObject {
                        class_id: 5,
                        class_name: "bus".to_string(),
                        confidence: 0.8,
                        bbox: BoundingBox::new(10.0, 10.0, 50.0, 50.0),
                    },
                    DetectedObject {
                        class_id: 2,
                        class_name: "car".to_string(),
                        confidence: 0.6,
                        bbox: BoundingBox::new(150.0, 20.0, 260.0, 140.0),
                    },
                ],
            })
        }
    }

    #[test]
    fn test_failed_detection_is_skipped() {
        let dir = tempdir().unwrap();
        let db = memory_db();
        let blobs = FsBlobStore::new(dir.path().join("blobs"));

        let mut paths = Vec::new();
        for name in ["a.jpg", "broken.jpg", "c.jpg"] {
            let path = dir.path().join(name);
            fs::write(&path, name.as_bytes()).unwrap();
            paths.push(path);
        }

        let report = Ingestor::new(&db, &blobs, &FakeDetector).ingest_files(&paths);
        assert_eq!(report.count(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.ends_with("broken.jpg"));
        assert_eq!(db.count_images().unwrap(), 2);

        let image = db.require_image(report.ingested[0]).unwrap();
        assert_eq!(image.original_name, "a.jpg");
        assert_eq!(image.dimensions(), Dimensions::new(200, 100));
        assert!(blobs.exists(&image.path).unwrap());
    }

    #[test]
    fn test_detections_recorded_in_logical_space() {
        let dir = tempdir().unwrap();
        let db = memory_db();
        let blobs = FsBlobStore::new(dir.path());

        let image_id = Ingestor::new(&db, &blobs, &FakeDetector)
            .ingest_bytes("street.png", b"png-bytes")
            .unwrap();

        let detections = db.detections_for_image(image_id).unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_id, 5);
        assert_eq!(detections[0].class_name, "bus");
        assert_eq!(detections[0].bbox, BoundingBox::new(10.0, 10.0, 50.0, 50.0));
        // The second box overflowed the 200x100 frame and was clamped.
        assert_eq!(detections[1].bbox, BoundingBox::new(150.0, 20.0, 200.0, 100.0));
        assert!(detections.iter().all(|d| d.indexed_at.is_none()));
    }

    #[test]
    fn test_nothing_written_on_detection_failure() {
        let dir = tempdir().unwrap();
        let db = memory_db();
        let blobs = FsBlobStore::new(dir.path());

        let result = Ingestor::new(&db, &blobs, &FakeDetector).ingest_bytes("broken.jpg", b"x");
        assert!(matches!(result, Err(Error::UpstreamUnavailable { .. })));
        assert!(!blobs.exists(&storage::content_path(b"x", "jpg")).unwrap());
        assert_eq!(db.count_images().unwrap(), 0);
    }

    #[test]
    fn test_discover_images() {
        let dir = tempdir().unwrap();

        File::create(dir.path().join("photo1.jpg")).unwrap();
        File::create(dir.path().join("photo2.PNG")).unwrap();
        File::create(dir.path().join("document.txt")).unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        File::create(dir.path().join("subdir/photo3.jpeg")).unwrap();
        let single = dir.path().join("document.txt");

        let extensions = vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()];
        let images = discover_images(&[dir.path().to_path_buf(), single.clone()], &extensions);

        assert_eq!(images.len(), 4);
        assert_eq!(images.last(), Some(&single));
    }
}
