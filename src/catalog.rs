//! Catalog facade used by the command-line binary.
//!
//! Owns the configuration, database, blob store and CV client, and wires
//! them into the pipeline components per call. Also hosts the catalog
//! maintenance operations: list, show, export, delete and health.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::Config;
use crate::db::{Database, Detection, Image};
use crate::error::{Error, Result};
use crate::ingest::{self, IngestReport, Ingestor};
use crate::search::{SearchAdapter, SearchOutcome};
use crate::services::HttpCvClient;
use crate::storage::{BlobStore, FsBlobStore};
use crate::sync::{SyncReport, Synchronizer};
use crate::transform::TransformEngine;

/// One detection as shown in the image view.
#[derive(Debug, Clone)]
pub struct DetectionView {
    pub detection: Detection,
    pub has_descriptor: bool,
    pub indexed: bool,
}

#[derive(Debug, Clone)]
pub struct ImageView {
    pub image: Image,
    pub detections: Vec<DetectionView>,
}

pub struct Catalog {
    config: Config,
    db: Database,
    blobs: FsBlobStore,
    client: HttpCvClient,
    cancel: Arc<AtomicBool>,
}

impl Catalog {
    pub fn open(config: Config) -> Result<Self> {
        let db = Database::open(&config.db_path)?;
        db.initialize()?;
        let blobs = FsBlobStore::new(&config.storage.root);
        let client = HttpCvClient::from_config(&config.services);

        tracing::debug!(
            db = %config.db_path.display(),
            storage = %config.storage.root.display(),
            service = client.base_url(),
            "Catalog opened"
        );

        Ok(Self {
            config,
            db,
            blobs,
            client,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Setting this flag stops a running synchronization at its next call
    /// boundary. Only embedding code sets it; the binary has no signal handler.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Ingest files and directories; directories are walked for images.
    pub fn ingest(&self, inputs: &[PathBuf]) -> IngestReport {
        let files = ingest::discover_images(inputs, &self.config.ingest.image_extensions);
        Ingestor::new(&self.db, &self.blobs, &self.client).ingest_files(&files)
    }

    fn synchronizer(&self) -> Synchronizer<'_> {
        Synchronizer::new(&self.db, &self.blobs, &self.client, &self.client)
            .with_workers(self.config.sync.describe_workers)
            .with_cancel_flag(self.cancel_flag())
    }

    pub fn process(&self, image_id: i64) -> Result<SyncReport> {
        self.synchronizer().process_image(image_id)
    }

    pub fn process_all(&self) -> Result<Vec<(i64, SyncReport)>> {
        self.synchronizer().process_pending()
    }

    /// Search with the configured `top_k` unless overridden.
    pub fn search(&self, detection_id: i64, top_k: Option<usize>) -> Result<SearchOutcome> {
        let top_k = top_k.unwrap_or(self.config.search.top_k);
        SearchAdapter::new(&self.db, &self.client, top_k).search(detection_id)
    }

    fn transforms(&self) -> TransformEngine<'_> {
        TransformEngine::new(&self.db, &self.blobs, self.config.transform.clone())
    }

    pub fn resize(&self, image_id: i64, width: Option<u32>, height: Option<u32>) -> Result<Image> {
        self.transforms().resize(image_id, width, height)
    }

    pub fn crop(&self, image_id: i64, detection_id: Option<i64>) -> Result<Image> {
        self.transforms().crop(image_id, detection_id)
    }

    pub fn list(&self) -> Result<Vec<Image>> {
        self.db.list_images()
    }

    pub fn show(&self, image_id: i64) -> Result<ImageView> {
        let image = self.db.require_image(image_id)?;
        let detections = self
            .db
            .detection_states(image_id)?
            .into_iter()
            .map(|state| DetectionView {
                indexed: state.is_fully_processed(),
                has_descriptor: state.has_descriptor,
                detection: state.detection,
            })
            .collect();
        Ok(ImageView { image, detections })
    }

    /// Copy an image's stored raster to `dest`. A directory destination
    /// receives the file under the image's original name.
    pub fn export(&self, image_id: i64, dest: &Path) -> Result<PathBuf> {
        let image = self.db.require_image(image_id)?;
        let bytes = self
            .blobs
            .read(&image.path)
            .map_err(|e| Error::SourceUnreadable {
                image_id,
                reason: e.to_string(),
            })?;

        let target = if dest.is_dir() {
            dest.join(&image.original_name)
        } else {
            dest.to_path_buf()
        };
        std::fs::write(&target, bytes).map_err(|e| Error::WriteFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(image_id, dest = %target.display(), "Image exported");
        Ok(target)
    }

    /// Delete an image record with its detections and descriptors. The blob
    /// goes too unless another image shares it.
    pub fn delete(&self, image_id: i64) -> Result<()> {
        let image = self.db.require_image(image_id)?;
        self.db.delete_image(image_id)?;

        if self.db.count_images_at_path(&image.path)? == 0 {
            if let Err(e) = self.blobs.delete(&image.path) {
                tracing::warn!(image_id, path = %image.path, error = %e, "Failed to delete blob");
            }
        }

        tracing::info!(image_id, "Image deleted");
        Ok(())
    }

    pub fn health(&self) -> Result<()> {
        self.client.health()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{new_detection, new_image};
    use crate::db::DescriptorSet;
    use tempfile::{tempdir, TempDir};

    fn catalog() -> (TempDir, Catalog) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.db_path = dir.path().join("objdex.db");
        config.storage.root = dir.path().join("blobs");
        config.services.base_url = "http://127.0.0.1:9".to_string();
        config.services.connect_timeout_secs = 1;
        let catalog = Catalog::open(config).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_show_reports_descriptor_state() {
        let (_dir, catalog) = catalog();
        let db = catalog.database();
        let image_id = db
            .insert_image(
                &new_image("a.jpg", 100, 100),
                &[
                    new_detection(1, [0.0, 0.0, 10.0, 10.0]),
                    new_detection(1, [20.0, 20.0, 30.0, 30.0]),
                    new_detection(2, [40.0, 40.0, 60.0, 60.0]),
                ],
            )
            .unwrap();
        let ids: Vec<i64> = db.detections_for_image(image_id).unwrap().iter().map(|d| d.id).collect();
        db.upsert_descriptor(ids[0], &DescriptorSet::with_vector(vec![1.0])).unwrap();
        db.upsert_descriptor(ids[1], &DescriptorSet::with_vector(vec![1.0])).unwrap();
        db.mark_indexed(&[ids[0]]).unwrap();

        let view = catalog.show(image_id).unwrap();
        let state: Vec<(bool, bool)> = view
            .detections
            .iter()
            .map(|d| (d.has_descriptor, d.indexed))
            .collect();
        assert_eq!(state, vec![(true, true), (true, false), (false, false)]);
    }

    #[test]
    fn test_export_to_directory_and_file() {
        let (dir, catalog) = catalog();
        let image = new_image("cat.jpg", 10, 10);
        catalog.blobs.write(&image.path, b"jpeg bytes").unwrap();
        let image_id = catalog.database().insert_image(&image, &[]).unwrap();

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let target = catalog.export(image_id, &out).unwrap();
        assert_eq!(target, out.join("cat.jpg"));
        assert_eq!(std::fs::read(&target).unwrap(), b"jpeg bytes");

        let named = dir.path().join("copy.jpg");
        assert_eq!(catalog.export(image_id, &named).unwrap(), named);
    }

    #[test]
    fn test_export_missing_blob() {
        let (dir, catalog) = catalog();
        let image_id = catalog
            .database()
            .insert_image(&new_image("gone.jpg", 10, 10), &[])
            .unwrap();
        assert!(matches!(
            catalog.export(image_id, dir.path()),
            Err(Error::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn test_delete_keeps_shared_blob() {
        let (_dir, catalog) = catalog();
        let image = new_image("same.jpg", 10, 10);
        catalog.blobs.write(&image.path, b"bytes").unwrap();
        let first = catalog.database().insert_image(&image, &[]).unwrap();
        let second = catalog.database().insert_image(&image, &[]).unwrap();

        catalog.delete(first).unwrap();
        assert!(catalog.blobs.exists(&image.path).unwrap());

        catalog.delete(second).unwrap();
        assert!(!catalog.blobs.exists(&image.path).unwrap());
        assert!(catalog.list().unwrap().is_empty());
        assert!(matches!(catalog.delete(second), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_cancel_flag_stops_processing_before_any_call() {
        let (_dir, catalog) = catalog();
        catalog
            .database()
            .insert_image(
                &new_image("a.jpg", 100, 100),
                &[new_detection(1, [0.0, 0.0, 10.0, 10.0])],
            )
            .unwrap();

        catalog
            .cancel_flag()
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(catalog.process_all().unwrap().is_empty());
        assert_eq!(catalog.database().count_descriptors().unwrap(), 0);
    }

    #[test]
    fn test_health_reports_unreachable_service() {
        let (_dir, catalog) = catalog();
        assert!(matches!(
            catalog.health(),
            Err(Error::UpstreamUnavailable { .. })
        ));
    }
}
