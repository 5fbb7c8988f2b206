//! Descriptor and index synchronization.
//!
//! Brings every detection of an image to the fully processed state:
//! a stored descriptor with a non-empty feature vector, confirmed in the
//! similarity index (`indexed_at` set).
//!
//! A run is safe to repeat. Fully processed detections are skipped; detections
//! that already have a vector but were never confirmed are resubmitted from
//! the stored vector without calling the description service again. Describe
//! failures and index batch failures only affect the detections involved and
//! leave them for the next run.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::db::{Database, DescriptorSet, Detection};
use crate::error::Result;
use crate::services::{DescriptionService, IndexItem, Raster, SimilarityIndex};
use crate::storage::BlobStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Already fully processed before this run.
    pub skipped: usize,
    /// Had a stored vector and were resubmitted without describing.
    pub reused: usize,
    /// Newly described with a usable vector.
    pub described: usize,
    pub describe_failures: usize,
    pub batches_indexed: usize,
    pub batches_failed: usize,
    /// Detections that became fully processed during this run.
    pub newly_indexed: usize,
    /// The run stopped early at a call boundary.
    pub cancelled: bool,
}

pub struct Synchronizer<'a> {
    db: &'a Database,
    blobs: &'a dyn BlobStore,
    describer: &'a dyn DescriptionService,
    index: &'a dyn SimilarityIndex,
    /// Describe workers, shared by every image of a run. `None` runs inline.
    pool: Option<rayon::ThreadPool>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        db: &'a Database,
        blobs: &'a dyn BlobStore,
        describer: &'a dyn DescriptionService,
        index: &'a dyn SimilarityIndex,
    ) -> Self {
        Self {
            db,
            blobs,
            describer,
            index,
            pool: None,
            cancel: None,
        }
    }

    /// Run describe calls on up to `workers` threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool = None;
        if workers > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("objdex-describe-{}", i))
                .build()
            {
                Ok(pool) => self.pool = Some(pool),
                Err(e) => {
                    tracing::warn!(workers, error = %e, "Worker pool unavailable, describing sequentially")
                }
            }
        }
        self
    }

    /// Stop at the next call boundary once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Synchronize one image. Fails only if the image itself cannot be loaded.
    pub fn process_image(&self, image_id: i64) -> Result<SyncReport> {
        let image = self.db.require_image(image_id)?;
        let states = self.db.detection_states(image_id)?;

        let mut report = SyncReport::default();
        let mut groups: BTreeMap<i64, Vec<IndexItem>> = BTreeMap::new();
        let mut pending: Vec<Detection> = Vec::new();

        for state in states {
            if state.is_fully_processed() {
                report.skipped += 1;
            } else if state.is_index_ready() {
                report.reused += 1;
                groups
                    .entry(state.detection.class_id)
                    .or_default()
                    .push(IndexItem {
                        image_id,
                        detection_id: state.detection.id,
                        vector: state.feature_vector,
                    });
            } else {
                pending.push(state.detection);
            }
        }

        if !pending.is_empty() {
            let source = match self.blobs.exists(&image.path) {
                Ok(true) => self.blobs.read(&image.path).map_err(|e| e.to_string()),
                Ok(false) => Err(format!("stored file {} is missing", image.path)),
                Err(e) => Err(e.to_string()),
            };
            match source {
                Ok(bytes) => {
                    let raster = Raster::new(&image.original_name, &bytes);
                    for (detection, outcome) in self.describe_all(raster, pending) {
                        let Some(outcome) = outcome else {
                            report.cancelled = true;
                            continue;
                        };
                        match self.store_descriptor(&detection, outcome) {
                            Some(vector) => {
                                report.described += 1;
                                groups.entry(detection.class_id).or_default().push(IndexItem {
                                    image_id,
                                    detection_id: detection.id,
                                    vector,
                                });
                            }
                            None => report.describe_failures += 1,
                        }
                    }
                }
                Err(reason) => {
                    tracing::warn!(
                        image_id,
                        path = %image.path,
                        error = %reason,
                        "Source raster unreadable, cannot describe detections"
                    );
                    report.describe_failures += pending.len();
                }
            }
        }

        for (class_id, items) in groups {
            if self.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.index_batch(class_id, &items, &mut report);
        }

        tracing::info!(
            image_id,
            skipped = report.skipped,
            described = report.described,
            reused = report.reused,
            describe_failures = report.describe_failures,
            batches_failed = report.batches_failed,
            newly_indexed = report.newly_indexed,
            cancelled = report.cancelled,
            "Synchronization finished"
        );
        Ok(report)
    }

    /// Synchronize every image that still has detections outside the index.
    /// Per-image failures are logged and skipped.
    pub fn process_pending(&self) -> Result<Vec<(i64, SyncReport)>> {
        let mut reports = Vec::new();
        for image_id in self.db.images_with_unindexed_detections()? {
            if self.is_cancelled() {
                break;
            }
            match self.process_image(image_id) {
                Ok(report) => reports.push((image_id, report)),
                Err(e) => tracing::warn!(image_id, error = %e, "Skipping image"),
            }
        }
        Ok(reports)
    }

    /// Describe each detection independently. All results are collected
    /// before returning, so grouping only starts once every call is done.
    /// `None` marks a call skipped because the run was cancelled.
    fn describe_all(
        &self,
        raster: Raster<'_>,
        pending: Vec<Detection>,
    ) -> Vec<(Detection, Option<Result<DescriptorSet>>)> {
        // The database connection is not Sync, so workers only see these.
        let describer = self.describer;
        let cancel = self.cancel.as_deref();
        let describe = move |detection: Detection| {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return (detection, None);
            }
            let outcome = describer.describe(raster, &detection.bbox);
            (detection, Some(outcome))
        };

        match &self.pool {
            Some(pool) if pending.len() > 1 => {
                pool.install(|| pending.into_par_iter().map(describe).collect())
            }
            _ => pending.into_iter().map(describe).collect(),
        }
    }

    /// Persist one describe outcome, returning the vector when it is usable
    /// for indexing.
    fn store_descriptor(
        &self,
        detection: &Detection,
        outcome: Result<DescriptorSet>,
    ) -> Option<Vec<f32>> {
        let set = match outcome {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(
                    detection_id = detection.id,
                    class_id = detection.class_id,
                    error = %e,
                    "Describe failed"
                );
                return None;
            }
        };

        if let Err(e) = self.db.upsert_descriptor(detection.id, &set) {
            tracing::error!(detection_id = detection.id, error = %e, "Failed to store descriptor");
            return None;
        }

        if set.feature_vector.is_empty() {
            tracing::warn!(
                detection_id = detection.id,
                "Descriptor has an empty feature vector, not indexing"
            );
            return None;
        }

        Some(set.feature_vector)
    }

    /// Submit one class group. Only a confirmed batch marks its detections.
    fn index_batch(&self, class_id: i64, items: &[IndexItem], report: &mut SyncReport) {
        if let Err(e) = self.index.add(class_id, items) {
            tracing::warn!(class_id, items = items.len(), error = %e, "Index batch failed");
            report.batches_failed += 1;
            return;
        }

        let ids: Vec<i64> = items.iter().map(|item| item.detection_id).collect();
        match self.db.mark_indexed(&ids) {
            Ok(updated) => {
                report.batches_indexed += 1;
                report.newly_indexed += updated;
                if updated < ids.len() {
                    // Another run confirmed some of these first.
                    tracing::debug!(class_id, updated, submitted = ids.len(), "Batch partly already indexed");
                }
            }
            Err(e) => {
                // The index holds the vectors but we could not record it; the
                // next run resubmits them.
                tracing::error!(class_id, error = %e, "Failed to mark batch as indexed");
                report.batches_failed += 1;
            }
        }
    }
}
