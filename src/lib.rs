//! Object detection catalog with per-class similarity search.
//!
//! Uploaded rasters go through a CV service for object detection; each
//! detected object is described by a feature vector, pushed into a
//! class-partitioned similarity index and can then be searched for
//! neighbors. Derived images (resize, crop of a detection) keep bounding box
//! geometry consistent between the recorded and the decoded resolution.

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod geometry;
pub mod ingest;
pub mod logging;
pub mod search;
pub mod services;
pub mod storage;
pub mod sync;
pub mod transform;

pub use catalog::Catalog;
pub use config::Config;
pub use error::{Error, Result};
