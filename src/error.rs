//! Error taxonomy shared by every pipeline entry point.
//!
//! Per-item failures inside batch operations (ingesting many files,
//! describing many detections) are logged and counted by the caller and
//! never surface here. Whole-operation failures (search, a single
//! transform) propagate as one of these variants with enough context to
//! retry deliberately.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Detection, description or index service unreachable, timed out, or
    /// answered with a non-success envelope.
    #[error("{service} service unavailable: {reason}")]
    UpstreamUnavailable { service: &'static str, reason: String },

    /// The similarity index refused or failed a class-scoped query.
    #[error("similarity search unavailable for class {class_id}: {reason}")]
    SearchUnavailable { class_id: i64, reason: String },

    #[error("detection {detection_id} has no descriptor; run processing on its image first")]
    MissingDescriptor { detection_id: i64 },

    #[error("invalid geometry: {0}")]
    GeometryInvalid(String),

    #[error("source raster for image {image_id} is unreadable: {reason}")]
    SourceUnreadable { image_id: i64, reason: String },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("failed to write {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] rusqlite::Error),

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

impl Error {
    pub(crate) fn upstream(service: &'static str, reason: impl ToString) -> Self {
        Error::UpstreamUnavailable {
            service,
            reason: reason.to_string(),
        }
    }

    /// True for failures where rerunning the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable { .. } | Error::SearchUnavailable { .. }
        )
    }
}
