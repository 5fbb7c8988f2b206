//! Descriptor storage: named feature blocks plus the flattened search vector.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{optional, Database};
use crate::error::{Error, Result};

/// Feature blocks computed for one detection.
///
/// Every block defaults to empty; a stored descriptor never has a missing
/// field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorSet {
    pub color_hist: Vec<f32>,
    pub dominant_colors: Vec<f32>,
    pub gabor: Vec<f32>,
    pub tamura: Vec<f32>,
    pub hu_moments: Vec<f32>,
    pub orientation_hist: Vec<f32>,
    /// Blocks without a dedicated column, e.g. `lbp_hist`.
    pub extra: BTreeMap<String, Vec<f32>>,
    pub feature_vector: Vec<f32>,
}

impl DescriptorSet {
    pub fn with_vector(feature_vector: Vec<f32>) -> Self {
        Self {
            feature_vector,
            ..Default::default()
        }
    }
}

impl Database {
    /// Create or replace the descriptor of a detection in a single statement.
    pub fn upsert_descriptor(&self, detection_id: i64, set: &DescriptorSet) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO descriptors (
                detection_id, color_hist, dominant_colors, gabor, tamura,
                hu_moments, orientation_hist, extra, feature_vector, feature_dim, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(detection_id) DO UPDATE SET
                color_hist = excluded.color_hist,
                dominant_colors = excluded.dominant_colors,
                gabor = excluded.gabor,
                tamura = excluded.tamura,
                hu_moments = excluded.hu_moments,
                orientation_hist = excluded.orientation_hist,
                extra = excluded.extra,
                feature_vector = excluded.feature_vector,
                feature_dim = excluded.feature_dim,
                updated_at = CURRENT_TIMESTAMP
            "#,
            params![
                detection_id,
                to_json(&set.color_hist)?,
                to_json(&set.dominant_colors)?,
                to_json(&set.gabor)?,
                to_json(&set.tamura)?,
                to_json(&set.hu_moments)?,
                to_json(&set.orientation_hist)?,
                to_json(&set.extra)?,
                vector_to_bytes(&set.feature_vector),
                set.feature_vector.len() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_descriptor(&self, detection_id: i64) -> Result<Option<DescriptorSet>> {
        let row = optional(self.conn.query_row(
            r#"
            SELECT color_hist, dominant_colors, gabor, tamura, hu_moments,
                   orientation_hist, extra, feature_vector
            FROM descriptors
            WHERE detection_id = ?
            "#,
            [detection_id],
            |row| {
                Ok((
                    [
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ],
                    row.get::<_, String>(6)?,
                    row.get::<_, Vec<u8>>(7)?,
                ))
            },
        ))?;

        let Some(([color, dominant, gabor, tamura, hu, orientation], extra, vector)) = row else {
            return Ok(None);
        };

        Ok(Some(DescriptorSet {
            color_hist: from_json(&color)?,
            dominant_colors: from_json(&dominant)?,
            gabor: from_json(&gabor)?,
            tamura: from_json(&tamura)?,
            hu_moments: from_json(&hu)?,
            orientation_hist: from_json(&orientation)?,
            extra: from_json(&extra)?,
            feature_vector: bytes_to_vector(&vector),
        }))
    }

    pub fn count_descriptors(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM descriptors", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::ValidationFailure(format!("descriptor block not serializable: {}", e)))
}

fn from_json<T: for<'de> Deserialize<'de> + Default>(text: &str) -> Result<T> {
    if text.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(text)
        .map_err(|e| Error::ValidationFailure(format!("stored descriptor block is corrupt: {}", e)))
}

/// Convert f32 slice to bytes for storage
pub(crate) fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
