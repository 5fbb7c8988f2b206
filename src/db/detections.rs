//! Detection records and their index state.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};

use super::descriptors::bytes_to_vector;
use super::{optional, placeholders, Database};
use crate::error::Result;
use crate::geometry::{BoundingBox, Dimensions};

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: i64,
    pub image_id: i64,
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
    /// In the owning image's logical coordinate space.
    pub bbox: BoundingBox,
    /// Set once the vector is confirmed in the similarity index.
    pub indexed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDetection {
    pub class_id: i64,
    pub class_name: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// A detection with whatever vector is stored for it.
#[derive(Debug, Clone)]
pub struct DetectionState {
    pub detection: Detection,
    pub has_descriptor: bool,
    /// Stored feature vector; empty when there is no descriptor.
    pub feature_vector: Vec<f32>,
}

impl DetectionState {
    /// Has a descriptor with a non-empty feature vector.
    pub fn is_index_ready(&self) -> bool {
        self.has_descriptor && !self.feature_vector.is_empty()
    }

    /// Index-ready and confirmed in the similarity index.
    pub fn is_fully_processed(&self) -> bool {
        self.is_index_ready() && self.detection.indexed_at.is_some()
    }
}

const DETECTION_COLUMNS: &str =
    "d.id, d.image_id, d.class_id, d.class_name, d.confidence, d.x1, d.y1, d.x2, d.y2, d.indexed_at";

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
    let indexed_at: Option<String> = row.get(9)?;
    Ok(Detection {
        id: row.get(0)?,
        image_id: row.get(1)?,
        class_id: row.get(2)?,
        class_name: row.get(3)?,
        confidence: row.get(4)?,
        bbox: BoundingBox::new(row.get(5)?, row.get(6)?, row.get(7)?, row.get(8)?),
        indexed_at: indexed_at.as_deref().and_then(parse_timestamp),
    })
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Insert one detection, clamping its box into `bounds`.
pub(crate) fn insert_detection(
    conn: &Connection,
    image_id: i64,
    bounds: Dimensions,
    detection: &NewDetection,
) -> Result<i64> {
    let bbox = detection.bbox.clamp_to(bounds);
    let confidence = if detection.confidence.is_finite() {
        detection.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    conn.execute(
        r#"
        INSERT INTO detections (image_id, class_id, class_name, confidence, x1, y1, x2, y2)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            image_id,
            detection.class_id,
            detection.class_name,
            confidence,
            bbox.x1,
            bbox.y1,
            bbox.x2,
            bbox.y2,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub fn get_detection(&self, detection_id: i64) -> Result<Option<Detection>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM detections d WHERE d.id = ?", DETECTION_COLUMNS),
            [detection_id],
            detection_from_row,
        ))
    }

    pub fn detections_for_image(&self, image_id: i64) -> Result<Vec<Detection>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM detections d WHERE d.image_id = ? ORDER BY d.id",
            DETECTION_COLUMNS
        ))?;
        let detections = stmt
            .query_map([image_id], detection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(detections)
    }

    /// Every detection of an image with its stored vector, in id order.
    pub fn detection_states(&self, image_id: i64) -> Result<Vec<DetectionState>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {}, s.feature_vector
            FROM detections d
            LEFT JOIN descriptors s ON s.detection_id = d.id
            WHERE d.image_id = ?
            ORDER BY d.id
            "#,
            DETECTION_COLUMNS
        ))?;
        let states = stmt
            .query_map([image_id], |row| {
                let vector: Option<Vec<u8>> = row.get(10)?;
                Ok(DetectionState {
                    detection: detection_from_row(row)?,
                    has_descriptor: vector.is_some(),
                    feature_vector: vector.as_deref().map(bytes_to_vector).unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(states)
    }

    /// Ids of images that still have detections outside the index.
    pub fn images_with_unindexed_detections(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT image_id FROM detections WHERE indexed_at IS NULL ORDER BY image_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Set `indexed_at` on the given detections that do not have it yet.
    ///
    /// The update is conditional on `indexed_at IS NULL`, so a timestamp is
    /// written at most once per detection even if two runs race. Returns the
    /// number of detections that transitioned.
    pub fn mark_indexed(&self, detection_ids: &[i64]) -> Result<usize> {
        if detection_ids.is_empty() {
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        let updated = {
            let sql = format!(
                "UPDATE detections SET indexed_at = ? WHERE indexed_at IS NULL AND id IN ({})",
                placeholders(detection_ids.len())
            );
            let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(detection_ids.len() + 1);
            values.push(now.into());
            values.extend(detection_ids.iter().map(|&id| id.into()));
            tx.execute(&sql, params_from_iter(values))?
        };
        tx.commit()?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{memory_db, new_detection, new_image};
    use super::*;
    use crate::db::DescriptorSet;

    #[test]
    fn test_boxes_are_clamped_on_insert() {
        let db = memory_db();
        let image_id = db
            .insert_image(
                &new_image("a.jpg", 100, 50),
                &[new_detection(1, [-20.0, 10.0, 140.0, 70.0])],
            )
            .unwrap();

        let det = &db.detections_for_image(image_id).unwrap()[0];
        assert_eq!(det.bbox, BoundingBox::new(0.0, 10.0, 100.0, 50.0));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let db = memory_db();
        let mut high = new_detection(1, [0.0, 0.0, 1.0, 1.0]);
        high.confidence = 1.7;
        let image_id = db.insert_image(&new_image("a.jpg", 10, 10), &[high]).unwrap();

        assert_eq!(db.detections_for_image(image_id).unwrap()[0].confidence, 1.0);
    }

    #[test]
    fn test_detection_states() {
        let db = memory_db();
        let image_id = db
            .insert_image(
                &new_image("a.jpg", 100, 100),
                &[
                    new_detection(1, [0.0, 0.0, 10.0, 10.0]),
                    new_detection(1, [10.0, 10.0, 20.0, 20.0]),
                    new_detection(2, [20.0, 20.0, 30.0, 30.0]),
                ],
            )
            .unwrap();
        let ids: Vec<i64> = db
            .detections_for_image(image_id)
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();

        db.upsert_descriptor(ids[0], &DescriptorSet::with_vector(vec![0.5, 0.5]))
            .unwrap();
        db.upsert_descriptor(ids[1], &DescriptorSet::default()).unwrap();
        db.mark_indexed(&[ids[0]]).unwrap();

        let states = db.detection_states(image_id).unwrap();
        assert_eq!(states.len(), 3);
        assert!(states[0].is_fully_processed());
        assert_eq!(states[0].feature_vector, vec![0.5, 0.5]);
        assert!(states[1].has_descriptor);
        assert!(!states[1].is_index_ready());
        assert!(!states[2].has_descriptor);
    }

    #[test]
    fn test_mark_indexed_sets_timestamp_once() {
        let db = memory_db();
        let image_id = db
            .insert_image(
                &new_image("a.jpg", 100, 100),
                &[
                    new_detection(1, [0.0, 0.0, 10.0, 10.0]),
                    new_detection(1, [10.0, 10.0, 20.0, 20.0]),
                ],
            )
            .unwrap();
        let dets = db.detections_for_image(image_id).unwrap();

        assert_eq!(db.mark_indexed(&[dets[0].id]).unwrap(), 1);
        let first = db.get_detection(dets[0].id).unwrap().unwrap().indexed_at;
        assert!(first.is_some());

        // Only the second detection transitions; the first keeps its timestamp.
        assert_eq!(db.mark_indexed(&[dets[0].id, dets[1].id]).unwrap(), 1);
        assert_eq!(db.get_detection(dets[0].id).unwrap().unwrap().indexed_at, first);
        assert_eq!(db.mark_indexed(&[]).unwrap(), 0);
    }

    #[test]
    fn test_images_with_unindexed_detections() {
        let db = memory_db();
        let a = db
            .insert_image(&new_image("a.jpg", 10, 10), &[new_detection(1, [0.0, 0.0, 1.0, 1.0])])
            .unwrap();
        let b = db
            .insert_image(&new_image("b.jpg", 10, 10), &[new_detection(1, [0.0, 0.0, 1.0, 1.0])])
            .unwrap();
        db.insert_image(&new_image("c.jpg", 10, 10), &[]).unwrap();

        let det_a = db.detections_for_image(a).unwrap()[0].id;
        db.mark_indexed(&[det_a]).unwrap();

        assert_eq!(db.images_with_unindexed_detections().unwrap(), vec![b]);
    }
}
