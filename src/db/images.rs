//! Image records.

use rusqlite::{params, params_from_iter, Row};
use std::collections::HashMap;

use super::detections::{insert_detection, NewDetection};
use super::{optional, placeholders, Database};
use crate::error::{Error, Result};
use crate::geometry::Dimensions;

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub id: i64,
    pub original_name: String,
    /// Blob path relative to the storage root.
    pub path: String,
    /// Logical width/height: the frame of reference for stored detections.
    pub width: u32,
    pub height: u32,
    pub is_generated: bool,
    pub parent_image_id: Option<i64>,
    pub created_at: String,
}

impl Image {
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub struct NewImage {
    pub original_name: String,
    pub path: String,
    pub dimensions: Dimensions,
    pub is_generated: bool,
    pub parent_image_id: Option<i64>,
}

const IMAGE_COLUMNS: &str =
    "id, original_name, path, width, height, is_generated, parent_image_id, created_at";

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get(0)?,
        original_name: row.get(1)?,
        path: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        is_generated: row.get(5)?,
        parent_image_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Database {
    /// Insert an image together with its detections in one transaction.
    ///
    /// Detection boxes are clamped into the image's logical space and
    /// confidences into `[0, 1]`; nothing is rejected for being out of range.
    pub fn insert_image(&self, image: &NewImage, detections: &[NewDetection]) -> Result<i64> {
        if image.dimensions.is_empty() {
            return Err(Error::ValidationFailure(format!(
                "image {} has empty dimensions {}x{}",
                image.original_name, image.dimensions.width, image.dimensions.height
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r#"
            INSERT INTO images (original_name, path, width, height, is_generated, parent_image_id)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                image.original_name,
                image.path,
                image.dimensions.width,
                image.dimensions.height,
                image.is_generated,
                image.parent_image_id,
            ],
        )?;
        let image_id = tx.last_insert_rowid();

        for detection in detections {
            insert_detection(&tx, image_id, image.dimensions, detection)?;
        }

        tx.commit()?;
        Ok(image_id)
    }

    pub fn get_image(&self, image_id: i64) -> Result<Option<Image>> {
        optional(self.conn.query_row(
            &format!("SELECT {} FROM images WHERE id = ?", IMAGE_COLUMNS),
            [image_id],
            image_from_row,
        ))
    }

    pub fn require_image(&self, image_id: i64) -> Result<Image> {
        self.get_image(image_id)?.ok_or(Error::NotFound {
            entity: "image",
            id: image_id,
        })
    }

    /// Newest first.
    pub fn list_images(&self) -> Result<Vec<Image>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM images ORDER BY id DESC",
            IMAGE_COLUMNS
        ))?;
        let images = stmt
            .query_map([], image_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }

    /// Fetch a set of images in one query, keyed by id. Unknown ids are absent.
    pub fn images_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, Image>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM images WHERE id IN ({})",
            IMAGE_COLUMNS,
            placeholders(ids.len())
        ))?;
        let images = stmt
            .query_map(params_from_iter(ids.iter()), image_from_row)?
            .map(|r| r.map(|image| (image.id, image)))
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(images)
    }

    /// Delete an image record. Detections and descriptors cascade.
    pub fn delete_image(&self, image_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM images WHERE id = ?", [image_id])?;
        Ok(deleted > 0)
    }

    /// Number of image records stored at `path`. Identical uploads share a blob.
    pub fn count_images_at_path(&self, path: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM images WHERE path = ?",
            [path],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_images(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(count)
    }
}
