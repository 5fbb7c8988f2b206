pub const SCHEMA: &str = r#"
-- Images: uploaded rasters and derived (resized/cropped) rasters
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    original_name TEXT NOT NULL,
    path TEXT NOT NULL,               -- blob path relative to storage root
    width INTEGER NOT NULL CHECK (width > 0),    -- logical width at detection time
    height INTEGER NOT NULL CHECK (height > 0),  -- logical height at detection time
    is_generated INTEGER NOT NULL DEFAULT 0,
    parent_image_id INTEGER,         -- source of a derived image; kept as-is if the source goes
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_images_parent ON images(parent_image_id);
CREATE INDEX IF NOT EXISTS idx_images_path ON images(path);

-- Detections: one object box per row, in the owning image's logical space
CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id INTEGER NOT NULL,
    class_id INTEGER NOT NULL,
    class_name TEXT NOT NULL,
    confidence REAL NOT NULL,
    x1 REAL NOT NULL,
    y1 REAL NOT NULL,
    x2 REAL NOT NULL,
    y2 REAL NOT NULL,
    indexed_at TEXT,                  -- set once the vector is confirmed in the similarity index
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (image_id) REFERENCES images(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_detections_image ON detections(image_id);
CREATE INDEX IF NOT EXISTS idx_detections_class ON detections(class_id);

-- Descriptors: feature blocks for one detection
CREATE TABLE IF NOT EXISTS descriptors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    detection_id INTEGER NOT NULL UNIQUE,
    color_hist TEXT NOT NULL,         -- JSON arrays
    dominant_colors TEXT NOT NULL,
    gabor TEXT NOT NULL,
    tamura TEXT NOT NULL,
    hu_moments TEXT NOT NULL,
    orientation_hist TEXT NOT NULL,
    extra TEXT NOT NULL,              -- JSON object of named arrays
    feature_vector BLOB NOT NULL,     -- float32 array stored as bytes
    feature_dim INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (detection_id) REFERENCES detections(id) ON DELETE CASCADE
);
"#;
