//! Bounding boxes and the logical-to-actual coordinate mapping.
//!
//! Detections are stored in the *logical* space of their image: the
//! width/height the detection service reported at ingestion. The raster on
//! disk may decode to a different size (re-encoded upload, client-side
//! resize), so every crop goes through [`map_to_raster`] which rescales each
//! axis independently and then clamps the result into the decoded raster.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Width/height pair in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Axis-aligned box in `(x1, y1, x2, y2)` form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_xyxy(xyxy: [f64; 4]) -> Self {
        Self::new(xyxy[0], xyxy[1], xyxy[2], xyxy[3])
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// Clamp every coordinate into `[0, width] x [0, height]`.
    ///
    /// Corners are ordered first so the result always satisfies
    /// `0 <= x1 <= x2 <= width` and `0 <= y1 <= y2 <= height`.
    /// Non-finite coordinates collapse to 0.
    pub fn clamp_to(&self, bounds: Dimensions) -> Self {
        let w = bounds.width as f64;
        let h = bounds.height as f64;
        let fix = |v: f64, max: f64| if v.is_finite() { v.clamp(0.0, max) } else { 0.0 };

        let (x1, x2) = ordered(fix(self.x1, w), fix(self.x2, w));
        let (y1, y2) = ordered(fix(self.y1, h), fix(self.y2, h));
        Self { x1, y1, x2, y2 }
    }
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Integer pixel rectangle inside a decoded raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Project a box stored in `logical` space onto a raster of size `actual`.
///
/// The returned region always lies inside the raster and is at least 1x1,
/// even when rounding drifts past the right or bottom edge.
pub fn map_to_raster(
    bbox: &BoundingBox,
    logical: Dimensions,
    actual: Dimensions,
) -> Result<PixelRegion> {
    if logical.is_empty() {
        return Err(Error::GeometryInvalid(format!(
            "logical dimensions {}x{} have no area",
            logical.width, logical.height
        )));
    }
    if actual.is_empty() {
        return Err(Error::GeometryInvalid(format!(
            "raster dimensions {}x{} have no area",
            actual.width, actual.height
        )));
    }

    let clamped = bbox.clamp_to(logical);

    // Size is measured in logical space before scaling, floored at one pixel.
    let bw = clamped.width().round().max(1.0);
    let bh = clamped.height().round().max(1.0);

    let lw = logical.width as f64;
    let lh = logical.height as f64;
    let fw = actual.width as f64;
    let fh = actual.height as f64;

    let sx = (clamped.x1 / lw * fw).round();
    let sy = (clamped.y1 / lh * fh).round();
    let sw = (bw / lw * fw).round();
    let sh = (bh / lh * fh).round();

    let x = sx.clamp(0.0, fw - 1.0) as u32;
    let y = sy.clamp(0.0, fh - 1.0) as u32;
    let width = (sw as u32).min(actual.width - x).max(1);
    let height = (sh as u32).min(actual.height - y).max(1);

    Ok(PixelRegion {
        x,
        y,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_keeps_box_inside_bounds() {
        let bounds = Dimensions::new(100, 50);
        let cases = [
            BoundingBox::new(-10.0, -5.0, 40.0, 20.0),
            BoundingBox::new(90.0, 40.0, 150.0, 80.0),
            BoundingBox::new(200.0, 200.0, 300.0, 300.0),
            BoundingBox::new(-50.0, -50.0, -10.0, -10.0),
            BoundingBox::new(60.0, 30.0, 20.0, 10.0),
            BoundingBox::new(f64::NAN, 10.0, f64::INFINITY, 20.0),
        ];

        for bbox in cases {
            let c = bbox.clamp_to(bounds);
            assert!(0.0 <= c.x1 && c.x1 <= c.x2 && c.x2 <= 100.0, "{:?}", c);
            assert!(0.0 <= c.y1 && c.y1 <= c.y2 && c.y2 <= 50.0, "{:?}", c);
        }
    }

    #[test]
    fn test_degenerate_box_still_yields_one_pixel() {
        let logical = Dimensions::new(100, 100);
        let bbox = BoundingBox::new(500.0, 500.0, 600.0, 600.0);
        let region = map_to_raster(&bbox, logical, logical).unwrap();
        assert!(region.width >= 1 && region.height >= 1);
        assert_eq!(region.x, 99);
        assert_eq!(region.y, 99);
        assert_eq!((region.width, region.height), (1, 1));
    }

    #[test]
    fn test_downscaled_raster_scenario() {
        let bbox = BoundingBox::new(100.0, 100.0, 300.0, 300.0);
        let region = map_to_raster(
            &bbox,
            Dimensions::new(1000, 800),
            Dimensions::new(500, 400),
        )
        .unwrap();

        // y: 100/800*400 = 50, height: 200/800*400 = 100
        assert_eq!(
            region,
            PixelRegion {
                x: 50,
                y: 50,
                width: 100,
                height: 100
            }
        );
    }

    #[test]
    fn test_uniform_scale_preserves_relative_size() {
        let logical = Dimensions::new(640, 480);
        let bbox = BoundingBox::new(33.0, 17.0, 301.0, 222.0);

        for k in [0.5_f64, 1.0, 2.0, 3.0] {
            let actual = Dimensions::new(
                (640.0 * k).round() as u32,
                (480.0 * k).round() as u32,
            );
            let region = map_to_raster(&bbox, logical, actual).unwrap();
            let back_w = region.width as f64 / k;
            let back_h = region.height as f64 / k;
            assert!((back_w - bbox.width()).abs() <= 1.0 / k + 1e-9, "k={} w={}", k, back_w);
            assert!((back_h - bbox.height()).abs() <= 1.0 / k + 1e-9, "k={} h={}", k, back_h);
        }
    }

    #[test]
    fn test_axes_scale_independently() {
        // Logical 100x100, file squashed to 200x50.
        let bbox = BoundingBox::new(10.0, 10.0, 60.0, 60.0);
        let region = map_to_raster(
            &bbox,
            Dimensions::new(100, 100),
            Dimensions::new(200, 50),
        )
        .unwrap();
        assert_eq!(
            region,
            PixelRegion {
                x: 20,
                y: 5,
                width: 100,
                height: 25
            }
        );
    }

    #[test]
    fn test_rounding_drift_is_clamped_at_edges() {
        let bbox = BoundingBox::new(0.0, 0.0, 3.0, 3.0);
        let region = map_to_raster(&bbox, Dimensions::new(3, 3), Dimensions::new(10, 10)).unwrap();
        assert_eq!(region.x + region.width, 10);
        assert_eq!(region.y + region.height, 10);
    }

    #[test]
    fn test_empty_dimensions_rejected() {
        let bbox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(matches!(
            map_to_raster(&bbox, Dimensions::new(0, 10), Dimensions::new(10, 10)),
            Err(Error::GeometryInvalid(_))
        ));
        assert!(matches!(
            map_to_raster(&bbox, Dimensions::new(10, 10), Dimensions::new(10, 0)),
            Err(Error::GeometryInvalid(_))
        ));
    }
}
