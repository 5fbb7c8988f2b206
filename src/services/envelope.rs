//! Strict parsing of the CV service's response envelope.
//!
//! Every response is `{"success": bool, "message"?: str, ...payload}`. A
//! non-success envelope is an upstream failure; a success envelope whose
//! payload does not match the expected shape is a validation failure. There
//! is no fallback between alternative key names.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{DetectedObject, DetectionResult, Neighbor};
use crate::db::DescriptorSet;
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Dimensions};

#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

/// Parse `body` as an envelope and decode its payload as `T`.
pub fn parse<T: DeserializeOwned>(service: &'static str, body: &str) -> Result<T> {
    let envelope: Envelope = serde_json::from_str(body).map_err(|e| {
        Error::ValidationFailure(format!("{} service returned malformed JSON: {}", service, e))
    })?;

    if !envelope.success {
        return Err(Error::upstream(
            service,
            envelope
                .message
                .unwrap_or_else(|| "request reported failure".to_string()),
        ));
    }

    serde_json::from_value(serde_json::Value::Object(envelope.payload)).map_err(|e| {
        Error::ValidationFailure(format!("{} service response has unexpected shape: {}", service, e))
    })
}

/// The `message` of an error envelope, if the body is one.
pub fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<Envelope>(body)
        .ok()
        .and_then(|e| e.message)
}

#[derive(Debug, Deserialize)]
pub(crate) struct DetectPayload {
    image: WireSize,
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireSize {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    class_id: i64,
    class_name: String,
    confidence: f64,
    bbox_xyxy: [f64; 4],
}

impl From<DetectPayload> for DetectionResult {
    fn from(payload: DetectPayload) -> Self {
        DetectionResult {
            dimensions: Dimensions::new(payload.image.width, payload.image.height),
            objects: payload
                .detections
                .into_iter()
                .map(|d| DetectedObject {
                    class_id: d.class_id,
                    class_name: d.class_name,
                    confidence: d.confidence,
                    bbox: BoundingBox::from_xyxy(d.bbox_xyxy),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DescribePayload {
    descriptors: WireDescriptors,
}

/// Feature blocks as named by the service. Absent blocks are empty.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireDescriptors {
    color_hist_hsv: Vec<f32>,
    dominant_colors_lab: Vec<f32>,
    gabor: Vec<f32>,
    tamura: Vec<f32>,
    hu_moments: Vec<f32>,
    orientation_hist: Vec<f32>,
    lbp_hist: Vec<f32>,
    feature_vector: Vec<f32>,
}

impl From<DescribePayload> for DescriptorSet {
    fn from(payload: DescribePayload) -> Self {
        let d = payload.descriptors;
        let mut extra = BTreeMap::new();
        extra.insert("lbp_hist".to_string(), d.lbp_hist);

        DescriptorSet {
            color_hist: d.color_hist_hsv,
            dominant_colors: d.dominant_colors_lab,
            gabor: d.gabor,
            tamura: d.tamura,
            hu_moments: d.hu_moments,
            orientation_hist: d.orientation_hist,
            extra,
            feature_vector: d.feature_vector,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchPayload {
    pub(crate) results: Vec<Neighbor>,
}

/// Payload-less success, e.g. from `/index/add`.
#[derive(Debug, Deserialize)]
pub(crate) struct Ack {}
