//! HTTP client for the CV service.
//!
//! Routes: `POST /detect` and `POST /describe` take multipart uploads,
//! `POST /index/add` and `POST /search-similar` take JSON, `GET /health`
//! is a liveness probe. Each call kind uses its own agent so its timeout is
//! bounded independently.

use serde::Serialize;
use std::time::Duration;

use super::envelope::{self, Ack, DescribePayload, DetectPayload, SearchPayload};
use super::multipart::MultipartForm;
use super::{
    DescriptionService, DetectionResult, DetectionService, IndexItem, Neighbor, Raster,
    SimilarityIndex,
};
use crate::config::ServicesConfig;
use crate::db::DescriptorSet;
use crate::error::{Error, Result};
use crate::geometry::BoundingBox;

const DETECTION: &str = "detection";
const DESCRIPTION: &str = "description";
const INDEX: &str = "index";

pub struct HttpCvClient {
    base_url: String,
    detect_agent: ureq::Agent,
    describe_agent: ureq::Agent,
    index_agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct IndexAddRequest<'a> {
    class_id: i64,
    items: &'a [IndexItem],
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    class_id: i64,
    vector: &'a [f32],
    top_k: usize,
}

fn agent(connect: Duration, total: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(connect)
        .timeout(total)
        .build()
}

impl HttpCvClient {
    pub fn from_config(config: &ServicesConfig) -> Self {
        let connect = config.connect_timeout();
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            detect_agent: agent(connect, config.detect_timeout()),
            describe_agent: agent(connect, config.describe_timeout()),
            index_agent: agent(connect, config.index_timeout()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    /// Probe `GET /health`. Any failure is reported as unavailable.
    pub fn health(&self) -> Result<()> {
        let body = read_response(INDEX, self.index_agent.get(&self.url("/health")).call())?;
        envelope::parse::<Ack>(INDEX, &body)?;
        Ok(())
    }
}

/// Turn a ureq outcome into the response body, mapping transport and HTTP
/// errors to `UpstreamUnavailable`.
fn read_response(
    service: &'static str,
    outcome: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<String> {
    match outcome {
        Ok(response) => response
            .into_string()
            .map_err(|e| Error::upstream(service, format!("failed to read response: {}", e))),
        Err(ureq::Error::Status(code, response)) => {
            let detail = response
                .into_string()
                .ok()
                .and_then(|body| envelope::error_message(&body))
                .unwrap_or_else(|| "no error message".to_string());
            Err(Error::upstream(service, format!("HTTP {}: {}", code, detail)))
        }
        Err(ureq::Error::Transport(t)) => Err(Error::upstream(service, t)),
    }
}

impl DetectionService for HttpCvClient {
    fn detect(&self, raster: Raster<'_>) -> Result<DetectionResult> {
        let (content_type, body) = MultipartForm::new()
            .file("image", raster.filename, raster.bytes)
            .finish();

        let outcome = self
            .detect_agent
            .post(&self.url("/detect"))
            .set("Content-Type", &content_type)
            .send_bytes(&body);

        let body = read_response(DETECTION, outcome)?;
        Ok(envelope::parse::<DetectPayload>(DETECTION, &body)?.into())
    }
}

impl DescriptionService for HttpCvClient {
    fn describe(&self, raster: Raster<'_>, bbox: &BoundingBox) -> Result<DescriptorSet> {
        let (content_type, body) = MultipartForm::new()
            .file("image", raster.filename, raster.bytes)
            .text("x1", &bbox.x1.to_string())
            .text("y1", &bbox.y1.to_string())
            .text("x2", &bbox.x2.to_string())
            .text("y2", &bbox.y2.to_string())
            .finish();

        let outcome = self
            .describe_agent
            .post(&self.url("/describe"))
            .set("Content-Type", &content_type)
            .send_bytes(&body);

        let body = read_response(DESCRIPTION, outcome)?;
        Ok(envelope::parse::<DescribePayload>(DESCRIPTION, &body)?.into())
    }
}

impl SimilarityIndex for HttpCvClient {
    fn add(&self, class_id: i64, items: &[IndexItem]) -> Result<()> {
        let outcome = self
            .index_agent
            .post(&self.url("/index/add"))
            .send_json(IndexAddRequest { class_id, items });

        let body = read_response(INDEX, outcome)?;
        envelope::parse::<Ack>(INDEX, &body)?;
        Ok(())
    }

    fn search(&self, class_id: i64, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        let outcome = self
            .index_agent
            .post(&self.url("/search-similar"))
            .send_json(SearchRequest {
                class_id,
                vector,
                top_k,
            });

        let body = read_response(INDEX, outcome)?;
        Ok(envelope::parse::<SearchPayload>(INDEX, &body)?.results)
    }
}
