use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::collaborator::{Detector, DetectorInput, RawDetections};
use crate::error::{CollaboratorError, PipelineError, Result};

/// Detector backed by a TF-Serving style REST `:predict` endpoint.
///
/// The request body is `{"instances": [<H x W x 3 tensor>]}`; the first prediction
/// must carry `detection_scores`, `detection_boxes` and `detection_classes`.
pub struct ServingDetector {
    url: String,
    byte_input: bool,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PredictResponse {
    Predictions { predictions: Vec<RawDetections> },
    Error { error: String },
}

impl ServingDetector {
    pub fn new(url: impl Into<String>, byte_input: bool, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            byte_input,
            timeout,
        }
    }

    fn request_body(&self, input: &DetectorInput) -> serde_json::Value {
        let rows = input.outer_iter();
        if self.byte_input {
            let tensor: Vec<Vec<Vec<u8>>> = rows
                .map(|row| {
                    row.outer_iter()
                        .map(|px| px.iter().map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8).collect())
                        .collect()
                })
                .collect();
            json!({ "instances": [tensor] })
        } else {
            let tensor: Vec<Vec<Vec<f32>>> = rows
                .map(|row| row.outer_iter().map(|px| px.to_vec()).collect())
                .collect();
            json!({ "instances": [tensor] })
        }
    }
}

impl Detector for ServingDetector {
    fn detect(&self, input: &DetectorInput) -> std::result::Result<RawDetections, CollaboratorError> {
        // Runs on the blocking pool.
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;

        debug!("POST {} ({:?} tensor)", self.url, input.shape());
        let response = client.post(&self.url).json(&self.request_body(input)).send()?;
        let status = response.status();
        let body = response.text()?;

        match serde_json::from_str::<PredictResponse>(&body) {
            Ok(PredictResponse::Predictions { mut predictions }) if !predictions.is_empty() => {
                Ok(predictions.swap_remove(0))
            }
            Ok(PredictResponse::Predictions { .. }) => {
                Err(CollaboratorError::Inference("empty predictions list".to_string()))
            }
            Ok(PredictResponse::Error { error }) => Err(CollaboratorError::Inference(error)),
            Err(e) if status.is_success() => Err(CollaboratorError::Inference(format!(
                "unexpected response body: {e}"
            ))),
            Err(_) => Err(CollaboratorError::Unavailable(format!("{} returned {}", self.url, status))),
        }
    }

    fn name(&self) -> &str {
        "tf-serving"
    }
}

/// Detector that replays detections computed elsewhere.
///
/// The file holds the three parallel arrays exactly as a TF object-detection
/// model emits them.
pub struct PrecomputedDetector {
    detections: RawDetections,
}

impl PrecomputedDetector {
    pub fn new(detections: RawDetections) -> Self {
        Self { detections }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::storage(format!("reading detections {}", path.display()), e))?;
        let detections = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Validation(format!("{} is not a detection file: {e}", path.display()))
        })?;
        Ok(Self { detections })
    }
}

impl Detector for PrecomputedDetector {
    fn detect(&self, _input: &DetectorInput) -> std::result::Result<RawDetections, CollaboratorError> {
        Ok(self.detections.clone())
    }

    fn name(&self) -> &str {
        "precomputed"
    }
}
