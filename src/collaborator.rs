//! Interfaces to the external model collaborators.
//!
//! All three are synchronous and potentially slow; stages never call them directly
//! but go through [`call_with_timeout`], which runs the call on the blocking pool
//! and bounds how long the caller waits.

use std::time::Duration;

use image::DynamicImage;
use ndarray::Array3;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CollaboratorError, PipelineError};
use crate::models::{BoundingBox, Detection};

/// Preprocessed detector input: `(height, width, 3)` RGB values in [0, 1].
pub type DetectorInput = Array3<f32>;

/// Raw detector output as three parallel sequences.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDetections {
    #[serde(rename = "detection_scores")]
    pub scores: Vec<f32>,
    #[serde(rename = "detection_boxes")]
    pub boxes: Vec<[f32; 4]>,
    #[serde(rename = "detection_classes")]
    pub classes: Vec<f32>,
}

impl RawDetections {
    /// Zip the parallel sequences into detections, rejecting malformed output.
    pub fn into_detections(self) -> Result<Vec<Detection>, CollaboratorError> {
        let n = self.scores.len();
        if self.boxes.len() != n || self.classes.len() != n {
            return Err(CollaboratorError::Inference(format!(
                "mismatched output lengths: {} scores, {} boxes, {} classes",
                n,
                self.boxes.len(),
                self.classes.len()
            )));
        }

        self.scores
            .into_iter()
            .zip(self.boxes)
            .zip(self.classes)
            .map(|((score, bbox), class)| {
                let class = class.round();
                if !class.is_finite() || class < 1.0 {
                    return Err(CollaboratorError::Inference(format!(
                        "class index {class} outside the 1-based vocabulary"
                    )));
                }
                if !score.is_finite() {
                    return Err(CollaboratorError::Inference("non-finite score".to_string()));
                }
                Ok(Detection {
                    bbox: BoundingBox::from_detector(bbox),
                    class_label: class as u32,
                    score: score.clamp(0.0, 1.0),
                })
            })
            .collect()
    }
}

/// Proposes objects in a preprocessed image.
pub trait Detector: Send + Sync {
    fn detect(&self, input: &DetectorInput) -> Result<RawDetections, CollaboratorError>;

    fn name(&self) -> &str;
}

/// Extracts visible text from a crop.
pub trait Recognizer: Send + Sync {
    fn recognize(&self, image: &DynamicImage) -> Result<String, CollaboratorError>;

    fn name(&self) -> &str;
}

/// Describes a crop in natural language.
pub trait Captioner: Send + Sync {
    fn caption(&self, image: &DynamicImage) -> Result<String, CollaboratorError>;

    fn name(&self) -> &str;
}

/// Run a blocking collaborator call with an upper bound on the wait.
///
/// On timeout the caller gets a `Processing` error immediately; the blocking task
/// is abandoned and its eventual result discarded.
pub async fn call_with_timeout<T, F>(
    context: String,
    timeout: Duration,
    call: F,
) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CollaboratorError> + Send + 'static,
{
    debug!("{}: calling collaborator (timeout {:?})", context, timeout);
    let task = tokio::task::spawn_blocking(call);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(PipelineError::processing(context, err)),
        Ok(Err(join_err)) => Err(PipelineError::processing(
            context,
            format!("collaborator task aborted: {join_err}"),
        )),
        Err(_) => {
            warn!("{}: collaborator timed out after {:?}", context, timeout);
            Err(PipelineError::processing(context, CollaboratorError::Timeout(timeout)))
        }
    }
}
