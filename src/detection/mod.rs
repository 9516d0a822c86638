pub mod labels;
pub mod serving;

use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use tracing::{debug, info};

use crate::collaborator::{Detector, call_with_timeout};
use crate::config::DetectionConfig;
use crate::error::{PipelineError, Result};
use crate::models::{Detection, RunId, SegmentId};
use crate::preprocessing;
use crate::store::ArtifactStore;

pub use labels::LabelVocabulary;
pub use serving::{PrecomputedDetector, ServingDetector};

/// Turns one uploaded image into zero or more stored segments.
pub struct DetectionStage {
    detector: Arc<dyn Detector>,
    pub input_size: u32,
    pub threshold: f32,
    pub timeout: Duration,
}

impl DetectionStage {
    pub fn new(detector: Arc<dyn Detector>, config: &DetectionConfig) -> Self {
        Self {
            detector,
            input_size: config.input_size,
            threshold: config.confidence_threshold,
            timeout: config.timeout(),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::Validation(format!(
                "confidence threshold must be within [0, 1], got {threshold}"
            )));
        }
        self.threshold = threshold;
        Ok(self)
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Preprocess the image and return the detector's raw, unfiltered candidates.
    pub async fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let detector = self.detector.clone();
        let image = image.clone();
        let size = self.input_size;
        let context = format!("detector {}", self.detector.name());

        let detections = call_with_timeout(context, self.timeout, move || {
            let input = preprocessing::detector_input(&image, size);
            detector.detect(&input)?.into_detections()
        })
        .await?;

        info!("Detector {} proposed {} candidates", self.detector.name(), detections.len());
        Ok(detections)
    }

    /// Detect, filter by the stage threshold and store the survivors under `run`.
    pub async fn run(
        &self,
        store: &ArtifactStore,
        run: &RunId,
        image: &DynamicImage,
    ) -> Result<Vec<(SegmentId, Detection)>> {
        let candidates = self.detect(image).await?;
        let kept = filter_by_confidence(&candidates, self.threshold);
        info!(
            "{} of {} detections scored above {}",
            kept.len(),
            candidates.len(),
            self.threshold
        );
        let ids = materialize(store, run, image, &kept).await?;
        Ok(ids.into_iter().zip(kept).collect())
    }
}

/// Keep detections scoring strictly above `threshold`, preserving input order.
pub fn filter_by_confidence(detections: &[Detection], threshold: f32) -> Vec<Detection> {
    detections
        .iter()
        .filter(|d| d.score > threshold)
        .cloned()
        .collect()
}

/// Crop each detection out of `image` and store it, ordinal = position in `detections`.
///
/// Stops at the first failed write; crops already written stay on disk.
pub async fn materialize(
    store: &ArtifactStore,
    run: &RunId,
    image: &DynamicImage,
    detections: &[Detection],
) -> Result<Vec<SegmentId>> {
    let (width, height) = (image.width(), image.height());
    let mut segments = Vec::with_capacity(detections.len());

    for (ordinal, detection) in detections.iter().enumerate() {
        let px = detection.bbox.to_pixels(width, height);
        debug!(
            "Segment {}: class {} score {:.2} at ({}, {})-({}, {})",
            ordinal, detection.class_label, detection.score, px.left, px.top, px.right, px.bottom
        );
        let crop = image.crop_imm(px.left, px.top, px.width(), px.height());
        let id = store
            .write_segment(run, &crop, ordinal as u32, detection.class_label)
            .await?;
        segments.push(id);
    }

    Ok(segments)
}
