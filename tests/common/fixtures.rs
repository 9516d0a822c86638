use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageBuffer, Rgb};
use segscribe::config::DetectionConfig;
use segscribe::{
    Captioner, CollaboratorError, DetectionStage, EnrichmentStage, LabelVocabulary, PrecomputedDetector,
    RawDetections, Recognizer, Session,
};
use tempfile::TempDir;

/// Collaborator timeout used by every test stage.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes a `width`x`height` gradient PNG named `name` into a fresh temp dir.
/// Returns the directory (keep alive) and the image path.
pub fn create_test_image(name: &str, width: u32, height: u32) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128u8])
    });
    let path = dir.path().join(name);
    img.save_with_format(&path, image::ImageFormat::Png)
        .expect("Failed to save test image");
    (dir, path)
}

/// Opens an empty session in a temp data directory.
pub async fn create_test_session() -> (Session, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let session = Session::open(dir.path().join("data"), LabelVocabulary::coco())
        .await
        .expect("Failed to open test session");
    (session, dir)
}

/// Session with an 800x600 `scene.png` already uploaded.
pub async fn create_session_with_image() -> (Session, TempDir) {
    let (mut session, dir) = create_test_session().await;
    let (_img_dir, path) = create_test_image("scene.png", 800, 600);
    session.upload(&path).await.expect("Failed to upload test image");
    (session, dir)
}

/// Detector output with one box per entry: `(score, [ymin, xmin, ymax, xmax], class)`.
pub fn raw_detections(entries: &[(f32, [f32; 4], u32)]) -> RawDetections {
    RawDetections {
        scores: entries.iter().map(|e| e.0).collect(),
        boxes: entries.iter().map(|e| e.1).collect(),
        classes: entries.iter().map(|e| e.2 as f32).collect(),
    }
}

/// Detection stage replaying `raw` with the default 0.5 threshold.
pub fn detection_stage(raw: RawDetections) -> DetectionStage {
    let config = DetectionConfig {
        input_size: 64,
        ..DetectionConfig::default()
    };
    DetectionStage::new(Arc::new(PrecomputedDetector::new(raw)), &config)
}

/// The car scenario: one confident class-3 box and one below threshold.
pub fn car_scenario() -> RawDetections {
    raw_detections(&[
        (0.9, [0.1, 0.2, 0.5, 0.6], 3),
        (0.3, [0.0, 0.0, 1.0, 1.0], 1),
    ])
}

/// Recognizer returning the crop size as text, so results are per-segment.
pub struct SizeRecognizer;

impl Recognizer for SizeRecognizer {
    fn recognize(&self, image: &DynamicImage) -> Result<String, CollaboratorError> {
        Ok(format!("{}x{}", image.width(), image.height()))
    }

    fn name(&self) -> &str {
        "size"
    }
}

pub struct FixedCaptioner(pub &'static str);

impl Captioner for FixedCaptioner {
    fn caption(&self, _image: &DynamicImage) -> Result<String, CollaboratorError> {
        Ok(self.0.to_string())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

pub struct FailingCaptioner;

impl Captioner for FailingCaptioner {
    fn caption(&self, _image: &DynamicImage) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("captioning service down".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Captioner that never answers within [`TEST_TIMEOUT`].
pub struct StalledCaptioner;

impl Captioner for StalledCaptioner {
    fn caption(&self, _image: &DynamicImage) -> Result<String, CollaboratorError> {
        std::thread::sleep(Duration::from_millis(500));
        Ok("too late".to_string())
    }

    fn name(&self) -> &str {
        "stalled"
    }
}

pub fn text_stage() -> EnrichmentStage {
    EnrichmentStage::text(Arc::new(SizeRecognizer), TEST_TIMEOUT)
}

pub fn caption_stage(captioner: impl Captioner + 'static) -> EnrichmentStage {
    EnrichmentStage::caption(Arc::new(captioner), TEST_TIMEOUT)
}
