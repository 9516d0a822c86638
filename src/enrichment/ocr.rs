use std::path::Path;

use image::DynamicImage;
use ocrs::{ImageSource, OcrEngine, OcrEngineParams};
use rten::Model;
use tracing::info;

use crate::collaborator::Recognizer;
use crate::config::OcrConfig;
use crate::error::{CollaboratorError, PipelineError, Result};
use crate::preprocessing;

/// Text recognizer running the `ocrs` detection + recognition models.
pub struct OcrsRecognizer {
    engine: OcrEngine,
}

impl OcrsRecognizer {
    /// Load the models named by `config` (or the `ocrs` cache defaults).
    pub fn from_config(config: &OcrConfig) -> Result<Self> {
        let (detection, recognition) = config.model_paths()?;
        Self::load(&detection, &recognition)
    }

    pub fn load(detection_model_path: &Path, recognition_model_path: &Path) -> Result<Self> {
        if !detection_model_path.exists() || !recognition_model_path.exists() {
            return Err(PipelineError::NotFound(format!(
                "OCR models not found. Please run: ocrs-cli --help (or download models manually)\n\
                 Expected locations:\n  - {}\n  - {}",
                detection_model_path.display(),
                recognition_model_path.display()
            )));
        }

        let detection_model = Model::load_file(detection_model_path)
            .map_err(|e| PipelineError::storage(format!("loading {}", detection_model_path.display()), e))?;
        let recognition_model = Model::load_file(recognition_model_path)
            .map_err(|e| PipelineError::storage(format!("loading {}", recognition_model_path.display()), e))?;

        let engine = OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .map_err(|e| PipelineError::processing("initialising OCR engine", e))?;

        info!("OCR engine initialized");
        Ok(Self { engine })
    }
}

impl Recognizer for OcrsRecognizer {
    fn recognize(&self, image: &DynamicImage) -> std::result::Result<String, CollaboratorError> {
        let binary = preprocessing::binarize_for_ocr(image);
        let img = DynamicImage::ImageLuma8(binary).to_rgb8();

        let source = ImageSource::from_bytes(img.as_raw(), img.dimensions())
            .map_err(|e| CollaboratorError::InvalidInput(e.to_string()))?;
        let input = self
            .engine
            .prepare_input(source)
            .map_err(|e| CollaboratorError::InvalidInput(e.to_string()))?;
        let text = self
            .engine
            .get_text(&input)
            .map_err(|e| CollaboratorError::Inference(e.to_string()))?;

        Ok(text.trim().to_string())
    }

    fn name(&self) -> &str {
        "ocrs"
    }
}
