//! Pipeline configuration
//!
//! Settings are stored in TOML; every field has a default so a partial file works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default Hugging Face inference endpoint for image captioning.
pub const DEFAULT_CAPTION_ENDPOINT: &str =
    "https://api-inference.huggingface.co/models/Salesforce/blip-image-captioning-large";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the artifact store and session database
    pub data_dir: PathBuf,
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    pub caption: CaptionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            detection: DetectionConfig::default(),
            ocr: OcrConfig::default(),
            caption: CaptionConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let t = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(PipelineError::Validation(format!(
                "confidence threshold must be within [0, 1], got {t}"
            )));
        }
        if self.detection.input_size == 0 {
            return Err(PipelineError::Validation(
                "detector input size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Detections must score strictly above this to become segments
    pub confidence_threshold: f32,
    /// Square resolution the detector expects
    pub input_size: u32,
    /// Label vocabulary file, one class name per line (built-in COCO list otherwise)
    pub labels_path: Option<PathBuf>,
    /// TF-Serving style REST predict endpoint
    pub serving_url: Option<String>,
    /// Send channel values as 0..255 instead of 0..1
    pub byte_input: bool,
    pub timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            input_size: 640,
            labels_path: None,
            serving_url: None,
            byte_input: true,
            timeout_secs: 120,
        }
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub detection_model: Option<PathBuf>,
    pub recognition_model: Option<PathBuf>,
    pub timeout_secs: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            detection_model: None,
            recognition_model: None,
            timeout_secs: 60,
        }
    }
}

impl OcrConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolve both model paths, falling back to the per-user `ocrs` cache.
    pub fn model_paths(&self) -> Result<(PathBuf, PathBuf)> {
        let cache = || -> Result<PathBuf> {
            directories::BaseDirs::new()
                .map(|dirs| dirs.cache_dir().join("ocrs"))
                .ok_or_else(|| PipelineError::NotFound("could not determine cache directory".to_string()))
        };
        let detection = match &self.detection_model {
            Some(path) => path.clone(),
            None => cache()?.join("text-detection.rten"),
        };
        let recognition = match &self.recognition_model {
            Some(path) => path.clone(),
            None => cache()?.join("text-recognition.rten"),
        };
        Ok((detection, recognition))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub endpoint: String,
    /// Environment variable holding the bearer token
    pub token_env: String,
    pub timeout_secs: u64,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CAPTION_ENDPOINT.to_string(),
            token_env: "HF_TOKEN".to_string(),
            timeout_secs: 60,
        }
    }
}

impl CaptionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
