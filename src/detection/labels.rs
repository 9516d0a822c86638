use std::path::Path;

use crate::error::{PipelineError, Result};

const COCO_LABELS: &str = include_str!("../../assets/coco_labels.txt");

/// Ordered class names; detector class `c` names entry `c - 1`.
#[derive(Debug, Clone)]
pub struct LabelVocabulary {
    names: Vec<String>,
}

impl LabelVocabulary {
    /// The 90-entry COCO label map used by TF object-detection models.
    pub fn coco() -> Self {
        Self::parse(COCO_LABELS)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::storage(format!("reading labels {}", path.display()), e))?;
        let vocab = Self::parse(&content);
        if vocab.names.iter().all(String::is_empty) {
            return Err(PipelineError::Validation(format!(
                "label file {} is empty",
                path.display()
            )));
        }
        Ok(vocab)
    }

    /// Load `path` when given, the built-in COCO list otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::coco()),
        }
    }

    /// One entry per line; blank lines are placeholders and keep their index.
    fn parse(content: &str) -> Self {
        let mut names: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
        if names.last().is_some_and(String::is_empty) {
            names.pop();
        }
        Self { names }
    }

    /// Name for a 1-based detector class; placeholders and out-of-range classes have none.
    pub fn name(&self, class_label: u32) -> Option<&str> {
        let index = (class_label as usize).checked_sub(1)?;
        self.names
            .get(index)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
