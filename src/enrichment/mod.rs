pub mod caption;
pub mod ocr;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::collaborator::{Captioner, Recognizer, call_with_timeout};
use crate::error::{PipelineError, Result};
use crate::models::{RunId, SegmentId};
use crate::store::ArtifactStore;

pub use caption::HttpCaptioner;
pub use ocr::OcrsRecognizer;

/// Which per-segment analysis a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    TextExtraction,
    Captioning,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::TextExtraction => "text",
            StageKind::Captioning => "caption",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            StageKind::TextExtraction => "Text Extraction",
            StageKind::Captioning => "Image Summarization",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(StageKind::TextExtraction),
            "caption" => Ok(StageKind::Captioning),
            other => Err(PipelineError::Validation(format!("unknown enrichment stage {other:?}"))),
        }
    }
}

/// State of one enrichment for one segment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Enrichment {
    /// Not processed yet.
    #[default]
    Pending,
    /// Processing was attempted and the collaborator failed.
    Failed(String),
    Done(String),
}

impl Enrichment {
    pub fn value(&self) -> Option<&str> {
        match self {
            Enrichment::Done(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Enrichment::Done(_))
    }
}

/// Partial mapping from segment to enrichment state for one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentResults {
    entries: BTreeMap<SegmentId, Enrichment>,
}

impl EnrichmentResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `id`; segments never processed are `Pending`.
    pub fn get(&self, id: &SegmentId) -> Enrichment {
        self.entries.get(id).cloned().unwrap_or_default()
    }

    /// Insert or replace the state for `id`.
    pub fn record(&mut self, id: SegmentId, state: Enrichment) {
        if state == Enrichment::Pending {
            self.entries.remove(&id);
        } else {
            self.entries.insert(id, state);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SegmentId, &Enrichment)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl FromIterator<(SegmentId, Enrichment)> for EnrichmentResults {
    fn from_iter<I: IntoIterator<Item = (SegmentId, Enrichment)>>(iter: I) -> Self {
        let mut results = EnrichmentResults::new();
        for (id, state) in iter {
            results.record(id, state);
        }
        results
    }
}

/// Record `value` for `id`, replacing any earlier result.
pub fn record_result(results: &mut EnrichmentResults, id: SegmentId, value: String) {
    results.record(id, Enrichment::Done(value));
}

enum Analyzer {
    Text(Arc<dyn Recognizer>),
    Caption(Arc<dyn Captioner>),
}

/// One per-segment analysis backed by a collaborator.
pub struct EnrichmentStage {
    analyzer: Analyzer,
    timeout: Duration,
}

impl EnrichmentStage {
    pub fn text(recognizer: Arc<dyn Recognizer>, timeout: Duration) -> Self {
        Self {
            analyzer: Analyzer::Text(recognizer),
            timeout,
        }
    }

    pub fn caption(captioner: Arc<dyn Captioner>, timeout: Duration) -> Self {
        Self {
            analyzer: Analyzer::Caption(captioner),
            timeout,
        }
    }

    pub fn kind(&self) -> StageKind {
        match self.analyzer {
            Analyzer::Text(_) => StageKind::TextExtraction,
            Analyzer::Caption(_) => StageKind::Captioning,
        }
    }

    pub fn collaborator_name(&self) -> &str {
        match &self.analyzer {
            Analyzer::Text(r) => r.name(),
            Analyzer::Caption(c) => c.name(),
        }
    }

    /// Compute this stage's result for one segment. Reads the store, never writes it.
    pub async fn process(&self, store: &ArtifactStore, run: &RunId, id: &SegmentId) -> Result<String> {
        let image = store.read_segment(run, id).await?;
        let context = format!("{} of segment {} via {}", self.kind(), id, self.collaborator_name());

        let outcome = match &self.analyzer {
            Analyzer::Text(recognizer) => {
                let recognizer = recognizer.clone();
                call_with_timeout(context, self.timeout, move || recognizer.recognize(&image)).await
            }
            Analyzer::Caption(captioner) => {
                let captioner = captioner.clone();
                call_with_timeout(context, self.timeout, move || captioner.caption(&image)).await
            }
        };

        match &outcome {
            Ok(value) => info!("{} for {}: {} chars", self.kind().title(), id, value.chars().count()),
            Err(e) => warn!("{} for {} failed: {}", self.kind().title(), id, e),
        }
        outcome
    }
}
