//! Session orchestration
//!
//! A [`Session`] is the explicit context every pipeline step runs against: it owns
//! the artifact store, the session database and both enrichment mappings for the
//! current detection run. Steps are driven one at a time by the caller.

pub mod db;

use std::fmt;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::Config;
use crate::detection::{DetectionStage, LabelVocabulary};
use crate::enrichment::{Enrichment, EnrichmentResults, EnrichmentStage, StageKind};
use crate::error::{PipelineError, Result};
use crate::models::{RunId, SegmentDetail, SegmentId, UploadedImage};
use crate::report::{self, ReportRecord, documents};
use crate::store::ArtifactStore;

pub use db::{SessionDb, SessionRepository};

const DB_FILE_NAME: &str = "session.db";

/// Where the session stands; derived from persisted state, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Empty,
    Detected,
    Enriching,
    Reported,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Empty => "empty",
            SessionPhase::Detected => "detected",
            SessionPhase::Enriching => "enriching",
            SessionPhase::Reported => "reported",
        };
        f.write_str(name)
    }
}

/// Files produced by [`Session::write_report`].
#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub records: Vec<ReportRecord>,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
}

pub struct Session {
    store: ArtifactStore,
    db: SessionDb,
    labels: LabelVocabulary,
    run: Option<RunId>,
    text: EnrichmentResults,
    captions: EnrichmentResults,
}

impl Session {
    /// Open the session rooted at `data_dir`, restoring the current run's results.
    pub async fn open<P: AsRef<Path>>(data_dir: P, labels: LabelVocabulary) -> Result<Self> {
        let store = ArtifactStore::open(data_dir.as_ref()).await?;
        let db = SessionDb::open(data_dir.as_ref().join(DB_FILE_NAME)).await?;

        let run = db.current_run().await?;
        let (text, captions) = match &run {
            Some(run) => (
                db.load_enrichments(run, StageKind::TextExtraction).await?,
                db.load_enrichments(run, StageKind::Captioning).await?,
            ),
            None => Default::default(),
        };

        Ok(Self {
            store,
            db,
            labels,
            run,
            text,
            captions,
        })
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let labels = LabelVocabulary::load(config.detection.labels_path.as_deref())?;
        Self::open(&config.data_dir, labels).await
    }

    pub async fn started_at(&self) -> Result<Option<OffsetDateTime>> {
        self.db.started_at().await
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn labels(&self) -> &LabelVocabulary {
        &self.labels
    }

    /// Accept a new upload and make it the current image.
    ///
    /// The new image has no detection run yet, so the session drops back to `Empty`.
    pub async fn upload<P: AsRef<Path>>(&mut self, path: P) -> Result<UploadedImage> {
        let stored = self.store.add_input_image(path).await?;
        let image = self.db.record_image(&stored).await?;
        self.run = None;
        self.text.clear();
        self.captions.clear();
        info!("Current image is now {}", image.file_name);
        Ok(image)
    }

    /// Every upload, oldest first.
    pub async fn images(&self) -> Result<Vec<UploadedImage>> {
        self.db.images().await
    }

    pub async fn current_image(&self) -> Result<UploadedImage> {
        self.db
            .current_image()
            .await?
            .ok_or_else(|| PipelineError::NotFound("no image uploaded yet; upload one first".to_string()))
    }

    /// Run detection on the current image under a fresh run.
    ///
    /// The new run becomes current only once every segment is stored; enrichment
    /// results of the previous run stay in the database but leave the session.
    pub async fn detect(&mut self, stage: &DetectionStage) -> Result<Vec<SegmentDetail>> {
        let image = self.current_image().await?;
        let pixels = self.store.load_input_image(&image.file_name).await?;
        let run = RunId::generate();
        info!("Detection run {} on {} via {}", run, image.file_name, stage.detector_name());

        let details: Vec<SegmentDetail> = stage
            .run(&self.store, &run, &pixels)
            .await?
            .into_iter()
            .map(|(id, detection)| SegmentDetail {
                id,
                label_name: self.labels.name(detection.class_label).map(str::to_string),
                score: detection.score,
                bbox: detection.bbox,
            })
            .collect();

        self.db.record_run(&run, image.id, stage.threshold, &details).await?;
        self.run = Some(run);
        self.text.clear();
        self.captions.clear();
        Ok(details)
    }

    pub fn current_run(&self) -> Result<RunId> {
        self.run
            .ok_or_else(|| PipelineError::NotFound("no segments yet; run detection first".to_string()))
    }

    /// Segments of the current run, in ordinal order.
    pub async fn segments(&self) -> Result<Vec<SegmentId>> {
        let run = self.current_run()?;
        self.store.list_segments(&run).await
    }

    pub async fn segment_details(&self) -> Result<Vec<SegmentDetail>> {
        let run = self.current_run()?;
        self.db.segment_details(&run).await
    }

    pub fn segment_path(&self, id: &SegmentId) -> Result<PathBuf> {
        Ok(self.store.segment_path(&self.current_run()?, id))
    }

    pub fn results(&self, kind: StageKind) -> &EnrichmentResults {
        match kind {
            StageKind::TextExtraction => &self.text,
            StageKind::Captioning => &self.captions,
        }
    }

    fn results_mut(&mut self, kind: StageKind) -> &mut EnrichmentResults {
        match kind {
            StageKind::TextExtraction => &mut self.text,
            StageKind::Captioning => &mut self.captions,
        }
    }

    /// Run one enrichment stage on one segment and record the outcome.
    ///
    /// A collaborator failure is recorded as `Failed` and still returned as an error.
    pub async fn enrich(&mut self, stage: &EnrichmentStage, id: &SegmentId) -> Result<String> {
        let run = self.current_run()?;
        let kind = stage.kind();

        let (state, outcome) = match stage.process(&self.store, &run, id).await {
            Ok(value) => (Enrichment::Done(value.clone()), Ok(value)),
            Err(PipelineError::Processing { context, reason }) => (
                Enrichment::Failed(reason.clone()),
                Err(PipelineError::Processing { context, reason }),
            ),
            Err(other) => return Err(other),
        };

        self.append_stage_document(kind, &run, id, &state)?;
        self.db.save_enrichment(&run, kind, id, &state).await?;
        self.results_mut(kind).record(*id, state);
        self.db.set_reported(None).await?;
        outcome
    }

    /// Enrich every segment that has no successful result yet.
    ///
    /// Collaborator failures are recorded and skipped; storage failures abort.
    pub async fn enrich_pending(&mut self, stage: &EnrichmentStage) -> Result<Vec<(SegmentId, Enrichment)>> {
        let kind = stage.kind();
        let mut summary = Vec::new();
        for id in self.segments().await? {
            if self.results(kind).get(&id).is_done() {
                continue;
            }
            match self.enrich(stage, &id).await {
                Ok(value) => summary.push((id, Enrichment::Done(value))),
                Err(PipelineError::Processing { reason, .. }) => {
                    warn!("{} skipped for {}: {}", kind.title(), id, reason);
                    summary.push((id, Enrichment::Failed(reason)));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(summary)
    }

    fn append_stage_document(
        &self,
        kind: StageKind,
        run: &RunId,
        id: &SegmentId,
        state: &Enrichment,
    ) -> Result<()> {
        let doc = match kind {
            StageKind::TextExtraction => self.store.text_extraction_dir().join(documents::TEXT_EXTRACTION_DOC),
            StageKind::Captioning => self.store.summarization_dir().join(documents::SUMMARIZATION_DOC),
        };
        let link = format!("../segmented_objects/{}/{}", run, id.file_name());
        documents::append_stage_entry(&doc, kind, id, &link, state)
    }

    /// Join the current run's segments with both enrichment mappings.
    pub async fn report(&self) -> Result<Vec<ReportRecord>> {
        let segments = self.segments().await?;
        Ok(report::build_report(&segments, &self.text, &self.captions))
    }

    /// Build the report and write the JSON mapping and Markdown table.
    pub async fn write_report(&mut self) -> Result<WrittenReport> {
        let run = self.current_run()?;
        let image = self.current_image().await?;
        let records = self.report().await?;

        let report_dir = self.store.report_dir();
        let json_path = report_dir.join(documents::REPORT_JSON);
        let markdown_path = report_dir.join(documents::REPORT_MARKDOWN);
        report::write_mapping(&json_path, &report::to_exportable_mapping(&records))?;
        documents::write_report_markdown(&markdown_path, &image.file_name, &records)?;
        self.db.set_reported(Some(&run)).await?;

        info!("Report with {} objects written to {}", records.len(), json_path.display());
        Ok(WrittenReport {
            records,
            json_path,
            markdown_path,
        })
    }

    pub async fn phase(&self) -> Result<SessionPhase> {
        let Some(run) = self.run else {
            return Ok(SessionPhase::Empty);
        };
        if self.db.reported_run().await? == Some(run) {
            return Ok(SessionPhase::Reported);
        }
        if self.text.is_empty() && self.captions.is_empty() {
            Ok(SessionPhase::Detected)
        } else {
            Ok(SessionPhase::Enriching)
        }
    }

    /// Start a new session: forget enrichment results and the current image/run.
    /// Stored artifacts are left in place.
    pub async fn reset(&mut self) -> Result<()> {
        self.db.reset().await?;
        self.run = None;
        self.text.clear();
        self.captions.clear();
        info!("Session reset");
        Ok(())
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}
