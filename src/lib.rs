pub mod collaborator;
pub mod config;
pub mod detection;
pub mod enrichment;
pub mod error;
pub mod models;
pub mod preprocessing;
pub mod report;
pub mod session;
pub mod store;

pub use collaborator::{Captioner, Detector, DetectorInput, RawDetections, Recognizer};
pub use config::{Config, load_config};
pub use detection::{DetectionStage, LabelVocabulary, PrecomputedDetector, ServingDetector};
pub use enrichment::{Enrichment, EnrichmentResults, EnrichmentStage, HttpCaptioner, OcrsRecognizer, StageKind};
pub use error::{CollaboratorError, PipelineError, Result};
pub use models::{BoundingBox, Detection, RunId, SegmentDetail, SegmentId, UploadedImage};
pub use report::{ExportEntry, ExportMapping, ReportRecord};
pub use session::{Session, SessionPhase, WrittenReport};
pub use store::ArtifactStore;
