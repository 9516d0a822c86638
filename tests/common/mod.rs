mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from segscribe for tests
pub use segscribe::{
    Enrichment, PipelineError, SegmentId, Session, SessionPhase, StageKind,
};
