//! Report merging
//!
//! Joins the segment list with both partial enrichment mappings into one total,
//! ordered view, and restructures it for export.

pub mod documents;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::enrichment::{Enrichment, EnrichmentResults};
use crate::error::{PipelineError, Result};
use crate::models::SegmentId;

/// One joined row of the final report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    /// 1-based position in the segment list
    pub object_id: usize,
    pub segment: SegmentId,
    pub description: Enrichment,
    pub extracted_text: Enrichment,
}

/// Exported per-segment entry; anything not successfully produced is `null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub description: Option<String>,
    pub extracted_text: Option<String>,
}

pub type ExportMapping = BTreeMap<SegmentId, ExportEntry>;

/// Build exactly one record per segment, in `segments` order.
pub fn build_report(
    segments: &[SegmentId],
    text: &EnrichmentResults,
    captions: &EnrichmentResults,
) -> Vec<ReportRecord> {
    segments
        .iter()
        .enumerate()
        .map(|(idx, id)| ReportRecord {
            object_id: idx + 1,
            segment: *id,
            description: captions.get(id),
            extracted_text: text.get(id),
        })
        .collect()
}

pub fn to_exportable_mapping(records: &[ReportRecord]) -> ExportMapping {
    records
        .iter()
        .map(|record| {
            (
                record.segment,
                ExportEntry {
                    description: record.description.value().map(str::to_string),
                    extracted_text: record.extracted_text.value().map(str::to_string),
                },
            )
        })
        .collect()
}

pub fn write_mapping(path: &Path, mapping: &ExportMapping) -> Result<()> {
    let json = serde_json::to_string_pretty(mapping)
        .map_err(|e| PipelineError::storage("serialising report mapping", e))?;
    std::fs::write(path, json)
        .map_err(|e| PipelineError::storage(format!("writing {}", path.display()), e))
}

pub fn read_mapping(path: &Path) -> Result<ExportMapping> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::NotFound(format!("report mapping {}", path.display()))
        } else {
            PipelineError::storage(format!("reading {}", path.display()), e)
        }
    })?;
    serde_json::from_str(&content)
        .map_err(|e| PipelineError::storage(format!("parsing {}", path.display()), e))
}
