use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::enrichment::{Enrichment, StageKind};
use crate::error::{PipelineError, Result};
use crate::models::SegmentId;
use crate::report::ReportRecord;

pub const TEXT_EXTRACTION_DOC: &str = "text_extraction.md";
pub const SUMMARIZATION_DOC: &str = "image_summarization.md";
pub const REPORT_JSON: &str = "data_mapping.json";
pub const REPORT_MARKDOWN: &str = "report.md";

/// Append one processed segment to a stage's running document.
///
/// The heading is written when the document is created.
pub fn append_stage_entry(
    doc: &Path,
    stage: StageKind,
    segment: &SegmentId,
    image_link: &str,
    state: &Enrichment,
) -> Result<()> {
    let is_new = !doc.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(doc)
        .map_err(|e| PipelineError::storage(format!("opening {}", doc.display()), e))?;

    let mut entry = String::new();
    if is_new {
        entry.push_str(&format!("# {}\n\n", stage.title()));
    }
    let label = match stage {
        StageKind::TextExtraction => "Extracted Text",
        StageKind::Captioning => "Description",
    };
    entry.push_str(&format!("## {}\n\n", segment.file_name()));
    entry.push_str(&format!("![{}]({})\n\n", segment.file_name(), image_link));
    entry.push_str(&format!("Image Name: {}\n\n", segment.file_name()));
    match state {
        Enrichment::Done(value) => entry.push_str(&format!("{label}:\n\n{value}\n\n")),
        Enrichment::Failed(reason) => entry.push_str(&format!("{label}: failed ({reason})\n\n")),
        Enrichment::Pending => entry.push_str(&format!("{label}: not processed\n\n")),
    }

    file.write_all(entry.as_bytes())
        .map_err(|e| PipelineError::storage(format!("appending to {}", doc.display()), e))
}

fn cell(state: &Enrichment) -> String {
    let text = match state {
        Enrichment::Done(value) => value.as_str(),
        Enrichment::Failed(_) => "(failed)",
        Enrichment::Pending => "",
    };
    text.replace('|', "\\|").replace(['\r', '\n'], " ").trim().to_string()
}

/// Markdown table: Object ID, Description, Extracted Text, Image Name.
pub fn render_table(records: &[ReportRecord]) -> String {
    let mut out = String::from("| Object ID | Description | Extracted Text | Image Name |\n");
    out.push_str("|---|---|---|---|\n");
    for record in records {
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            record.object_id,
            cell(&record.description),
            cell(&record.extracted_text),
            record.segment.file_name()
        ));
    }
    out
}

pub fn write_report_markdown(path: &Path, source_image: &str, records: &[ReportRecord]) -> Result<()> {
    let mut doc = format!("# Final Report\n\nSource image: {source_image}\n\n");
    if records.is_empty() {
        doc.push_str("No objects were detected.\n");
    } else {
        doc.push_str(&render_table(records));
    }
    std::fs::write(path, doc).map_err(|e| PipelineError::storage(format!("writing {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ordinal: u32, description: Enrichment, text: Enrichment) -> ReportRecord {
        ReportRecord {
            object_id: ordinal as usize + 1,
            segment: SegmentId::new(ordinal, 3),
            description,
            extracted_text: text,
        }
    }

    #[test]
    fn table_escapes_cells_and_blanks_pending() {
        let table = render_table(&[
            record(0, Enrichment::Done("a | b\nc".into()), Enrichment::Pending),
            record(1, Enrichment::Failed("boom".into()), Enrichment::Done("STOP".into())),
        ]);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "| 1 | a \\| b c |  | 0_3.png |");
        assert_eq!(lines[3], "| 2 | (failed) | STOP | 1_3.png |");
    }

    #[test]
    fn stage_document_gets_one_heading() {
        let dir = tempfile::TempDir::new().unwrap();
        let doc = dir.path().join(TEXT_EXTRACTION_DOC);

        append_stage_entry(&doc, StageKind::TextExtraction, &SegmentId::new(0, 3), "x/0_3.png", &Enrichment::Done("EXIT".into())).unwrap();
        append_stage_entry(&doc, StageKind::TextExtraction, &SegmentId::new(1, 3), "x/1_3.png", &Enrichment::Failed("bad".into())).unwrap();

        let content = std::fs::read_to_string(&doc).unwrap();
        assert_eq!(content.matches("# Text Extraction").count(), 1);
        assert!(content.contains("## 0_3.png"));
        assert!(content.contains("Extracted Text:\n\nEXIT"));
        assert!(content.contains("Extracted Text: failed (bad)"));
    }
}
