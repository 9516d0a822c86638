//! Integration tests for the session lifecycle.
//!
//! Tests cover:
//! - Upload validation and the current image
//! - Enrichment recording, failures and timeouts
//! - Phase transitions
//! - Persistence across reopen, and reset

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use segscribe::{EnrichmentStage, LabelVocabulary};

#[tokio::test]
async fn test_upload_sets_current_image() -> anyhow::Result<()> {
    let (mut session, _dir) = create_test_session().await;
    assert!(session.current_image().await.unwrap_err().is_not_found());

    let (_a, first) = create_test_image("first.png", 40, 30);
    let (_b, second) = create_test_image("second.png", 20, 10);
    session.upload(&first).await?;
    let uploaded = session.upload(&second).await?;

    assert_eq!((uploaded.width, uploaded.height), (20, 10));
    assert_eq!(session.current_image().await?.file_name, "second.png");
    let names: Vec<String> = session.images().await?.into_iter().map(|i| i.file_name).collect();
    assert_eq!(names, vec!["first.png", "second.png"]);

    Ok(())
}

#[tokio::test]
async fn test_upload_rejects_bad_input() -> anyhow::Result<()> {
    let (mut session, _dir) = create_test_session().await;
    let tmp = tempfile::TempDir::new()?;

    let text = tmp.path().join("notes.txt");
    std::fs::write(&text, "hello")?;
    assert!(matches!(session.upload(&text).await, Err(PipelineError::Validation(_))));

    let fake = tmp.path().join("fake.png");
    std::fs::write(&fake, "not really a png")?;
    assert!(matches!(session.upload(&fake).await, Err(PipelineError::Validation(_))));

    let (_img_dir, path) = create_test_image("scene.png", 10, 10);
    session.upload(&path).await?;
    assert!(
        matches!(session.upload(&path).await, Err(PipelineError::Validation(_))),
        "same name twice must be rejected"
    );
    assert!(session.images().await?.len() == 1);

    Ok(())
}

#[tokio::test]
async fn test_enrich_records_results_per_stage() -> anyhow::Result<()> {
    let (mut session, _dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    let id = SegmentId::new(0, 3);

    let text = session.enrich(&text_stage(), &id).await?;
    assert_eq!(text, "320x240");
    session.enrich(&caption_stage(FixedCaptioner("a red car")), &id).await?;

    assert_eq!(session.results(StageKind::TextExtraction).get(&id), Enrichment::Done("320x240".into()));
    assert_eq!(session.results(StageKind::Captioning).get(&id), Enrichment::Done("a red car".into()));

    let doc = session
        .store()
        .text_extraction_dir()
        .join(segscribe::report::documents::TEXT_EXTRACTION_DOC);
    let content = std::fs::read_to_string(doc)?;
    assert!(content.contains("## 0_3.png"));
    assert!(content.contains(&format!("../segmented_objects/{}/0_3.png", session.current_run()?)));

    Ok(())
}

#[tokio::test]
async fn test_enrich_unknown_segment_is_not_found() -> anyhow::Result<()> {
    let (mut session, _dir) = create_session_with_image().await;
    assert!(session.enrich(&text_stage(), &SegmentId::new(0, 3)).await.unwrap_err().is_not_found());

    session.detect(&detection_stage(car_scenario())).await?;
    let err = session.enrich(&text_stage(), &SegmentId::new(7, 1)).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(session.results(StageKind::TextExtraction).is_empty());

    Ok(())
}

#[tokio::test]
async fn test_collaborator_failure_is_recorded() -> anyhow::Result<()> {
    let (mut session, _dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    let id = SegmentId::new(0, 3);

    let err = session.enrich(&caption_stage(FailingCaptioner), &id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Processing { .. }));
    assert!(matches!(
        session.results(StageKind::Captioning).get(&id),
        Enrichment::Failed(reason) if reason.contains("down")
    ));

    // A later success replaces the failure.
    session.enrich(&caption_stage(FixedCaptioner("a car")), &id).await?;
    assert_eq!(session.results(StageKind::Captioning).get(&id), Enrichment::Done("a car".into()));

    Ok(())
}

#[tokio::test]
async fn test_stalled_collaborator_times_out() -> anyhow::Result<()> {
    let (mut session, _dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    let stage = EnrichmentStage::caption(Arc::new(StalledCaptioner), Duration::from_millis(50));

    let err = session.enrich(&stage, &SegmentId::new(0, 3)).await.unwrap_err();
    assert!(matches!(err, PipelineError::Processing { ref reason, .. } if reason.contains("timed out")));
    assert!(matches!(
        session.results(StageKind::Captioning).get(&SegmentId::new(0, 3)),
        Enrichment::Failed(_)
    ));

    Ok(())
}

#[tokio::test]
async fn test_enrich_pending_skips_done_segments() -> anyhow::Result<()> {
    let (mut session, _dir) = create_session_with_image().await;
    let raw = raw_detections(&[
        (0.9, [0.0, 0.0, 0.5, 0.5], 1),
        (0.9, [0.5, 0.5, 1.0, 1.0], 2),
        (0.9, [0.0, 0.5, 0.5, 1.0], 3),
    ]);
    session.detect(&detection_stage(raw)).await?;
    session.enrich(&text_stage(), &SegmentId::new(1, 2)).await?;

    let outcomes = session.enrich_pending(&text_stage()).await?;
    let processed: Vec<SegmentId> = outcomes.iter().map(|(id, _)| *id).collect();
    assert_eq!(processed, vec![SegmentId::new(0, 1), SegmentId::new(2, 3)]);
    assert_eq!(session.results(StageKind::TextExtraction).len(), 3);

    assert!(session.enrich_pending(&text_stage()).await?.is_empty());

    let failed = session.enrich_pending(&caption_stage(FailingCaptioner)).await?;
    assert_eq!(failed.len(), 3);
    assert!(failed.iter().all(|(_, state)| matches!(state, Enrichment::Failed(_))));

    Ok(())
}

#[tokio::test]
async fn test_phase_transitions() -> anyhow::Result<()> {
    let (mut session, _dir) = create_test_session().await;
    assert_eq!(session.phase().await?, SessionPhase::Empty);

    let (_img_dir, path) = create_test_image("scene.png", 800, 600);
    session.upload(&path).await?;
    assert_eq!(session.phase().await?, SessionPhase::Empty);

    session.detect(&detection_stage(car_scenario())).await?;
    assert_eq!(session.phase().await?, SessionPhase::Detected);

    session.enrich(&text_stage(), &SegmentId::new(0, 3)).await?;
    assert_eq!(session.phase().await?, SessionPhase::Enriching);

    session.write_report().await?;
    assert_eq!(session.phase().await?, SessionPhase::Reported);

    session.enrich(&caption_stage(FixedCaptioner("a car")), &SegmentId::new(0, 3)).await?;
    assert_eq!(session.phase().await?, SessionPhase::Enriching, "new results invalidate the report");

    session.detect(&detection_stage(car_scenario())).await?;
    assert_eq!(session.phase().await?, SessionPhase::Detected);

    Ok(())
}

#[tokio::test]
async fn test_session_survives_reopen() -> anyhow::Result<()> {
    let (mut session, dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    session.enrich(&text_stage(), &SegmentId::new(0, 3)).await?;
    session.enrich(&caption_stage(FailingCaptioner), &SegmentId::new(0, 3)).await.ok();
    let run = session.current_run()?;
    session.close().await;

    let reopened = Session::open(dir.path().join("data"), LabelVocabulary::coco()).await?;
    assert_eq!(reopened.current_run()?, run);
    assert_eq!(reopened.current_image().await?.file_name, "scene.png");
    assert_eq!(reopened.segments().await?, vec![SegmentId::new(0, 3)]);

    let details = reopened.segment_details().await?;
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].label_name.as_deref(), Some("car"));
    assert!((details[0].score - 0.9).abs() < 1e-6);

    assert_eq!(
        reopened.results(StageKind::TextExtraction).get(&SegmentId::new(0, 3)),
        Enrichment::Done("320x240".into())
    );
    assert!(matches!(
        reopened.results(StageKind::Captioning).get(&SegmentId::new(0, 3)),
        Enrichment::Failed(_)
    ));

    Ok(())
}

#[tokio::test]
async fn test_reset_starts_a_new_session() -> anyhow::Result<()> {
    let (mut session, dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    session.enrich(&text_stage(), &SegmentId::new(0, 3)).await?;
    let old_run = session.current_run()?;
    let started = session.started_at().await?;
    assert!(started.is_some());

    session.reset().await?;

    assert_eq!(session.phase().await?, SessionPhase::Empty);
    assert!(session.current_image().await.unwrap_err().is_not_found());
    assert!(session.current_run().unwrap_err().is_not_found());
    assert!(session.results(StageKind::TextExtraction).is_empty());
    assert!(session.started_at().await?.is_some());

    // Artifacts stay on disk.
    assert!(session.store().segment_path(&old_run, &SegmentId::new(0, 3)).exists());
    session.close().await;

    let reopened = Session::open(dir.path().join("data"), LabelVocabulary::coco()).await?;
    assert_eq!(reopened.phase().await?, SessionPhase::Empty);

    Ok(())
}

#[tokio::test]
async fn test_new_upload_starts_without_a_run() -> anyhow::Result<()> {
    let (mut session, dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    session.enrich(&text_stage(), &SegmentId::new(0, 3)).await?;
    session.write_report().await?;

    let (_img_dir, other) = create_test_image("other.png", 50, 40);
    session.upload(&other).await?;

    assert_eq!(session.phase().await?, SessionPhase::Empty);
    assert_eq!(session.current_image().await?.file_name, "other.png");
    assert!(session.segments().await.unwrap_err().is_not_found());
    assert!(session.write_report().await.unwrap_err().is_not_found());
    assert!(session.results(StageKind::TextExtraction).is_empty());
    session.close().await;

    let reopened = Session::open(dir.path().join("data"), LabelVocabulary::coco()).await?;
    assert_eq!(reopened.phase().await?, SessionPhase::Empty);
    assert!(reopened.current_run().unwrap_err().is_not_found());

    Ok(())
}

#[tokio::test]
async fn test_failed_document_append_records_nothing() -> anyhow::Result<()> {
    let (mut session, dir) = create_session_with_image().await;
    session.detect(&detection_stage(car_scenario())).await?;
    let id = SegmentId::new(0, 3);

    // A directory in place of the stage document makes the append fail.
    let doc = session
        .store()
        .text_extraction_dir()
        .join(segscribe::report::documents::TEXT_EXTRACTION_DOC);
    std::fs::create_dir(&doc)?;

    let err = session.enrich(&text_stage(), &id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Storage { .. }));
    assert_eq!(session.results(StageKind::TextExtraction).get(&id), Enrichment::Pending);
    session.close().await;

    let reopened = Session::open(dir.path().join("data"), LabelVocabulary::coco()).await?;
    assert_eq!(reopened.results(StageKind::TextExtraction).get(&id), Enrichment::Pending);

    Ok(())
}
