use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use crate::enrichment::{Enrichment, EnrichmentResults, StageKind};
use crate::error::{PipelineError, Result};
use crate::models::{BoundingBox, RunId, SegmentDetail, SegmentId, UploadedImage};
use crate::store::StoredInput;

const CURRENT_IMAGE_KEY: &str = "current_image";
const CURRENT_RUN_KEY: &str = "current_run";
const REPORTED_RUN_KEY: &str = "reported_run";
const STARTED_AT_KEY: &str = "started_at";

const STATUS_DONE: &str = "done";
const STATUS_FAILED: &str = "failed";

/// Persistence for everything a session accumulates.
pub trait SessionRepository {
    fn record_image(&self, stored: &StoredInput) -> impl Future<Output = Result<UploadedImage>>;
    fn images(&self) -> impl Future<Output = Result<Vec<UploadedImage>>>;
    fn current_image(&self) -> impl Future<Output = Result<Option<UploadedImage>>>;
    fn record_run(
        &self,
        run: &RunId,
        image_id: i64,
        threshold: f32,
        segments: &[SegmentDetail],
    ) -> impl Future<Output = Result<()>>;
    fn current_run(&self) -> impl Future<Output = Result<Option<RunId>>>;
    fn segment_details(&self, run: &RunId) -> impl Future<Output = Result<Vec<SegmentDetail>>>;
    fn save_enrichment(
        &self,
        run: &RunId,
        stage: StageKind,
        id: &SegmentId,
        state: &Enrichment,
    ) -> impl Future<Output = Result<()>>;
    fn load_enrichments(&self, run: &RunId, stage: StageKind) -> impl Future<Output = Result<EnrichmentResults>>;
    fn set_reported(&self, run: Option<&RunId>) -> impl Future<Output = Result<()>>;
    fn reported_run(&self) -> impl Future<Output = Result<Option<RunId>>>;
    fn reset(&self) -> impl Future<Output = Result<()>>;
}

#[derive(Debug)]
pub struct SessionDb {
    pool: SqlitePool,
}

fn now() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| PipelineError::storage("formatting timestamp", e))
}

fn parse_time(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|e| PipelineError::storage(format!("parsing timestamp {value:?}"), e))
}

type ImageRow = (i64, String, i64, i64, String);

fn image_from_row((id, file_name, width, height, uploaded_at): ImageRow) -> Result<UploadedImage> {
    Ok(UploadedImage {
        id,
        file_name,
        width: width as u32,
        height: height as u32,
        uploaded_at: parse_time(&uploaded_at)?,
    })
}

impl SessionDb {
    pub async fn open<P: AsRef<Path>>(db_file: P) -> Result<Self> {
        let connect_opts = SqliteConnectOptions::new()
            .filename(db_file.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_opts)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let db = Self { pool };
        if db.metadata(STARTED_AT_KEY).await?.is_none() {
            db.set_metadata(STARTED_AT_KEY, &now()?).await?;
        }
        Ok(db)
    }

    /// Flush and close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn started_at(&self) -> Result<Option<OffsetDateTime>> {
        match self.metadata(STARTED_AT_KEY).await? {
            Some(value) => Ok(Some(parse_time(&value)?)),
            None => Ok(None),
        }
    }

    async fn metadata(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM session_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_metadata (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_metadata(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM session_metadata WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn run_metadata(&self, key: &str) -> Result<Option<RunId>> {
        self.metadata(key).await?.map(|v| v.parse::<RunId>()).transpose()
    }
}

impl SessionRepository for SessionDb {
    async fn record_image(&self, stored: &StoredInput) -> Result<UploadedImage> {
        let uploaded_at = now()?;
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO images (file_name, width, height, uploaded_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(&stored.file_name)
        .bind(stored.width as i64)
        .bind(stored.height as i64)
        .bind(&uploaded_at)
        .fetch_one(&mut *tx)
        .await?;

        // The current image is switched in the same transaction as the insert,
        // and the previous image's run stops being current.
        sqlx::query(
            "INSERT INTO session_metadata (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(CURRENT_IMAGE_KEY)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM session_metadata WHERE key IN (?, ?)")
            .bind(CURRENT_RUN_KEY)
            .bind(REPORTED_RUN_KEY)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!("Recorded image {} as #{}", stored.file_name, id);
        Ok(UploadedImage {
            id,
            file_name: stored.file_name.clone(),
            width: stored.width,
            height: stored.height,
            uploaded_at: parse_time(&uploaded_at)?,
        })
    }

    async fn images(&self) -> Result<Vec<UploadedImage>> {
        sqlx::query_as::<_, ImageRow>(
            "SELECT id, file_name, width, height, uploaded_at FROM images ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(image_from_row)
        .collect()
    }

    async fn current_image(&self) -> Result<Option<UploadedImage>> {
        let Some(id) = self.metadata(CURRENT_IMAGE_KEY).await? else {
            return Ok(None);
        };
        let id: i64 = id
            .parse()
            .map_err(|e| PipelineError::storage("reading current image reference", e))?;
        sqlx::query_as::<_, ImageRow>(
            "SELECT id, file_name, width, height, uploaded_at FROM images WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .map(image_from_row)
        .transpose()
    }

    async fn record_run(
        &self,
        run: &RunId,
        image_id: i64,
        threshold: f32,
        segments: &[SegmentDetail],
    ) -> Result<()> {
        let run_str = run.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO detection_runs (id, image_id, threshold, created_at) VALUES (?, ?, ?, ?)")
            .bind(&run_str)
            .bind(image_id)
            .bind(threshold as f64)
            .bind(now()?)
            .execute(&mut *tx)
            .await?;

        for segment in segments {
            sqlx::query(
                "INSERT INTO segments (run_id, ordinal, class_label, label_name, score, ymin, xmin, ymax, xmax)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&run_str)
            .bind(segment.id.ordinal as i64)
            .bind(segment.id.class_label as i64)
            .bind(segment.label_name.as_deref())
            .bind(segment.score as f64)
            .bind(segment.bbox.ymin as f64)
            .bind(segment.bbox.xmin as f64)
            .bind(segment.bbox.ymax as f64)
            .bind(segment.bbox.xmax as f64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO session_metadata (key, value) VALUES (?, ?)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(CURRENT_RUN_KEY)
        .bind(&run_str)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM session_metadata WHERE key = ?")
            .bind(REPORTED_RUN_KEY)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn current_run(&self) -> Result<Option<RunId>> {
        self.run_metadata(CURRENT_RUN_KEY).await
    }

    async fn segment_details(&self, run: &RunId) -> Result<Vec<SegmentDetail>> {
        let rows = sqlx::query_as::<_, (i64, i64, Option<String>, f64, f64, f64, f64, f64)>(
            "SELECT ordinal, class_label, label_name, score, ymin, xmin, ymax, xmax
             FROM segments WHERE run_id = ? ORDER BY ordinal ASC",
        )
        .bind(run.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ordinal, class_label, label_name, score, ymin, xmin, ymax, xmax)| SegmentDetail {
                id: SegmentId::new(ordinal as u32, class_label as u32),
                label_name,
                score: score as f32,
                bbox: BoundingBox::new(ymin as f32, xmin as f32, ymax as f32, xmax as f32),
            })
            .collect())
    }

    async fn save_enrichment(
        &self,
        run: &RunId,
        stage: StageKind,
        id: &SegmentId,
        state: &Enrichment,
    ) -> Result<()> {
        let (status, value) = match state {
            Enrichment::Done(value) => (STATUS_DONE, value.as_str()),
            Enrichment::Failed(reason) => (STATUS_FAILED, reason.as_str()),
            Enrichment::Pending => {
                sqlx::query("DELETE FROM enrichments WHERE run_id = ? AND stage = ? AND ordinal = ?")
                    .bind(run.to_string())
                    .bind(stage.as_str())
                    .bind(id.ordinal as i64)
                    .execute(&self.pool)
                    .await?;
                return Ok(());
            }
        };

        sqlx::query(
            "INSERT INTO enrichments (run_id, stage, ordinal, class_label, status, value, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (run_id, stage, ordinal) DO UPDATE SET
                class_label = excluded.class_label,
                status = excluded.status,
                value = excluded.value,
                updated_at = excluded.updated_at",
        )
        .bind(run.to_string())
        .bind(stage.as_str())
        .bind(id.ordinal as i64)
        .bind(id.class_label as i64)
        .bind(status)
        .bind(value)
        .bind(now()?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_enrichments(&self, run: &RunId, stage: StageKind) -> Result<EnrichmentResults> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String)>(
            "SELECT ordinal, class_label, status, value FROM enrichments
             WHERE run_id = ? AND stage = ? ORDER BY ordinal ASC",
        )
        .bind(run.to_string())
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(ordinal, class_label, status, value)| {
                let state = match status.as_str() {
                    STATUS_DONE => Enrichment::Done(value),
                    STATUS_FAILED => Enrichment::Failed(value),
                    other => {
                        return Err(PipelineError::storage(
                            "reading enrichment results",
                            format!("unknown status {other:?}"),
                        ));
                    }
                };
                Ok((SegmentId::new(ordinal as u32, class_label as u32), state))
            })
            .collect()
    }

    async fn set_reported(&self, run: Option<&RunId>) -> Result<()> {
        match run {
            Some(run) => self.set_metadata(REPORTED_RUN_KEY, &run.to_string()).await,
            None => self.clear_metadata(REPORTED_RUN_KEY).await,
        }
    }

    async fn reported_run(&self) -> Result<Option<RunId>> {
        self.run_metadata(REPORTED_RUN_KEY).await
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM enrichments").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM session_metadata").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO session_metadata (key, value) VALUES (?, ?)")
            .bind(STARTED_AT_KEY)
            .bind(now()?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
