//! PostgreSQL-backed store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use posfeed_core::{
    ClaimOutcome, CompletedFile, DedupePolicy, FetchLog, FieldMap, FileIdentity, FileRecord,
    FileStatus, IngestedRow, JobMode, JobStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::repo::{
    page_window, ClaimRepo, InsertOutcome, JobRepo, ReportFilter, ReportPage, ReportRepo,
    StoreError, StoreResult,
};

const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Nine binds per row keeps a chunk well under the 65535 parameter limit.
const INSERT_CHUNK_ROWS: usize = 5_000;

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn pos_from_db(value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative pos {value}")))
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let statements = schema_statements(POSTGRES_SCHEMA);
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!(statements = statements.len(), "schema ensured");
        Ok(())
    }

    async fn insert_chunk(&self, rows: &[IngestedRow]) -> StoreResult<u64> {
        // Bound as text and cast to `json` so the stored document keeps column order.
        let documents = rows
            .iter()
            .map(|row| serde_json::to_string(&row.data))
            .collect::<Result<Vec<_>, _>>()?;
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO reports (id, job_id, branch, pos, work_date, source_file, ingested_at, unique_key, data) ",
        );
        qb.push_values(rows.iter().zip(documents), |mut b, (row, document)| {
            b.push_bind(row.id)
                .push_bind(row.job_id.clone())
                .push_bind(row.branch.clone())
                .push_bind(row.pos as i32)
                .push_bind(row.work_date)
                .push_bind(row.source_file.clone())
                .push_bind(row.ingested_at)
                .push_bind(row.unique_key.clone())
                .push_bind(document)
                .push_unseparated("::json");
        });
        qb.push(" ON CONFLICT (unique_key) DO NOTHING");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn file_record_from_row(row: &PgRow) -> StoreResult<FileRecord> {
    let status: String = row.try_get("status")?;
    let size: Option<i64> = row.try_get("size")?;
    Ok(FileRecord {
        identity: FileIdentity::new(
            row.try_get::<String, _>("branch")?,
            pos_from_db(row.try_get("pos")?)?,
            row.try_get::<NaiveDate, _>("work_date")?,
            row.try_get::<String, _>("source_file")?,
        ),
        filename: row.try_get("filename")?,
        storage_path: row.try_get("storage_path")?,
        fetched_at: row.try_get("fetched_at")?,
        size: size.map(to_u64),
        checksum: row.try_get("checksum")?,
        status: FileStatus::from_str(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        error: row.try_get("error")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn report_from_row(row: &PgRow) -> StoreResult<IngestedRow> {
    let data: Json<FieldMap> = row.try_get("data")?;
    Ok(IngestedRow {
        id: row.try_get::<Uuid, _>("id")?,
        job_id: row.try_get("job_id")?,
        branch: row.try_get("branch")?,
        pos: pos_from_db(row.try_get("pos")?)?,
        work_date: row.try_get("work_date")?,
        source_file: row.try_get("source_file")?,
        ingested_at: row.try_get("ingested_at")?,
        unique_key: row.try_get("unique_key")?,
        data: data.0,
    })
}

fn fetch_log_from_row(row: &PgRow) -> StoreResult<FetchLog> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("mode")?;
    let positions: Vec<i32> = row.try_get("positions")?;
    Ok(FetchLog {
        job_id: row.try_get("job_id")?,
        status: JobStatus::from_str(&status).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        mode: JobMode::from_str(&mode).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        branches: row.try_get("branches")?,
        positions: positions
            .into_iter()
            .map(pos_from_db)
            .collect::<StoreResult<Vec<_>>>()?,
        rows_inserted: to_u64(row.try_get("rows_inserted")?),
        files_total: to_u64(row.try_get("files_total")?),
        files_completed: to_u64(row.try_get("files_completed")?),
        errors: row.try_get("errors")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn push_report_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ReportFilter) {
    qb.push(" WHERE TRUE");
    if let Some(branch) = &filter.branch {
        qb.push(" AND branch = ").push_bind(branch.clone());
    }
    if let Some(pos) = filter.pos {
        qb.push(" AND pos = ").push_bind(pos as i32);
    }
    if let Some(date) = filter.work_date {
        qb.push(" AND work_date = ").push_bind(date);
    }
    if let Some(source) = &filter.source_file {
        qb.push(" AND source_file = ").push_bind(source.clone());
    }
    if let Some(job) = &filter.job_id {
        qb.push(" AND job_id = ").push_bind(job.clone());
    }
}

fn job_not_found(job_id: &str, rows_affected: u64) -> StoreResult<()> {
    if rows_affected == 0 {
        Err(StoreError::JobNotFound(job_id.to_string()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ClaimRepo for PgStore {
    async fn claim_file(
        &self,
        identity: &FileIdentity,
        policy: DedupePolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<ClaimOutcome> {
        // A fresh insert leaves xmax at zero; an upsert that updated an existing row does not.
        let claimed = sqlx::query(
            r#"
            INSERT INTO file_records (branch, pos, work_date, source_file, filename, status, fetched_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', $6, $6, $6)
            ON CONFLICT (branch, pos, work_date, source_file) DO UPDATE
               SET status = 'processing',
                   error = NULL,
                   fetched_at = EXCLUDED.fetched_at,
                   updated_at = EXCLUDED.updated_at
             WHERE file_records.status IN ('raw', 'error')
                OR (file_records.status = 'completed' AND $7)
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .bind(identity.filename())
        .bind(now)
        .bind(policy == DedupePolicy::Replace)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = claimed {
            let inserted: bool = row.try_get("inserted")?;
            return Ok(ClaimOutcome::Claimed {
                reclaimed: !inserted,
            });
        }

        let status: Option<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM file_records
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match status.as_deref() {
            Some("completed") => ClaimOutcome::AlreadyCompleted,
            _ => ClaimOutcome::InProgress,
        })
    }

    async fn complete_file(
        &self,
        identity: &FileIdentity,
        file: &CompletedFile,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_records
               SET status = 'completed',
                   storage_path = $5,
                   size = $6,
                   checksum = $7,
                   error = NULL,
                   completed_at = $8,
                   updated_at = $8
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
               AND status = 'processing'
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .bind(&file.storage_path)
        .bind(to_i64(file.size))
        .bind(&file.checksum)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotHeld(identity.to_string()));
        }
        Ok(())
    }

    async fn fail_file(
        &self,
        identity: &FileIdentity,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE file_records
               SET status = 'error',
                   error = $5,
                   updated_at = $6
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
               AND status = 'processing'
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotHeld(identity.to_string()));
        }
        Ok(())
    }

    async fn reset_file(&self, identity: &FileIdentity, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE file_records
               SET status = 'raw',
                   updated_at = $5
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
               AND status IN ('processing', 'error')
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_file(&self, identity: &FileIdentity) -> StoreResult<Option<FileRecord>> {
        let row = sqlx::query(
            r#"
            SELECT branch, pos, work_date, source_file, filename, storage_path, fetched_at,
                   size, checksum, status, error, completed_at, updated_at
              FROM file_records
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_record_from_row).transpose()
    }

    async fn distinct_branches(&self) -> StoreResult<Vec<String>> {
        let branches: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT branch FROM file_records
             UNION
            SELECT branch FROM reports
             ORDER BY branch
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(branches)
    }
}

#[async_trait]
impl ReportRepo for PgStore {
    async fn insert_reports(&self, rows: &[IngestedRow]) -> StoreResult<InsertOutcome> {
        let mut outcome = InsertOutcome::default();
        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            match self.insert_chunk(chunk).await {
                Ok(inserted) => outcome.absorb(InsertOutcome {
                    inserted,
                    rejected: chunk.len() as u64 - inserted,
                }),
                Err(StoreError::Database(sqlx::Error::Database(err))) => {
                    // One bad row poisons a multi-row statement; salvage the rest one by one.
                    warn!(error = %err, rows = chunk.len(), "bulk insert failed, retrying per row");
                    for row in chunk {
                        match self.insert_chunk(std::slice::from_ref(row)).await {
                            Ok(1) => outcome.inserted += 1,
                            Ok(_) => outcome.rejected += 1,
                            Err(StoreError::Database(sqlx::Error::Database(row_err))) => {
                                warn!(error = %row_err, id = %row.id, "row rejected");
                                outcome.rejected += 1;
                            }
                            Err(other) => return Err(other),
                        }
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Ok(outcome)
    }

    async fn count_reports(&self, filter: &ReportFilter) -> StoreResult<u64> {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM reports");
        push_report_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(to_u64(count))
    }

    async fn find_reports(
        &self,
        filter: &ReportFilter,
        page: u64,
        limit: u64,
    ) -> StoreResult<ReportPage> {
        let (page, limit) = page_window(page, limit);
        let total = self.count_reports(filter).await?;

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT id, job_id, branch, pos, work_date, source_file, ingested_at, unique_key, data FROM reports",
        );
        push_report_filter(&mut qb, filter);
        qb.push(" ORDER BY work_date DESC, branch, pos, ingested_at LIMIT ")
            .push_bind(to_i64(limit))
            .push(" OFFSET ")
            .push_bind(to_i64((page - 1) * limit));
        let rows = qb.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(report_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(ReportPage {
            items,
            total,
            page,
            page_size: limit,
        })
    }

    async fn backup_and_delete(
        &self,
        identity: &FileIdentity,
        replaced_by_job: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO report_backups (original_id, job_id, branch, pos, work_date, source_file,
                                        ingested_at, unique_key, data, replaced_at, replaced_by_job, created_at)
            SELECT id, job_id, branch, pos, work_date, source_file,
                   ingested_at, unique_key, data, $5, $6, $5
              FROM reports
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .bind(now)
        .bind(replaced_by_job)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM reports
             WHERE branch = $1 AND pos = $2 AND work_date = $3 AND source_file = $4
            "#,
        )
        .bind(&identity.branch)
        .bind(identity.pos as i32)
        .bind(identity.work_date)
        .bind(&identity.source_file)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn count_backups(&self, created_before: Option<DateTime<Utc>>) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM report_backups WHERE $1::timestamptz IS NULL OR created_at < $1",
        )
        .bind(created_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn delete_backups_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM report_backups WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobRepo for PgStore {
    async fn create_job(&self, log: &FetchLog) -> StoreResult<bool> {
        let positions: Vec<i32> = log.positions.iter().map(|p| *p as i32).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO fetch_logs (job_id, status, mode, start_date, end_date, branches, positions,
                                    rows_inserted, files_total, files_completed, errors,
                                    started_at, finished_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(&log.job_id)
        .bind(log.status.as_str())
        .bind(log.mode.as_str())
        .bind(log.start_date)
        .bind(log.end_date)
        .bind(&log.branches)
        .bind(&positions)
        .bind(to_i64(log.rows_inserted))
        .bind(to_i64(log.files_total))
        .bind(to_i64(log.files_completed))
        .bind(&log.errors)
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<FetchLog>> {
        let row = sqlx::query("SELECT * FROM fetch_logs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fetch_log_from_row).transpose()
    }

    async fn mark_job_running(
        &self,
        job_id: &str,
        files_total: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO fetch_logs (job_id, status, mode, files_total, started_at, created_at, updated_at)
            VALUES ($1, 'running', $2, $3, $4, $4, $4)
            ON CONFLICT (job_id) DO UPDATE
               SET status = 'running',
                   files_total = EXCLUDED.files_total,
                   started_at = EXCLUDED.started_at,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job_id)
        .bind(JobMode::Files.as_str())
        .bind(to_i64(files_total))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_progress(
        &self,
        job_id: &str,
        rows_inserted: u64,
        files_completed: u64,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fetch_logs
               SET rows_inserted = $2,
                   files_completed = $3,
                   updated_at = $4
             WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(to_i64(rows_inserted))
        .bind(to_i64(files_completed))
        .bind(now)
        .execute(&self.pool)
        .await?;
        job_not_found(job_id, result.rows_affected())
    }

    async fn append_job_error(
        &self,
        job_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE fetch_logs SET errors = array_append(errors, $2), updated_at = $3 WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        job_not_found(job_id, result.rows_affected())
    }

    async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE fetch_logs SET status = $2, finished_at = $3, updated_at = $3 WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        job_not_found(job_id, result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements(POSTGRES_SCHEMA);
        assert!(statements.len() >= 6);
        assert!(statements
            .iter()
            .all(|s| !s.is_empty() && s.contains("IF NOT EXISTS")));
        assert!(statements
            .iter()
            .any(|s| s.contains("reports_unique_key_idx")));
    }

    #[test]
    fn counter_conversions_saturate() {
        assert_eq!(to_i64(u64::MAX), i64::MAX);
        assert_eq!(to_u64(-1), 0);
        assert!(pos_from_db(-3).is_err());
        assert_eq!(pos_from_db(4).unwrap(), 4);
    }
}
