//! libSQL job store (`agenda` provider).
//!
//! Jobs are persisted to a local file (or an in-memory database for tests).
//! This backend generates its own ids; the caller-supplied id is kept in the
//! `reference` column.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::jobs::migrations;
use crate::jobs::model::{Job, JobCounts, JobFilter, JobStatus, NewJob};
use crate::jobs::store::{JobProvider, JobStore};

const JOB_COLUMNS: &str =
    "id, reference, job_type, data, scheduled_for, status, created_at, updated_at, last_error";

pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_db(db).await?;
        info!(path = %path.display(), "Job database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_db(db).await
    }

    async fn from_db(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        sql: &str,
        values: Vec<libsql::Value>,
        op: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("{op}: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamp so string comparison in SQL orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a row selected with `JOB_COLUMNS` to a Job.
fn row_to_job(row: &libsql::Row) -> Result<Job, StoreError> {
    let col = |e: libsql::Error| StoreError::Serialization(format!("job row: {e}"));

    let data_str: String = row.get(3).map_err(col)?;
    let status_str: String = row.get(5).map_err(col)?;
    let scheduled_str: String = row.get(4).map_err(col)?;
    let created_str: String = row.get(6).map_err(col)?;
    let updated_str: String = row.get(7).map_err(col)?;

    Ok(Job {
        id: row.get(0).map_err(col)?,
        reference: row.get::<Option<String>>(1).map_err(col)?,
        job_type: row.get(2).map_err(col)?,
        data: serde_json::from_str(&data_str)
            .map_err(|e| StoreError::Serialization(format!("job data: {e}")))?,
        scheduled_for: parse_ts(&scheduled_str)?,
        status: status_str
            .parse()
            .map_err(|e| StoreError::Serialization(format!("job status: {e}")))?,
        created_at: parse_ts(&created_str)?,
        updated_at: parse_ts(&updated_str)?,
        last_error: row.get::<Option<String>>(8).map_err(col)?,
    })
}

/// WHERE clause and positional values for a filter.
fn filter_clause(filter: &JobFilter) -> (String, Vec<libsql::Value>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();
    if let Some(status) = filter.status {
        values.push(libsql::Value::Text(status.as_str().to_string()));
        conditions.push(format!("status = ?{}", values.len()));
    }
    if let Some(job_type) = &filter.job_type {
        values.push(libsql::Value::Text(job_type.clone()));
        conditions.push(format!("job_type = ?{}", values.len()));
    }
    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, values)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlJobStore {
    fn provider(&self) -> JobProvider {
        JobProvider::Agenda
    }

    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut job = Job::new(
            Uuid::new_v4().to_string(),
            new.job_type,
            new.data,
            new.scheduled_for,
        );
        job.reference = Some(new.requested_id);

        let data = serde_json::to_string(&job.data)
            .map_err(|e| StoreError::Serialization(format!("job data: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO jobs (id, reference, job_type, data, scheduled_for, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    job.id.clone(),
                    opt_text(job.reference.as_deref()),
                    job.job_type.clone(),
                    data,
                    ts(job.scheduled_for),
                    job.status.as_str(),
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.job_type, "Job inserted into DB");
        // Re-read so callers see the stored timestamp precision.
        self.get(&job.id).await?.ok_or_else(|| {
            StoreError::Query(format!("insert_job: job {} missing after insert", job.id))
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                vec![libsql::Value::Text(id.to_string())],
                "get_job",
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<Option<Job>, StoreError> {
        if !from.can_transition_to(to) {
            return Ok(None);
        }

        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2, last_error = COALESCE(?3, last_error) WHERE id = ?4 AND status = ?5",
                params![to.as_str(), ts(Utc::now()), opt_text(error), id, from.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("transition_job: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        debug!(job_id = %id, %from, %to, "Job status updated in DB");
        self.get(id).await
    }

    async fn remove_if(&self, id: &str, status: JobStatus) -> Result<bool, StoreError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE id = ?1 AND status = ?2",
                params![id, status.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("remove_job: {e}")))?;
        Ok(removed > 0)
    }

    async fn list(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize), StoreError> {
        let (clause, values) = filter_clause(filter);

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM jobs{clause}"),
                libsql::params_from_iter(values.clone()),
            )
            .await
            .map_err(|e| StoreError::Query(format!("count_jobs: {e}")))?;
        let total: i64 = match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("count_jobs: {e}")))?
        {
            Some(row) => row
                .get(0)
                .map_err(|e| StoreError::Query(format!("count_jobs: {e}")))?,
            None => 0,
        };

        // SQLite needs a LIMIT to use OFFSET; -1 means unbounded.
        let limit = filter
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let offset = i64::try_from(filter.offset.unwrap_or(0)).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs{clause} ORDER BY scheduled_for ASC, created_at ASC, id ASC LIMIT {limit} OFFSET {offset}"
        );
        let jobs = self.query_jobs(&sql, values, "list_jobs").await?;
        Ok((jobs, usize::try_from(total).unwrap_or(0)))
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM jobs WHERE status = 'scheduled' AND scheduled_for <= ?1 ORDER BY scheduled_for ASC LIMIT ?2",
                params![ts(now), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("due_jobs: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("due_jobs: {e}")))?
        {
            ids.push(
                row.get::<String>(0)
                    .map_err(|e| StoreError::Query(format!("due_jobs: {e}")))?,
            );
        }
        Ok(ids)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND updated_at < ?1",
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("purge_jobs: {e}")))?;
        Ok(count as usize)
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(|e| StoreError::Query(format!("count_by_status: {e}")))?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("count_by_status: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("count_by_status: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("count_by_status: {e}")))?;
            match status.parse::<JobStatus>() {
                Ok(status) => counts.add(status, u64::try_from(n).unwrap_or(0)),
                Err(e) => tracing::warn!("Skipping job count row: {e}"),
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.conn()
            .query("SELECT 1", ())
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Connection(format!("ping: {e}")))
    }
}
