use crate::model::{BackgroundJob, Finding, JobStatus, QueryRecord, QuerySource, QueryStatus};
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable store for queries, cache entries, rate windows, background jobs
/// and credit usage. All mutations are single-row upserts; no cross-row
/// transactions are required.
#[derive(Clone)]
pub struct Store {
    pub conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("failed to open sqlite db")?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite db")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(crate::storage::schema::DDL)?;
        Ok(())
    }

    // --- Queries ---

    pub fn insert_query(&self, q: &QueryRecord, job_id: Option<i64>) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queries(tenant_id, project_id, job_id, question, generated_sql,
                explanation, assumptions, visualization_type, columns_json,
                result_summary_json, insights_json, execution_time_ms, status, source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                q.tenant_id,
                q.project_id,
                job_id,
                q.question,
                q.generated_sql,
                q.explanation,
                q.assumptions,
                q.visualization_type.as_str(),
                serde_json::to_string(&q.columns)?,
                serde_json::to_string(&q.result_summary)?,
                serde_json::to_string(&q.insights)?,
                q.execution_time_ms as i64,
                match q.status {
                    QueryStatus::Success => "success",
                    QueryStatus::Error => "error",
                },
                q.source.as_str(),
                q.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_query(&self, tenant_id: &str, id: i64) -> anyhow::Result<Option<QueryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, project_id, question, generated_sql, explanation,
                    assumptions, visualization_type, columns_json, result_summary_json,
                    insights_json, execution_time_ms, status, source, created_at
             FROM queries WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, id], map_query_row)
            .optional()?;
        Ok(row)
    }

    pub fn queries_for_job(&self, tenant_id: &str, job_id: i64) -> anyhow::Result<Vec<QueryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, project_id, question, generated_sql, explanation,
                    assumptions, visualization_type, columns_json, result_summary_json,
                    insights_json, execution_time_ms, status, source, created_at
             FROM queries WHERE tenant_id = ?1 AND job_id = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id, job_id], map_query_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Newest first; history views page through this.
    pub fn queries_for_project(
        &self,
        tenant_id: &str,
        project_id: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<QueryRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, project_id, question, generated_sql, explanation,
                    assumptions, visualization_type, columns_json, result_summary_json,
                    insights_json, execution_time_ms, status, source, created_at
             FROM queries WHERE tenant_id = ?1 AND project_id = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![tenant_id, project_id, limit], map_query_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // --- Query cache ---

    /// Returns the serialized result for an unexpired entry and bumps its hit
    /// count. Expired rows are treated as misses even before the sweep
    /// physically removes them.
    pub fn cache_get(
        &self,
        tenant_id: &str,
        question_hash: &str,
        schema_hash: &str,
        now_ms: i64,
    ) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let result: Option<String> = conn
            .query_row(
                "SELECT result_json FROM query_cache
                 WHERE tenant_id = ?1 AND question_hash = ?2 AND schema_hash = ?3
                   AND expires_at > ?4",
                params![tenant_id, question_hash, schema_hash, now_ms],
                |r| r.get(0),
            )
            .optional()?;
        if result.is_some() {
            conn.execute(
                "UPDATE query_cache SET hit_count = hit_count + 1
                 WHERE tenant_id = ?1 AND question_hash = ?2 AND schema_hash = ?3",
                params![tenant_id, question_hash, schema_hash],
            )?;
        }
        Ok(result)
    }

    /// Upsert; last write wins for the (tenant, question, schema) key.
    #[allow(clippy::too_many_arguments)]
    pub fn cache_put(
        &self,
        tenant_id: &str,
        project_id: &str,
        question: &str,
        question_hash: &str,
        schema_hash: &str,
        result_json: &str,
        expires_at_ms: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO query_cache(tenant_id, project_id, question_hash, schema_hash,
                 question, result_json, expires_at, hit_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)
             ON CONFLICT(tenant_id, question_hash, schema_hash) DO UPDATE SET
                 project_id = excluded.project_id,
                 question = excluded.question,
                 result_json = excluded.result_json,
                 expires_at = excluded.expires_at,
                 created_at = excluded.created_at",
            params![
                tenant_id,
                project_id,
                question_hash,
                schema_hash,
                question,
                result_json,
                expires_at_ms,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn cache_delete_tenant(&self, tenant_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM query_cache WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        Ok(n)
    }

    pub fn cache_delete_project(&self, project_id: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM query_cache WHERE project_id = ?1",
            params![project_id],
        )?;
        Ok(n)
    }

    pub fn cache_delete_expired(&self, now_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM query_cache WHERE expires_at <= ?1",
            params![now_ms],
        )?;
        Ok(n)
    }

    // --- Rate windows ---

    /// Lazily creates the (tenant, endpoint, window) row and increments it,
    /// returning the post-increment count.
    pub fn rate_increment(
        &self,
        tenant_id: &str,
        endpoint: &str,
        window_start_ms: i64,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rate_windows(tenant_id, endpoint, window_start, count)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(tenant_id, endpoint, window_start) DO UPDATE SET
                 count = count + 1",
            params![tenant_id, endpoint, window_start_ms],
        )?;
        let count: i64 = conn.query_row(
            "SELECT count FROM rate_windows
             WHERE tenant_id = ?1 AND endpoint = ?2 AND window_start = ?3",
            params![tenant_id, endpoint, window_start_ms],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn rate_delete_before(&self, cutoff_ms: i64) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM rate_windows WHERE window_start < ?1",
            params![cutoff_ms],
        )?;
        Ok(n)
    }

    /// Live jobs are counted from persisted rows rather than an in-memory
    /// counter, so the cap stays correct across process restarts.
    pub fn count_live_jobs(&self, tenant_id: &str) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM background_jobs
             WHERE tenant_id = ?1 AND status IN ('queued', 'running')",
            params![tenant_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // --- Background jobs ---

    pub fn insert_job(
        &self,
        tenant_id: &str,
        project_id: &str,
        credits_budget: f64,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO background_jobs(tenant_id, project_id, status, credits_budget, created_at)
             VALUES (?1, ?2, 'queued', ?3, ?4)",
            params![tenant_id, project_id, credits_budget, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn mark_job_running(&self, job_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE background_jobs SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), job_id],
        )?;
        Ok(())
    }

    pub fn update_job_plan(
        &self,
        job_id: i64,
        total_questions_planned: usize,
        credits_used: f64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE background_jobs SET total_questions_planned = ?1, credits_used = ?2
             WHERE id = ?3",
            params![total_questions_planned as i64, credits_used, job_id],
        )?;
        Ok(())
    }

    /// Durable progress checkpoint written after every step.
    pub fn checkpoint_job(
        &self,
        job_id: i64,
        questions_completed: usize,
        credits_used: f64,
        findings: &[Finding],
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE background_jobs SET questions_completed = ?1, credits_used = ?2,
                 findings_json = ?3
             WHERE id = ?4",
            params![
                questions_completed as i64,
                credits_used,
                serde_json::to_string(findings)?,
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn finalize_job(
        &self,
        job_id: i64,
        status: JobStatus,
        credits_used: f64,
        findings: &[Finding],
        executive_summary: Option<&str>,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE background_jobs SET status = ?1, credits_used = ?2, findings_json = ?3,
                 executive_summary = ?4, error_message = ?5, finished_at = ?6
             WHERE id = ?7",
            params![
                status.as_str(),
                credits_used,
                serde_json::to_string(findings)?,
                executive_summary,
                error_message,
                now_rfc3339(),
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, tenant_id: &str, job_id: i64) -> anyhow::Result<Option<BackgroundJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE tenant_id = ?1 AND id = ?2"
        ))?;
        let row = stmt
            .query_row(params![tenant_id, job_id], map_job_row)
            .optional()?;
        Ok(row)
    }

    pub fn jobs_for_project(
        &self,
        tenant_id: &str,
        project_id: &str,
    ) -> anyhow::Result<Vec<BackgroundJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE tenant_id = ?1 AND project_id = ?2 ORDER BY id DESC"
        ))?;
        let rows = stmt.query_map(params![tenant_id, project_id], map_job_row)?;
        collect_jobs(rows)
    }

    pub fn active_jobs(&self, tenant_id: &str) -> anyhow::Result<Vec<BackgroundJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE tenant_id = ?1 AND status IN ('queued', 'running') ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![tenant_id], map_job_row)?;
        collect_jobs(rows)
    }

    pub fn recent_completed_jobs(
        &self,
        tenant_id: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<BackgroundJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE tenant_id = ?1 AND status = 'completed'
             ORDER BY finished_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![tenant_id, limit], map_job_row)?;
        collect_jobs(rows)
    }

    // --- Credit usage ---

    pub fn usage_get(&self, tenant_id: &str, month: &str) -> anyhow::Result<Option<(f64, f64)>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT allocated, used FROM credit_usage WHERE tenant_id = ?1 AND month = ?2",
                params![tenant_id, month],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Adds `cost` to the tenant's month row, creating it with the default
    /// allocation when absent. Returns (allocated, used) after the write.
    pub fn usage_add(
        &self,
        tenant_id: &str,
        month: &str,
        cost: f64,
        default_allocation: f64,
    ) -> anyhow::Result<(f64, f64)> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO credit_usage(tenant_id, month, allocated, used)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tenant_id, month) DO UPDATE SET used = used + ?4",
            params![tenant_id, month, default_allocation, cost],
        )?;
        let row = conn.query_row(
            "SELECT allocated, used FROM credit_usage WHERE tenant_id = ?1 AND month = ?2",
            params![tenant_id, month],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(row)
    }
}

const JOB_SELECT: &str = "SELECT id, tenant_id, project_id, status, credits_budget, credits_used,
        total_questions_planned, questions_completed, findings_json,
        executive_summary, error_message, created_at, started_at, finished_at
     FROM background_jobs";

fn map_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackgroundJob> {
    let findings_json: String = row.get(8)?;
    let findings: Vec<Finding> = serde_json::from_str(&findings_json).unwrap_or_default();
    Ok(BackgroundJob {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        status: JobStatus::parse(&row.get::<_, String>(3)?),
        credits_budget: row.get(4)?,
        credits_used: row.get(5)?,
        total_questions_planned: row.get::<_, i64>(6)? as usize,
        questions_completed: row.get::<_, i64>(7)? as usize,
        findings,
        executive_summary: row.get(9)?,
        error_message: row.get(10)?,
        created_at: row.get(11)?,
        started_at: row.get(12)?,
        finished_at: row.get(13)?,
    })
}

fn map_query_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryRecord> {
    let columns_json: String = row.get(8)?;
    let summary_json: String = row.get(9)?;
    let insights_json: String = row.get(10)?;
    let status: String = row.get(12)?;
    Ok(QueryRecord {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        question: row.get(3)?,
        generated_sql: row.get(4)?,
        explanation: row.get(5)?,
        assumptions: row.get(6)?,
        visualization_type: crate::model::VisualizationType::parse(&row.get::<_, String>(7)?),
        columns: serde_json::from_str(&columns_json).unwrap_or_default(),
        result_summary: serde_json::from_str(&summary_json).unwrap_or_default(),
        insights: serde_json::from_str(&insights_json).unwrap_or_default(),
        execution_time_ms: row.get::<_, i64>(11)? as u64,
        status: if status == "success" {
            QueryStatus::Success
        } else {
            QueryStatus::Error
        },
        source: QuerySource::parse(&row.get::<_, String>(13)?),
        created_at: row.get(14)?,
    })
}

fn collect_jobs(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<BackgroundJob>>,
) -> anyhow::Result<Vec<BackgroundJob>> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Month key used to partition credit usage, e.g. "2026-08".
pub fn current_month() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}
