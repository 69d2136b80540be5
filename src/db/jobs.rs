//! Job status rows.
//!
//! Every write publishes `{op, jobId}` on the `job_status` NOTIFY channel
//! so listeners on other instances (and the external-trigger feed) can
//! react without polling. Updates are full-record replacements after a
//! read-merge; `start_unix_sec` is always preserved, `log_id` is
//! preserved on completion.

use super::{Database, JOB_CHANGE_CHANNEL};
use crate::wire::{JobState, JobStatusMsg};
use anyhow::Result;
use serde_json::json;

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    job_type: String,
    job_item_id: String,
    requestor_user_id: String,
    name: String,
    elements: serde_json::Value,
    status: String,
    message: String,
    start_unix_sec: i64,
    last_update_unix_sec: i64,
    end_unix_sec: i64,
    output_file_path: String,
    log_id: String,
    other_log_files: serde_json::Value,
}

fn string_list(v: serde_json::Value) -> Vec<String> {
    serde_json::from_value(v).unwrap_or_default()
}

impl JobRow {
    fn into_msg(self) -> JobStatusMsg {
        JobStatusMsg {
            job_id: self.job_id,
            job_type: self.job_type,
            job_item_id: self.job_item_id,
            requestor_user_id: self.requestor_user_id,
            name: self.name,
            elements: string_list(self.elements),
            status: JobState::parse(&self.status).unwrap_or(JobState::Error),
            message: self.message,
            start_unix_sec: self.start_unix_sec,
            last_update_unix_sec: self.last_update_unix_sec,
            end_unix_sec: self.end_unix_sec,
            output_file_path: self.output_file_path,
            log_id: self.log_id,
            other_log_files: string_list(self.other_log_files),
        }
    }
}

const JOB_COLUMNS: &str = "job_id, job_type, job_item_id, requestor_user_id, name, elements,
     status, message, start_unix_sec, last_update_unix_sec, end_unix_sec,
     output_file_path, log_id, other_log_files";

impl Database {
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobStatusMsg>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM job_statuses WHERE job_id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(JobRow::into_msg))
    }

    /// Insert or replace a job row and publish the change.
    pub async fn write_job(&self, job: &JobStatusMsg, op: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_statuses (job_id, job_type, job_item_id, requestor_user_id,
                 name, elements, status, message, start_unix_sec, last_update_unix_sec,
                 end_unix_sec, output_file_path, log_id, other_log_files)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (job_id) DO UPDATE SET
                 job_type = EXCLUDED.job_type,
                 job_item_id = EXCLUDED.job_item_id,
                 requestor_user_id = EXCLUDED.requestor_user_id,
                 name = EXCLUDED.name,
                 elements = EXCLUDED.elements,
                 status = EXCLUDED.status,
                 message = EXCLUDED.message,
                 start_unix_sec = EXCLUDED.start_unix_sec,
                 last_update_unix_sec = EXCLUDED.last_update_unix_sec,
                 end_unix_sec = EXCLUDED.end_unix_sec,
                 output_file_path = EXCLUDED.output_file_path,
                 log_id = EXCLUDED.log_id,
                 other_log_files = EXCLUDED.other_log_files",
        )
        .bind(&job.job_id)
        .bind(&job.job_type)
        .bind(&job.job_item_id)
        .bind(&job.requestor_user_id)
        .bind(&job.name)
        .bind(json!(job.elements))
        .bind(job.status.as_str())
        .bind(&job.message)
        .bind(job.start_unix_sec)
        .bind(job.last_update_unix_sec)
        .bind(job.end_unix_sec)
        .bind(&job.output_file_path)
        .bind(&job.log_id)
        .bind(json!(job.other_log_files))
        .execute(&self.pool)
        .await?;

        let payload = json!({ "op": op, "jobId": job.job_id }).to_string();
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOB_CHANGE_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_jobs_for_user(&self, user_id: &str) -> Result<Vec<JobStatusMsg>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM job_statuses WHERE requestor_user_id = $1
             ORDER BY start_unix_sec DESC",
            JOB_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(JobRow::into_msg).collect())
    }
}
