//! Handler election rows: last writer wins per job id.

use super::Database;
use anyhow::Result;

impl Database {
    pub async fn upsert_job_handler(
        &self,
        job_id: &str,
        instance_id: &str,
        now_unix: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_handlers (job_id, handler_instance_id, timestamp_unix_sec)
             VALUES ($1, $2, $3)
             ON CONFLICT (job_id) DO UPDATE SET
                 handler_instance_id = EXCLUDED.handler_instance_id,
                 timestamp_unix_sec = EXCLUDED.timestamp_unix_sec",
        )
        .bind(job_id)
        .bind(instance_id)
        .bind(now_unix)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job_handler(&self, job_id: &str) -> Result<Option<String>> {
        let row: Option<String> = sqlx::query_scalar(
            "SELECT handler_instance_id FROM job_handlers WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Stale election rows are garbage, not state; correctness never
    /// depends on this cleanup.
    pub async fn prune_job_handlers(&self, older_than_unix: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_handlers WHERE timestamp_unix_sec < $1")
            .bind(older_than_unix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
