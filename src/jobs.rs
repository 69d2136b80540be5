//! # Job tracker — lifecycle and cross-instance watchers
//!
//! Any API instance may update any job; the rows in `job_statuses` are
//! the source of truth. The instance that created a job also spawns a
//! watcher task that polls the row and forwards fresh snapshots to a
//! per-job callback. A job that never reaches a terminal state is
//! force-terminated by its watcher with a synthetic ERROR snapshot.
//!
//! The active-job set lives under a mutex; `complete_job` writes the row
//! first and then marks the entry inactive. Dropping the mutex before
//! I/O is fine because the row is authoritative.

use crate::db::Database;
use crate::lock_or_recover;
use crate::wire::{JobState, JobStatusMsg};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

pub type JobUpdateFn = Arc<dyn Fn(JobStatusMsg) + Send + Sync>;

pub const TIMEOUT_MESSAGE: &str = "Timed out while waiting for status";

#[derive(Clone)]
pub struct JobTracker {
    db: Database,
    poll_interval_sec: u64,
    active: Arc<Mutex<HashMap<String, bool>>>,
}

impl JobTracker {
    pub fn new(db: Database, poll_interval_sec: u64) -> Self {
        JobTracker {
            db,
            poll_interval_sec: poll_interval_sec.max(1),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether this instance created the job, active or not. Feed
    /// listeners use this to avoid double-pushing locally watched jobs.
    pub fn is_tracked(&self, job_id: &str) -> bool {
        lock_or_recover(&self.active).contains_key(job_id)
    }

    pub fn active_count(&self) -> usize {
        lock_or_recover(&self.active)
            .values()
            .filter(|v| **v)
            .count()
    }

    /// Create a job in STARTING and spawn its watcher. The job id is
    /// `<prefix>-<random 16>`.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_job(
        &self,
        prefix: &str,
        job_type: &str,
        job_item_id: &str,
        requestor_user_id: &str,
        name: &str,
        elements: Vec<String>,
        timeout_sec: u32,
        on_update: JobUpdateFn,
    ) -> Result<JobStatusMsg> {
        let now = crate::now_unix();
        let job = JobStatusMsg {
            job_id: format!("{}-{}", prefix, crate::random_id(16)),
            job_type: job_type.to_string(),
            job_item_id: job_item_id.to_string(),
            requestor_user_id: requestor_user_id.to_string(),
            name: name.to_string(),
            elements,
            status: JobState::Starting,
            message: String::new(),
            start_unix_sec: now,
            last_update_unix_sec: now,
            end_unix_sec: 0,
            output_file_path: String::new(),
            log_id: String::new(),
            other_log_files: Vec::new(),
        };
        self.db.write_job(&job, "insert").await?;
        lock_or_recover(&self.active).insert(job.job_id.clone(), true);
        info!(job_id = %job.job_id, job_type, "job created");

        let tracker = self.clone();
        let job_id = job.job_id.clone();
        let max_iterations =
            (u64::from(timeout_sec) + self.poll_interval_sec - 1) / self.poll_interval_sec;
        tokio::spawn(async move {
            tracker.watch(job_id, now, max_iterations, on_update).await;
        });
        Ok(job)
    }

    async fn watch(
        &self,
        job_id: String,
        start_last_update: i64,
        max_iterations: u64,
        on_update: JobUpdateFn,
    ) {
        let mut last_seen = start_last_update;
        for _ in 0..max_iterations.max(1) {
            tokio::time::sleep(Duration::from_secs(self.poll_interval_sec)).await;
            let snapshot = match self.db.get_job(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job_id = %job_id, "watched job row disappeared");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "job poll failed");
                    continue;
                }
            };
            let terminal = snapshot.status.is_terminal();
            if snapshot.last_update_unix_sec > last_seen {
                last_seen = snapshot.last_update_unix_sec;
                on_update(snapshot);
            }
            if terminal {
                lock_or_recover(&self.active).insert(job_id.clone(), false);
                return;
            }
        }

        warn!(job_id = %job_id, "job watcher timed out");
        let synthetic = match self.db.get_job(&job_id).await {
            Ok(Some(mut job)) => {
                job.status = JobState::Error;
                job.message = TIMEOUT_MESSAGE.to_string();
                job.end_unix_sec = crate::now_unix();
                job
            }
            _ => JobStatusMsg {
                job_id: job_id.clone(),
                job_type: String::new(),
                job_item_id: String::new(),
                requestor_user_id: String::new(),
                name: String::new(),
                elements: Vec::new(),
                status: JobState::Error,
                message: TIMEOUT_MESSAGE.to_string(),
                start_unix_sec: start_last_update,
                last_update_unix_sec: crate::now_unix(),
                end_unix_sec: crate::now_unix(),
                output_file_path: String::new(),
                log_id: String::new(),
                other_log_files: Vec::new(),
            },
        };
        lock_or_recover(&self.active).insert(job_id, false);
        on_update(synthetic);
    }

    /// Replace the row with an updated copy, preserving the start time
    /// and every field the update does not touch. An unknown job id is
    /// logged, not fatal: updates may arrive from worker processes that
    /// did not create the job.
    pub async fn update_job(
        &self,
        job_id: &str,
        status: JobState,
        message: &str,
        log_id: &str,
    ) -> Result<()> {
        let Some(mut job) = self.db.get_job(job_id).await? else {
            warn!(job_id, "update for unknown job");
            return Ok(());
        };
        job.status = status;
        job.message = message.to_string();
        if !log_id.is_empty() {
            job.log_id = log_id.to_string();
        }
        job.last_update_unix_sec = crate::now_unix();
        self.db.write_job(&job, "update").await
    }

    /// Terminal write. Preserves `start_unix_sec` and `log_id` from the
    /// stored row, then marks the job inactive.
    pub async fn complete_job(
        &self,
        job_id: &str,
        success: bool,
        message: &str,
        output_file_path: &str,
        other_log_files: Vec<String>,
    ) -> Result<()> {
        let Some(mut job) = self.db.get_job(job_id).await? else {
            warn!(job_id, "completion for unknown job");
            return Ok(());
        };
        job.status = if success {
            JobState::Complete
        } else {
            JobState::Error
        };
        job.message = message.to_string();
        job.output_file_path = output_file_path.to_string();
        job.other_log_files = other_log_files;
        let now = crate::now_unix();
        job.last_update_unix_sec = now;
        job.end_unix_sec = now;
        self.db.write_job(&job, "complete").await?;
        lock_or_recover(&self.active).insert(job_id.to_string(), false);
        info!(job_id, success, "job completed");
        Ok(())
    }
}
