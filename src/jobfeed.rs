//! External-trigger listener.
//!
//! Tails the `job_status` NOTIFY channel and fires registered callbacks
//! for job ids matching a prefix. This is how clients connected to any
//! API instance see progress for jobs originated elsewhere (importers
//! driven from external control planes included). The payload only
//! carries `{op, jobId}`; the listener re-reads the row for the full
//! snapshot.

use crate::db::{Database, JOB_CHANGE_CHANNEL};
use crate::jobs::JobUpdateFn;
use crate::lock_or_recover;
use anyhow::Result;
use sqlx::postgres::PgListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct JobFeed {
    subscribers: Arc<Mutex<Vec<(String, JobUpdateFn)>>>,
}

impl JobFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for job ids starting with `prefix`.
    pub fn register(&self, prefix: &str, cb: JobUpdateFn) {
        lock_or_recover(&self.subscribers).push((prefix.to_string(), cb));
    }

    /// Run forever; reconnects with backoff on listener failure.
    pub async fn run(self, db: Database) {
        loop {
            if let Err(e) = self.listen_loop(&db).await {
                warn!(error = %e, "job feed listener failed, reconnecting");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    async fn listen_loop(&self, db: &Database) -> Result<()> {
        let mut listener = PgListener::connect_with(db.pool()).await?;
        listener.listen(JOB_CHANGE_CHANNEL).await?;
        info!(channel = JOB_CHANGE_CHANNEL, "job feed listening");
        loop {
            let event = listener.recv().await?;
            let payload: serde_json::Value = match serde_json::from_str(event.payload()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "bad job feed payload");
                    continue;
                }
            };
            let Some(job_id) = payload.get("jobId").and_then(|v| v.as_str()) else {
                continue;
            };
            let matching: Vec<JobUpdateFn> = {
                let subs = lock_or_recover(&self.subscribers);
                subs.iter()
                    .filter(|(prefix, _)| job_id.starts_with(prefix.as_str()))
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect()
            };
            if matching.is_empty() {
                continue;
            }
            match db.get_job(job_id).await {
                Ok(Some(job)) => {
                    for cb in matching {
                        cb(job.clone());
                    }
                }
                Ok(None) => warn!(job_id, "job feed event for missing row"),
                Err(e) => warn!(job_id, error = %e, "job feed row read failed"),
            }
        }
    }
}
