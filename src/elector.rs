//! Single-instance election for fleet-wide side effects.
//!
//! Every instance that observes an event calls `handle_once`; exactly
//! one ends up running the callback. The algorithm leans on the store's
//! linearizable single-row upsert: write your claim, wait out write
//! propagation, re-read, and proceed only if your claim survived
//! (last writer wins). The 2 s wait must exceed worst-case propagation.

use crate::db::Database;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const ELECTION_WAIT: Duration = Duration::from_secs(2);

/// Claim `job_id` for this instance; if the claim wins, spawn `cb`.
/// Returns whether this instance won.
pub async fn handle_once<F, Fut>(
    db: &Database,
    job_id: &str,
    instance_id: &str,
    cb: F,
) -> Result<bool>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    db.upsert_job_handler(job_id, instance_id, crate::now_unix())
        .await?;
    tokio::time::sleep(ELECTION_WAIT).await;
    let winner = db.get_job_handler(job_id).await?;
    match winner.as_deref() {
        Some(w) if w == instance_id => {
            debug!(job_id, instance_id, "election won");
            tokio::spawn(cb());
            Ok(true)
        }
        Some(_) => {
            debug!(job_id, instance_id, "election lost");
            Ok(false)
        }
        None => {
            // Row swept between upsert and read; treat as lost.
            warn!(job_id, "election row missing on re-read");
            Ok(false)
        }
    }
}
