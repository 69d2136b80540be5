//! # CLI execution functions
//!
//! Extracted from `main.rs` to keep the entry point slim. `run_serve`
//! wires every service an API instance carries; `run_convert` is the
//! offline codec path with no store or database involved.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use xrfcore::config::AppConfig;
use xrfcore::db::Database;
use xrfcore::filecache::{FileCache, SystemClock};
use xrfcore::gateway::{self, AppState};
use xrfcore::jobfeed::JobFeed;
use xrfcore::jobs::JobTracker;
use xrfcore::metrics::Metrics;
use xrfcore::notify::{LogMailer, NotificationRouter};
use xrfcore::objstore::{FsObjectStore, ObjectStore};
use xrfcore::quant::runner::{NullRunner, Runner, SubprocessRunner};
use xrfcore::quant::{convert, QuantContext};
use xrfcore::quantfile::QuantFile;
use xrfcore::scan::ScanFile;
use xrfcore::sessions::SessionRegistry;
use xrfcore::wire::{Update, WsMessage};

pub fn run_serve(port: u16, database_url: &str) -> Result<()> {
    let config = Arc::new(AppConfig::from_env());
    info!(
        instance_id = %config.instance_id,
        store_root = %config.store_root.display(),
        "xrfcore starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let db = Database::connect(database_url).await?;
        db.ensure_schema().await?;

        let store: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(config.store_root.clone()));
        let cache = Arc::new(FileCache::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            config.cache_dir.clone(),
            config.cache_max_bytes,
            config.cache_max_age_sec,
            config.data_bucket.clone(),
            config.users_bucket.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let notifier = NotificationRouter::new(
            db.clone(),
            Arc::clone(&sessions),
            Arc::new(LogMailer),
            config.instance_id.clone(),
        );
        let tracker = JobTracker::new(db.clone(), config.job_poll_interval_sec);
        let metrics = Arc::new(Metrics::new());

        let runner: Arc<dyn Runner> = if config.piquant_bin.is_empty() {
            info!("PIQUANT_BIN not set, using the fabricating runner");
            Arc::new(NullRunner)
        } else {
            info!(bin = %config.piquant_bin, "using local PIQUANT binary");
            Arc::new(SubprocessRunner::new(
                &config.piquant_bin,
                config.cores_per_node,
            ))
        };

        // Cross-instance progress: quant jobs originated elsewhere get
        // forwarded to the requestor's local sessions. Locally tracked
        // jobs are skipped; their watcher already pushes.
        let feed = JobFeed::new();
        {
            let sessions = Arc::clone(&sessions);
            let tracker = tracker.clone();
            feed.register(
                "quant",
                Arc::new(move |job| {
                    if tracker.is_tracked(&job.job_id) {
                        return;
                    }
                    let (found, _missing) =
                        sessions.sessions_for_users(&[job.requestor_user_id.clone()]);
                    for session_id in found {
                        sessions.send_to_session(
                            &session_id,
                            WsMessage::Update(Update::JobStatus(job.clone())),
                        );
                    }
                }),
            );
        }
        tokio::spawn(feed.run(db.clone()));

        // Election rows matter for seconds; sweep day-old ones hourly.
        {
            let db = db.clone();
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(std::time::Duration::from_secs(3600));
                loop {
                    tick.tick().await;
                    match db.prune_job_handlers(xrfcore::now_unix() - 86_400).await {
                        Ok(n) if n > 0 => info!(pruned = n, "election rows swept"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "election sweep failed"),
                    }
                }
            });
        }

        let ctx = QuantContext {
            config,
            db,
            store,
            cache,
            tracker,
            notifier,
            runner,
            metrics,
        };
        gateway::serve(AppState::new(ctx), port).await
    })
}

pub fn run_convert(input: &Path, output: &Path, scan_path: Option<&Path>) -> Result<()> {
    let data = std::fs::read(input)
        .with_context(|| format!("reading {}", input.display()))?;

    let to_csv = input.extension().is_some_and(|e| e == "bin");
    if to_csv {
        info!(input = %input.display(), "decoding quantification binary");
        let quant = QuantFile::from_bytes(&data)?;
        info!(
            detectors = quant.detector_names().len(),
            columns = quant.labels.len(),
            "decoded"
        );
        let csv = convert::quant_to_csv(&quant);
        std::fs::write(output, csv)
            .with_context(|| format!("writing {}", output.display()))?;
    } else {
        let csv = String::from_utf8(data).context("CSV input is not valid UTF-8")?;
        let scan = match scan_path {
            Some(p) => {
                let bytes = std::fs::read(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                Some(ScanFile::from_bytes(&bytes)?)
            }
            None => None,
        };
        info!(input = %input.display(), with_scan = scan.is_some(), "parsing quantification CSV");
        let quant = convert::csv_to_quant(&csv, scan.as_ref())?;
        info!(
            detectors = quant.detector_names().len(),
            columns = quant.labels.len(),
            "parsed"
        );
        std::fs::write(output, quant.to_bytes()?)
            .with_context(|| format!("writing {}", output.display()))?;
    }
    info!(output = %output.display(), "conversion complete");
    Ok(())
}
