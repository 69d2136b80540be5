//! Quantification run driver.
//!
//! `create_quant` validates the request, allocates a job and drives the
//! pipeline: snapshot → manifests → runner → gather → convert →
//! persist. A `map` run is tracked through the job registry and runs in
//! the background; a non-map run is an untracked one-node fit executed
//! inline, mirroring its raw output to a well-known last-output path.

use super::roi::{self, ResolvedRoi};
use super::runner::PiquantParams;
use super::{clean_log_name, combine, convert, partition, validate, QuantContext};
use crate::db::{make_owner_for_write, QuantSummary, QUANT_OBJECT_TYPE};
use crate::error::{ApiError, ApiResult};
use crate::filepaths;
use crate::indexlist::decode_index_list;
use crate::jobs::JobUpdateFn;
use crate::metrics::CommandLabel;
use crate::scan::ScanFile;
use crate::sessions::Principal;
use crate::wire::{
    JobState, JobStatusMsg, QuantCreateParams, QuantParams, SysEvent, Update, UserNotification,
    WsMessage,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Snapshot written to the jobs bucket so workers can self-configure
/// without calling back into the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantStartingParameters {
    pub user_params: QuantCreateParams,
    pub pmc_count: u32,
    pub node_count: u32,
    pub cores_per_node: u32,
    pub data_bucket: String,
    pub jobs_bucket: String,
    pub users_bucket: String,
    pub piquant_version: String,
    pub requestor_user_id: String,
    pub start_unix_sec: i64,
}

/// Validate a request, allocate a job and start the run. For `map` the
/// returned snapshot is STARTING and progress flows through the job
/// registry; for non-map the run completes before returning.
pub async fn create_quant(
    ctx: &QuantContext,
    requestor: &Principal,
    mut params: QuantCreateParams,
) -> ApiResult<JobStatusMsg> {
    validate::validate_create(&mut params)?;

    let pmcs = decode_index_list(&params.pmcs, -1)
        .map_err(|e| ApiError::BadRequest(format!("invalid PMC list: {}", e)))?;
    if pmcs.is_empty() && params.roi_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "no PMCs or ROIs selected".to_string(),
        ));
    }

    ctx.metrics
        .quant_jobs
        .get_or_create(&CommandLabel {
            command: params.command.clone(),
        })
        .inc();

    if params.command == "map" {
        if ctx
            .db
            .quant_name_exists(&requestor.user_id, &params.scan_id, &params.name)
            .await?
        {
            return Err(ApiError::BadRequest(format!(
                "a quantification named \"{}\" already exists for this scan",
                params.name
            )));
        }

        let on_update = session_push(ctx, requestor, &params.name);
        let job = ctx
            .tracker
            .add_job(
                "quant",
                "quant",
                &params.scan_id,
                &requestor.user_id,
                &params.name,
                params.elements.clone(),
                ctx.config.quant_timeout_sec,
                on_update,
            )
            .await?;

        let ctx = ctx.clone();
        let requestor = requestor.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = run_pipeline(&ctx, &job_id, &requestor, &params, &pmcs, true).await {
                warn!(job_id = %job_id, error = %e, "quantification failed");
                if let Err(e2) = ctx
                    .tracker
                    .complete_job(&job_id, false, &e.to_string(), "", Vec::new())
                    .await
                {
                    warn!(job_id = %job_id, error = %e2, "failure write failed");
                }
            }
        });
        return Ok(job);
    }

    // non-map: untracked one-node fit, run to completion here
    let job_id = format!("cmd-quant-{}", crate::random_id(16));
    let now = crate::now_unix();
    let mut job = JobStatusMsg {
        job_id: job_id.clone(),
        job_type: "quant".to_string(),
        job_item_id: params.scan_id.clone(),
        requestor_user_id: requestor.user_id.clone(),
        name: job_id.clone(),
        elements: params.elements.clone(),
        status: JobState::Starting,
        message: String::new(),
        start_unix_sec: now,
        last_update_unix_sec: now,
        end_unix_sec: 0,
        output_file_path: String::new(),
        log_id: String::new(),
        other_log_files: Vec::new(),
    };
    match run_pipeline(ctx, &job_id, requestor, &params, &pmcs, false).await {
        Ok(output_path) => {
            job.status = JobState::Complete;
            job.output_file_path = output_path;
        }
        Err(e) => {
            job.status = JobState::Error;
            job.message = e.to_string();
        }
    }
    job.end_unix_sec = crate::now_unix();
    job.last_update_unix_sec = job.end_unix_sec;
    Ok(job)
}

/// Per-job update callback: push every snapshot to the requestor's live
/// sessions, and on terminal snapshots route a completion notification.
fn session_push(ctx: &QuantContext, requestor: &Principal, quant_name: &str) -> JobUpdateFn {
    let notifier = ctx.notifier.clone();
    let metrics = Arc::clone(&ctx.metrics);
    let user_id = requestor.user_id.clone();
    let email = requestor.email.clone();
    let quant_name = quant_name.to_string();
    Arc::new(move |job: JobStatusMsg| {
        let msg = WsMessage::Update(Update::JobStatus(job.clone()));
        let (sessions, _) = notifier.sessions().sessions_for_users(std::slice::from_ref(&user_id));
        for session_id in sessions {
            notifier.sessions().send_to_session(&session_id, msg.clone());
        }
        if job.status.is_terminal() {
            let notifier = notifier.clone();
            let metrics = Arc::clone(&metrics);
            let user_id = user_id.clone();
            let email = email.clone();
            let quant_name = quant_name.clone();
            tokio::spawn(async move {
                let succeeded = job.status == JobState::Complete;
                let subject = format!(
                    "Quantification {} {}",
                    quant_name,
                    if succeeded { "completed" } else { "failed" }
                );
                let notification = UserNotification {
                    id: format!("quant-done-{}", job.job_id),
                    subject: subject.clone(),
                    contents: job.message.clone(),
                    from: "Data platform".to_string(),
                    link: format!("quant/{}", job.job_id),
                    timestamp_unix_sec: 0,
                    notification_type: "quant-complete".to_string(),
                };
                metrics.notifications.inc();
                if let Err(e) = notifier
                    .send_notification(std::slice::from_ref(&user_id), notification)
                    .await
                {
                    warn!(user_id = %user_id, error = %e, "completion notification failed");
                }
                if !email.is_empty() {
                    // Keyed by job id, so one email per job across the fleet.
                    let source_id = format!("email-{}", job.job_id);
                    if let Err(e) = notifier
                        .send_email_once(&source_id, email, subject, job.message.clone())
                        .await
                    {
                        warn!(job_id = %job.job_id, error = %e, "email election failed");
                    }
                }
            });
        }
    })
}

async fn load_scan(ctx: &QuantContext, scan_id: &str) -> Result<ScanFile> {
    let cache = Arc::clone(&ctx.cache);
    let id = scan_id.to_string();
    let bytes = tokio::task::spawn_blocking(move || cache.read_scan(&id)).await??;
    ScanFile::from_bytes(&bytes)
}

async fn resolve_rois(
    ctx: &QuantContext,
    scan: &ScanFile,
    params: &QuantCreateParams,
    pmcs: &[i32],
) -> Result<Vec<ResolvedRoi>> {
    if params.roi_ids.is_empty() {
        // non-map fit over an explicit selection
        return Ok(vec![ResolvedRoi {
            roi_id: "selection".to_string(),
            pmcs: pmcs.to_vec(),
        }]);
    }
    let mut rois = Vec::with_capacity(params.roi_ids.len());
    for roi_id in &params.roi_ids {
        if roi::is_all_points(roi_id) {
            rois.push(roi::resolve_remaining_points(scan, roi_id));
            continue;
        }
        let record = ctx
            .db
            .get_roi(roi_id)
            .await?
            .with_context(|| format!("roi {} not found", roi_id))?;
        rois.push(roi::resolve_roi(scan, &record)?);
    }
    Ok(rois)
}

/// The fan-out/fan-in pipeline proper. Returns the final output path.
async fn run_pipeline(
    ctx: &QuantContext,
    job_id: &str,
    requestor: &Principal,
    params: &QuantCreateParams,
    pmcs: &[i32],
    tracked: bool,
) -> Result<String> {
    if tracked {
        ctx.tracker
            .update_job(job_id, JobState::PreparingNodes, "Preparing nodes", "")
            .await?;
    }

    let scan = load_scan(ctx, &params.scan_id).await?;
    let combined = validate::is_combined(&params.quant_mode);
    let by_roi = validate::quant_by_roi(&params.command, &params.quant_mode);

    let mut manifest_paths = Vec::new();
    let mut rois = Vec::new();
    let pmc_count;
    if by_roi {
        rois = resolve_rois(ctx, &scan, params, pmcs).await?;
        pmc_count = rois.iter().map(|r| r.pmcs.len()).sum::<usize>() as u32;
        let body = roi::make_roi_manifest(&scan, &rois, combined, params.include_dwells);
        let path = filepaths::job_manifest(&params.scan_id, job_id, &filepaths::node_name(0));
        ctx.store
            .write(&ctx.config.jobs_bucket, &path, body.as_bytes())?;
        manifest_paths.push(path);
    } else {
        pmc_count = pmcs.len() as u32;
        let spectra_count = pmc_count * if combined { 1 } else { 2 };
        let node_count = if ctx.config.node_count_override > 0 {
            ctx.config.node_count_override
        } else if params.command != "map" {
            1
        } else {
            partition::estimate_node_count(
                spectra_count,
                params.elements.len() as u32,
                params.run_time_sec,
                ctx.config.cores_per_node,
                ctx.config.max_quant_nodes,
            )
        };
        for (i, chunk) in partition::chunk_pmcs(pmcs, node_count).iter().enumerate() {
            let body = partition::make_manifest(&scan, chunk, combined, params.include_dwells);
            let path = filepaths::job_manifest(&params.scan_id, job_id, &filepaths::node_name(i));
            ctx.store
                .write(&ctx.config.jobs_bucket, &path, body.as_bytes())?;
            manifest_paths.push(path);
        }
    }

    let snapshot = QuantStartingParameters {
        user_params: params.clone(),
        pmc_count,
        node_count: manifest_paths.len() as u32,
        cores_per_node: ctx.config.cores_per_node,
        data_bucket: ctx.config.data_bucket.clone(),
        jobs_bucket: ctx.config.jobs_bucket.clone(),
        users_bucket: ctx.config.users_bucket.clone(),
        piquant_version: ctx.config.piquant_version.clone(),
        requestor_user_id: requestor.user_id.clone(),
        start_unix_sec: crate::now_unix(),
    };
    ctx.store.write(
        &ctx.config.jobs_bucket,
        &filepaths::job_params(&params.scan_id, &requestor.user_id),
        &serde_json::to_vec_pretty(&snapshot)?,
    )?;

    if tracked {
        ctx.tracker
            .update_job(job_id, JobState::Running, "Nodes running", "")
            .await?;
    }

    let piquant = PiquantParams {
        piquant_version: ctx.config.piquant_version.clone(),
        command: params.command.clone(),
        scan_id: params.scan_id.clone(),
        job_id: job_id.to_string(),
        detector_config: params.detector_config.clone(),
        elements: params.elements.clone(),
        parameters: params.parameters.clone(),
        run_time_sec: params.run_time_sec,
        data_bucket: ctx.config.data_bucket.clone(),
        jobs_bucket: ctx.config.jobs_bucket.clone(),
        manifest_paths: manifest_paths.clone(),
        requestor_user_id: requestor.user_id.clone(),
    };
    let runner = Arc::clone(&ctx.runner);
    let store = Arc::clone(&ctx.store);
    tokio::task::spawn_blocking(move || runner.run_piquant(store.as_ref(), &piquant)).await??;

    if tracked {
        ctx.tracker
            .update_job(job_id, JobState::GatheringResults, "Gathering results", "")
            .await?;
    }

    let mut node_csvs = Vec::with_capacity(manifest_paths.len());
    for (i, _) in manifest_paths.iter().enumerate() {
        let path = filepaths::job_output(&params.scan_id, job_id, &filepaths::node_name(i));
        let bytes = ctx.store.read(&ctx.config.jobs_bucket, &path)?;
        node_csvs.push(String::from_utf8(bytes).context("node output is not utf-8")?);
    }

    let merged = if by_roi {
        roi::expand_roi_csv(&node_csvs[0], &rois)?
    } else {
        combine::combine_node_csvs(&node_csvs)?
    };

    if params.command == "map" {
        persist_map_output(ctx, job_id, requestor, params, &merged).await
    } else {
        persist_last_output(ctx, job_id, requestor, params, &node_csvs[0])
    }
}

/// Convert, store and register a map run's artifact; the summary and
/// its ownership row land in one transaction.
async fn persist_map_output(
    ctx: &QuantContext,
    job_id: &str,
    requestor: &Principal,
    params: &QuantCreateParams,
    merged_csv: &str,
) -> Result<String> {
    let quant = convert::csv_to_quant(merged_csv, Some(&load_scan(ctx, &params.scan_id).await?))?;

    let bin_path = filepaths::quant_binary(&params.scan_id, &requestor.user_id, job_id);
    let csv_path = filepaths::quant_csv(&params.scan_id, &requestor.user_id, job_id);
    ctx.store
        .write(&ctx.config.users_bucket, &bin_path, &quant.to_bytes()?)?;
    ctx.store
        .write(&ctx.config.users_bucket, &csv_path, merged_csv.as_bytes())?;

    // log copy failure never fails a completed job
    let mut log_names = Vec::new();
    let log_prefix = filepaths::job_log_prefix(&params.scan_id, job_id);
    match ctx.store.list(&ctx.config.jobs_bucket, &log_prefix) {
        Ok(logs) => {
            for log_path in logs {
                let base = log_path.rsplit('/').next().unwrap_or(&log_path);
                let clean = clean_log_name(base);
                let dst =
                    filepaths::quant_log(&params.scan_id, &requestor.user_id, job_id, &clean);
                match ctx
                    .store
                    .copy(&ctx.config.jobs_bucket, &log_path, &ctx.config.users_bucket, &dst)
                {
                    Ok(()) => log_names.push(clean),
                    Err(e) => warn!(job_id, log = %log_path, error = %e, "log copy failed"),
                }
            }
        }
        Err(e) => warn!(job_id, error = %e, "log listing failed"),
    }

    ctx.tracker
        .complete_job(job_id, true, "Quantification complete", &bin_path, log_names)
        .await?;
    let status = ctx
        .db
        .get_job(job_id)
        .await?
        .with_context(|| format!("job {} vanished at completion", job_id))?;

    let summary = QuantSummary {
        id: job_id.to_string(),
        scan_id: params.scan_id.clone(),
        name: params.name.clone(),
        requestor_user_id: requestor.user_id.clone(),
        elements: quant.elements(),
        status,
        params: QuantParams::Map(params.clone()),
    };
    let ownership = make_owner_for_write(
        job_id,
        QUANT_OBJECT_TYPE,
        &requestor.user_id,
        crate::now_unix(),
    );
    ctx.db.insert_quant_with_ownership(&summary, &ownership).await?;
    ctx.notifier.sys_notify(SysEvent::QuantChanged);
    info!(job_id, scan_id = %params.scan_id, "quantification stored");
    Ok(bin_path)
}

/// Non-map runs overwrite a per-(user, scan, command) last-output pair
/// instead of registering a summary.
fn persist_last_output(
    ctx: &QuantContext,
    job_id: &str,
    requestor: &Principal,
    params: &QuantCreateParams,
    raw_csv: &str,
) -> Result<String> {
    let csv_path =
        filepaths::last_output_csv(&params.scan_id, &requestor.user_id, &params.command);
    ctx.store
        .write(&ctx.config.users_bucket, &csv_path, raw_csv.as_bytes())?;

    let log_prefix = filepaths::job_log_prefix(&params.scan_id, job_id);
    if let Some(first_log) = ctx
        .store
        .list(&ctx.config.jobs_bucket, &log_prefix)?
        .into_iter()
        .next()
    {
        let dst = filepaths::last_output_log(&params.scan_id, &requestor.user_id, &params.command);
        ctx.store
            .copy(&ctx.config.jobs_bucket, &first_log, &ctx.config.users_bucket, &dst)?;
    }
    info!(job_id, path = %csv_path, "fit output mirrored");
    Ok(csv_path)
}
