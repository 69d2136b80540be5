//! Object downloads over plain HTTP.
//!
//! Large artifacts (scan binaries, quant CSVs, worker logs) bypass the
//! socket and stream straight from the object store. Routing requires a
//! literal `download` path segment, and only GET is mounted. Responses
//! default to a short client cache; when the caller pins a version with
//! `?v=` the body is immutable and gets a long cache plus an ETag.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::auth::RequireAuth;
use super::AppState;
use crate::objstore::StoreError;

const CACHE_SHORT_SEC: u32 = 300;
const CACHE_LONG_SEC: u32 = 604_800;

/// What a users-bucket path must be authorized against.
#[derive(Debug)]
enum QuantTarget {
    /// An artifact of a registered quantification; the job id is the
    /// ownership object.
    Quant(String),
    /// A per-user LastOutput file; only its owner may fetch it.
    UserScoped(String),
}

/// Pick the ownership id out of a quant path. Artifacts sit at
/// `Quantifications/<scanId>/<userId>/<jobId>.bin|.csv` with their logs
/// under `<jobId>-logs/`; anything deeper is a per-user LastOutput pair.
fn quant_target(path: &str) -> Option<QuantTarget> {
    let mut parts = path.split('/');
    if parts.next()? != "Quantifications" {
        return None;
    }
    let _scan_id = parts.next()?;
    let user_id = parts.next()?;
    let tail = parts.next()?;
    if let Some(stem) = tail.strip_suffix(".bin").or_else(|| tail.strip_suffix(".csv")) {
        if parts.next().is_none() {
            return Some(QuantTarget::Quant(stem.to_string()));
        }
    }
    if let Some(stem) = tail.strip_suffix("-logs") {
        return Some(QuantTarget::Quant(stem.to_string()));
    }
    Some(QuantTarget::UserScoped(user_id.to_string()))
}

#[derive(Deserialize)]
pub(super) struct DownloadQuery {
    /// Version tag; presence means the object at this path is immutable.
    #[serde(default)]
    v: String,
}

pub(super) async fn handler_download(
    RequireAuth(principal): RequireAuth,
    Path((resource, path)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let bucket = match resource.as_str() {
        "scan" => state.ctx.config.data_bucket.clone(),
        "quant" => state.ctx.config.users_bucket.clone(),
        "job" => state.ctx.config.jobs_bucket.clone(),
        _ => {
            return (StatusCode::NOT_FOUND, "unknown resource").into_response();
        }
    };

    if resource == "quant" {
        match quant_target(&path) {
            Some(QuantTarget::Quant(quant_id)) => {
                if let Err(e) = state
                    .ctx
                    .db
                    .check_access(&principal.user_id, &quant_id, false)
                    .await
                {
                    return (StatusCode::FORBIDDEN, e.to_string()).into_response();
                }
            }
            Some(QuantTarget::UserScoped(owner)) => {
                if owner != principal.user_id {
                    return (StatusCode::FORBIDDEN, "not your output").into_response();
                }
            }
            None => {
                return (StatusCode::BAD_REQUEST, "malformed quant path").into_response();
            }
        }
    }

    let store = Arc::clone(&state.ctx.store);
    let read_path = path.clone();
    let result =
        tokio::task::spawn_blocking(move || store.read(&bucket, &read_path)).await;
    let data = match result {
        Ok(Ok(data)) => data,
        Ok(Err(StoreError::NotFound { .. })) => {
            return (StatusCode::NOT_FOUND, "object not found").into_response();
        }
        Ok(Err(e)) => {
            warn!(resource, path, error = %e, "download read failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response();
        }
        Err(e) => {
            warn!(resource, path, error = %e, "download task failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response();
        }
    };

    let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();
    let mut headers = vec![
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        ),
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_string(),
        ),
    ];
    if query.v.is_empty() {
        headers.push((
            header::CACHE_CONTROL,
            format!("max-age={}", CACHE_SHORT_SEC),
        ));
    } else {
        headers.push((header::CACHE_CONTROL, format!("max-age={}", CACHE_LONG_SEC)));
        headers.push((header::ETAG, format!("\"{}\"", query.v)));
    }

    let mut response = (StatusCode::OK, data).into_response();
    for (name, value) in headers {
        match value.parse() {
            Ok(v) => {
                response.headers_mut().insert(name, v);
            }
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "invalid header value").into_response();
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filepaths;

    fn quant_id_of(path: &str) -> Option<String> {
        match quant_target(path)? {
            QuantTarget::Quant(id) => Some(id),
            QuantTarget::UserScoped(_) => None,
        }
    }

    #[test]
    fn quant_artifacts_authorize_against_job_id_not_scan_id() {
        let path = filepaths::quant_binary("5x11", "u1", "quant-abc");
        assert_eq!(quant_id_of(&path).as_deref(), Some("quant-abc"));
        let path = filepaths::quant_csv("5x11", "u1", "quant-abc");
        assert_eq!(quant_id_of(&path).as_deref(), Some("quant-abc"));
    }

    #[test]
    fn quant_logs_authorize_against_job_id() {
        let path = filepaths::quant_log("5x11", "u1", "quant-abc", "node00001_stdout.log");
        assert_eq!(quant_id_of(&path).as_deref(), Some("quant-abc"));
    }

    #[test]
    fn last_output_paths_are_owner_scoped() {
        let path = filepaths::last_output_csv("5x11", "u1", "quant");
        match quant_target(&path) {
            Some(QuantTarget::UserScoped(owner)) => assert_eq!(owner, "u1"),
            other => panic!("wrong target for {}: {:?}", path, other),
        }
        let path = filepaths::last_output_log("5x11", "u1", "quant");
        assert!(matches!(
            quant_target(&path),
            Some(QuantTarget::UserScoped(ref o)) if o == "u1"
        ));
    }

    #[test]
    fn malformed_quant_paths_are_rejected() {
        assert!(quant_target("Datasets/5x11/dataset.bin").is_none());
        assert!(quant_target("Quantifications/5x11/u1").is_none());
        assert!(quant_target("").is_none());
    }
}
