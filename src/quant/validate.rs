//! Request validation for quantification runs.
//!
//! The free-text `parameters` field ends up in the worker's argument
//! list, so it is allowlist-filtered before anything else looks at it.

use crate::error::{ApiError, ApiResult};
use crate::wire::QuantCreateParams;
use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_QUANT_MODE: &str = "CombinedAB";

const QUANT_MODES: &[&str] = &[
    "CombinedAB",
    "SeparateAB",
    "CombinedAB-ROIBulk",
    "SeparateAB-ROIBulk",
    "AB-ManualUpload",
    "Combined-ManualUpload",
];

/// Characters permitted in pass-through worker parameters. Anything a
/// shell could interpret is absent.
fn params_allowed(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"^[A-Za-z0-9 \-.,_"]+$"#).expect("static pattern"));
    s.is_empty() || re.is_match(s)
}

/// Normalize and validate a create request in place. The empty quant
/// mode defaults to combined; a non-map command never carries a name.
pub fn validate_create(params: &mut QuantCreateParams) -> ApiResult<()> {
    match params.command.as_str() {
        "map" => {
            if params.name.trim().is_empty() {
                return Err(ApiError::BadRequest("name must not be empty".to_string()));
            }
        }
        "quant" => {
            params.name.clear();
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "unexpected command: {}",
                other
            )));
        }
    }

    if params.scan_id.is_empty() {
        return Err(ApiError::BadRequest("scan id must not be empty".to_string()));
    }
    if params.elements.is_empty() {
        return Err(ApiError::BadRequest(
            "must include at least one element".to_string(),
        ));
    }

    let mut config_parts = params.detector_config.split('/');
    let family = config_parts.next().unwrap_or("");
    let version = config_parts.next().unwrap_or("");
    if family.is_empty() || version.is_empty() || config_parts.next().is_some() {
        return Err(ApiError::BadRequest(format!(
            "invalid detector config: {}",
            params.detector_config
        )));
    }

    if params.run_time_sec < 1 {
        return Err(ApiError::BadRequest(format!(
            "invalid run time: {}",
            params.run_time_sec
        )));
    }

    if params.quant_mode.is_empty() {
        params.quant_mode = DEFAULT_QUANT_MODE.to_string();
    }
    if !QUANT_MODES.contains(&params.quant_mode.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "invalid quant mode: {}",
            params.quant_mode
        )));
    }

    if !params_allowed(&params.parameters) {
        return Err(ApiError::BadRequest(format!(
            "invalid characters in parameters: {}",
            params.parameters
        )));
    }

    Ok(())
}

/// True when both detectors are summed into one spectrum per unit.
pub fn is_combined(quant_mode: &str) -> bool {
    quant_mode.starts_with("Combined")
}

/// True when the run quantifies whole regions instead of individual PMCs.
pub fn quant_by_roi(command: &str, quant_mode: &str) -> bool {
    quant_mode.ends_with("-ROIBulk") || command != "map"
}
