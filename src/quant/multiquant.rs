//! Multi-quantification composition and comparison.
//!
//! A z-stack is an ordered list of `(roi, quant)` layers, top first;
//! the synthetic `RemainingPoints` layer sits at the bottom. Each PMC
//! takes its row from the topmost layer containing it. The composite is
//! serialized back to CSV, converted to the columnar binary and
//! registered as a new quantification owned by the requestor.

use super::roi::{self, ResolvedRoi};
use super::{convert, QuantContext};
use crate::db::{make_owner_for_write, QuantSummary, QUANT_OBJECT_TYPE};
use crate::error::{ApiError, ApiResult};
use crate::filepaths;
use crate::quantfile::{ColumnValue, QuantFile};
use crate::scan::ScanFile;
use crate::sessions::Principal;
use crate::wire::{
    JobStatusMsg, MultiQuantCombineParams, QuantComparisonTable, QuantParams, SysEvent,
};
use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

pub struct QuantLayer {
    pub roi_id: String,
    pub pmcs: Vec<i32>,
    pub quant: QuantFile,
}

const MISSING: f32 = -1.0;

fn value_as_f32(v: &ColumnValue) -> f32 {
    match v {
        ColumnValue::F(f) => *f,
        ColumnValue::I(i) => *i as f32,
        ColumnValue::S(_) => MISSING,
    }
}

fn column_value(quant: &QuantFile, label: &str, values: &[ColumnValue]) -> f32 {
    quant
        .labels
        .iter()
        .position(|l| l == label)
        .and_then(|i| values.get(i))
        .map(value_as_f32)
        .unwrap_or(MISSING)
}

/// Merge an ordered z-stack into one CSV. Layers are applied bottom-up
/// so that the topmost (first) layer containing a PMC wins.
pub fn combine_layers(layers: &[QuantLayer]) -> Result<String> {
    let first = layers.first().ok_or_else(|| anyhow!("empty z-stack"))?;
    let detector_names = first.quant.detector_names();
    for layer in layers {
        if layer.quant.detector_names() != detector_names {
            bail!(
                "quant for roi {} has a different detector set",
                layer.roi_id
            );
        }
    }

    let mut element_cols: Vec<String> = layers
        .iter()
        .flat_map(|l| l.quant.labels.iter())
        .filter(|l| l.ends_with("_%"))
        .cloned()
        .collect();
    element_cols.sort();
    element_cols.dedup();
    if element_cols.is_empty() {
        bail!("no weight-percent columns in any layer");
    }

    let mut csv = String::from("Combined multi-quantification\n");
    csv.push_str("PMC, RTT, SCLK, filename, livetime");
    for col in &element_cols {
        csv.push_str(", ");
        csv.push_str(col);
    }
    csv.push('\n');

    for detector in &detector_names {
        // bottom-up: later (higher) layers overwrite
        let mut rows: BTreeMap<i32, String> = BTreeMap::new();
        for layer in layers.iter().rev() {
            let Some(set) = layer
                .quant
                .detectors
                .iter()
                .find(|d| &d.detector == detector)
            else {
                continue;
            };
            for &pmc in &layer.pmcs {
                let Some(rec) = set.records.iter().find(|r| r.pmc == pmc) else {
                    continue;
                };
                let mut row = format!(
                    "{}, {}, {}, Normal_{}_{}, {}",
                    pmc,
                    rec.rtt,
                    rec.sclk,
                    detector,
                    layer.roi_id,
                    ColumnValue::F(column_value(&layer.quant, "livetime", &rec.values))
                        .to_csv_field()
                );
                for col in &element_cols {
                    row.push_str(", ");
                    row.push_str(
                        &ColumnValue::F(column_value(&layer.quant, col, &rec.values))
                            .to_csv_field(),
                    );
                }
                rows.insert(pmc, row);
            }
        }
        for row in rows.values() {
            csv.push_str(row);
            csv.push('\n');
        }
    }
    Ok(csv)
}

/// Per-quant average weight percent over an ROI. Only combined-detector
/// quantifications compare meaningfully.
pub fn compare_tables(
    roi_pmcs: &[i32],
    quants: &[(String, String, QuantFile)],
) -> Result<Vec<QuantComparisonTable>> {
    let mut tables = Vec::with_capacity(quants.len());
    for (quant_id, name, quant) in quants {
        if quant.detector_names() != vec!["Combined".to_string()] {
            bail!("quant {} is not a combined-detector quantification", quant_id);
        }
        let set = &quant.detectors[0];
        let matched: Vec<_> = set
            .records
            .iter()
            .filter(|r| roi_pmcs.contains(&r.pmc))
            .collect();
        let mut element_weights = Vec::new();
        for (i, label) in quant.labels.iter().enumerate() {
            if !label.ends_with("_%") {
                continue;
            }
            let total: f32 = matched
                .iter()
                .map(|r| r.values.get(i).map(value_as_f32).unwrap_or(MISSING))
                .sum();
            // Averaged over the full ROI membership; PMCs the quant
            // never covered drag the mean down rather than vanishing.
            let avg = if roi_pmcs.is_empty() {
                0.0
            } else {
                total / roi_pmcs.len() as f32
            };
            element_weights.push((label.clone(), avg));
        }
        tables.push(QuantComparisonTable {
            quant_id: quant_id.clone(),
            quant_name: name.clone(),
            element_weights,
        });
    }
    Ok(tables)
}

async fn load_quant_file(
    ctx: &QuantContext,
    user_id: &str,
    quant_id: &str,
) -> ApiResult<(QuantSummary, QuantFile)> {
    ctx.db.check_access(user_id, quant_id, false).await?;
    let summary = ctx
        .db
        .get_quant(quant_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("quant {}", quant_id)))?;
    let path = summary.status.output_file_path.clone();
    let cache = Arc::clone(&ctx.cache);
    let id = quant_id.to_string();
    let bytes = tokio::task::spawn_blocking(move || cache.read_quant(&id, &path))
        .await
        .map_err(|e| ApiError::Server(e.into()))??;
    let quant = QuantFile::from_bytes(&bytes)?;
    Ok((summary, quant))
}

async fn load_scan(ctx: &QuantContext, scan_id: &str) -> ApiResult<ScanFile> {
    let cache = Arc::clone(&ctx.cache);
    let id = scan_id.to_string();
    let bytes = tokio::task::spawn_blocking(move || cache.read_scan(&id))
        .await
        .map_err(|e| ApiError::Server(e.into()))??;
    Ok(ScanFile::from_bytes(&bytes)?)
}

async fn resolve_layer_roi(
    ctx: &QuantContext,
    scan: &ScanFile,
    roi_id: &str,
) -> ApiResult<ResolvedRoi> {
    if roi::is_all_points(roi_id) {
        return Ok(roi::resolve_remaining_points(scan, roi_id));
    }
    let record = ctx
        .db
        .get_roi(roi_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("roi {}", roi_id)))?;
    Ok(roi::resolve_roi(scan, &record)?)
}

/// Build and persist a composite quantification from a z-stack.
pub async fn combine(
    ctx: &QuantContext,
    requestor: &Principal,
    params: MultiQuantCombineParams,
) -> ApiResult<JobStatusMsg> {
    if params.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".to_string()));
    }
    if params.z_stack.len() < 2 {
        return Err(ApiError::BadRequest(
            "z-stack needs at least two layers".to_string(),
        ));
    }
    for (i, layer) in params.z_stack.iter().enumerate() {
        if roi::is_all_points(&layer.roi_id) && i + 1 != params.z_stack.len() {
            return Err(ApiError::BadRequest(
                "RemainingPoints must be the last layer".to_string(),
            ));
        }
    }

    let scan = load_scan(ctx, &params.scan_id).await?;

    let mut layers = Vec::with_capacity(params.z_stack.len());
    for entry in &params.z_stack {
        let resolved = resolve_layer_roi(ctx, &scan, &entry.roi_id).await?;
        let (_, quant) = load_quant_file(ctx, &requestor.user_id, &entry.quant_id).await?;
        layers.push(QuantLayer {
            roi_id: entry.roi_id.clone(),
            pmcs: resolved.pmcs,
            quant,
        });
    }

    let job = ctx
        .tracker
        .add_job(
            "quant",
            "multiquant",
            &params.scan_id,
            &requestor.user_id,
            &params.name,
            Vec::new(),
            ctx.config.quant_timeout_sec,
            Arc::new(|_| {}),
        )
        .await?;

    let csv = combine_layers(&layers)?;
    let quant = convert::csv_to_quant(&csv, None)?;

    let bin_path = filepaths::quant_binary(&params.scan_id, &requestor.user_id, &job.job_id);
    let csv_path = filepaths::quant_csv(&params.scan_id, &requestor.user_id, &job.job_id);
    ctx.store
        .write(&ctx.config.users_bucket, &bin_path, &quant.to_bytes()?)
        .map_err(|e| ApiError::Server(e.into()))?;
    ctx.store
        .write(&ctx.config.users_bucket, &csv_path, csv.as_bytes())
        .map_err(|e| ApiError::Server(e.into()))?;

    ctx.tracker
        .complete_job(&job.job_id, true, "combined", &bin_path, Vec::new())
        .await?;
    let status = ctx
        .db
        .get_job(&job.job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {}", job.job_id)))?;

    let summary = QuantSummary {
        id: job.job_id.clone(),
        scan_id: params.scan_id.clone(),
        name: params.name.clone(),
        requestor_user_id: requestor.user_id.clone(),
        elements: quant.elements(),
        status: status.clone(),
        params: QuantParams::MultiQuant {
            description: params.description.clone(),
            z_stack: params.z_stack.clone(),
        },
    };
    let ownership = make_owner_for_write(
        &summary.id,
        QUANT_OBJECT_TYPE,
        &requestor.user_id,
        crate::now_unix(),
    );
    ctx.db.insert_quant_with_ownership(&summary, &ownership).await?;
    ctx.notifier.sys_notify(SysEvent::QuantChanged);
    info!(quant_id = %summary.id, scan_id = %params.scan_id, "multi-quant created");

    Ok(status)
}

/// Per-element averages over an ROI for each selected quantification.
pub async fn compare(
    ctx: &QuantContext,
    requestor: &Principal,
    scan_id: &str,
    roi_id: &str,
    quant_ids: &[String],
) -> ApiResult<Vec<QuantComparisonTable>> {
    if quant_ids.is_empty() {
        return Err(ApiError::BadRequest("no quants selected".to_string()));
    }
    let scan = load_scan(ctx, scan_id).await?;
    let resolved = resolve_layer_roi(ctx, &scan, roi_id).await?;

    for quant_id in quant_ids {
        ctx.db.check_access(&requestor.user_id, quant_id, false).await?;
    }
    let mut by_id: BTreeMap<String, QuantSummary> = ctx
        .db
        .get_quants_by_ids(quant_ids)
        .await?
        .into_iter()
        .map(|s| (s.id.clone(), s))
        .collect();

    let mut quants = Vec::with_capacity(quant_ids.len());
    for quant_id in quant_ids {
        let summary = by_id
            .remove(quant_id)
            .ok_or_else(|| ApiError::NotFound(format!("quant {}", quant_id)))?;
        let path = summary.status.output_file_path.clone();
        let cache = Arc::clone(&ctx.cache);
        let id = quant_id.clone();
        let bytes = tokio::task::spawn_blocking(move || cache.read_quant(&id, &path))
            .await
            .map_err(|e| ApiError::Server(e.into()))??;
        quants.push((quant_id.clone(), summary.name, QuantFile::from_bytes(&bytes)?));
    }
    let tables = compare_tables(&resolved.pmcs, &quants)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantfile::{ColumnType, DetectorSet, QuantRecord};

    fn quant_for(pmc_weights: &[(i32, f32)], detector: &str) -> QuantFile {
        QuantFile {
            title: "t".to_string(),
            labels: vec!["Fe_%".to_string(), "livetime".to_string()],
            types: vec![ColumnType::Float, ColumnType::Float],
            detectors: vec![DetectorSet {
                detector: detector.to_string(),
                records: pmc_weights
                    .iter()
                    .map(|&(pmc, w)| QuantRecord {
                        pmc,
                        sclk: 100,
                        rtt: 7890,
                        filename: format!("Normal_{}", detector),
                        values: vec![ColumnValue::F(w), ColumnValue::F(9.9)],
                    })
                    .collect(),
            }],
        }
    }

    #[test]
    fn top_layer_wins_for_shared_pmcs() {
        let layers = vec![
            QuantLayer {
                roi_id: "top".to_string(),
                pmcs: vec![1, 2],
                quant: quant_for(&[(1, 10.0), (2, 10.0)], "Combined"),
            },
            QuantLayer {
                roi_id: "RemainingPoints".to_string(),
                pmcs: vec![1, 2, 3],
                quant: quant_for(&[(1, 99.0), (2, 99.0), (3, 99.0)], "Combined"),
            },
        ];
        let csv = combine_layers(&layers).unwrap();
        let rows: Vec<&str> = csv.lines().skip(2).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("1,") && rows[0].contains("Normal_Combined_top"));
        assert!(rows[0].ends_with("10.0"));
        assert!(rows[1].starts_with("2,") && rows[1].ends_with("10.0"));
        assert!(
            rows[2].starts_with("3,") && rows[2].contains("Normal_Combined_RemainingPoints")
        );
        assert!(rows[2].ends_with("99.0"));
    }

    #[test]
    fn mismatched_detector_sets_are_rejected() {
        let layers = vec![
            QuantLayer {
                roi_id: "a".to_string(),
                pmcs: vec![1],
                quant: quant_for(&[(1, 1.0)], "Combined"),
            },
            QuantLayer {
                roi_id: "b".to_string(),
                pmcs: vec![2],
                quant: quant_for(&[(2, 1.0)], "A"),
            },
        ];
        assert!(combine_layers(&layers).is_err());
    }

    #[test]
    fn missing_element_columns_fill_with_sentinel() {
        let mut other = quant_for(&[(5, 3.0)], "Combined");
        other.labels[0] = "Ca_%".to_string();
        let layers = vec![
            QuantLayer {
                roi_id: "a".to_string(),
                pmcs: vec![1],
                quant: quant_for(&[(1, 2.0)], "Combined"),
            },
            QuantLayer {
                roi_id: "RemainingPoints".to_string(),
                pmcs: vec![5],
                quant: other,
            },
        ];
        let csv = combine_layers(&layers).unwrap();
        // header carries the union of element columns, sorted
        assert!(csv.lines().nth(1).unwrap().ends_with("Ca_%, Fe_%"));
        let row1 = csv.lines().nth(2).unwrap();
        // pmc 1 has Fe but no Ca
        assert!(row1.contains(", -1.0, 2.0"));
    }

    #[test]
    fn comparison_averages_over_roi_members() {
        let quants = vec![(
            "q1".to_string(),
            "first".to_string(),
            quant_for(&[(1, 4.0), (2, 8.0), (9, 100.0)], "Combined"),
        )];
        let tables = compare_tables(&[1, 2], &quants).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].element_weights, vec![("Fe_%".to_string(), 6.0)]);

        // The divisor is the ROI membership count, so an uncovered
        // member dilutes the average instead of being ignored.
        let tables = compare_tables(&[1, 2, 4], &quants).unwrap();
        assert_eq!(tables[0].element_weights, vec![("Fe_%".to_string(), 4.0)]);
    }

    #[test]
    fn comparison_requires_combined_detector() {
        let quants = vec![(
            "q1".to_string(),
            "first".to_string(),
            quant_for(&[(1, 4.0)], "A"),
        )];
        assert!(compare_tables(&[1], &quants).is_err());
    }
}
