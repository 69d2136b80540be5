//! Region-of-interest quantification support.
//!
//! ROI runs sum each region's spectra into one unit, so a whole run
//! fits in a single manifest: one line per ROI per detector grouping,
//! prefixed `roiId:`. The worker returns one row per line; the
//! aggregator expands each row back to the ROI's member PMCs by
//! cross-referencing the `filename` column.

use crate::db::RoiRecord;
use crate::indexlist::decode_index_list;
use crate::scan::{ReadType, ScanFile};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;

/// Synthetic ROI covering every location with a normal spectrum. Must
/// sit at the bottom of any stacking order.
pub const REMAINING_POINTS_ID: &str = "RemainingPoints";
pub const ALL_POINTS_ID: &str = "AllPoints";

pub struct ResolvedRoi {
    pub roi_id: String,
    pub pmcs: Vec<i32>,
}

/// Map an ROI's encoded scan-entry indexes to PMCs, keeping only
/// locations that actually carry a normal or dwell spectrum.
pub fn resolve_roi(scan: &ScanFile, roi: &RoiRecord) -> Result<ResolvedRoi> {
    let indexes = decode_index_list(
        &roi.scan_entry_indexes_encoded,
        scan.entries.len() as i32,
    )
    .with_context(|| format!("roi {} has an invalid index list", roi.id))?;

    let mut pmcs = Vec::with_capacity(indexes.len());
    for idx in indexes {
        let pmc = scan
            .pmc_for_index(idx)
            .ok_or_else(|| anyhow!("roi {} index {} outside scan", roi.id, idx))?;
        if scan.has_spectrum(pmc, ReadType::Normal) || scan.has_spectrum(pmc, ReadType::Dwell) {
            pmcs.push(pmc);
        }
    }
    Ok(ResolvedRoi {
        roi_id: roi.id.clone(),
        pmcs,
    })
}

/// The synthetic all-points region.
pub fn resolve_remaining_points(scan: &ScanFile, roi_id: &str) -> ResolvedRoi {
    ResolvedRoi {
        roi_id: roi_id.to_string(),
        pmcs: scan.pmcs_with_normal(),
    }
}

pub fn is_all_points(roi_id: &str) -> bool {
    roi_id == REMAINING_POINTS_ID || roi_id == ALL_POINTS_ID
}

fn roi_line(
    scan: &ScanFile,
    roi: &ResolvedRoi,
    detectors: &[&str],
    include_dwells: bool,
) -> String {
    let mut fragments = Vec::new();
    for &pmc in &roi.pmcs {
        for det in detectors {
            fragments.push(format!("{}|Normal|{}", pmc, det));
        }
        if include_dwells && scan.has_dwell(pmc) {
            for det in detectors {
                fragments.push(format!("{}|Dwell|{}", pmc, det));
            }
        }
    }
    format!("{}:{}", roi.roi_id, fragments.join(","))
}

/// Single manifest covering every ROI in the run: one line per ROI in
/// combined mode, an A line then a B line in separate mode.
pub fn make_roi_manifest(
    scan: &ScanFile,
    rois: &[ResolvedRoi],
    combined: bool,
    include_dwells: bool,
) -> String {
    let mut body = String::new();
    body.push_str(&scan.dataset_basename());
    body.push('\n');
    for roi in rois {
        if combined {
            body.push_str(&roi_line(scan, roi, &["A", "B"], include_dwells));
            body.push('\n');
        } else {
            for det in ["A", "B"] {
                body.push_str(&roi_line(scan, roi, &[det], include_dwells));
                body.push('\n');
            }
        }
    }
    body
}

/// ROI id embedded in a worker output filename
/// `<READTYPE>_<DETECTOR>_<roiId>`.
fn roi_id_of_filename(filename: &str) -> Option<&str> {
    let rest = filename.split_once('_')?.1;
    Some(rest.split_once('_')?.1)
}

/// Expand the worker's one-row-per-ROI output into one row per member
/// PMC, rewriting the PMC column. A row whose stated PMC is not a
/// member of its ROI fails the whole aggregation.
pub fn expand_roi_csv(csv: &str, rois: &[ResolvedRoi]) -> Result<String> {
    let by_id: HashMap<&str, &ResolvedRoi> =
        rois.iter().map(|r| (r.roi_id.as_str(), r)).collect();

    let mut lines = csv.lines();
    let title = lines.next().context("output missing title row")?;
    let header = lines.next().context("output missing header row")?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let pmc_col = columns
        .iter()
        .position(|c| *c == "PMC")
        .context("output missing PMC column")?;
    let filename_col = columns
        .iter()
        .position(|c| *c == "filename")
        .context("output missing filename column")?;

    let mut out = String::new();
    out.push_str(title);
    out.push('\n');
    out.push_str(header);
    out.push('\n');

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != columns.len() {
            bail!("row width {} does not match header {}", fields.len(), columns.len());
        }
        let row_pmc: i32 = fields[pmc_col]
            .parse()
            .with_context(|| format!("bad PMC value: {}", fields[pmc_col]))?;
        let filename = fields[filename_col];
        let roi_id = roi_id_of_filename(filename)
            .ok_or_else(|| anyhow!("filename {} names no roi", filename))?;
        let roi = by_id
            .get(roi_id)
            .ok_or_else(|| anyhow!("filename {} references unknown roi {}", filename, roi_id))?;
        if !roi.pmcs.contains(&row_pmc) {
            bail!("row PMC {} is not a member of roi {}", row_pmc, roi_id);
        }
        for &pmc in &roi.pmcs {
            let row: Vec<String> = fields
                .iter()
                .enumerate()
                .map(|(i, f)| {
                    if i == pmc_col {
                        pmc.to_string()
                    } else {
                        f.to_string()
                    }
                })
                .collect();
            out.push_str(&row.join(","));
            out.push('\n');
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::testutil::scan_with;

    fn roi(id: &str, encoded: Vec<i32>) -> RoiRecord {
        RoiRecord {
            id: id.to_string(),
            scan_id: "5x11".to_string(),
            name: id.to_string(),
            scan_entry_indexes_encoded: encoded,
        }
    }

    #[test]
    fn roi_indexes_resolve_to_pmcs() {
        let scan = scan_with("5x11", &[7, 15, 388], &[]);
        let resolved = resolve_roi(&scan, &roi("roi1-id", vec![0, -1, 2])).unwrap();
        assert_eq!(resolved.pmcs, vec![7, 15, 388]);
    }

    #[test]
    fn out_of_bounds_roi_index_is_rejected() {
        let scan = scan_with("5x11", &[7, 15], &[]);
        assert!(resolve_roi(&scan, &roi("r", vec![0, 5])).is_err());
    }

    #[test]
    fn remaining_points_covers_all_normal_pmcs() {
        let scan = scan_with("5x11", &[7, 15, 388], &[]);
        let resolved = resolve_remaining_points(&scan, REMAINING_POINTS_ID);
        assert_eq!(resolved.pmcs, vec![7, 15, 388]);
        assert!(is_all_points(ALL_POINTS_ID));
        assert!(!is_all_points("roi1-id"));
    }

    #[test]
    fn roi_manifest_prefixes_lines_with_roi_id() {
        let scan = scan_with("5x11", &[7, 15], &[]);
        let rois = vec![ResolvedRoi {
            roi_id: "roi1-id".to_string(),
            pmcs: vec![7, 15],
        }];
        let combined = make_roi_manifest(&scan, &rois, true, false);
        assert_eq!(
            combined,
            "5x11dataset.bin\n\
             roi1-id:7|Normal|A,7|Normal|B,15|Normal|A,15|Normal|B\n"
        );
        let separate = make_roi_manifest(&scan, &rois, false, false);
        assert_eq!(
            separate,
            "5x11dataset.bin\n\
             roi1-id:7|Normal|A,15|Normal|A\n\
             roi1-id:7|Normal|B,15|Normal|B\n"
        );
    }

    #[test]
    fn roi_rows_expand_to_member_pmcs() {
        let rois = vec![ResolvedRoi {
            roi_id: "roi1-id".to_string(),
            pmcs: vec![7, 15, 388],
        }];
        let csv = "title\n\
                   PMC, Fe_%, filename, Fe_int, RTT\n\
                   15, 5.1, Normal_A_roi1-id, 400, 7890\n";
        let out = expand_roi_csv(csv, &rois).unwrap();
        let rows: Vec<&str> = out.lines().skip(2).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], "7,5.1,Normal_A_roi1-id,400,7890");
        assert_eq!(rows[1], "15,5.1,Normal_A_roi1-id,400,7890");
        assert_eq!(rows[2], "388,5.1,Normal_A_roi1-id,400,7890");
    }

    #[test]
    fn row_pmc_outside_roi_fails_aggregation() {
        let rois = vec![ResolvedRoi {
            roi_id: "roi1-id".to_string(),
            pmcs: vec![7, 15],
        }];
        let csv = "title\n\
                   PMC, Fe_%, filename\n\
                   388, 5.1, Normal_A_roi1-id\n";
        assert!(expand_roi_csv(csv, &rois).is_err());
    }
}
