//! Work partitioning and per-node manifest generation.
//!
//! A manifest's first line is the scan dataset basename; each further
//! line is one sum-then-quantify unit as `pmc|readtype|detector`
//! fragments joined by commas. Combined mode sums both detectors into
//! one unit per PMC; separate mode emits one unit per detector.

use crate::scan::ScanFile;

/// Estimate how many compute nodes a run should fan out across.
/// Derived from spectra count and element count against the per-node
/// throughput of the worker binary, clamped to `1..=max_nodes`.
pub fn estimate_node_count(
    spectra_count: u32,
    element_count: u32,
    run_time_sec: u32,
    cores_per_node: u32,
    max_nodes: u32,
) -> u32 {
    let cost = f64::from(spectra_count) * f64::from(element_count + 3);
    let capacity = 3.0 * f64::from(run_time_sec.max(1)) * f64::from(cores_per_node.max(1));
    let estimate = (cost / capacity).round() as u32;
    estimate.clamp(1, max_nodes.max(1))
}

/// Split a PMC list into contiguous per-node slices of at most
/// `ceil(len / node_count)` entries. Input order is preserved.
pub fn chunk_pmcs(pmcs: &[i32], node_count: u32) -> Vec<Vec<i32>> {
    if pmcs.is_empty() {
        return Vec::new();
    }
    let node_count = node_count.max(1) as usize;
    let per_node = pmcs.len().div_ceil(node_count);
    pmcs.chunks(per_node).map(|c| c.to_vec()).collect()
}

fn unit_fragments(
    scan: &ScanFile,
    pmc: i32,
    detector: &str,
    include_dwells: bool,
    out: &mut Vec<String>,
) {
    out.push(format!("{}|Normal|{}", pmc, detector));
    if include_dwells && scan.has_dwell(pmc) {
        out.push(format!("{}|Dwell|{}", pmc, detector));
    }
}

/// Render one node's manifest for a PMC slice.
pub fn make_manifest(
    scan: &ScanFile,
    pmcs: &[i32],
    combined: bool,
    include_dwells: bool,
) -> String {
    let mut body = String::new();
    body.push_str(&scan.dataset_basename());
    body.push('\n');
    for &pmc in pmcs {
        if combined {
            let mut unit = Vec::new();
            unit.push(format!("{}|Normal|A", pmc));
            unit.push(format!("{}|Normal|B", pmc));
            if include_dwells && scan.has_dwell(pmc) {
                unit.push(format!("{}|Dwell|A", pmc));
                unit.push(format!("{}|Dwell|B", pmc));
            }
            body.push_str(&unit.join(","));
            body.push('\n');
        } else {
            for detector in ["A", "B"] {
                let mut unit = Vec::new();
                unit_fragments(scan, pmc, detector, include_dwells, &mut unit);
                body.push_str(&unit.join(","));
                body.push('\n');
            }
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::testutil::scan_with;

    #[test]
    fn combined_manifest_pairs_detectors_per_pmc() {
        let scan = scan_with("5x11", &[15, 7, 388], &[]);
        let body = make_manifest(&scan, &[15, 7, 388], true, false);
        assert_eq!(
            body,
            "5x11dataset.bin\n\
             15|Normal|A,15|Normal|B\n\
             7|Normal|A,7|Normal|B\n\
             388|Normal|A,388|Normal|B\n"
        );
    }

    #[test]
    fn separate_manifest_appends_dwells_within_detector_rows() {
        let scan = scan_with("5x11", &[15, 7, 388], &[15]);
        let body = make_manifest(&scan, &[15, 7, 388], false, true);
        assert_eq!(
            body,
            "5x11dataset.bin\n\
             15|Normal|A,15|Dwell|A\n\
             15|Normal|B,15|Dwell|B\n\
             7|Normal|A\n\
             7|Normal|B\n\
             388|Normal|A\n\
             388|Normal|B\n"
        );
    }

    #[test]
    fn combined_manifest_includes_dwell_pairs_when_enabled() {
        let scan = scan_with("s", &[15, 7], &[15]);
        let body = make_manifest(&scan, &[15, 7], true, true);
        assert_eq!(
            body,
            "sdataset.bin\n\
             15|Normal|A,15|Normal|B,15|Dwell|A,15|Dwell|B\n\
             7|Normal|A,7|Normal|B\n"
        );
    }

    #[test]
    fn node_estimate_scales_with_work_and_clamps() {
        // tiny run fits one node
        assert_eq!(estimate_node_count(3, 2, 30, 4, 40), 1);
        // heavy run wants many nodes
        let heavy = estimate_node_count(10_000, 10, 30, 4, 40);
        assert!(heavy > 1);
        assert!(heavy <= 40);
        // clamp to the ceiling
        assert_eq!(estimate_node_count(1_000_000, 30, 1, 1, 40), 40);
        // never zero
        assert_eq!(estimate_node_count(0, 0, 30, 4, 40), 1);
    }

    #[test]
    fn chunking_is_contiguous_and_order_preserving() {
        let chunks = chunk_pmcs(&[15, 7, 388, 2, 99], 2);
        assert_eq!(chunks, vec![vec![15, 7, 388], vec![2, 99]]);
        assert_eq!(chunk_pmcs(&[1, 2], 5), vec![vec![1], vec![2]]);
        assert!(chunk_pmcs(&[], 3).is_empty());
    }
}
