//! Canonical object-store paths.
//!
//! Layout, per bucket:
//!
//! | Bucket | Path |
//! |---|---|
//! | data  | `Datasets/<scanId>/dataset.bin` |
//! | data  | `Datasets/<scanId>/diffraction-db.bin` |
//! | jobs  | `<scanId>/<userId>/params.json` |
//! | jobs  | `<scanId>/<jobId>/<nodeName>.pmcs` |
//! | jobs  | `<scanId>/<jobId>/output/<nodeName>.pmcs_result.csv` |
//! | jobs  | `<scanId>/<jobId>/piquant-logs/...` |
//! | users | `Quantifications/<scanId>/<userId>/<jobId>.bin|.csv` |
//! | users | `Quantifications/<scanId>/<userId>/<command>/LastOutput.csv|.log` |
//!
//! Paths are partitioned by scan id and user id so no two orchestrator
//! runs ever write to the same object.

pub const DATASET_FILE: &str = "dataset.bin";
pub const DIFFRACTION_FILE: &str = "diffraction-db.bin";

pub fn scan_dataset(scan_id: &str) -> String {
    format!("Datasets/{}/{}", scan_id, DATASET_FILE)
}

pub fn scan_diffraction(scan_id: &str) -> String {
    format!("Datasets/{}/{}", scan_id, DIFFRACTION_FILE)
}

pub fn job_params(scan_id: &str, user_id: &str) -> String {
    format!("{}/{}/params.json", scan_id, user_id)
}

pub fn job_manifest(scan_id: &str, job_id: &str, node_name: &str) -> String {
    format!("{}/{}/{}.pmcs", scan_id, job_id, node_name)
}

pub fn job_output(scan_id: &str, job_id: &str, node_name: &str) -> String {
    format!("{}/{}/output/{}.pmcs_result.csv", scan_id, job_id, node_name)
}

pub fn job_log_prefix(scan_id: &str, job_id: &str) -> String {
    format!("{}/{}/piquant-logs/", scan_id, job_id)
}

pub fn quant_binary(scan_id: &str, user_id: &str, job_id: &str) -> String {
    format!("Quantifications/{}/{}/{}.bin", scan_id, user_id, job_id)
}

pub fn quant_csv(scan_id: &str, user_id: &str, job_id: &str) -> String {
    format!("Quantifications/{}/{}/{}.csv", scan_id, user_id, job_id)
}

pub fn quant_log(scan_id: &str, user_id: &str, job_id: &str, log_name: &str) -> String {
    format!("Quantifications/{}/{}/{}-logs/{}", scan_id, user_id, job_id, log_name)
}

pub fn last_output_csv(scan_id: &str, user_id: &str, command: &str) -> String {
    format!("Quantifications/{}/{}/{}/LastOutput.csv", scan_id, user_id, command)
}

pub fn last_output_log(scan_id: &str, user_id: &str, command: &str) -> String {
    format!("Quantifications/{}/{}/{}/LastOutput.log", scan_id, user_id, command)
}

/// Node name for the nth manifest of a job, 1-based, zero-padded so
/// lexicographic listing matches node order.
pub fn node_name(index: usize) -> String {
    format!("node{:05}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_partitioned_by_scan_and_user() {
        assert_eq!(scan_dataset("5x11"), "Datasets/5x11/dataset.bin");
        assert_eq!(job_params("5x11", "u1"), "5x11/u1/params.json");
        assert_eq!(
            job_output("5x11", "quant-abc", "node00001"),
            "5x11/quant-abc/output/node00001.pmcs_result.csv"
        );
        assert_eq!(
            quant_binary("5x11", "u1", "quant-abc"),
            "Quantifications/5x11/u1/quant-abc.bin"
        );
        assert_eq!(
            last_output_csv("5x11", "u1", "quant"),
            "Quantifications/5x11/u1/quant/LastOutput.csv"
        );
    }

    #[test]
    fn node_names_sort_in_node_order() {
        assert_eq!(node_name(0), "node00001");
        assert_eq!(node_name(9), "node00010");
        assert!(node_name(9) > node_name(8));
    }
}
