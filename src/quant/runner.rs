//! Compute-runner seam.
//!
//! The orchestrator never shells out directly; it hands a
//! [`PiquantParams`] to whatever [`Runner`] the deployment binds
//! (subprocess, container scheduler, managed batch service). The
//! contract: for every manifest `<scanId>/<jobId>/<node>.pmcs` the
//! runner writes `<scanId>/<jobId>/output/<node>.pmcs_result.csv` plus
//! log files under `<scanId>/<jobId>/piquant-logs/`.

use crate::filepaths;
use crate::objstore::ObjectStore;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiquantParams {
    pub piquant_version: String,
    pub command: String,
    pub scan_id: String,
    pub job_id: String,
    pub detector_config: String,
    pub elements: Vec<String>,
    pub parameters: String,
    pub run_time_sec: u32,
    pub data_bucket: String,
    pub jobs_bucket: String,
    pub manifest_paths: Vec<String>,
    pub requestor_user_id: String,
}

pub trait Runner: Send + Sync {
    /// Blocking; the orchestrator calls this from a blocking task.
    fn run_piquant(&self, store: &dyn ObjectStore, params: &PiquantParams) -> Result<()>;
}

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Execs the PIQUANT binary locally, one invocation per manifest.
/// Suits single-box deployments; fleet deployments bind a scheduler
/// runner instead.
///
/// Invocation:
/// `<bin> <command> <detectorConfig> <dataset> <pmcs> <elements>
///  [userParams..] -t,<cores> <output>`
pub struct SubprocessRunner {
    binary: PathBuf,
    cores_per_node: u32,
}

impl SubprocessRunner {
    pub fn new(binary: impl Into<PathBuf>, cores_per_node: u32) -> Self {
        SubprocessRunner {
            binary: binary.into(),
            cores_per_node: cores_per_node.max(1),
        }
    }

    fn run_all(
        &self,
        store: &dyn ObjectStore,
        params: &PiquantParams,
        work: &Path,
    ) -> Result<()> {
        let dataset_path = work.join(filepaths::DATASET_FILE);
        let dataset = store.read(
            &params.data_bucket,
            &filepaths::scan_dataset(&params.scan_id),
        )?;
        std::fs::write(&dataset_path, dataset)
            .with_context(|| format!("staging dataset for {}", params.job_id))?;

        for manifest_path in &params.manifest_paths {
            let node = manifest_path
                .rsplit('/')
                .next()
                .and_then(|f| f.strip_suffix(".pmcs"))
                .unwrap_or("node00001");
            let pmcs_path = work.join(format!("{}.pmcs", node));
            std::fs::write(
                &pmcs_path,
                store.read(&params.jobs_bucket, manifest_path)?,
            )?;
            let out_path = work.join(format!("{}.pmcs_result.csv", node));

            let mut cmd = Command::new(&self.binary);
            cmd.arg(&params.command)
                .arg(&params.detector_config)
                .arg(&dataset_path)
                .arg(&pmcs_path)
                .arg(params.elements.join(","));
            for frag in params.parameters.split_whitespace() {
                cmd.arg(frag);
            }
            cmd.arg(format!("-t,{}", self.cores_per_node));
            cmd.arg(&out_path);
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

            let output = cmd
                .output()
                .with_context(|| format!("spawning {}", self.binary.display()))?;
            if !output.status.success() {
                bail!(
                    "piquant exited with {} on {}: {}",
                    output.status,
                    node,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }

            let csv = std::fs::read(&out_path)
                .with_context(|| format!("piquant produced no output for {}", node))?;
            store.write(
                &params.jobs_bucket,
                &filepaths::job_output(&params.scan_id, &params.job_id, node),
                &csv,
            )?;
            store.write(
                &params.jobs_bucket,
                &format!(
                    "{}{}.pmcs_stdout.log",
                    filepaths::job_log_prefix(&params.scan_id, &params.job_id),
                    node
                ),
                &output.stdout,
            )?;
        }
        Ok(())
    }
}

impl Runner for SubprocessRunner {
    fn run_piquant(&self, store: &dyn ObjectStore, params: &PiquantParams) -> Result<()> {
        // Unique work dir per invocation; parallel jobs never collide.
        let work = std::env::temp_dir().join(format!(
            "piquant_{}_{}",
            params.job_id,
            RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&work)
            .with_context(|| format!("creating {}", work.display()))?;
        let result = self.run_all(store, params, &work);
        let _ = std::fs::remove_dir_all(&work);
        result
    }
}

/// Runner standing in for the external binary: fabricates one output
/// row per manifest work unit. Backs local runs and the pipeline tests.
pub struct NullRunner;

impl NullRunner {
    fn detector_of_line(units: &str) -> &'static str {
        let mut dets = units
            .split(',')
            .filter_map(|frag| frag.rsplit('|').next());
        let first = dets.next().unwrap_or("A");
        if dets.all(|d| d == first) {
            match first {
                "B" => "B",
                _ => "A",
            }
        } else {
            "Combined"
        }
    }
}

impl Runner for NullRunner {
    fn run_piquant(&self, store: &dyn ObjectStore, params: &PiquantParams) -> Result<()> {
        for manifest_path in &params.manifest_paths {
            let manifest = store.read(&params.jobs_bucket, manifest_path)?;
            let manifest = String::from_utf8(manifest).context("manifest is not utf-8")?;

            let mut csv = format!(
                "PIQUANT version: {} DetectorConfig: {}\n",
                params.piquant_version, params.detector_config
            );
            csv.push_str("PMC, ");
            for element in &params.elements {
                csv.push_str(&format!("{}_%, {}_int, ", element, element));
            }
            csv.push_str("filename, livetime, SCLK, RTT\n");

            for line in manifest.lines().skip(1) {
                if line.trim().is_empty() {
                    continue;
                }
                let (roi_id, units) = match line.split_once(':') {
                    Some((roi, rest)) => (Some(roi), rest),
                    None => (None, line),
                };
                let pmc = units
                    .split(['|', ','])
                    .next()
                    .unwrap_or("0")
                    .trim()
                    .to_string();
                let detector = Self::detector_of_line(units);
                let filename = match roi_id {
                    Some(roi) => format!("Normal_{}_{}", detector, roi),
                    None => format!("Normal_{}", detector),
                };
                csv.push_str(&pmc);
                for (i, _) in params.elements.iter().enumerate() {
                    csv.push_str(&format!(", {}.5, {}00", i + 1, i + 4));
                }
                csv.push_str(&format!(", {}, 9.9, 100, 7890\n", filename));
            }

            let node = manifest_path
                .rsplit('/')
                .next()
                .and_then(|f| f.strip_suffix(".pmcs"))
                .unwrap_or("node00001");
            store.write(
                &params.jobs_bucket,
                &filepaths::job_output(&params.scan_id, &params.job_id, node),
                csv.as_bytes(),
            )?;
            store.write(
                &params.jobs_bucket,
                &format!(
                    "{}{}.pmcs_stdout.log",
                    filepaths::job_log_prefix(&params.scan_id, &params.job_id),
                    node
                ),
                format!("ran {} units\n", manifest.lines().count().saturating_sub(1)).as_bytes(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::FsObjectStore;

    fn params(job_id: &str, manifests: Vec<String>) -> PiquantParams {
        PiquantParams {
            piquant_version: "piquant/3.2.8".to_string(),
            command: "map".to_string(),
            scan_id: "5x11".to_string(),
            job_id: job_id.to_string(),
            detector_config: "PIXL/v7".to_string(),
            elements: vec!["Fe".to_string()],
            parameters: String::new(),
            run_time_sec: 30,
            data_bucket: "data".to_string(),
            jobs_bucket: "jobs".to_string(),
            manifest_paths: manifests,
            requestor_user_id: "u1".to_string(),
        }
    }

    #[test]
    fn null_runner_emits_one_row_per_unit_and_a_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let manifest_path = crate::filepaths::job_manifest("5x11", "quant-j1", "node00001");
        store
            .write(
                "jobs",
                &manifest_path,
                b"5x11dataset.bin\n15|Normal|A,15|Normal|B\n7|Normal|A,7|Normal|B\n",
            )
            .unwrap();

        NullRunner
            .run_piquant(&store, &params("quant-j1", vec![manifest_path]))
            .unwrap();

        let out = store
            .read(
                "jobs",
                &crate::filepaths::job_output("5x11", "quant-j1", "node00001"),
            )
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        let rows: Vec<&str> = out.lines().skip(2).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("15,"));
        assert!(rows[0].contains("Normal_Combined"));
        assert!(rows[1].starts_with("7,"));

        let logs = store
            .list("jobs", &crate::filepaths::job_log_prefix("5x11", "quant-j1"))
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ends_with("node00001.pmcs_stdout.log"));
    }

    #[test]
    fn roi_lines_carry_the_roi_in_the_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let manifest_path = crate::filepaths::job_manifest("5x11", "quant-j2", "node00001");
        store
            .write(
                "jobs",
                &manifest_path,
                b"5x11dataset.bin\nroi1-id:7|Normal|A,15|Normal|A\n",
            )
            .unwrap();

        NullRunner
            .run_piquant(&store, &params("quant-j2", vec![manifest_path]))
            .unwrap();

        let out = store
            .read(
                "jobs",
                &crate::filepaths::job_output("5x11", "quant-j2", "node00001"),
            )
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        let row = out.lines().nth(2).unwrap();
        assert!(row.starts_with("7,"));
        assert!(row.contains("Normal_A_roi1-id"));
    }

    #[cfg(unix)]
    fn fake_piquant(dir: &Path, script_body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.join("fake_piquant.sh");
        std::fs::write(&bin, script_body).unwrap();
        let mut perms = std::fs::metadata(&bin).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&bin, perms).unwrap();
        bin
    }

    #[cfg(unix)]
    #[test]
    fn subprocess_runner_uploads_output_and_stdout_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store
            .write("data", &crate::filepaths::scan_dataset("5x11"), b"dataset")
            .unwrap();
        let manifest_path = crate::filepaths::job_manifest("5x11", "quant-j3", "node00001");
        store
            .write("jobs", &manifest_path, b"5x11dataset.bin\n7|Normal|A\n")
            .unwrap();

        // Writes a minimal result CSV to the output path (last argument).
        let bin = fake_piquant(
            dir.path(),
            "#!/bin/sh\nfor last; do :; done\n\
             printf 'PIQUANT version: test DetectorConfig: PIXL/v7\\n\
             PMC, Fe_%%, Fe_int, filename, livetime, SCLK, RTT\\n\
             7, 1.5, 400, Normal_A, 9.9, 100, 7890\\n' > \"$last\"\n\
             echo processed 1 location\n",
        );

        SubprocessRunner::new(&bin, 2)
            .run_piquant(&store, &params("quant-j3", vec![manifest_path]))
            .unwrap();

        let out = store
            .read(
                "jobs",
                &crate::filepaths::job_output("5x11", "quant-j3", "node00001"),
            )
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("PIQUANT version:"));
        assert!(out.lines().nth(2).unwrap().starts_with("7,"));

        let log = store
            .read(
                "jobs",
                &format!(
                    "{}node00001.pmcs_stdout.log",
                    crate::filepaths::job_log_prefix("5x11", "quant-j3")
                ),
            )
            .unwrap();
        assert_eq!(String::from_utf8(log).unwrap().trim(), "processed 1 location");
    }

    #[cfg(unix)]
    #[test]
    fn subprocess_runner_surfaces_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        store
            .write("data", &crate::filepaths::scan_dataset("5x11"), b"dataset")
            .unwrap();
        let manifest_path = crate::filepaths::job_manifest("5x11", "quant-j4", "node00001");
        store
            .write("jobs", &manifest_path, b"5x11dataset.bin\n7|Normal|A\n")
            .unwrap();

        let bin = fake_piquant(
            dir.path(),
            "#!/bin/sh\necho 'bad detector config' >&2\nexit 3\n",
        );

        let err = SubprocessRunner::new(&bin, 2)
            .run_piquant(&store, &params("quant-j4", vec![manifest_path]))
            .unwrap_err();
        assert!(err.to_string().contains("bad detector config"));
    }
}
