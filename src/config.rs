//! Environment-driven configuration for an API instance.
//!
//! Every instance is stateless apart from its local file cache; all knobs
//! come from the environment so a fleet of instances can share one config
//! source. `AppConfig::from_env` is called once at startup and the result
//! is carried inside the shared state.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root directory for the filesystem object store (one subdir per bucket).
    pub store_root: PathBuf,
    /// Bucket holding scan binaries and images.
    pub data_bucket: String,
    /// Bucket holding per-job manifests, params snapshots and worker output.
    pub jobs_bucket: String,
    /// Bucket holding per-user quantification artifacts.
    pub users_bucket: String,

    /// Cores available on each compute node, used by the node estimator.
    pub cores_per_node: u32,
    /// Upper bound on nodes for a single quantification.
    pub max_quant_nodes: u32,
    /// When > 0, forces the node count regardless of the estimate.
    pub node_count_override: u32,
    /// Job watcher timeout for quantification jobs.
    pub quant_timeout_sec: u32,
    /// Job watcher poll interval.
    pub job_poll_interval_sec: u64,

    /// File cache resident-byte cap.
    pub cache_max_bytes: u64,
    /// File cache entry age cap.
    pub cache_max_age_sec: i64,
    /// Local directory for cached artifacts.
    pub cache_dir: PathBuf,

    /// Version string passed through to the compute runner.
    pub piquant_version: String,
    /// Path to a local PIQUANT binary; empty selects the fabricating
    /// runner.
    pub piquant_bin: String,
    /// Unique id of this API instance, used by the elector.
    pub instance_id: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "api".to_string());
        AppConfig {
            store_root: PathBuf::from(env_or_str("STORE_ROOT", "./store")),
            data_bucket: env_or_str("DATA_BUCKET", "data"),
            jobs_bucket: env_or_str("JOBS_BUCKET", "jobs"),
            users_bucket: env_or_str("USERS_BUCKET", "users"),
            cores_per_node: env_or("CORES_PER_NODE", 4),
            max_quant_nodes: env_or("MAX_QUANT_NODES", 40),
            node_count_override: env_or("NODE_COUNT_OVERRIDE", 0),
            quant_timeout_sec: env_or("QUANT_TIMEOUT_SEC", 900),
            job_poll_interval_sec: env_or("JOB_POLL_INTERVAL_SEC", 10),
            cache_max_bytes: env_or("CACHE_MAX_BYTES", 2 * 1024 * 1024 * 1024),
            cache_max_age_sec: env_or("CACHE_MAX_AGE_SEC", 86_400),
            cache_dir: PathBuf::from(env_or_str("CACHE_DIR", "./cache")),
            piquant_version: env_or_str("PIQUANT_VERSION", "piquant/3.2.8"),
            piquant_bin: env_or_str("PIQUANT_BIN", ""),
            instance_id: format!("{}-{}", hostname, crate::random_id(8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        let cfg = AppConfig::from_env();
        assert!(cfg.cores_per_node >= 1);
        assert!(cfg.max_quant_nodes >= 1);
        assert!(cfg.job_poll_interval_sec >= 1);
        assert!(cfg.cache_max_bytes > 0);
        assert!(!cfg.instance_id.is_empty());
    }
}
