//! # Quantification orchestrator
//!
//! Turns a scan id plus a PMC or ROI selection into a merged, indexed
//! quantification artifact. The run is a fan-out/fan-in pipeline:
//!
//! 1. validate and snapshot the request ([`validate`], [`create`])
//! 2. partition PMCs across compute nodes and write one manifest per
//!    node ([`partition`], [`roi`])
//! 3. invoke the external compute binary through a pluggable
//!    [`runner::Runner`]
//! 4. gather per-node CSVs, merge them ([`combine`]) and convert the
//!    result to the columnar binary ([`convert`])
//! 5. persist the summary and ownership atomically, copy logs, and
//!    complete the job
//!
//! Multi-quantification composition and comparison live in
//! [`multiquant`].

pub mod combine;
pub mod convert;
pub mod create;
pub mod multiquant;
pub mod partition;
pub mod roi;
pub mod runner;
pub mod validate;

use crate::config::AppConfig;
use crate::db::Database;
use crate::filecache::FileCache;
use crate::jobs::JobTracker;
use crate::metrics::Metrics;
use crate::notify::NotificationRouter;
use crate::objstore::ObjectStore;
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Everything a quantification run needs, threaded explicitly instead
/// of living in process globals.
#[derive(Clone)]
pub struct QuantContext {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub store: Arc<dyn ObjectStore>,
    pub cache: Arc<FileCache>,
    pub tracker: JobTracker,
    pub notifier: NotificationRouter,
    pub runner: Arc<dyn runner::Runner>,
    pub metrics: Arc<Metrics>,
}

/// Presentation name for a worker log file: the manifest-derived
/// `.pmcs_` segment is dropped, case-insensitively.
pub fn clean_log_name(name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?i)\.pmcs_").expect("static pattern"));
    re.replace_all(name, "_").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_name_drops_manifest_segment_case_insensitively() {
        assert_eq!(
            clean_log_name("NODE00001.PMCS_stdout.log"),
            "NODE00001_stdout.log"
        );
        assert_eq!(
            clean_log_name("node00001.pmcs_piquant.log"),
            "node00001_piquant.log"
        );
    }

    #[test]
    fn log_name_without_segment_is_untouched() {
        assert_eq!(clean_log_name("node00001_data.log"), "node00001_data.log");
    }
}
