use std::path::PathBuf;

use crate::limits::MAX_DATE_WINDOW_DAYS;

/// Runtime settings for the `docket` binary, read from `DOCKET_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Days ahead covered by the schedule report.
    pub report_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            report_days: 7,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let data_dir = lookup("DOCKET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let metrics_port = lookup("DOCKET_METRICS_PORT").and_then(|s| s.parse().ok());
        let report_days = lookup("DOCKET_REPORT_DAYS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.report_days)
            .min(MAX_DATE_WINDOW_DAYS);
        Self {
            data_dir,
            metrics_port,
            report_days,
        }
    }
}
