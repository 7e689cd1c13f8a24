//! Runner configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// Configuration of the worker spawn runner.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Extra startup flags per mnemonic, appended after
    /// `--persistent_worker` in configured order.
    #[serde(default)]
    pub extra_flags: HashMap<String, Vec<String>>,

    /// Directory receiving per-worker log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("kiln-workers")
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            extra_flags: HashMap::new(),
            log_dir: default_log_dir(),
        }
    }
}
