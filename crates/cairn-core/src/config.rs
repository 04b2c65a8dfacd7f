use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};
use crate::pool::CompressClass;

/// Periods accepted for the nightly full-scan schedule. 0 disables full
/// scans; otherwise a shard group is re-measured every `period` passes.
const VALID_FULL_SCAN_PERIODS: [u32; 6] = [0, 1, 2, 4, 8, 16];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CairnConfig {
    /// Root of the backup store: hosts under `<top_dir>/pc`, pools beside it.
    pub top_dir: PathBuf,

    /// Uncompressed pool root. Default: `<top_dir>/pool`.
    #[serde(default)]
    pub pool_dir: Option<PathBuf>,

    /// Compressed pool root. Default: `<top_dir>/cpool`.
    #[serde(default)]
    pub cpool_dir: Option<PathBuf>,

    /// Full-scan period: one of 0, 1, 2, 4, 8, 16.
    #[serde(default = "default_full_scan_period")]
    pub pool_size_nightly_update_period: u32,

    /// Baseline log verbosity when the command line does not raise it.
    #[serde(default = "default_xfer_log_level")]
    pub xfer_log_level: u32,
}

fn default_full_scan_period() -> u32 {
    16
}

fn default_xfer_log_level() -> u32 {
    1
}

impl CairnConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CairnError::Config(format!("cannot read '{}': {e}", path.display()))
        })?;
        let config: CairnConfig = serde_yaml::from_str(&text)
            .map_err(|e| CairnError::Config(format!("'{}': {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_FULL_SCAN_PERIODS.contains(&self.pool_size_nightly_update_period) {
            return Err(CairnError::Config(format!(
                "pool_size_nightly_update_period must be one of {VALID_FULL_SCAN_PERIODS:?}, \
                 got {}",
                self.pool_size_nightly_update_period
            )));
        }
        Ok(())
    }

    pub fn pool_root(&self, class: CompressClass) -> PathBuf {
        match class {
            CompressClass::Pool => self
                .pool_dir
                .clone()
                .unwrap_or_else(|| self.top_dir.join("pool")),
            CompressClass::Cpool => self
                .cpool_dir
                .clone()
                .unwrap_or_else(|| self.top_dir.join("cpool")),
        }
    }

    pub fn pc_dir(&self) -> PathBuf {
        self.top_dir.join("pc")
    }

    pub fn host_dir(&self, host: &str) -> PathBuf {
        self.pc_dir().join(host)
    }

    /// Enumerate hosts: the sorted subdirectories of `<top_dir>/pc`.
    pub fn hosts(&self) -> Result<Vec<String>> {
        let pc = self.pc_dir();
        let mut hosts = Vec::new();
        for entry in std::fs::read_dir(&pc).map_err(|e| {
            CairnError::Config(format!("cannot list hosts in '{}': {e}", pc.display()))
        })? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            hosts.push(name.to_string());
        }
        hosts.sort();
        Ok(hosts)
    }
}

/// Locate the config file: explicit flag, then `$CAIRN_CONFIG`, then
/// `./cairn.yaml`.
pub fn resolve_config_path(flag: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("CAIRN_CONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let cwd = PathBuf::from("cairn.yaml");
    if cwd.is_file() {
        return Some(cwd);
    }
    None
}
