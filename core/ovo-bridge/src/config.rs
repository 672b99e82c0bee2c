//! Bridge configuration: command-line flags layered over the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use ovo_core::StorageConfig;

pub const PM2_BIN_ENV: &str = "OVO_PM2_BIN";
pub const DEFAULT_RECONCILE_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DaemonKind {
    /// The pm2 process manager (production)
    Pm2,
    /// In-process daemon with no real processes (offline demos, tests)
    Memory,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub storage: StorageConfig,
    pub daemon: DaemonKind,
    pub pm2_bin: Option<PathBuf>,
    /// `None` disables periodic reconciliation.
    pub reconcile_interval: Option<Duration>,
    pub log_stderr: bool,
}

impl BridgeConfig {
    pub fn new(
        data_dir: Option<PathBuf>,
        daemon: DaemonKind,
        pm2_bin: Option<PathBuf>,
        reconcile_secs: u64,
        log_stderr: bool,
    ) -> Self {
        let storage = match data_dir {
            Some(root) => StorageConfig::with_root(root),
            None => StorageConfig::resolve(),
        };
        let pm2_bin = pm2_bin.or_else(|| {
            env::var_os(PM2_BIN_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        });
        let reconcile_interval = (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs));

        Self {
            storage,
            daemon,
            pm2_bin,
            reconcile_interval,
            log_stderr,
        }
    }
}
