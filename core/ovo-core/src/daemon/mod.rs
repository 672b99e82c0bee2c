//! Process-manager daemon interface.
//!
//! ovo never supervises processes itself. It drives an external daemon (pm2)
//! and reacts to what that daemon reports. `ProcessDaemon` is the seam:
//! `Pm2Daemon` talks to the real CLI, `MemoryDaemon` keeps everything in
//! process for tests and offline demos.

mod memory;
mod pm2;

pub use memory::{DaemonCall, MemoryDaemon};
pub use pm2::{parse_jlist, strip_ansi, Pm2Daemon};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;

use crate::error::Result;

/// Status strings as the daemon reports them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonStatus {
    Online,
    Launching,
    Stopping,
    Stopped,
    Errored,
    OneLaunchStatus,
    #[serde(other)]
    Other,
}

/// A process as the daemon reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonProcess {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: DaemonStatus,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub cpu: f32,
    #[serde(default)]
    pub memory: u64,
    /// Unix milliseconds when the process last came up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
}

/// Everything the daemon needs to launch a project.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Daemon-side process name; always the project id.
    pub name: String,
    pub cwd: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Out,
    Err,
}

/// One line read from a daemon log tail.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogLine {
    pub stream: LogStream,
    pub text: String,
}

/// A live tail of one process's logs.
///
/// Lines arrive on `lines` in emission order until the tail ends (the sender
/// is dropped) or `close` is called.
pub struct LogTail {
    pub lines: Receiver<RawLogLine>,
    closer: Box<dyn FnOnce() + Send>,
}

impl LogTail {
    pub fn new(lines: Receiver<RawLogLine>, closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            lines,
            closer: Box::new(closer),
        }
    }

    /// Splits the tail so the receiver can move to a reader thread while the
    /// closer stays with the owner.
    pub fn into_parts(self) -> (Receiver<RawLogLine>, Box<dyn FnOnce() + Send>) {
        (self.lines, self.closer)
    }
}

/// Trait for process-manager integrations.
///
/// Implementors should:
/// - Return `DaemonUnavailable` when the daemon binary cannot be found
/// - Return `DaemonCallFailed` when the daemon ran and refused the request
/// - Never retry internally; callers decide about retries
pub trait ProcessDaemon: Send + Sync {
    /// Short identifier (e.g., "pm2")
    fn id(&self) -> &'static str;

    /// Path of the daemon binary, if installed.
    fn locate(&self) -> Option<PathBuf>;

    /// Installs the daemon. Returns the installer's output.
    fn install(&self) -> Result<String>;

    fn version(&self) -> Result<String>;

    /// Makes sure the daemon is up and answering.
    fn connect(&self) -> Result<()>;

    /// Launches a process. Returns the daemon's view right after launch.
    fn start(&self, spec: &LaunchSpec) -> Result<Option<DaemonProcess>>;

    fn stop(&self, name: &str) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;

    fn list(&self) -> Result<Vec<DaemonProcess>>;

    fn describe(&self, name: &str) -> Result<Option<DaemonProcess>> {
        Ok(self.list()?.into_iter().find(|p| p.name == name))
    }

    /// Opens a tail of new log lines for `name`.
    fn tail_logs(&self, name: &str) -> Result<LogTail>;
}
