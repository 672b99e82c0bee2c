//! Port availability probing.
//!
//! Three sources of evidence are combined: a kernel bind test on the wildcard
//! and loopback addresses, `lsof` for listeners on any interface (and their
//! pid), and `sysinfo` to name the pid. When none of them can say anything
//! the result is `indeterminate`, never `available`.
//!
//! A check is a snapshot. Another process can take the port between a check
//! and its use; callers that assign ports accept that race.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{debug, info};

use crate::error::{OvoError, Result};
use crate::registry::ProjectRegistry;
use crate::types::{PortProbeResult, PortState, ProjectRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BindEvidence {
    InUse,
    Free,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LsofEvidence {
    Listener {
        pid: Option<u32>,
        command: Option<String>,
    },
    NoListener,
    Failed(String),
}

pub struct PortProbe {
    registry: Arc<ProjectRegistry>,
    lsof: PathBuf,
}

impl PortProbe {
    pub fn new(registry: Arc<ProjectRegistry>) -> Self {
        Self {
            registry,
            lsof: PathBuf::from("lsof"),
        }
    }

    /// Uses a specific lsof binary instead of the one on PATH.
    pub fn with_lsof(mut self, lsof: impl Into<PathBuf>) -> Self {
        self.lsof = lsof.into();
        self
    }

    pub fn check(&self, port: u16) -> Result<PortProbeResult> {
        if port == 0 {
            return Err(OvoError::InvalidRequest("port must be between 1 and 65535".into()));
        }

        let wildcard = bind_test(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let loopback = bind_test(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let lsof = self.lsof_listener(port);
        debug!(port, ?wildcard, ?loopback, ?lsof, "Port probe evidence");

        Ok(combine(port, &wildcard, &loopback, lsof))
    }

    /// Records `port` on the project without probing it.
    pub fn assign_port(&self, id: &str, port: u16) -> Result<ProjectRecord> {
        if port == 0 {
            return Err(OvoError::InvalidRequest("port must be between 1 and 65535".into()));
        }
        let record = self.registry.update_port(id, port)?;
        info!(project_id = %id, port, "Port assigned");
        Ok(record)
    }

    /// Probes `port` and assigns it only if it is confirmed free. Re-assigning
    /// the port a project already has is a no-op.
    pub fn update_port_checked(&self, id: &str, port: u16) -> Result<ProjectRecord> {
        let record = self.registry.get(id)?;
        if record.port == Some(port) {
            return Ok(record);
        }

        let probe = self.check(port)?;
        match probe.state {
            PortState::Available => self.assign_port(id, port),
            PortState::Occupied => Err(OvoError::PortOccupied {
                port,
                occupant: probe
                    .occupied_by
                    .unwrap_or_else(|| "unknown process".to_string()),
            }),
            PortState::Indeterminate => Err(OvoError::PortProbeIndeterminate {
                port,
                details: probe.error.unwrap_or_default(),
            }),
        }
    }

    fn lsof_listener(&self, port: u16) -> LsofEvidence {
        let output = Command::new(&self.lsof)
            .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-Fpc"])
            .stdin(Stdio::null())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(err) => return LsofEvidence::Failed(format!("lsof could not run: {}", err)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some((pid, command)) = parse_lsof_fields(&stdout) {
            return LsofEvidence::Listener { pid, command };
        }

        // lsof exits 1 both for "no matches" and for real errors; only a
        // silent exit means no matches.
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || (output.status.code() == Some(1) && stderr.trim().is_empty())
        {
            LsofEvidence::NoListener
        } else {
            LsofEvidence::Failed(format!("lsof failed: {}", stderr.trim()))
        }
    }
}

fn bind_test(addr: IpAddr, port: u16) -> BindEvidence {
    match TcpListener::bind((addr, port)) {
        Ok(_) => BindEvidence::Free,
        Err(err) if err.kind() == ErrorKind::AddrInUse => BindEvidence::InUse,
        Err(err) => BindEvidence::Unknown(format!("bind {}:{}: {}", addr, port, err)),
    }
}

fn combine(
    port: u16,
    wildcard: &BindEvidence,
    loopback: &BindEvidence,
    lsof: LsofEvidence,
) -> PortProbeResult {
    let lsof_error = match lsof {
        LsofEvidence::Listener { pid, command } => {
            return PortProbeResult::occupied(port, occupant_label(pid, command), pid);
        }
        LsofEvidence::NoListener => None,
        LsofEvidence::Failed(err) => Some(err),
    };

    if *wildcard == BindEvidence::InUse || *loopback == BindEvidence::InUse {
        return PortProbeResult::occupied(port, occupant_label(None, None), None);
    }
    if *wildcard == BindEvidence::Free && *loopback == BindEvidence::Free {
        return PortProbeResult::available(port);
    }

    let Some(lsof_error) = lsof_error else {
        return PortProbeResult::available(port);
    };
    let mut details = lsof_error;
    for evidence in [wildcard, loopback] {
        if let BindEvidence::Unknown(err) = evidence {
            details = format!("{}; {}", details, err);
        }
    }
    PortProbeResult::indeterminate(port, details)
}

/// Pulls the first pid/command pair out of `lsof -F pc` output.
fn parse_lsof_fields(stdout: &str) -> Option<(Option<u32>, Option<String>)> {
    let mut pid = None;
    let mut command = None;
    for line in stdout.lines() {
        if let Some(value) = line.strip_prefix('p') {
            if pid.is_some() {
                break;
            }
            pid = value.trim().parse::<u32>().ok();
        } else if let Some(value) = line.strip_prefix('c') {
            if command.is_none() {
                command = Some(value.trim().to_string());
            }
        }
    }
    (pid.is_some() || command.is_some()).then_some((pid, command))
}

fn occupant_label(pid: Option<u32>, command: Option<String>) -> String {
    let name = pid.and_then(process_name).or(command);
    match (name, pid) {
        (Some(name), Some(pid)) => format!("{} (pid {})", name, pid),
        (Some(name), None) => name,
        (None, Some(pid)) => format!("pid {}", pid),
        (None, None) => "unknown process".to_string(),
    }
}

fn process_name(pid: u32) -> Option<String> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sysinfo_pid, ProcessRefreshKind::new());
    sys.process(sysinfo_pid).map(|process| process.name().to_string())
}
