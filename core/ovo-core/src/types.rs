//! Core types shared by the registry, supervisor, port probe and gateway.
//!
//! Field names serialize in camelCase; these are the names the front-end and
//! the registry file both see.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::daemon::DaemonProcess;
use crate::project_id::stable_project_id;

// ═══════════════════════════════════════════════════════════════════════════════
// Projects
// ═══════════════════════════════════════════════════════════════════════════════

pub const DEFAULT_PROJECT_TYPE: &str = "node";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Unknown => "unknown",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Stopping => "stopping",
            ProjectStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered project.
///
/// `id` is always `stable_project_id(name, path)` and never changes after the
/// record is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub project_type: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: ProjectStatus,
    /// Reason shown next to an `error` status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(name: &str, path: &str, project_type: Option<&str>, port: Option<u16>) -> Self {
        let now = Utc::now();
        Self {
            id: stable_project_id(name, path),
            name: name.to_string(),
            path: path.to_string(),
            project_type: project_type
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_PROJECT_TYPE)
                .to_string(),
            port,
            status: ProjectStatus::Stopped,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when `id` still matches the identity inputs.
    pub fn has_consistent_id(&self) -> bool {
        self.id == stable_project_id(&self.name, &self.path)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Mutable fields a `project.update` may change. `name` and `path` are
/// accepted only so a change to them can be rejected explicitly.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub path: Option<String>,
    pub project_type: Option<String>,
    pub port: Option<u16>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ports
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Available,
    Occupied,
    /// The probe could not run; nothing is known about the port.
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortProbeResult {
    pub port: u16,
    pub available: bool,
    pub state: PortState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupied_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PortProbeResult {
    pub fn available(port: u16) -> Self {
        Self {
            port,
            available: true,
            state: PortState::Available,
            occupied_by: None,
            pid: None,
            error: None,
        }
    }

    pub fn occupied(port: u16, occupied_by: String, pid: Option<u32>) -> Self {
        Self {
            port,
            available: false,
            state: PortState::Occupied,
            occupied_by: Some(occupied_by),
            pid,
            error: None,
        }
    }

    pub fn indeterminate(port: u16, error: String) -> Self {
        Self {
            port,
            available: false,
            state: PortState::Indeterminate,
            occupied_by: None,
            pid: None,
            error: Some(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor views
// ═══════════════════════════════════════════════════════════════════════════════

/// What the front-end sees for `process.list` / `process.describe`: the
/// reconciled record plus whatever the daemon reported for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectProcessView {
    pub project: ProjectRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<DaemonProcess>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonInstallStatus {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_hint: Option<String>,
}
