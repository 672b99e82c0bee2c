//! Boundary protocol types for the ovo gateway.
//!
//! This crate is shared by the gateway and its front-end clients to prevent
//! schema drift. The gateway remains the authority on validation, but clients
//! can reuse the same types to construct valid requests.
//!
//! Every line on the wire is one JSON object. Requests flow in; responses and
//! push events flow out, tagged by `type` so a client can demultiplex them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

/// Push events for a log subscription are sent on `process.log.<subscriptionId>`.
pub const LOG_CHANNEL_PREFIX: &str = "process.log.";

// ═══════════════════════════════════════════════════════════════════════════════
// Operation allow-list
// ═══════════════════════════════════════════════════════════════════════════════

/// Every operation the front-end may invoke by name.
///
/// Anything not listed here is rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ProjectAdd,
    ProjectRemove,
    ProjectUpdate,
    ProjectList,
    ProjectGet,
    ProjectUpdatePort,
    ProcessCheckInstalled,
    ProcessInstall,
    ProcessVersion,
    ProcessConnect,
    ProcessStart,
    ProcessStop,
    ProcessRestart,
    ProcessDelete,
    ProcessList,
    ProcessDescribe,
    ProcessStartLogStream,
    ProcessStopLogStream,
    PortCheck,
}

impl Operation {
    pub const ALL: [Operation; 19] = [
        Operation::ProjectAdd,
        Operation::ProjectRemove,
        Operation::ProjectUpdate,
        Operation::ProjectList,
        Operation::ProjectGet,
        Operation::ProjectUpdatePort,
        Operation::ProcessCheckInstalled,
        Operation::ProcessInstall,
        Operation::ProcessVersion,
        Operation::ProcessConnect,
        Operation::ProcessStart,
        Operation::ProcessStop,
        Operation::ProcessRestart,
        Operation::ProcessDelete,
        Operation::ProcessList,
        Operation::ProcessDescribe,
        Operation::ProcessStartLogStream,
        Operation::ProcessStopLogStream,
        Operation::PortCheck,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::ProjectAdd => "project.add",
            Operation::ProjectRemove => "project.remove",
            Operation::ProjectUpdate => "project.update",
            Operation::ProjectList => "project.list",
            Operation::ProjectGet => "project.get",
            Operation::ProjectUpdatePort => "project.updatePort",
            Operation::ProcessCheckInstalled => "process.checkInstalled",
            Operation::ProcessInstall => "process.install",
            Operation::ProcessVersion => "process.version",
            Operation::ProcessConnect => "process.connect",
            Operation::ProcessStart => "process.start",
            Operation::ProcessStop => "process.stop",
            Operation::ProcessRestart => "process.restart",
            Operation::ProcessDelete => "process.delete",
            Operation::ProcessList => "process.list",
            Operation::ProcessDescribe => "process.describe",
            Operation::ProcessStartLogStream => "process.startLogStream",
            Operation::ProcessStopLogStream => "process.stopLogStream",
            Operation::PortCheck => "port.check",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = ErrorInfo;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.name() == name)
            .ok_or_else(|| {
                ErrorInfo::new(
                    "operation_not_allowed",
                    format!("operation '{}' is not exposed to the front-end", name),
                )
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Envelopes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    /// Identifies the front-end window issuing the call. Log subscriptions are
    /// de-duplicated per caller.
    #[serde(default)]
    pub caller: Option<String>,
}

impl GatewayRequest {
    pub fn new(operation: Operation, params: Value) -> Self {
        Self {
            id: None,
            operation: operation.name().to_string(),
            params,
            caller: None,
        }
    }

    pub fn caller_or_default(&self) -> &str {
        self.caller
            .as_deref()
            .map(str::trim)
            .filter(|caller| !caller.is_empty())
            .unwrap_or(DEFAULT_CALLER)
    }
}

pub const DEFAULT_CALLER: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl GatewayResponse {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self::error_with_info(id, ErrorInfo::new(code, message))
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// An asynchronous notification pushed to the front-end on a named channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub channel: String,
    pub payload: Value,
}

/// Everything the gateway writes to the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Response(GatewayResponse),
    Event(PushEvent),
}

pub fn log_channel(subscription_id: &str) -> String {
    format!("{}{}", LOG_CHANNEL_PREFIX, subscription_id)
}

/// Payload of a `process.log.<subscriptionId>` push event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEventPayload {
    pub project_id: String,
    pub subscription_id: String,
    pub seq: u64,
    pub line: String,
    pub stream: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload sent once when a subscription ends without the caller asking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogClosedPayload {
    pub project_id: String,
    pub subscription_id: String,
    pub closed: bool,
    pub reason: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation parameters
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddProjectParams {
    pub name: String,
    pub path: String,
    #[serde(default, rename = "type")]
    pub project_type: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub overwrite: bool,
}

impl AddProjectParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_empty(&self.name, "name")?;
        require_non_empty(&self.path, "path")?;
        if let Some(port) = self.port {
            require_port(port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProjectIdParams {
    pub id: String,
}

impl ProjectIdParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_empty(&self.id, "id")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateProjectParams {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default, rename = "type")]
    pub project_type: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl UpdateProjectParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_empty(&self.id, "id")?;
        if let Some(port) = self.port {
            require_port(port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdatePortParams {
    pub id: String,
    pub new_port: u16,
}

impl UpdatePortParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_non_empty(&self.id, "id")?;
        require_port(self.new_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PortCheckParams {
    pub port: u16,
}

impl PortCheckParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_port(self.port)
    }
}

/// `process.describe` accepts an id or nothing (describe everything).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DescribeParams {
    #[serde(default)]
    pub id: Option<String>,
}

/// `process.stopLogStream` accepts the project id (this caller's stream for
/// that project) or an explicit subscription id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StopLogStreamParams {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl StopLogStreamParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        let has_id = self.id.as_deref().is_some_and(|v| !v.trim().is_empty());
        let has_sub = self
            .subscription_id
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty());
        if has_id || has_sub {
            Ok(())
        } else {
            Err(ErrorInfo::new(
                "missing_field",
                "id or subscriptionId is required",
            ))
        }
    }
}

/// Deserializes operation params. A missing/`null` params value is treated as
/// an empty object so parameterless operations accept either.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ErrorInfo> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

fn require_port(port: u16) -> Result<(), ErrorInfo> {
    if port == 0 {
        return Err(ErrorInfo::new(
            "invalid_port",
            "port must be between 1 and 65535",
        ));
    }
    Ok(())
}
