//! Named-operation boundary between the front-end and the core.
//!
//! `Gateway::dispatch` checks the operation against the static allow-list,
//! parses its typed params, calls one component and converts the outcome to
//! a `GatewayResponse`. It never panics across the boundary and holds no
//! business logic of its own.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use ovo_protocol::{
    log_channel, parse_params, AddProjectParams, DescribeParams, ErrorInfo, GatewayRequest,
    GatewayResponse, LogClosedPayload, LogEventPayload, Operation, PortCheckParams,
    ProjectIdParams, PushEvent, StopLogStreamParams, UpdatePortParams, UpdateProjectParams,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::daemon::LogStream;
use crate::logs::{LogLine, LogSink, LogStreamManager, SubscriptionHandle};
use crate::ports::PortProbe;
use crate::registry::ProjectRegistry;
use crate::supervisor::ProcessSupervisor;
use crate::types::{ProjectPatch, ProjectRecord};

/// Where push events go. Returns false once the front-end is gone.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PushEvent) -> bool;
}

/// Forwards log lines as push events on the subscription's channel.
struct EventLogSink {
    events: Arc<dyn EventSink>,
}

impl LogSink for EventLogSink {
    fn deliver(&self, handle: &SubscriptionHandle, line: &LogLine) -> bool {
        let payload = LogEventPayload {
            project_id: line.project_id.clone(),
            subscription_id: handle.subscription_id.clone(),
            seq: line.seq,
            line: line.text.clone(),
            stream: match line.stream {
                LogStream::Out => "out".to_string(),
                LogStream::Err => "err".to_string(),
            },
            timestamp: line.timestamp,
        };
        match serde_json::to_value(payload) {
            Ok(payload) => self.events.emit(PushEvent {
                channel: log_channel(&handle.subscription_id),
                payload,
            }),
            Err(err) => {
                warn!(error = %err, "Failed to serialize log event");
                true
            }
        }
    }

    fn closed(&self, handle: &SubscriptionHandle, reason: &str) {
        let payload = LogClosedPayload {
            project_id: handle.project_id.clone(),
            subscription_id: handle.subscription_id.clone(),
            closed: true,
            reason: reason.to_string(),
        };
        if let Ok(payload) = serde_json::to_value(payload) {
            self.events.emit(PushEvent {
                channel: log_channel(&handle.subscription_id),
                payload,
            });
        }
    }
}

pub struct Gateway {
    registry: Arc<ProjectRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    ports: Arc<PortProbe>,
    logs: Arc<LogStreamManager>,
    log_sink: Arc<dyn LogSink>,
}

impl Gateway {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        supervisor: Arc<ProcessSupervisor>,
        ports: Arc<PortProbe>,
        logs: Arc<LogStreamManager>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            supervisor,
            ports,
            logs,
            log_sink: Arc::new(EventLogSink { events }),
        }
    }

    pub fn dispatch(&self, request: &GatewayRequest) -> GatewayResponse {
        let id = request.id.clone();
        let operation = match request.operation.parse::<Operation>() {
            Ok(operation) => operation,
            Err(info) => {
                warn!(operation = %request.operation, "Rejected operation not on allow-list");
                return GatewayResponse::error_with_info(id, info);
            }
        };
        debug!(%operation, request_id = ?id, caller = request.caller_or_default(), "Dispatch");

        match panic::catch_unwind(AssertUnwindSafe(|| self.handle(operation, request))) {
            Ok(Ok(data)) => GatewayResponse::ok(id, data),
            Ok(Err(info)) => {
                debug!(%operation, code = %info.code, message = %info.message, "Operation failed");
                GatewayResponse::error_with_info(id, info)
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unexpected failure".to_string());
                error!(%operation, panic = %message, "Operation panicked");
                GatewayResponse::error(id, "internal_error", message)
            }
        }
    }

    fn handle(&self, operation: Operation, request: &GatewayRequest) -> Result<Value, ErrorInfo> {
        let params = request.params.clone();
        match operation {
            Operation::ProjectAdd => {
                let params: AddProjectParams = parse_params(params)?;
                params.validate()?;
                let record = ProjectRecord::new(
                    params.name.trim(),
                    params.path.trim(),
                    params.project_type.as_deref(),
                    params.port,
                );
                to_data(self.registry.add(record, params.overwrite))
            }
            // Removing a project also retires its process and log streams.
            Operation::ProjectRemove | Operation::ProcessDelete => {
                let params: ProjectIdParams = parse_params(params)?;
                params.validate()?;
                let removed = self.supervisor.delete(&params.id)?;
                Ok(json!({ "removed": removed.is_some(), "project": removed }))
            }
            Operation::ProjectUpdate => {
                let params: UpdateProjectParams = parse_params(params)?;
                params.validate()?;
                let patch = ProjectPatch {
                    name: params.name,
                    path: params.path,
                    project_type: params.project_type,
                    port: params.port,
                };
                to_data(self.registry.update(&params.id, patch))
            }
            Operation::ProjectList => to_data(self.registry.load_all()),
            Operation::ProjectGet => {
                let params: ProjectIdParams = parse_params(params)?;
                params.validate()?;
                to_data(self.registry.get(&params.id))
            }
            Operation::ProjectUpdatePort => {
                let params: UpdatePortParams = parse_params(params)?;
                params.validate()?;
                to_data(self.ports.update_port_checked(&params.id, params.new_port))
            }
            Operation::ProcessCheckInstalled => to_data(Ok(self.supervisor.check_daemon_installed())),
            Operation::ProcessInstall => to_data(self.supervisor.install_daemon()),
            Operation::ProcessVersion => {
                let version = self.supervisor.daemon_version()?;
                Ok(json!({ "version": version }))
            }
            Operation::ProcessConnect => {
                self.supervisor.connect()?;
                Ok(json!({ "connected": true }))
            }
            Operation::ProcessStart => {
                let params: ProjectIdParams = parse_params(params)?;
                params.validate()?;
                to_data(self.supervisor.start(&params.id))
            }
            Operation::ProcessStop => {
                let params: ProjectIdParams = parse_params(params)?;
                params.validate()?;
                to_data(self.supervisor.stop(&params.id))
            }
            Operation::ProcessRestart => {
                let params: ProjectIdParams = parse_params(params)?;
                params.validate()?;
                to_data(self.supervisor.restart(&params.id))
            }
            Operation::ProcessList => to_data(self.supervisor.list()),
            Operation::ProcessDescribe => {
                let params: DescribeParams = parse_params(params)?;
                match params.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
                    Some(id) => to_data(self.supervisor.describe(id)),
                    None => to_data(self.supervisor.list()),
                }
            }
            Operation::ProcessStartLogStream => {
                let params: ProjectIdParams = parse_params(params)?;
                params.validate()?;
                self.registry.get(&params.id)?;
                let handle = self.logs.start_stream(
                    &params.id,
                    request.caller_or_default(),
                    Arc::clone(&self.log_sink),
                )?;
                Ok(json!({
                    "subscriptionId": handle.subscription_id,
                    "projectId": handle.project_id,
                    "channel": log_channel(&handle.subscription_id),
                }))
            }
            Operation::ProcessStopLogStream => {
                let params: StopLogStreamParams = parse_params(params)?;
                params.validate()?;
                let subscription_id = match (params.subscription_id, params.id) {
                    (Some(subscription_id), _) => Some(subscription_id),
                    (None, Some(project_id)) => self
                        .logs
                        .subscription_for(request.caller_or_default(), &project_id)
                        .map(|handle| handle.subscription_id),
                    (None, None) => None,
                };
                let stopped = subscription_id
                    .as_deref()
                    .is_some_and(|subscription_id| self.logs.stop_stream(subscription_id));
                Ok(json!({ "stopped": stopped }))
            }
            Operation::PortCheck => {
                let params: PortCheckParams = parse_params(params)?;
                params.validate()?;
                to_data(self.ports.check(params.port))
            }
        }
    }
}

fn to_data<T: Serialize>(result: crate::Result<T>) -> Result<Value, ErrorInfo> {
    let value = result?;
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::MemoryDaemon;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingEvents {
        events: Mutex<Vec<PushEvent>>,
    }

    impl EventSink for RecordingEvents {
        fn emit(&self, event: PushEvent) -> bool {
            self.events.lock().unwrap().push(event);
            true
        }
    }

    fn gateway() -> (TempDir, Gateway) {
        let tmp = TempDir::new().unwrap();
        let registry = Arc::new(ProjectRegistry::open(&tmp.path().join("projects.json")));
        let daemon = Arc::new(MemoryDaemon::new());
        let logs = Arc::new(LogStreamManager::new(daemon.clone()));
        let supervisor = Arc::new(
            ProcessSupervisor::new(registry.clone(), daemon).with_log_streams(logs.clone()),
        );
        let ports = Arc::new(PortProbe::new(registry.clone()));
        let events: Arc<dyn EventSink> = Arc::new(RecordingEvents::default());
        let gateway = Gateway::new(registry, supervisor, ports, logs, events);
        (tmp, gateway)
    }

    fn call(gateway: &Gateway, operation: &str, params: Value) -> GatewayResponse {
        gateway.dispatch(&GatewayRequest {
            id: Some("1".to_string()),
            operation: operation.to_string(),
            params,
            caller: None,
        })
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let (_tmp, gateway) = gateway();
        let response = call(&gateway, "fs.readFile", json!({ "path": "/etc/passwd" }));
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "operation_not_allowed");
    }

    #[test]
    fn add_generates_id_and_list_returns_it() {
        let (_tmp, gateway) = gateway();
        let response = call(
            &gateway,
            "project.add",
            json!({ "name": "test2", "path": "/Users/vidar/ovo/test2" }),
        );
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.data.unwrap()["id"], "test2qyiab2");

        let listed = call(&gateway, "project.list", Value::Null);
        assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_add_reports_duplicate_id() {
        let (_tmp, gateway) = gateway();
        let params = json!({ "name": "web", "path": "/srv/web" });
        assert!(call(&gateway, "project.add", params.clone()).success);

        let response = call(&gateway, "project.add", params);
        assert_eq!(response.error.unwrap().code, "duplicate_id");
    }

    #[test]
    fn invalid_params_are_reported() {
        let (_tmp, gateway) = gateway();
        let response = call(&gateway, "project.add", json!({ "name": "web" }));
        assert_eq!(response.error.unwrap().code, "invalid_params");

        let response = call(&gateway, "port.check", json!({ "port": 0 }));
        assert!(!response.success);
    }

    #[test]
    fn remove_of_unknown_id_succeeds() {
        let (_tmp, gateway) = gateway();
        let response = call(&gateway, "project.remove", json!({ "id": "ghost000" }));
        assert!(response.success);
        assert_eq!(response.data.unwrap()["removed"], false);
    }

    #[test]
    fn lifecycle_round_trip_through_gateway() {
        let (_tmp, gateway) = gateway();
        let added = call(&gateway, "project.add", json!({ "name": "web", "path": "/srv/web" }));
        let id = added.data.unwrap()["id"].as_str().unwrap().to_string();

        let started = call(&gateway, "process.start", json!({ "id": id }));
        assert_eq!(started.data.unwrap()["project"]["status"], "running");

        let described = call(&gateway, "process.describe", json!({ "id": id }));
        assert_eq!(described.data.unwrap()["process"]["status"], "online");

        let all = call(&gateway, "process.describe", Value::Null);
        assert_eq!(all.data.unwrap().as_array().unwrap().len(), 1);

        let stopped = call(&gateway, "process.stop", json!({ "id": id }));
        assert_eq!(stopped.data.unwrap()["project"]["status"], "stopped");
    }

    #[test]
    fn unknown_project_start_carries_code() {
        let (_tmp, gateway) = gateway();
        let response = call(&gateway, "process.start", json!({ "id": "ghost000" }));
        assert_eq!(response.error.unwrap().code, "unknown_project_id");
    }

    #[test]
    fn log_stream_start_is_idempotent_per_caller() {
        let (_tmp, gateway) = gateway();
        let added = call(&gateway, "project.add", json!({ "name": "web", "path": "/srv/web" }));
        let id = added.data.unwrap()["id"].as_str().unwrap().to_string();

        let first = call(&gateway, "process.startLogStream", json!({ "id": id }));
        let second = call(&gateway, "process.startLogStream", json!({ "id": id }));
        assert_eq!(
            first.data.unwrap()["subscriptionId"],
            second.data.unwrap()["subscriptionId"]
        );

        let stopped = call(&gateway, "process.stopLogStream", json!({ "id": id }));
        assert_eq!(stopped.data.unwrap()["stopped"], true);
        let again = call(&gateway, "process.stopLogStream", json!({ "id": id }));
        assert_eq!(again.data.unwrap()["stopped"], false);
    }

    #[test]
    fn log_stream_for_unknown_project_fails() {
        let (_tmp, gateway) = gateway();
        let response = call(&gateway, "process.startLogStream", json!({ "id": "ghost000" }));
        assert_eq!(response.error.unwrap().code, "unknown_project_id");
    }

    #[test]
    fn check_installed_reports_status() {
        let (_tmp, gateway) = gateway();
        let response = call(&gateway, "process.checkInstalled", Value::Null);
        assert_eq!(response.data.unwrap()["installed"], true);
    }

    #[test]
    fn every_operation_is_dispatchable() {
        let (_tmp, gateway) = gateway();
        for operation in Operation::ALL {
            let response = call(&gateway, operation.name(), Value::Null);
            if let Some(error) = response.error {
                assert_ne!(error.code, "operation_not_allowed", "{}", operation);
                assert_ne!(error.code, "internal_error", "{}", operation);
            }
        }
    }
}
