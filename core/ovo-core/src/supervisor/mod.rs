//! Process supervision through the external daemon.
//!
//! The registry owns project existence; the daemon owns live process state.
//! Every operation here reads the daemon's report, folds it into the registry
//! through [`transition::reconcile`], and only then decides what to do.
//!
//! Lifecycle calls for the same project run one at a time under a
//! per-project lock, and each re-reads its precondition once it holds the
//! lock. A call whose precondition is already met by the time it runs is
//! answered without touching the daemon. Background reconciliation does not
//! take the lock; its writes go through the same reconcile mapping.

pub mod transition;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::daemon::{DaemonProcess, LaunchSpec, ProcessDaemon};
use crate::error::{OvoError, Result};
use crate::logs::LogStreamManager;
use crate::registry::ProjectRegistry;
use crate::types::{DaemonInstallStatus, ProjectProcessView, ProjectRecord};
use transition::{Intent, Plan};

const INSTALL_HINT: &str = "Install pm2 with `npm install -g pm2` or call process.install";

pub struct ProcessSupervisor {
    registry: Arc<ProjectRegistry>,
    daemon: Arc<dyn ProcessDaemon>,
    logs: Option<Arc<LogStreamManager>>,
    /// project id -> lock serializing lifecycle calls for that project
    lifecycle: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessSupervisor {
    pub fn new(registry: Arc<ProjectRegistry>, daemon: Arc<dyn ProcessDaemon>) -> Self {
        Self {
            registry,
            daemon,
            logs: None,
            lifecycle: Mutex::new(HashMap::new()),
        }
    }

    /// Streams for a project are torn down when the project is deleted.
    pub fn with_log_streams(mut self, logs: Arc<LogStreamManager>) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn check_daemon_installed(&self) -> DaemonInstallStatus {
        match self.daemon.locate() {
            Some(path) => {
                let version = match self.daemon.version() {
                    Ok(version) => Some(version),
                    Err(err) => {
                        debug!(daemon = self.daemon.id(), error = %err, "Version probe failed");
                        None
                    }
                };
                DaemonInstallStatus {
                    installed: true,
                    path: Some(path.to_string_lossy().to_string()),
                    version,
                    install_hint: None,
                }
            }
            None => DaemonInstallStatus {
                installed: false,
                path: None,
                version: None,
                install_hint: Some(INSTALL_HINT.to_string()),
            },
        }
    }

    pub fn install_daemon(&self) -> Result<DaemonInstallStatus> {
        info!(daemon = self.daemon.id(), "Installing process manager");
        self.daemon.install()?;

        let status = self.check_daemon_installed();
        if !status.installed {
            return Err(OvoError::DaemonUnavailable(
                "installation finished but the process manager is still not found".to_string(),
            ));
        }
        info!(path = ?status.path, version = ?status.version, "Process manager installed");
        Ok(status)
    }

    pub fn daemon_version(&self) -> Result<String> {
        self.daemon.version()
    }

    /// Single attempt; the caller owns retry and backoff.
    pub fn connect(&self) -> Result<()> {
        self.daemon.connect()
    }

    pub fn start(&self, id: &str) -> Result<ProjectProcessView> {
        let lock = self.lifecycle_lock(id);
        let _guard = hold(&lock);
        self.drive(id, Intent::Start)
    }

    pub fn stop(&self, id: &str) -> Result<ProjectProcessView> {
        let lock = self.lifecycle_lock(id);
        let _guard = hold(&lock);
        self.drive(id, Intent::Stop)
    }

    /// Stop followed by start against the same daemon process name. No other
    /// lifecycle call for the project runs in between.
    pub fn restart(&self, id: &str) -> Result<ProjectProcessView> {
        let lock = self.lifecycle_lock(id);
        let _guard = hold(&lock);
        info!(project_id = %id, "Restarting project");
        self.drive(id, Intent::Stop)?;
        self.drive(id, Intent::Start)
    }

    /// Removes the project from the registry, tears down its log streams and
    /// asks the daemon to forget its process. The registry removal stands
    /// even when the daemon refuses or cannot be reached; that case is
    /// reported as `PartialFailure`.
    pub fn delete(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let lock = self.lifecycle_lock(id);
        let _guard = hold(&lock);
        if let Some(logs) = &self.logs {
            logs.stop_all_for_project(id);
        }

        let daemon_result = self.daemon.describe(id).and_then(|process| match process {
            Some(_) => self.daemon.delete(id),
            None => Ok(()),
        });

        let removed = self.registry.remove(id)?;

        match daemon_result {
            Ok(()) => {
                info!(project_id = %id, existed = removed.is_some(), "Project deleted");
                Ok(removed)
            }
            Err(err) => {
                warn!(
                    project_id = %id,
                    error = %err,
                    "Project removed from registry but daemon delete failed"
                );
                let completed = match removed {
                    Some(_) => format!("project {} was removed from the registry", id),
                    None => format!("project {} is not registered", id),
                };
                Err(OvoError::PartialFailure {
                    completed,
                    failed: format!("its process could not be deleted ({})", err),
                    cause: Box::new(err),
                })
            }
        }
    }

    /// Reconciles every registered project against the daemon and returns
    /// the merged views in registry order.
    pub fn list(&self) -> Result<Vec<ProjectProcessView>> {
        let processes = self.daemon.list()?;
        let by_name: HashMap<&str, &DaemonProcess> =
            processes.iter().map(|p| (p.name.as_str(), p)).collect();

        let records = self
            .registry
            .update_all(|record| apply_reconcile(record, by_name.get(record.id.as_str()).copied()))?;

        Ok(records
            .into_iter()
            .map(|project| {
                let process = by_name.get(project.id.as_str()).map(|p| (*p).clone());
                ProjectProcessView { project, process }
            })
            .collect())
    }

    pub fn describe(&self, id: &str) -> Result<ProjectProcessView> {
        self.registry.get(id)?;
        let process = self.daemon.describe(id)?;
        let project = self.apply_report(id, process.as_ref())?;
        Ok(ProjectProcessView { project, process })
    }

    fn drive(&self, id: &str, intent: Intent) -> Result<ProjectProcessView> {
        self.registry.get(id)?;

        // Only a daemon report may overwrite status, so an unreachable daemon
        // fails the call and leaves the record alone.
        let reported = self.daemon.describe(id)?;
        let record = self.apply_report(id, reported.as_ref())?;

        let optimistic = match transition::plan(intent, record.status, reported.is_some()) {
            Plan::AlreadySatisfied => {
                debug!(project_id = %id, status = %record.status, ?intent, "Already satisfied");
                return Ok(ProjectProcessView {
                    project: record,
                    process: reported,
                });
            }
            Plan::Proceed { optimistic } => optimistic,
        };

        info!(project_id = %id, ?intent, from = %record.status, "Lifecycle call");
        let launched = match intent {
            Intent::Start => self.daemon.start(&launch_spec(&record)),
            Intent::Stop => self.daemon.stop(id).map(|()| None),
        }
        .map_err(|err| {
            warn!(project_id = %id, ?intent, error = %err, "Daemon refused lifecycle call");
            err
        })?;

        if self.registry.transition(id, record.status, optimistic)?.is_none() {
            debug!(project_id = %id, ?intent, "Optimistic status skipped");
        }

        let reported = match launched {
            Some(process) => Some(process),
            None => match self.daemon.describe(id) {
                Ok(process) => process,
                Err(err) => {
                    // The daemon acknowledged; the next reconcile settles status.
                    warn!(project_id = %id, error = %err, "Post-call describe failed");
                    return Ok(ProjectProcessView {
                        project: self.registry.get(id)?,
                        process: None,
                    });
                }
            },
        };
        let project = self.apply_report(id, reported.as_ref())?;
        Ok(ProjectProcessView {
            project,
            process: reported,
        })
    }

    fn lifecycle_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    fn apply_report(&self, id: &str, reported: Option<&DaemonProcess>) -> Result<ProjectRecord> {
        self.registry
            .update_all(|record| record.id == id && apply_reconcile(record, reported))?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or_else(|| OvoError::UnknownProjectId(id.to_string()))
    }
}

fn hold(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes the reconciled status into `record`. Returns true if it changed.
fn apply_reconcile(record: &mut ProjectRecord, reported: Option<&DaemonProcess>) -> bool {
    let next = transition::reconcile(record.status, record.last_error.as_deref(), reported);
    if next.status == record.status && next.reason == record.last_error {
        return false;
    }
    if next.status != record.status {
        info!(
            project_id = %record.id,
            from = %record.status,
            to = %next.status,
            reason = next.reason.as_deref().unwrap_or(""),
            "Reconciled status"
        );
    }
    record.status = next.status;
    record.last_error = next.reason;
    true
}

/// How the daemon launches a project, derived from its type.
pub fn launch_spec(record: &ProjectRecord) -> LaunchSpec {
    let (command, args): (&str, Vec<String>) = match record.project_type.as_str() {
        "node" => ("npm", vec!["start".to_string()]),
        "static" => {
            let mut args = vec!["-m".to_string(), "http.server".to_string()];
            if let Some(port) = record.port {
                args.push(port.to_string());
            }
            ("python3", args)
        }
        _ => ("npm", vec!["run".to_string(), "dev".to_string()]),
    };

    let mut env = Vec::new();
    if let Some(port) = record.port {
        env.push(("PORT".to_string(), port.to_string()));
    }

    LaunchSpec {
        name: record.id.clone(),
        cwd: record.path.clone().into(),
        command: command.to_string(),
        args,
        env,
    }
}
