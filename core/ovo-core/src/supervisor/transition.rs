//! Lifecycle state machine.
//!
//! `plan` decides whether a lifecycle intent needs a daemon call at all.
//! `reconcile` is the only place externally reported status turns into a
//! `ProjectStatus`; optimistic transitions are always overwritten by it.

use crate::daemon::{DaemonProcess, DaemonStatus};
use crate::types::ProjectStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Call the daemon, then move to `optimistic` until the next reconcile.
    Proceed { optimistic: ProjectStatus },
    /// Nothing to do; the project is already where the intent leads.
    AlreadySatisfied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub status: ProjectStatus,
    pub reason: Option<String>,
}

impl Reconciled {
    fn new(status: ProjectStatus) -> Self {
        Self {
            status,
            reason: None,
        }
    }

    fn error(reason: String) -> Self {
        Self {
            status: ProjectStatus::Error,
            reason: Some(reason),
        }
    }
}

/// `current` must already be reconciled; `process_present` says whether the
/// daemon knows the process at all.
pub fn plan(intent: Intent, current: ProjectStatus, process_present: bool) -> Plan {
    use ProjectStatus::*;
    match (intent, current) {
        (Intent::Start, Running | Starting) => Plan::AlreadySatisfied,
        (Intent::Start, _) => Plan::Proceed {
            optimistic: Starting,
        },
        (Intent::Stop, Stopped | Stopping | Unknown) => Plan::AlreadySatisfied,
        (Intent::Stop, Error) if !process_present => Plan::AlreadySatisfied,
        (Intent::Stop, _) => Plan::Proceed {
            optimistic: Stopping,
        },
    }
}

/// Maps the daemon's report onto the project's status.
pub fn reconcile(
    current: ProjectStatus,
    current_reason: Option<&str>,
    reported: Option<&DaemonProcess>,
) -> Reconciled {
    let Some(process) = reported else {
        // A process that is gone after failing keeps its failure visible.
        return match current {
            ProjectStatus::Error => Reconciled {
                status: ProjectStatus::Error,
                reason: current_reason.map(str::to_string),
            },
            _ => Reconciled::new(ProjectStatus::Stopped),
        };
    };

    match process.status {
        DaemonStatus::Online => Reconciled::new(ProjectStatus::Running),
        DaemonStatus::Launching => Reconciled::new(ProjectStatus::Starting),
        DaemonStatus::Stopping => Reconciled::new(ProjectStatus::Stopping),
        DaemonStatus::Stopped | DaemonStatus::OneLaunchStatus => {
            if current == ProjectStatus::Starting {
                Reconciled::error("process exited during startup".to_string())
            } else {
                Reconciled::new(ProjectStatus::Stopped)
            }
        }
        DaemonStatus::Errored => Reconciled::error(match process.restarts {
            0 => "process errored".to_string(),
            1 => "process errored after 1 restart".to_string(),
            n => format!("process errored after {} restarts", n),
        }),
        // Transient states such as "waiting restart" say nothing new.
        DaemonStatus::Other => Reconciled {
            status: current,
            reason: current_reason.map(str::to_string),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(status: DaemonStatus, restarts: u32) -> DaemonProcess {
        DaemonProcess {
            name: "web12345".to_string(),
            pid: None,
            status,
            restarts,
            cpu: 0.0,
            memory: 0,
            started_at: None,
        }
    }

    #[test]
    fn test_start_from_stopped_proceeds() {
        assert_eq!(
            plan(Intent::Start, ProjectStatus::Stopped, false),
            Plan::Proceed {
                optimistic: ProjectStatus::Starting
            }
        );
    }

    #[test]
    fn test_start_from_error_proceeds() {
        assert_eq!(
            plan(Intent::Start, ProjectStatus::Error, true),
            Plan::Proceed {
                optimistic: ProjectStatus::Starting
            }
        );
    }

    #[test]
    fn test_start_when_running_is_satisfied() {
        assert_eq!(
            plan(Intent::Start, ProjectStatus::Running, true),
            Plan::AlreadySatisfied
        );
        assert_eq!(
            plan(Intent::Start, ProjectStatus::Starting, true),
            Plan::AlreadySatisfied
        );
    }

    #[test]
    fn test_stop_when_stopped_is_satisfied() {
        for status in [
            ProjectStatus::Stopped,
            ProjectStatus::Stopping,
            ProjectStatus::Unknown,
        ] {
            assert_eq!(plan(Intent::Stop, status, true), Plan::AlreadySatisfied);
        }
    }

    #[test]
    fn test_stop_errored_process_only_when_present() {
        assert_eq!(
            plan(Intent::Stop, ProjectStatus::Error, false),
            Plan::AlreadySatisfied
        );
        assert_eq!(
            plan(Intent::Stop, ProjectStatus::Error, true),
            Plan::Proceed {
                optimistic: ProjectStatus::Stopping
            }
        );
    }

    #[test]
    fn test_stop_running_proceeds() {
        assert_eq!(
            plan(Intent::Stop, ProjectStatus::Running, true),
            Plan::Proceed {
                optimistic: ProjectStatus::Stopping
            }
        );
    }

    #[test]
    fn test_online_reconciles_to_running() {
        let reported = process(DaemonStatus::Online, 0);
        assert_eq!(
            reconcile(ProjectStatus::Starting, None, Some(&reported)),
            Reconciled::new(ProjectStatus::Running)
        );
    }

    #[test]
    fn test_online_overrides_optimistic_stopping() {
        let reported = process(DaemonStatus::Online, 0);
        assert_eq!(
            reconcile(ProjectStatus::Stopping, None, Some(&reported)).status,
            ProjectStatus::Running
        );
    }

    #[test]
    fn test_launching_reconciles_to_starting() {
        let reported = process(DaemonStatus::Launching, 0);
        assert_eq!(
            reconcile(ProjectStatus::Stopped, None, Some(&reported)).status,
            ProjectStatus::Starting
        );
    }

    #[test]
    fn test_stopped_while_starting_is_error() {
        let reported = process(DaemonStatus::Stopped, 0);
        let result = reconcile(ProjectStatus::Starting, None, Some(&reported));
        assert_eq!(result.status, ProjectStatus::Error);
        assert!(result.reason.unwrap().contains("startup"));
    }

    #[test]
    fn test_stopped_while_stopping_is_stopped() {
        let reported = process(DaemonStatus::Stopped, 0);
        assert_eq!(
            reconcile(ProjectStatus::Stopping, None, Some(&reported)),
            Reconciled::new(ProjectStatus::Stopped)
        );
    }

    #[test]
    fn test_errored_carries_restart_count() {
        let reported = process(DaemonStatus::Errored, 15);
        let result = reconcile(ProjectStatus::Running, None, Some(&reported));
        assert_eq!(result.status, ProjectStatus::Error);
        assert_eq!(
            result.reason.as_deref(),
            Some("process errored after 15 restarts")
        );
    }

    #[test]
    fn test_absent_process_is_stopped() {
        assert_eq!(
            reconcile(ProjectStatus::Running, None, None),
            Reconciled::new(ProjectStatus::Stopped)
        );
        assert_eq!(
            reconcile(ProjectStatus::Unknown, None, None).status,
            ProjectStatus::Stopped
        );
    }

    #[test]
    fn test_absent_process_keeps_error_reason() {
        let result = reconcile(ProjectStatus::Error, Some("boom"), None);
        assert_eq!(result.status, ProjectStatus::Error);
        assert_eq!(result.reason.as_deref(), Some("boom"));
    }

    #[test]
    fn test_transient_status_keeps_current() {
        let reported = process(DaemonStatus::Other, 3);
        assert_eq!(
            reconcile(ProjectStatus::Running, None, Some(&reported)),
            Reconciled::new(ProjectStatus::Running)
        );
    }
}
