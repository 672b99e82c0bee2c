//! Composition root state.
//!
//! `Bootstrap::initialize` wires the registry, daemon, supervisor, port
//! probe, log manager and gateway exactly once per `Bootstrap`. Later calls
//! return the same `Services` and drop their options, so re-entry never
//! registers a second gateway or a second set of log sinks.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use crate::daemon::ProcessDaemon;
use crate::error::{OvoError, Result};
use crate::gateway::{EventSink, Gateway};
use crate::logs::LogStreamManager;
use crate::ports::PortProbe;
use crate::registry::ProjectRegistry;
use crate::storage::StorageConfig;
use crate::supervisor::ProcessSupervisor;

pub struct BootstrapOptions {
    pub storage: StorageConfig,
    pub daemon: Arc<dyn ProcessDaemon>,
    pub events: Arc<dyn EventSink>,
}

pub struct Services {
    pub storage: StorageConfig,
    pub registry: Arc<ProjectRegistry>,
    pub daemon: Arc<dyn ProcessDaemon>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub ports: Arc<PortProbe>,
    pub logs: Arc<LogStreamManager>,
    pub gateway: Arc<Gateway>,
}

impl Services {
    fn build(options: BootstrapOptions) -> Result<Self> {
        let BootstrapOptions {
            storage,
            daemon,
            events,
        } = options;

        storage
            .ensure_dirs()
            .map_err(|err| OvoError::io(format!("creating {}", storage.root().display()), err))?;

        let registry = Arc::new(ProjectRegistry::open(&storage.projects_file()));
        match registry.load_all() {
            Ok(records) => info!(
                projects = records.len(),
                path = %registry.path().display(),
                "Project registry loaded"
            ),
            // Left on disk untouched; every registry operation reports it.
            Err(err) => warn!(error = %err, "Project registry could not be loaded"),
        }

        let logs = Arc::new(LogStreamManager::new(Arc::clone(&daemon)));
        let supervisor = Arc::new(
            ProcessSupervisor::new(Arc::clone(&registry), Arc::clone(&daemon))
                .with_log_streams(Arc::clone(&logs)),
        );
        let ports = Arc::new(PortProbe::new(Arc::clone(&registry)));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::clone(&ports),
            Arc::clone(&logs),
            events,
        ));

        Ok(Self {
            storage,
            registry,
            daemon,
            supervisor,
            ports,
            logs,
            gateway,
        })
    }
}

#[derive(Default)]
pub struct Bootstrap {
    services: OnceLock<Arc<Services>>,
    init_lock: Mutex<()>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the services on the first call; returns the existing ones on
    /// every later call. A failed first call leaves the bootstrap
    /// uninitialized so it can be retried.
    pub fn initialize(&self, options: BootstrapOptions) -> Result<Arc<Services>> {
        let _guard = match self.init_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(services) = self.services.get() {
            debug!("Bootstrap already initialized; reusing services");
            return Ok(Arc::clone(services));
        }

        let daemon_id = options.daemon.id();
        let services = Arc::new(Services::build(options)?);
        // Cannot already be set: the init lock is held.
        let _ = self.services.set(Arc::clone(&services));
        info!(daemon = daemon_id, root = %services.storage.root().display(), "Bootstrap complete");
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonCall, MemoryDaemon};
    use ovo_protocol::PushEvent;
    use std::thread;
    use tempfile::TempDir;

    struct NullEvents;

    impl EventSink for NullEvents {
        fn emit(&self, _event: PushEvent) -> bool {
            true
        }
    }

    fn options(tmp: &TempDir, daemon: Arc<MemoryDaemon>) -> BootstrapOptions {
        BootstrapOptions {
            storage: StorageConfig::with_root(tmp.path().join("data")),
            daemon,
            events: Arc::new(NullEvents),
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let bootstrap = Bootstrap::new();

        let first = bootstrap
            .initialize(options(&tmp, Arc::new(MemoryDaemon::new())))
            .unwrap();
        let second = bootstrap
            .initialize(options(&tmp, Arc::new(MemoryDaemon::new())))
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first.gateway, &second.gateway));
        assert!(tmp.path().join("data").join("logs").is_dir());
    }

    #[test]
    fn concurrent_initialize_builds_once() {
        let tmp = TempDir::new().unwrap();
        let bootstrap = Arc::new(Bootstrap::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bootstrap = Arc::clone(&bootstrap);
                let root = tmp.path().join("data");
                thread::spawn(move || {
                    bootstrap
                        .initialize(BootstrapOptions {
                            storage: StorageConfig::with_root(root),
                            daemon: Arc::new(MemoryDaemon::new()),
                            events: Arc::new(NullEvents),
                        })
                        .unwrap()
                })
            })
            .collect();

        let services: Vec<Arc<Services>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &services[1..] {
            assert!(Arc::ptr_eq(&services[0], other));
        }
    }

    #[test]
    fn repeated_initialize_does_not_duplicate_log_streams() {
        let tmp = TempDir::new().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        let bootstrap = Bootstrap::new();

        let services = bootstrap.initialize(options(&tmp, daemon.clone())).unwrap();
        let record = services
            .registry
            .add(crate::types::ProjectRecord::new("web", "/srv/web", None, None), false)
            .unwrap();
        let request = ovo_protocol::GatewayRequest::new(
            ovo_protocol::Operation::ProcessStartLogStream,
            serde_json::json!({ "id": record.id }),
        );

        for _ in 0..3 {
            let services = bootstrap.initialize(options(&tmp, daemon.clone())).unwrap();
            assert!(services.gateway.dispatch(&request).success);
        }
        assert_eq!(
            daemon.count_calls(|call| matches!(call, DaemonCall::TailLogs(_))),
            1
        );
        assert_eq!(services.logs.active_subscriptions().len(), 1);
    }
}
