//! # ovo-core
//!
//! Project registry and process supervision for ovo, shared by every client
//! of the gateway.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Blocking work (daemon
//!   calls, file I/O, port probes) runs on the caller's thread; log tails get
//!   their own threads.
//! - **Thread-safe**: Services are `Send + Sync` and meant to sit behind `Arc`.
//! - **Registry is durable truth**: The registry file decides which projects
//!   exist. The daemon decides what is running. Reconciliation is the only
//!   path from the latter into the former.
//! - **Structured failures**: Every error carries a stable code and, where
//!   possible, a hint the user can act on.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ovo_core::{Bootstrap, BootstrapOptions, Pm2Daemon, StorageConfig};
//!
//! let bootstrap = Bootstrap::new();
//! let services = bootstrap.initialize(BootstrapOptions {
//!     storage: StorageConfig::resolve(),
//!     daemon: Arc::new(Pm2Daemon::new(None)),
//!     events,
//! })?;
//! let response = services.gateway.dispatch(&request);
//! ```

pub mod bootstrap;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod logs;
pub mod ports;
pub mod project_id;
pub mod registry;
pub mod storage;
pub mod supervisor;
pub mod types;

pub use bootstrap::{Bootstrap, BootstrapOptions, Services};
pub use daemon::{
    DaemonCall, DaemonProcess, DaemonStatus, LaunchSpec, LogStream, LogTail, MemoryDaemon,
    Pm2Daemon, ProcessDaemon, RawLogLine,
};
pub use error::{OvoError, Result};
pub use gateway::{EventSink, Gateway};
pub use logs::{LogLine, LogSink, LogStreamManager, SubscriptionHandle};
pub use ports::PortProbe;
pub use project_id::stable_project_id;
pub use registry::ProjectRegistry;
pub use storage::StorageConfig;
pub use supervisor::ProcessSupervisor;
pub use types::*;
