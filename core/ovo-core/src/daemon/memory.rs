//! In-process daemon.
//!
//! Behaves like pm2 closely enough for the supervisor: processes are keyed by
//! name, stop/delete of an unknown name fail, and log tails receive
//! whatever `emit_log` pushes. Every call is recorded so tests can assert on
//! what reached the daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use super::{DaemonProcess, DaemonStatus, LaunchSpec, LogStream, LogTail, ProcessDaemon, RawLogLine};
use crate::error::{OvoError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCall {
    Install,
    Version,
    Connect,
    Start(String),
    Stop(String),
    Delete(String),
    List,
    TailLogs(String),
}

type TailMap = HashMap<String, Vec<(u64, Sender<RawLogLine>)>>;

pub struct MemoryDaemon {
    installed: AtomicBool,
    processes: Mutex<HashMap<String, DaemonProcess>>,
    launches: Mutex<HashMap<String, LaunchSpec>>,
    calls: Mutex<Vec<DaemonCall>>,
    failures: Mutex<HashMap<&'static str, String>>,
    start_status: Mutex<DaemonStatus>,
    tails: Arc<Mutex<TailMap>>,
    next_pid: AtomicU32,
    next_tail: AtomicU64,
}

impl Default for MemoryDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self {
            installed: AtomicBool::new(true),
            processes: Mutex::new(HashMap::new()),
            launches: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            start_status: Mutex::new(DaemonStatus::Online),
            tails: Arc::new(Mutex::new(HashMap::new())),
            next_pid: AtomicU32::new(40_000),
            next_tail: AtomicU64::new(1),
        }
    }

    /// A daemon that reports itself as not installed until `install` runs.
    pub fn not_installed() -> Self {
        let daemon = Self::new();
        daemon.installed.store(false, Ordering::SeqCst);
        daemon
    }

    /// Makes every future call of `operation` ("start", "stop", "delete",
    /// "list", "tail", "version", "connect") fail with `message`.
    pub fn fail_on(&self, operation: &'static str, message: &str) {
        lock(&self.failures).insert(operation, message.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Status newly started processes come up in.
    pub fn set_start_status(&self, status: DaemonStatus) {
        *lock(&self.start_status) = status;
    }

    /// Simulates the process changing state behind the supervisor's back.
    pub fn set_status(&self, name: &str, status: DaemonStatus) {
        if let Some(process) = lock(&self.processes).get_mut(name) {
            process.pid = (status == DaemonStatus::Online).then(|| self.allocate_pid());
            process.status = status;
        }
    }

    /// Removes a process without going through `delete`.
    pub fn forget(&self, name: &str) {
        lock(&self.processes).remove(name);
    }

    /// Pushes a log line to every open tail of `name`. Returns how many tails
    /// received it.
    pub fn emit_log(&self, name: &str, stream: LogStream, text: &str) -> usize {
        let mut tails = lock(&self.tails);
        let Some(senders) = tails.get_mut(name) else {
            return 0;
        };
        senders.retain(|(_, tx)| {
            tx.send(RawLogLine {
                stream: stream.clone(),
                text: text.to_string(),
            })
            .is_ok()
        });
        senders.len()
    }

    /// Ends every open tail of `name` as if the daemon side went away.
    pub fn end_tails(&self, name: &str) {
        lock(&self.tails).remove(name);
    }

    /// Number of tails currently open for `name`.
    pub fn open_tails(&self, name: &str) -> usize {
        lock(&self.tails).get(name).map_or(0, Vec::len)
    }

    pub fn calls(&self) -> Vec<DaemonCall> {
        lock(&self.calls).clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&DaemonCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|call| predicate(call)).count()
    }

    /// The launch parameters the process named `name` was last launched with.
    pub fn launch_spec(&self, name: &str) -> Option<LaunchSpec> {
        lock(&self.launches).get(name).cloned()
    }

    fn record(&self, call: DaemonCall) {
        lock(&self.calls).push(call);
    }

    fn check(&self, operation: &'static str, name: &str) -> Result<()> {
        if !self.installed.load(Ordering::SeqCst) {
            return Err(OvoError::DaemonUnavailable("memory daemon not installed".into()));
        }
        if let Some(message) = lock(&self.failures).get(operation) {
            return Err(OvoError::DaemonCallFailed {
                command: format!("{} {}", operation, name).trim().to_string(),
                details: message.clone(),
            });
        }
        Ok(())
    }

    fn allocate_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    fn not_found(operation: &str, name: &str) -> OvoError {
        OvoError::DaemonCallFailed {
            command: format!("{} {}", operation, name),
            details: "process or namespace not found".to_string(),
        }
    }
}

impl ProcessDaemon for MemoryDaemon {
    fn id(&self) -> &'static str {
        "memory"
    }

    fn locate(&self) -> Option<PathBuf> {
        self.installed
            .load(Ordering::SeqCst)
            .then(|| PathBuf::from("memory://daemon"))
    }

    fn install(&self) -> Result<String> {
        self.record(DaemonCall::Install);
        self.installed.store(true, Ordering::SeqCst);
        Ok("installed memory daemon".to_string())
    }

    fn version(&self) -> Result<String> {
        self.record(DaemonCall::Version);
        self.check("version", "")?;
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    fn connect(&self) -> Result<()> {
        self.record(DaemonCall::Connect);
        self.check("connect", "")
    }

    fn start(&self, spec: &LaunchSpec) -> Result<Option<DaemonProcess>> {
        self.record(DaemonCall::Start(spec.name.clone()));
        self.check("start", &spec.name)?;

        let status = lock(&self.start_status).clone();
        let pid = (status == DaemonStatus::Online).then(|| self.allocate_pid());
        let mut processes = lock(&self.processes);
        let restarts = processes.get(&spec.name).map_or(0, |p| p.restarts);
        let process = DaemonProcess {
            name: spec.name.clone(),
            pid,
            status,
            restarts,
            cpu: 0.0,
            memory: 0,
            started_at: Some(Utc::now().timestamp_millis()),
        };
        processes.insert(spec.name.clone(), process.clone());
        lock(&self.launches).insert(spec.name.clone(), spec.clone());
        Ok(Some(process))
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.record(DaemonCall::Stop(name.to_string()));
        self.check("stop", name)?;
        let mut processes = lock(&self.processes);
        let process = processes
            .get_mut(name)
            .ok_or_else(|| Self::not_found("stop", name))?;
        process.status = DaemonStatus::Stopped;
        process.pid = None;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.record(DaemonCall::Delete(name.to_string()));
        self.check("delete", name)?;
        lock(&self.processes)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found("delete", name))
    }

    fn list(&self) -> Result<Vec<DaemonProcess>> {
        self.record(DaemonCall::List);
        self.check("list", "")?;
        let mut processes: Vec<DaemonProcess> = lock(&self.processes).values().cloned().collect();
        processes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(processes)
    }

    fn tail_logs(&self, name: &str) -> Result<LogTail> {
        self.record(DaemonCall::TailLogs(name.to_string()));
        self.check("tail", name)?;

        let (tx, rx) = mpsc::channel();
        let tail_id = self.next_tail.fetch_add(1, Ordering::SeqCst);
        lock(&self.tails)
            .entry(name.to_string())
            .or_default()
            .push((tail_id, tx));

        let tails = Arc::clone(&self.tails);
        let name = name.to_string();
        Ok(LogTail::new(rx, move || {
            let mut tails = lock(&tails);
            if let Some(senders) = tails.get_mut(&name) {
                senders.retain(|(id, _)| *id != tail_id);
                if senders.is_empty() {
                    tails.remove(&name);
                }
            }
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
