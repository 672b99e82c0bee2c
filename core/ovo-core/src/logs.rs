//! Live log streaming.
//!
//! Each project has at most one daemon log tail, opened by its first
//! subscriber and closed when its last subscriber leaves. A pump thread reads
//! the tail in order, numbers each line, and hands it to every subscriber
//! while holding the subscriber list lock. `stop_stream` removes a subscriber
//! under that same lock, which is what makes "no delivery after stop" hold.
//!
//! Subscriptions are keyed by `(caller, project)`: starting a stream that the
//! caller already has returns the existing handle and opens nothing.
//!
//! Lock order: manager state, then a stream's subscriber list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::daemon::{LogStream, ProcessDaemon, RawLogLine};
use crate::error::{OvoError, Result};

/// A log line as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub project_id: String,
    /// Position in the project's tail, starting at 1.
    pub seq: u64,
    pub stream: LogStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHandle {
    pub subscription_id: String,
    pub project_id: String,
}

/// Receives lines for one or more subscriptions.
pub trait LogSink: Send + Sync {
    /// Returns false once the receiving side is gone; the subscription is
    /// then dropped as disconnected.
    fn deliver(&self, handle: &SubscriptionHandle, line: &LogLine) -> bool;

    /// The subscription ended without the subscriber asking.
    fn closed(&self, _handle: &SubscriptionHandle, _reason: &str) {}
}

type Closer = Box<dyn FnOnce() + Send>;

struct Subscriber {
    handle: SubscriptionHandle,
    sink: Arc<dyn LogSink>,
}

struct ProjectStream {
    project_id: String,
    subscribers: Mutex<Vec<Subscriber>>,
    closer: Mutex<Option<Closer>>,
    closing: AtomicBool,
}

impl ProjectStream {
    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let closer = lock(&self.closer).take();
        if let Some(close) = closer {
            close();
        }
    }
}

#[derive(Default)]
struct State {
    /// (caller, project id) -> handle
    handles: HashMap<(String, String), SubscriptionHandle>,
    streams: HashMap<String, Arc<ProjectStream>>,
}

pub struct LogStreamManager {
    daemon: Arc<dyn ProcessDaemon>,
    state: Arc<Mutex<State>>,
}

impl LogStreamManager {
    pub fn new(daemon: Arc<dyn ProcessDaemon>) -> Self {
        Self {
            daemon,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn start_stream(
        &self,
        project_id: &str,
        caller: &str,
        sink: Arc<dyn LogSink>,
    ) -> Result<SubscriptionHandle> {
        let mut state = lock(&self.state);

        let key = (caller.to_string(), project_id.to_string());
        if let Some(handle) = state.handles.get(&key) {
            debug!(
                project_id = %project_id,
                caller = %caller,
                subscription_id = %handle.subscription_id,
                "Log stream already active; reusing subscription"
            );
            return Ok(handle.clone());
        }

        let stream = match state.streams.get(project_id) {
            Some(stream) => Arc::clone(stream),
            None => {
                let stream = self.open_tail(project_id)?;
                state
                    .streams
                    .insert(project_id.to_string(), Arc::clone(&stream));
                stream
            }
        };

        let handle = SubscriptionHandle {
            subscription_id: Ulid::new().to_string(),
            project_id: project_id.to_string(),
        };
        lock(&stream.subscribers).push(Subscriber {
            handle: handle.clone(),
            sink,
        });
        state.handles.insert(key, handle.clone());

        info!(
            project_id = %project_id,
            caller = %caller,
            subscription_id = %handle.subscription_id,
            "Log stream started"
        );
        Ok(handle)
    }

    /// Ends one subscription. Nothing is delivered to it after this returns.
    /// Returns false for an unknown subscription.
    pub fn stop_stream(&self, subscription_id: &str) -> bool {
        let to_close = {
            let mut state = lock(&self.state);
            let Some(key) = state
                .handles
                .iter()
                .find(|(_, handle)| handle.subscription_id == subscription_id)
                .map(|(key, _)| key.clone())
            else {
                return false;
            };
            let Some(handle) = state.handles.remove(&key) else {
                return false;
            };
            let (_, to_close) = detach(&mut state, &handle.project_id, |s| {
                s.handle.subscription_id == subscription_id
            });
            to_close
        };

        info!(subscription_id = %subscription_id, "Log stream stopped");
        if let Some(stream) = to_close {
            stream.close();
        }
        true
    }

    /// Ends every subscription of a project and closes its tail. Returns how
    /// many subscriptions were ended.
    pub fn stop_all_for_project(&self, project_id: &str) -> usize {
        let (removed, to_close) = {
            let mut state = lock(&self.state);
            state
                .handles
                .retain(|(_, project), _| project.as_str() != project_id);
            detach(&mut state, project_id, |_| true)
        };

        if let Some(stream) = to_close {
            stream.close();
        }
        for subscriber in &removed {
            subscriber.sink.closed(&subscriber.handle, "project removed");
        }
        if !removed.is_empty() {
            info!(project_id = %project_id, count = removed.len(), "Log streams stopped");
        }
        removed.len()
    }

    /// Closes every tail. Used when the process shuts down.
    pub fn shutdown(&self) {
        let streams: Vec<Arc<ProjectStream>> = {
            let mut state = lock(&self.state);
            state.handles.clear();
            state.streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in streams {
            lock(&stream.subscribers).clear();
            stream.close();
        }
    }

    /// The caller's active subscription for a project, if any.
    pub fn subscription_for(&self, caller: &str, project_id: &str) -> Option<SubscriptionHandle> {
        lock(&self.state)
            .handles
            .get(&(caller.to_string(), project_id.to_string()))
            .cloned()
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionHandle> {
        let mut handles: Vec<SubscriptionHandle> =
            lock(&self.state).handles.values().cloned().collect();
        handles.sort_by(|a, b| a.subscription_id.cmp(&b.subscription_id));
        handles
    }

    fn open_tail(&self, project_id: &str) -> Result<Arc<ProjectStream>> {
        let (lines, closer) = self.daemon.tail_logs(project_id)?.into_parts();
        let stream = Arc::new(ProjectStream {
            project_id: project_id.to_string(),
            subscribers: Mutex::new(Vec::new()),
            closer: Mutex::new(Some(closer)),
            closing: AtomicBool::new(false),
        });

        let pump_stream = Arc::clone(&stream);
        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name(format!("log-pump-{}", project_id))
            .spawn(move || pump(lines, pump_stream, state));

        if let Err(err) = spawned {
            stream.close();
            return Err(OvoError::io("spawning log pump thread", err));
        }
        debug!(project_id = %project_id, "Log tail opened");
        Ok(stream)
    }
}

/// Removes the subscribers of `project_id` matching `predicate`. When none
/// remain, the stream is unregistered and returned so the caller can close
/// it after releasing the state lock.
fn detach(
    state: &mut State,
    project_id: &str,
    predicate: impl Fn(&Subscriber) -> bool,
) -> (Vec<Subscriber>, Option<Arc<ProjectStream>>) {
    let Some(stream) = state.streams.get(project_id).cloned() else {
        return (Vec::new(), None);
    };

    let (removed, remaining) = {
        let mut subscribers = lock(&stream.subscribers);
        let (removed, kept): (Vec<Subscriber>, Vec<Subscriber>) =
            subscribers.drain(..).partition(|s| predicate(s));
        *subscribers = kept;
        (removed, subscribers.len())
    };

    if remaining > 0 {
        return (removed, None);
    }
    state.streams.remove(project_id);
    (removed, Some(stream))
}

fn pump(lines: Receiver<RawLogLine>, stream: Arc<ProjectStream>, state: Arc<Mutex<State>>) {
    let mut seq = 0u64;
    for raw in lines {
        seq += 1;
        let line = LogLine {
            project_id: stream.project_id.clone(),
            seq,
            stream: raw.stream,
            text: raw.text,
            timestamp: Utc::now(),
        };

        let mut disconnected = Vec::new();
        {
            let mut subscribers = lock(&stream.subscribers);
            subscribers.retain(|s| {
                let alive = s.sink.deliver(&s.handle, &line);
                if !alive {
                    disconnected.push(s.handle.subscription_id.clone());
                }
                alive
            });
        }

        if !disconnected.is_empty() {
            forget_disconnected(&state, &stream, &disconnected);
        }
    }

    if stream.closing.load(Ordering::SeqCst) {
        debug!(project_id = %stream.project_id, "Log tail closed");
        return;
    }

    // The tail ended on its own (daemon gone, process deleted elsewhere).
    let orphaned = {
        let mut state = lock(&state);
        if state
            .streams
            .get(&stream.project_id)
            .is_some_and(|current| Arc::ptr_eq(current, &stream))
        {
            state.streams.remove(&stream.project_id);
        }
        let orphaned = std::mem::take(&mut *lock(&stream.subscribers));
        state.handles.retain(|_, handle| {
            !orphaned
                .iter()
                .any(|s| s.handle.subscription_id == handle.subscription_id)
        });
        orphaned
    };

    warn!(
        project_id = %stream.project_id,
        subscribers = orphaned.len(),
        "Log tail ended"
    );
    for subscriber in orphaned {
        subscriber.sink.closed(&subscriber.handle, "log tail ended");
    }
    stream.close();
}

fn forget_disconnected(state: &Mutex<State>, stream: &Arc<ProjectStream>, ids: &[String]) {
    let to_close = {
        let mut state = lock(state);
        state
            .handles
            .retain(|_, handle| !ids.contains(&handle.subscription_id));

        let empty = lock(&stream.subscribers).is_empty();
        let registered = state
            .streams
            .get(&stream.project_id)
            .is_some_and(|current| Arc::ptr_eq(current, stream));
        if empty && registered {
            state.streams.remove(&stream.project_id);
            true
        } else {
            false
        }
    };

    debug!(project_id = %stream.project_id, count = ids.len(), "Dropped disconnected log subscribers");
    if to_close {
        stream.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
