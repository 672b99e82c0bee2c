//! pm2 driven through its CLI.
//!
//! Every call spawns `pm2 <subcommand>` and waits for it. `pm2 jlist` is the
//! only source of process state; its JSON is parsed leniently because pm2
//! versions disagree on optional fields and some print warnings before the
//! array.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DaemonProcess, DaemonStatus, LaunchSpec, LogStream, LogTail, ProcessDaemon, RawLogLine};
use crate::error::{OvoError, Result};

const PM2_FALLBACK_PATHS: &[&str] = &[
    "/opt/homebrew/bin/pm2", // Homebrew (Apple Silicon)
    "/usr/local/bin/pm2",    // Homebrew (Intel) or npm -g with default prefix
    "/usr/bin/pm2",
];

const NPM_FALLBACK_PATHS: &[&str] = &["/opt/homebrew/bin/npm", "/usr/local/bin/npm", "/usr/bin/npm"];

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI regex"));

pub struct Pm2Daemon {
    binary_override: Option<PathBuf>,
}

impl Pm2Daemon {
    /// `binary_override` pins the pm2 binary (e.g. from `OVO_PM2_BIN`);
    /// otherwise pm2 is looked up on PATH and in common install locations.
    pub fn new(binary_override: Option<PathBuf>) -> Self {
        Self { binary_override }
    }

    fn binary(&self) -> Result<PathBuf> {
        self.locate().ok_or_else(|| {
            OvoError::DaemonUnavailable("pm2 was not found on PATH or in common locations".into())
        })
    }

    fn run(&self, args: &[&str], env: &[(String, String)], cwd: Option<&Path>) -> Result<String> {
        let binary = self.binary()?;
        let command_line = format!("pm2 {}", args.join(" "));
        debug!(command = %command_line, "Running pm2");

        let mut command = Command::new(&binary);
        command.args(args).stdin(Stdio::null());
        for (key, value) in env {
            command.env(key, value);
        }
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command.output().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                OvoError::DaemonUnavailable(format!("{} could not be executed", binary.display()))
            } else {
                OvoError::DaemonCallFailed {
                    command: command_line.clone(),
                    details: err.to_string(),
                }
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = strip_ansi(String::from_utf8_lossy(&output.stderr).trim());
            let details = if stderr.is_empty() {
                strip_ansi(stdout.trim())
            } else {
                stderr
            };
            return Err(OvoError::DaemonCallFailed {
                command: command_line,
                details,
            });
        }
        Ok(stdout)
    }
}

impl ProcessDaemon for Pm2Daemon {
    fn id(&self) -> &'static str {
        "pm2"
    }

    fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = &self.binary_override {
            return path.is_file().then(|| path.clone());
        }
        which_with_fallback("pm2", PM2_FALLBACK_PATHS)
    }

    fn install(&self) -> Result<String> {
        let npm = which_with_fallback("npm", NPM_FALLBACK_PATHS).ok_or_else(|| {
            OvoError::DaemonUnavailable("npm was not found; install Node.js first".into())
        })?;
        info!(npm = %npm.display(), "Installing pm2 globally");

        let output = Command::new(&npm)
            .args(["install", "-g", "pm2"])
            .stdin(Stdio::null())
            .output()
            .map_err(|err| OvoError::DaemonCallFailed {
                command: "npm install -g pm2".to_string(),
                details: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(OvoError::DaemonCallFailed {
                command: "npm install -g pm2".to_string(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn version(&self) -> Result<String> {
        let stdout = self.run(&["--version"], &[], None)?;
        // pm2 may print a daemon banner first; the version is the last line.
        stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| OvoError::DaemonCallFailed {
                command: "pm2 --version".to_string(),
                details: "empty output".to_string(),
            })
    }

    fn connect(&self) -> Result<()> {
        self.run(&["ping"], &[], None).map(|_| ())
    }

    fn start(&self, spec: &LaunchSpec) -> Result<Option<DaemonProcess>> {
        // An existing entry (even stopped) is restarted in place so pm2 keeps
        // one process per project name.
        if self.describe(&spec.name)?.is_some() {
            self.run(
                &["restart", &spec.name, "--update-env"],
                &spec.env,
                Some(&spec.cwd),
            )?;
        } else {
            let cwd = spec.cwd.to_string_lossy().to_string();
            let mut args: Vec<&str> = vec![
                "start",
                &spec.command,
                "--name",
                &spec.name,
                "--cwd",
                &cwd,
                "--time",
            ];
            if !spec.args.is_empty() {
                args.push("--");
                args.extend(spec.args.iter().map(String::as_str));
            }
            self.run(&args, &spec.env, Some(&spec.cwd))?;
        }
        self.describe(&spec.name)
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.run(&["stop", name], &[], None).map(|_| ())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.run(&["delete", name], &[], None).map(|_| ())
    }

    fn list(&self) -> Result<Vec<DaemonProcess>> {
        let stdout = self.run(&["jlist"], &[], None)?;
        parse_jlist(&stdout).map_err(|details| OvoError::DaemonCallFailed {
            command: "pm2 jlist".to_string(),
            details,
        })
    }

    fn tail_logs(&self, name: &str) -> Result<LogTail> {
        let binary = self.binary()?;
        let mut child = Command::new(&binary)
            .args(["logs", name, "--raw", "--lines", "0"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| OvoError::DaemonCallFailed {
                command: format!("pm2 logs {}", name),
                details: err.to_string(),
            })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, LogStream::Out, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, LogStream::Err, tx);
        }

        let child = Arc::new(Mutex::new(child));
        let name = name.to_string();
        Ok(LogTail::new(rx, move || close_tail(&child, &name)))
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(
    source: R,
    stream: LogStream,
    tx: Sender<RawLogLine>,
) {
    thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            let Ok(line) = line else { break };
            let text = strip_ansi(&line);
            if tx
                .send(RawLogLine {
                    stream: stream.clone(),
                    text,
                })
                .is_err()
            {
                break;
            }
        }
    });
}

fn close_tail(child: &Mutex<Child>, name: &str) {
    let mut child = match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(err) = child.kill() {
        // Already exited is fine.
        debug!(process = %name, error = %err, "pm2 log tail kill failed");
    }
    let _ = child.wait();
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    monit: Option<JlistMonit>,
    #[serde(default)]
    pm2_env: Option<JlistEnv>,
}

#[derive(Debug, Deserialize)]
struct JlistMonit {
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    cpu: f32,
}

#[derive(Debug, Deserialize)]
struct JlistEnv {
    #[serde(default)]
    status: Option<DaemonStatus>,
    #[serde(default)]
    restart_time: u32,
    #[serde(default)]
    pm_uptime: Option<i64>,
}

/// Parses `pm2 jlist` output into daemon processes.
pub fn parse_jlist(stdout: &str) -> std::result::Result<Vec<DaemonProcess>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    // Banner lines like "[PM2] Spawning ..." also start with '[', so try each
    // candidate line until one parses as the process array.
    let mut last_error = "no JSON array in pm2 jlist output".to_string();
    let mut entries: Option<Vec<JlistEntry>> = None;
    let mut offset = 0;
    for line in trimmed.split_inclusive('\n') {
        if line.trim_start().starts_with('[') {
            match serde_json::from_str(&trimmed[offset..]) {
                Ok(parsed) => {
                    entries = Some(parsed);
                    break;
                }
                Err(err) => last_error = format!("invalid jlist JSON: {}", err),
            }
        }
        offset += line.len();
    }
    let entries = entries.ok_or(last_error)?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            let env = entry.pm2_env;
            let status = env
                .as_ref()
                .and_then(|e| e.status.clone())
                .unwrap_or(DaemonStatus::Other);
            DaemonProcess {
                name: entry.name,
                // pm2 reports pid 0 for stopped processes.
                pid: entry.pid.filter(|pid| *pid > 0),
                status,
                restarts: env.as_ref().map_or(0, |e| e.restart_time),
                cpu: entry.monit.as_ref().map_or(0.0, |m| m.cpu),
                memory: entry.monit.as_ref().map_or(0, |m| m.memory),
                started_at: env.and_then(|e| e.pm_uptime),
            }
        })
        .collect())
}

fn which(binary: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(binary).output().ok()?;

    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn which_with_fallback(binary: &str, fallback_paths: &[&str]) -> Option<PathBuf> {
    // Try `which` first (works in Terminal, may fail in GUI apps)
    if let Some(path) = which(binary) {
        return Some(path);
    }

    // GUI apps don't inherit shell PATH
    for path in fallback_paths {
        let p = Path::new(path);
        if p.is_file() {
            return Some(p.to_path_buf());
        }
    }

    // npm prefixes commonly configured per user
    let home = dirs::home_dir()?;
    for dir in [".npm-global/bin", ".volta/bin", ".local/bin"] {
        let candidate = home.join(dir).join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    warn!(binary, "Binary not found on PATH or fallback locations");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const JLIST: &str = r#"[
        {"pid": 4242, "name": "web12345", "pm_id": 0,
         "monit": {"memory": 52428800, "cpu": 1.5},
         "pm2_env": {"status": "online", "restart_time": 2, "pm_uptime": 1769774400000}},
        {"pid": 0, "name": "api67890", "pm_id": 1,
         "monit": {"memory": 0, "cpu": 0},
         "pm2_env": {"status": "stopped", "restart_time": 0}}
    ]"#;

    #[test]
    fn parses_jlist_entries() {
        let processes = parse_jlist(JLIST).unwrap();
        assert_eq!(processes.len(), 2);

        let web = &processes[0];
        assert_eq!(web.name, "web12345");
        assert_eq!(web.pid, Some(4242));
        assert_eq!(web.status, DaemonStatus::Online);
        assert_eq!(web.restarts, 2);
        assert_eq!(web.memory, 52_428_800);
        assert_eq!(web.started_at, Some(1_769_774_400_000));

        let api = &processes[1];
        assert_eq!(api.status, DaemonStatus::Stopped);
        assert_eq!(api.pid, None);
    }

    #[test]
    fn skips_banner_before_json() {
        let output = format!("[PM2] Spawning PM2 daemon with pm2_home=/x\n{}", JLIST);
        assert_eq!(parse_jlist(&output).unwrap().len(), 2);
    }

    #[test]
    fn empty_output_is_empty_list() {
        assert!(parse_jlist("").unwrap().is_empty());
        assert!(parse_jlist("[]").unwrap().is_empty());
    }

    #[test]
    fn missing_env_maps_to_other_status() {
        let processes = parse_jlist(r#"[{"name": "bare"}]"#).unwrap();
        assert_eq!(processes[0].status, DaemonStatus::Other);
        assert_eq!(processes[0].restarts, 0);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_jlist("pm2 exploded").is_err());
    }

    #[test]
    fn strips_color_codes() {
        assert_eq!(
            strip_ansi("\x1b[32mready\x1b[39m in 120ms"),
            "ready in 120ms"
        );
    }

    #[test]
    fn missing_override_binary_is_unavailable() {
        let daemon = Pm2Daemon::new(Some(PathBuf::from("/definitely/not/pm2")));
        assert!(daemon.locate().is_none());
        assert!(matches!(
            daemon.list().unwrap_err(),
            OvoError::DaemonUnavailable(_)
        ));
    }
}
