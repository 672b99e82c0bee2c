use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use serde_json::{json, Value};
use tempfile::TempDir;

struct BridgeGuard {
    child: Child,
}

impl Drop for BridgeGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn bridge_command(data_dir: &TempDir) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ovo-bridge"));
    command
        .arg("--data-dir")
        .arg(data_dir.path())
        .args(["--daemon", "memory", "--reconcile-secs", "0"])
        .env_remove("OVO_DEBUG_LOG");
    command
}

fn spawn_bridge(data_dir: &TempDir) -> (BridgeGuard, ChildStdin, BufReader<ChildStdout>) {
    let mut child = bridge_command(data_dir)
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn ovo-bridge");
    let stdin = child.stdin.take().expect("stdin");
    let stdout = BufReader::new(child.stdout.take().expect("stdout"));
    (BridgeGuard { child }, stdin, stdout)
}

fn roundtrip(stdin: &mut ChildStdin, stdout: &mut BufReader<ChildStdout>, line: &str) -> Value {
    writeln!(stdin, "{}", line).expect("write request");
    stdin.flush().expect("flush request");
    let mut response = String::new();
    stdout.read_line(&mut response).expect("read response");
    serde_json::from_str(&response).expect("response is JSON")
}

#[test]
fn test_serve_handles_requests_in_sequence() {
    let tmp = TempDir::new().unwrap();
    let (mut guard, mut stdin, mut stdout) = spawn_bridge(&tmp);

    let added = roundtrip(
        &mut stdin,
        &mut stdout,
        &json!({
            "id": "1",
            "operation": "project.add",
            "params": { "name": "test2", "path": "/Users/vidar/ovo/test2" }
        })
        .to_string(),
    );
    assert_eq!(added["type"], "response");
    assert_eq!(added["id"], "1");
    assert_eq!(added["success"], true);
    assert_eq!(added["data"]["id"], "test2qyiab2");

    let started = roundtrip(
        &mut stdin,
        &mut stdout,
        &json!({ "id": "2", "operation": "process.start", "params": { "id": "test2qyiab2" } })
            .to_string(),
    );
    assert_eq!(started["success"], true);
    assert_eq!(started["data"]["project"]["status"], "running");

    let listed = roundtrip(
        &mut stdin,
        &mut stdout,
        r#"{"id":"3","operation":"process.list"}"#,
    );
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let refused = roundtrip(
        &mut stdin,
        &mut stdout,
        r#"{"id":"4","operation":"shell.exec","params":{"cmd":"ls"}}"#,
    );
    assert_eq!(refused["id"], "4");
    assert_eq!(refused["success"], false);
    assert_eq!(refused["error"]["code"], "operation_not_allowed");

    let malformed = roundtrip(&mut stdin, &mut stdout, "{not json");
    assert_eq!(malformed["error"]["code"], "invalid_json");

    drop(stdin);
    let status = guard.child.wait().expect("bridge exits");
    assert!(status.success());
}

#[test]
fn test_call_prints_single_response() {
    let tmp = TempDir::new().unwrap();
    let output = bridge_command(&tmp)
        .args(["call", "project.list"])
        .stderr(Stdio::null())
        .output()
        .expect("run ovo-bridge call");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let response: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(response["success"], true);
    assert_eq!(response["data"], json!([]));
}

#[test]
fn test_call_with_unknown_operation_fails() {
    let tmp = TempDir::new().unwrap();
    let output = bridge_command(&tmp)
        .args(["call", "fs.readFile"])
        .stderr(Stdio::null())
        .output()
        .expect("run ovo-bridge call");
    assert!(!output.status.success());

    let response: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["error"]["code"], "operation_not_allowed");
}

#[test]
fn test_operations_lists_allow_list() {
    let output = Command::new(env!("CARGO_BIN_EXE_ovo-bridge"))
        .arg("operations")
        .output()
        .expect("run ovo-bridge operations");
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let names: Vec<&str> = stdout.lines().collect();
    assert_eq!(names.len(), 19);
    assert!(names.contains(&"project.add"));
    assert!(names.contains(&"process.startLogStream"));
}
