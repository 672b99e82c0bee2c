//! Newline-delimited JSON over stdin/stdout.
//!
//! Each request line is dispatched on its own thread so a slow daemon call
//! never holds up other requests; responses carry the request id and may
//! come back out of order. Push events share stdout with responses, one
//! `Outbound` object per line.

use std::io::{self, BufRead, Stdout, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ovo_core::{EventSink, OvoError, ProcessSupervisor, Services};
use ovo_protocol::{GatewayRequest, GatewayResponse, Outbound, PushEvent, MAX_REQUEST_BYTES};
use tracing::{debug, info, warn};

/// Serializes everything written to stdout so lines never interleave.
pub struct StdoutSink {
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }

    pub fn send(&self, outbound: &Outbound) -> io::Result<()> {
        let mut out = match self.out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        serde_json::to_writer(&mut *out, outbound)?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StdoutSink {
    fn emit(&self, event: PushEvent) -> bool {
        match self.send(&Outbound::Event(event)) {
            Ok(()) => true,
            Err(err) => {
                debug!(error = %err, "Front-end gone; dropping push event");
                false
            }
        }
    }
}

/// Reads requests until stdin closes, then waits for in-flight requests.
pub fn serve(services: Arc<Services>, output: Arc<StdoutSink>) -> io::Result<()> {
    let stdin = io::stdin();
    let mut requests = 0u64;

    thread::scope(|scope| -> io::Result<()> {
        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            requests += 1;

            let request = match parse_request(&line) {
                Ok(request) => request,
                Err(response) => {
                    output.send(&Outbound::Response(response))?;
                    continue;
                }
            };

            let gateway = Arc::clone(&services.gateway);
            let output = Arc::clone(&output);
            scope.spawn(move || {
                let response = gateway.dispatch(&request);
                if let Err(err) = output.send(&Outbound::Response(response)) {
                    warn!(error = %err, operation = %request.operation, "Failed to write response");
                }
            });
        }
        Ok(())
    })?;

    info!(requests, "stdin closed; bridge shutting down");
    Ok(())
}

fn parse_request(line: &str) -> Result<GatewayRequest, GatewayResponse> {
    if line.len() > MAX_REQUEST_BYTES {
        return Err(GatewayResponse::error(
            None,
            "request_too_large",
            format!("request exceeds {} bytes", MAX_REQUEST_BYTES),
        ));
    }
    serde_json::from_str(line).map_err(|err| {
        GatewayResponse::error(None, "invalid_json", format!("Invalid request JSON: {}", err))
    })
}

/// Periodically folds daemon state into the registry so crashes show up
/// without the front-end asking.
pub fn spawn_reconciler(supervisor: Arc<ProcessSupervisor>, interval: Duration) {
    let spawned = thread::Builder::new()
        .name("ovo-reconciler".to_string())
        .spawn(move || loop {
            thread::sleep(interval);
            match supervisor.list() {
                Ok(views) => debug!(projects = views.len(), "Periodic reconciliation"),
                Err(OvoError::DaemonUnavailable(reason)) => {
                    debug!(reason = %reason, "Periodic reconciliation skipped; daemon unavailable")
                }
                Err(err) => warn!(error = %err, "Periodic reconciliation failed"),
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to start reconciler thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_line_yields_invalid_json() {
        let response = parse_request("{not json").unwrap_err();
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, "invalid_json");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let response = parse_request(r#"{"operation":"project.list","extra":1}"#).unwrap_err();
        assert_eq!(response.error.unwrap().code, "invalid_json");
    }

    #[test]
    fn oversized_line_is_rejected() {
        let line = "x".repeat(MAX_REQUEST_BYTES + 1);
        let response = parse_request(&line).unwrap_err();
        assert_eq!(response.error.unwrap().code, "request_too_large");
    }

    #[test]
    fn well_formed_request_parses() {
        let request =
            parse_request(r#"{"id":"7","operation":"port.check","params":{"port":3000}}"#).unwrap();
        assert_eq!(request.id.as_deref(), Some("7"));
        assert_eq!(request.operation, "port.check");
    }
}
