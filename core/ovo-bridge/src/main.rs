//! ovo-bridge: gateway process between the ovo front-end and ovo-core.
//!
//! The front-end spawns this binary and talks to it over stdin/stdout, one
//! JSON object per line. Only operations on the allow-list are served.
//!
//! ## Subcommands
//!
//! - `serve` (default): Serve gateway requests until stdin closes
//! - `call`: Dispatch one operation and print the response
//! - `operations`: List the operations the gateway exposes

mod config;
mod logging;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ovo_core::{Bootstrap, BootstrapOptions, MemoryDaemon, Pm2Daemon, ProcessDaemon};
use ovo_protocol::{GatewayRequest, Operation, Outbound};
use serde_json::Value;

use config::{BridgeConfig, DaemonKind, DEFAULT_RECONCILE_SECS};
use server::StdoutSink;

#[derive(Parser)]
#[command(name = "ovo-bridge")]
#[command(about = "Project registry and process supervision gateway for ovo")]
#[command(version)]
struct Cli {
    /// Data directory (default: $OVO_DATA_DIR or the per-user data dir)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Process manager backing lifecycle operations
    #[arg(long, global = true, value_enum, default_value_t = DaemonKind::Pm2)]
    daemon: DaemonKind,

    /// pm2 binary to use (default: $OVO_PM2_BIN, then PATH lookup)
    #[arg(long, global = true, value_name = "PATH")]
    pm2_bin: Option<PathBuf>,

    /// Seconds between background reconciliations; 0 disables
    #[arg(long, global = true, default_value_t = DEFAULT_RECONCILE_SECS)]
    reconcile_secs: u64,

    /// Mirror logs to stderr in addition to the log file
    #[arg(long, global = true)]
    log_stderr: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve gateway requests from stdin until it closes
    Serve,

    /// Dispatch a single operation and print its response
    Call {
        /// Operation name, e.g. project.list
        #[arg(value_name = "OPERATION")]
        operation: String,

        /// Operation params as JSON
        #[arg(long, default_value = "null")]
        params: String,

        /// Caller identity used for log subscriptions
        #[arg(long)]
        caller: Option<String>,
    },

    /// List the operations the gateway exposes
    Operations,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Commands::Operations) = cli.command {
        for operation in Operation::ALL {
            println!("{}", operation.name());
        }
        return ExitCode::SUCCESS;
    }

    let config = BridgeConfig::new(
        cli.data_dir,
        cli.daemon,
        cli.pm2_bin,
        cli.reconcile_secs,
        cli.log_stderr,
    );
    let _logging_guard = logging::init(&config.storage.logs_dir(), config.log_stderr);

    let daemon: Arc<dyn ProcessDaemon> = match config.daemon {
        DaemonKind::Pm2 => Arc::new(Pm2Daemon::new(config.pm2_bin.clone())),
        DaemonKind::Memory => Arc::new(MemoryDaemon::new()),
    };
    let output = Arc::new(StdoutSink::new());

    let bootstrap = Bootstrap::new();
    let services = match bootstrap.initialize(BootstrapOptions {
        storage: config.storage.clone(),
        daemon,
        events: output.clone(),
    }) {
        Ok(services) => services,
        Err(err) => {
            tracing::error!(error = %err, "ovo-bridge failed to start");
            eprintln!("ovo-bridge: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                daemon = ?config.daemon,
                data_dir = %config.storage.root().display(),
                "ovo-bridge serving"
            );
            if let Some(interval) = config.reconcile_interval {
                server::spawn_reconciler(Arc::clone(&services.supervisor), interval);
            }
            let result = server::serve(Arc::clone(&services), output);
            services.logs.shutdown();
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    tracing::error!(error = %err, "ovo-bridge serve loop failed");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Call {
            operation,
            params,
            caller,
        } => {
            let params: Value = match serde_json::from_str(&params) {
                Ok(params) => params,
                Err(err) => {
                    eprintln!("ovo-bridge: --params is not valid JSON: {}", err);
                    return ExitCode::from(2);
                }
            };
            let request = GatewayRequest {
                id: None,
                operation,
                params,
                caller,
            };
            let response = services.gateway.dispatch(&request);
            let success = response.success;
            if let Err(err) = output.send(&Outbound::Response(response)) {
                eprintln!("ovo-bridge: failed to write response: {}", err);
                return ExitCode::FAILURE;
            }
            services.logs.shutdown();
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Operations => ExitCode::SUCCESS,
    }
}
