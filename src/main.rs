//! cadwork-mcp: MCP bridge to a running Cadwork 3D plug-in
//!
//! The same binary runs either end of the plug-in protocol: the MCP stdio
//! bridge, the plug-in listener over an in-memory model, or a one-shot
//! command client.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use cadwork_mcp::client::Connection;
use cadwork_mcp::config::{self, Config};
use cadwork_mcp::host::{self, Model};
use cadwork_mcp::mcp::McpServer;
use cadwork_mcp::server::PluginServer;
use cadwork_mcp::wire::{Command, Fields};

/// MCP bridge to a running Cadwork 3D plug-in.
///
/// Exposes the plug-in's model operations as MCP tools over stdio, and can
/// also run the plug-in side or send single commands for testing.
#[derive(Parser, Debug)]
#[command(name = "cadwork-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, global = true, value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Mode {
    /// Run the MCP server on stdio (default)
    Bridge,

    /// Run the plug-in listener over an in-memory model
    Serve,

    /// Send one command to the plug-in and print the response
    Send {
        /// Operation name, e.g. `ping` or `create_beam`
        operation: String,

        /// Arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        args: Option<String>,
    },
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Parses the `--args` option of `send`.
fn parse_send_args(raw: Option<&str>) -> Result<Fields, String> {
    let Some(raw) = raw else {
        return Ok(Fields::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("--args must be a JSON object, got {other}")),
        Err(e) => Err(format!("--args is not valid JSON: {e}")),
    }
}

/// Completes on SIGINT or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        error!("Failed to install signal handlers");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Completes on Ctrl+C.
#[cfg(windows)]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, initiating graceful shutdown");
    } else {
        error!("Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

async fn run_bridge(cfg: &Config) -> ExitCode {
    let connection = Connection::from_config(&cfg.connection);
    info!(status = %connection.status(), "Plug-in connection configured");

    let mut server = McpServer::new(connection);
    server.handshake().await;

    info!("MCP server ready, waiting for client connection...");
    match server.run().await {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(cfg: &Config) -> ExitCode {
    let model = Arc::new(Mutex::new(Model::new(cfg.server.model_name.clone())));
    let server = match PluginServer::from_config(&cfg.server, host::dispatcher(&model)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start plug-in listener");
            return ExitCode::FAILURE;
        }
    };

    server.serve(shutdown_signal()).await;
    info!("Plug-in listener shut down gracefully");
    ExitCode::SUCCESS
}

async fn run_send(cfg: &Config, operation: String, args: Option<&str>) -> ExitCode {
    let command = match parse_send_args(args)
        .and_then(|args| Command::new(operation, args).map_err(|e| e.to_string()))
    {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Invalid command: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut connection = Connection::from_config(&cfg.connection);
    let outcome = match connection.connect().await {
        Ok(()) => connection.send(&command).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(response) => {
            match serde_json::to_string_pretty(&response.to_value()) {
                Ok(text) => println!("{text}"),
                Err(e) => {
                    eprintln!("Failed to render response: {e}");
                    return ExitCode::FAILURE;
                }
            }
            if response.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Entry point for cadwork-mcp.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nConfig location: {}", default_path.display());
                    eprintln!("Create one based on config/example-config.json");
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cadwork-mcp");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match args.command.unwrap_or(Mode::Bridge) {
        Mode::Bridge => runtime.block_on(run_bridge(&cfg)),
        Mode::Serve => runtime.block_on(run_serve(&cfg)),
        Mode::Send { operation, args } => {
            runtime.block_on(run_send(&cfg, operation, args.as_deref()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn bridge_is_the_default_mode() {
        let args = Args::try_parse_from(["cadwork-mcp", "-vv"]).unwrap();
        assert_eq!(args.command, None);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn send_takes_operation_and_args() {
        let args = Args::try_parse_from([
            "cadwork-mcp",
            "send",
            "get_element_info",
            "--args",
            r#"{"element_id": 1}"#,
            "--config",
            "cw.json",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("cw.json")));
        assert_eq!(
            args.command,
            Some(Mode::Send {
                operation: "get_element_info".to_string(),
                args: Some(r#"{"element_id": 1}"#.to_string()),
            })
        );
    }

    #[test]
    fn log_level_precedence() {
        assert_eq!(get_log_level(0, true, "trace"), Level::ERROR);
        assert_eq!(get_log_level(0, false, "DEBUG"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "bogus"), Level::WARN);
        assert_eq!(get_log_level(1, false, "error"), Level::INFO);
        assert_eq!(get_log_level(5, false, "warn"), Level::TRACE);
    }

    #[test]
    fn send_args_must_be_an_object() {
        assert!(parse_send_args(None).unwrap().is_empty());
        assert_eq!(parse_send_args(Some(r#"{"a": 1}"#)).unwrap().len(), 1);
        assert!(parse_send_args(Some("[1]")).unwrap_err().contains("JSON object"));
        assert!(parse_send_args(Some("{")).unwrap_err().contains("not valid JSON"));
    }
}
