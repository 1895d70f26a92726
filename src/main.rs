//! Telemetry service CLI
//!
//! Entry point for the `telemetry-service` command-line tool.

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use telemetry_core::signal::{SignalHandler, EXIT_CODE_INTERRUPTED};
use telemetry_core::streams::{StreamEndpoint, StreamMux, StreamRegistry};
use telemetry_core::{logging, ServiceConfig, SocketServer};

const TEARDOWN_POLL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "telemetry-service")]
#[command(about = "Local record service for run telemetry", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the socket service until teardown
    Serve {
        /// Interface to bind (default: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for an ephemeral port
        #[arg(long, short = 'p')]
        port: Option<u16>,

        /// Path to a TOML config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Write the bound port to this file once listening
        #[arg(long)]
        port_file: Option<PathBuf>,
    },

    /// Print the effective configuration with secrets redacted
    Config {
        /// Path to a TOML config file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            config,
            port_file,
        } => {
            logging::init();
            let code = run_serve(host, port, config, port_file);
            process::exit(code);
        }
        Commands::Config { config } => run_config(config),
    }
}

fn cli_overrides(host: Option<String>, port: Option<u16>) -> Option<Value> {
    let mut server = Map::new();
    if let Some(host) = host {
        server.insert("host".to_string(), json!(host));
    }
    if let Some(port) = port {
        server.insert("port".to_string(), json!(port));
    }
    (!server.is_empty()).then(|| json!({ "server": server }))
}

/// Log every record a stream receives until the stream closes.
fn log_records(endpoint: StreamEndpoint) {
    tracing::info!(stream_id = %endpoint.id, settings = endpoint.settings.len(), "stream opened");
    let mut count: u64 = 0;
    while let Some(record) = endpoint.recv() {
        count += 1;
        tracing::debug!(stream_id = %endpoint.id, data = %record.data, "record");
    }
    tracing::info!(stream_id = %endpoint.id, records = count, "stream closed");
}

fn run_serve(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<PathBuf>,
    port_file: Option<PathBuf>,
) -> i32 {
    let config = match ServiceConfig::load(config_path.as_deref(), cli_overrides(host, port)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return 1;
        }
    };
    tracing::debug!(config = %config.redacted(), "effective configuration");

    let mux = Arc::new(StreamMux::with_processor(log_records));
    let mut server = SocketServer::with_config(mux.clone(), config.server_config());
    let port = match server.start() {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Error starting server: {}", e);
            return 1;
        }
    };

    println!("Running at port: {}", port);
    if let Some(path) = port_file {
        if let Err(e) = write_port_file(&path, port) {
            eprintln!("Error writing port file {}: {}", path.display(), e);
            server.stop();
            return 1;
        }
    }

    let handler = SignalHandler::new();
    let registry = mux.clone();
    if let Err(e) = handler.install(move || registry.teardown(EXIT_CODE_INTERRUPTED)) {
        tracing::warn!(error = %e, "failed to install signal handler");
    }

    // a single-connection server also ends when its client goes away
    let exit_code = loop {
        if let Some(code) = mux.wait_for_teardown(Some(TEARDOWN_POLL)) {
            break code;
        }
        if !server.is_running() {
            break 0;
        }
    };
    server.stop();
    if let Err(e) = server.join() {
        tracing::error!(error = %e, "socket server failed");
        if exit_code == 0 {
            return 1;
        }
    }
    exit_code
}

fn write_port_file(path: &Path, port: u16) -> std::io::Result<()> {
    fs::write(path, format!("{}\n", port))
}

fn run_config(config_path: Option<PathBuf>) {
    let config = match ServiceConfig::load(config_path.as_deref(), None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&config.redacted()) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
    }
}
