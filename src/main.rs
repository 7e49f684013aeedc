//! fbns-listener: connect, register and print push notifications
//!
//! Notifications and newly issued tokens are written to stdout as JSON
//! lines; logs go to stderr.

use clap::{Parser, Subcommand};
use fbns_mqtt::config::FbnsConfig;
use fbns_mqtt::error::sanitize_for_log;
use fbns_mqtt::listener::{Listener, ListenerEvent};
use fbns_mqtt::observability::init_default_logging;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "fbns-listener")]
#[command(about = "Listen for push notifications over the MQTToT transport")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "FBNS_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging unless LOG_LEVEL says otherwise
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and stream notifications until interrupted
    Listen,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging(cli.verbose);

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen => listen(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", sanitize_for_log(&e.to_string()));
        process::exit(1);
    }
}

fn load_configuration(path: Option<&std::path::Path>) -> Result<FbnsConfig, Box<dyn std::error::Error>> {
    let (config, source) = FbnsConfig::discover(path)?;
    match source {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }
    config.validate()?;
    Ok(config)
}

async fn listen(config: FbnsConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        broker = %config.server.broker_url,
        state_file = %config.session.state_file.display(),
        "Starting fbns-listener v{}",
        env!("CARGO_PKG_VERSION")
    );

    let listener = Listener::new(config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink, mut events) = mpsc::unbounded_channel();

    let printer = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(event) = events.recv().await {
            let line = match &event {
                ListenerEvent::Push(push) => serde_json::to_string(push),
                ListenerEvent::NewToken(token) => serde_json::to_string(&json!({ "token": token })),
            };
            match line {
                Ok(line) => {
                    let mut out = stdout.lock();
                    if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
                        warn!("stdout closed, dropping output");
                    }
                }
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    });

    let mut run = tokio::spawn(listener.run(shutdown_rx, sink));

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let finished = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            None
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            None
        }
        finished = &mut run => Some(finished),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    let _ = printer.await;
    result?.map_err(Into::into)
}

fn handle_config_command(config: &FbnsConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration is valid");
    Ok(())
}
