//! ws-reactor: a WebSocket demo server
//!
//! Runs one of the bundled handlers on a single-threaded event loop:
//! - `echo`: sends every message back
//! - `command`: answers date/time/country/city lookups
//!
//! Features:
//! - TCP or Unix-domain listener
//! - Optional time budget after which the server shuts down
//! - Console and/or log file output of lifecycle events
//! - Configuration via CLI arguments or TOML file

use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use ws_reactor::commands::{CommandHandler, EchoHandler};
use ws_reactor::config::{Config, HandlerKind};
use ws_reactor::{MessageHandler, Server, ServerSettings};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config)?;

    info!(
        listen = %config.listen,
        handler = ?config.handler,
        time_limit = config.time_limit,
        max_connections = config.max_connections,
        "Starting ws-reactor server"
    );

    match config.handler {
        HandlerKind::Echo => run(&config, EchoHandler),
        HandlerKind::Command => run(&config, CommandHandler),
    }
}

/// Bind and run until stopped or the time budget expires.
fn run<H: MessageHandler>(config: &Config, handler: H) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::bind(&config.listen, ServerSettings::from(config), handler)?;
    server.start()?;
    info!("Server stopped");
    Ok(())
}

/// Console output follows `verbose`; a log file, when configured, always
/// receives the configured level.
fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let console_level = if config.verbose {
        config.log_level.as_str()
    } else {
        "warn"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(console_level));
    let console = fmt::layer().with_target(false).with_filter(console_filter);

    let file = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new(&config.log_level));
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .init();

    Ok(())
}
