//! glomersd - cluster node speaking the line-delimited JSON protocol
//!
//! Reads messages from stdin, writes messages to stdout, logs to stderr.

use clap::Parser;
use glomers_net::Transport;
use glomersd::config::Config;
use glomersd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long queued output may take to reach stdout at exit
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

fn init_tracing(config: &Config) {
    let default_level = if config.verbose {
        "glomersd=debug"
    } else {
        "glomersd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries protocol traffic; logs go to stderr only.
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_tracing(&config);

    info!(
        "glomersd v{} - {:?} workload",
        env!("CARGO_PKG_VERSION"),
        config.workload
    );

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut transport = Transport::stdio();
    let Some(inbound) = transport.take_inbound() else {
        error!("Transport has no inbound queue");
        return ExitCode::FAILURE;
    };

    {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                server.shutdown();
            }
        });
    }

    let result = server.run(inbound, transport.outbox()).await;

    if tokio::time::timeout(FLUSH_TIMEOUT, transport.close())
        .await
        .is_err()
    {
        warn!("Timed out flushing output");
    }

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server error: {}", e);
            ExitCode::FAILURE
        }
    }
}
