mod access_log;
mod auth;
mod body;
mod buffer_pool;
mod config;
mod connection;
mod daily_log;
mod forward;
mod middleware;
mod rate_limit;
mod server;
mod socks;
#[cfg(test)]
mod test_support;
mod transport;

use crate::access_log::AccessLog;
use crate::buffer_pool::BufferPool;
use crate::config::{Cli, ProxyConfig};
use crate::daily_log::{display_dir, DailyFileWriter};
use crate::forward::Forwarder;
use crate::rate_limit::IpRateLimiter;
use crate::server::{build_service, ConnectionLimits, Server, SHUTDOWN_GRACE};
use crate::transport::build_client;
use hyper_util::client::proxy::matcher::Matcher;
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for queued access lines to reach disk
const ACCESS_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let args = Cli::parse();

    // Operational and error logs go to error-YYYY-MM-DD.log
    let error_sink = Arc::new(DailyFileWriter::new(&args.log_dir, "error"));
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_proxy=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(error_sink)
        .init();
    color_eyre::install()?;

    match dotenv {
        Ok(path) => info!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => info!("No .env file, using process environment"),
        Err(e) => warn!("Ignoring unreadable .env file: {}", e),
    }

    let config = match ProxyConfig::from_cli(args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Forwarding to {}", config.upstream);
    info!("Writing logs to {}", display_dir(&config.log_dir));
    info!(
        "Rate limit: {} requests per {:?} per client IP",
        config.rate_limit, config.rate_window
    );

    let env_proxy = Matcher::from_env();
    let (client, _egress) = match build_client(
        &config.upstream,
        config.socks5.as_ref(),
        Some(&env_proxy),
    ) {
        Ok(built) => built,
        Err(e) => {
            error!("Failed to build upstream transport: {}", e);
            return Err(e.into());
        }
    };

    let access_sink = Arc::new(DailyFileWriter::new(&config.log_dir, "access"));
    let (access_log, relay) = AccessLog::spawn(access_sink, config.access_queue);

    let limiter = Arc::new(IpRateLimiter::new(config.rate_limit, config.rate_window));
    let sweeper = limiter.spawn_sweeper(limiter.window() * 2);

    let forwarder = Forwarder::new(
        client,
        config.upstream.clone(),
        Arc::new(BufferPool::new()),
        config.response_timeout,
    );
    let service = build_service(
        forwarder,
        Arc::clone(&limiter),
        access_log.clone(),
        config.trust_forwarded,
    );

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.listen_addr, e);
            return Err(e.into());
        }
    };
    let server = Server::new(listener, service, ConnectionLimits::default());
    info!("Reverse proxy listening on http://{}", server.local_addr()?);

    // Graceful shutdown signal handling
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install CTRL+C handler: {}", e);
            return;
        }
        info!("Shutdown signal received");
        trigger.cancel();
    });

    server.run(shutdown, SHUTDOWN_GRACE).await;
    sweeper.abort();

    // The relay exits once the last AccessLog handle is gone
    let dropped = access_log.dropped();
    drop(access_log);
    match tokio::time::timeout(ACCESS_FLUSH_TIMEOUT, relay).await {
        Ok(Ok(())) => info!("Access log flushed"),
        Ok(Err(e)) => error!("Access log writer failed: {}", e),
        Err(_) => warn!("Access log still draining after {:?}", ACCESS_FLUSH_TIMEOUT),
    }
    if dropped > 0 {
        warn!("{} access log lines dropped while the queue was full", dropped);
    }

    info!("Server shutdown complete");
    Ok(())
}
