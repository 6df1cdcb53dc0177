use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use proxyup::access_log::AccessLog;
use proxyup::config::{Cli, ProxyConfig};
use proxyup::server::{self, ServerCtx};
use proxyup::upstream::UpstreamConnector;

/// Grace period for in-flight tunnels after the listeners stop accepting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Distinct exit code so scripts can tell config errors from crashes.
    if args.upstream_host.as_deref().map(str::trim).unwrap_or("").is_empty() {
        eprintln!("Missing required option --upstream-host");
        std::process::exit(2);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("proxyup={}", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let config = Arc::new(ProxyConfig::from_cli(args)?);
    let upstream = Arc::new(UpstreamConnector::from_config(&config));
    let access_log = AccessLog::spawn(config.access_log_file.clone(), config.access_log_console);

    let ctx = ServerCtx {
        config: Arc::clone(&config),
        upstream,
        access_log,
    };

    let http_listener = TcpListener::bind(config.http_addr()).await?;
    info!("HTTP proxy listening on {}", config.http_addr());

    let socks_listener = match config.socks_addr() {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            info!("SOCKS proxy listening on {addr}");
            Some(listener)
        }
        None => None,
    };

    info!(
        "upstream proxy: {}:{} (tls: {})",
        config.upstream_host, config.upstream_port, config.upstream_tls
    );
    if config.pac_enabled {
        info!("PAC file available at http://{}{}", config.http_addr(), config.pac_path);
    }

    let http_server = server::serve_http(http_listener, ctx.clone());
    let socks_server = async {
        match socks_listener {
            Some(listener) => server::serve_socks(listener, ctx.clone()).await,
            None => std::future::pending().await,
        }
    };

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
    };

    // Dropping the listener futures on shutdown stops new accepts;
    // in-flight tunnels get a bounded grace period to drain.
    tokio::select! {
        _ = http_server => {
            warn!("HTTP listener terminated");
        }
        _ = socks_server => {
            warn!("SOCKS listener terminated");
        }
        _ = shutdown => {
            let remaining = server::drain_connections(SHUTDOWN_GRACE).await;
            if remaining > 0 {
                warn!("forced shutdown with {remaining} tunnels still active");
            } else {
                info!("all tunnels closed gracefully");
            }
        }
    }

    Ok(())
}
