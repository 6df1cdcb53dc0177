use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::access_log::AccessLog;
use crate::config::ProxyConfig;
use crate::http;
use crate::socks;
use crate::upstream::UpstreamConnector;

/// Active tunnels across both listeners; the shutdown path drains on this.
pub static ACTIVE_TUNNELS: AtomicUsize = AtomicUsize::new(0);

/// RAII guard keeping the active-tunnel counter honest across early returns.
pub struct ConnectionGuard {
    decremented: bool,
}

impl ConnectionGuard {
    pub fn new() -> Self {
        ACTIVE_TUNNELS.fetch_add(1, Ordering::Relaxed);
        Self { decremented: false }
    }

    pub fn active_count() -> usize {
        ACTIVE_TUNNELS.load(Ordering::Relaxed)
    }
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.decremented {
            ACTIVE_TUNNELS.fetch_sub(1, Ordering::Relaxed);
            self.decremented = true;
        }
    }
}

/// Shared per-listener context handed to every connection task.
#[derive(Clone)]
pub struct ServerCtx {
    pub config: Arc<ProxyConfig>,
    pub upstream: Arc<UpstreamConnector>,
    pub access_log: AccessLog,
}

/// Accept loop for the HTTP listener. Runs until the future is dropped.
pub async fn serve_http(listener: TcpListener, ctx: ServerCtx) {
    accept_loop(listener, ctx, |stream, peer, ctx| async move {
        http::handle_connection(stream, peer, &ctx.config, &ctx.upstream, &ctx.access_log).await;
    })
    .await;
}

/// Accept loop for the SOCKS listener.
pub async fn serve_socks(listener: TcpListener, ctx: ServerCtx) {
    accept_loop(listener, ctx, |stream, peer, ctx| async move {
        socks::handle_connection(stream, peer, &ctx.config, &ctx.upstream, &ctx.access_log).await;
    })
    .await;
}

async fn accept_loop<F, Fut>(listener: TcpListener, ctx: ServerCtx, handler: F)
where
    F: Fn(TcpStream, std::net::SocketAddr, ServerCtx) -> Fut + Copy + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tune_socket(&stream);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _guard = ConnectionGuard::new();
                    handler(stream, peer, ctx).await;
                });
            }
            Err(e) => {
                warn!("accept error: {e} (continuing)");
                continue;
            }
        }
    }
}

/// Low-latency, dead-peer-detecting socket options on every accepted
/// connection. Failures are non-fatal.
fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {e}");
    }
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("failed to set SO_KEEPALIVE: {e}");
    }
}

/// Wait up to `grace` for in-flight tunnels to drain after the listeners
/// stop accepting. Returns the number still active.
pub async fn drain_connections(grace: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        let active = ConnectionGuard::active_count();
        if active == 0 {
            return 0;
        }
        if tokio::time::Instant::now() >= deadline {
            return active;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
