use std::path::PathBuf;

use chrono::{DateTime, Local};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Bounded queue capacity; entries beyond it are dropped with a warning so a
/// slow disk never backpressures connection handling.
const QUEUE_CAPACITY: usize = 10_000;

/// Squid-style request outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    TcpTunnel,
    TcpMiss,
    TcpDenied,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::TcpTunnel => "TCP_TUNNEL",
            Action::TcpMiss => "TCP_MISS",
            Action::TcpDenied => "TCP_DENIED",
        }
    }
}

/// One completed inbound connection, emitted exactly once per accept.
#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub timestamp: DateTime<Local>,
    pub client_addr: String,
    pub action: Action,
    pub status: u16,
    pub bytes: u64,
    pub method: String,
    pub target: String,
    pub duration_ms: u64,
    pub content_type: Option<String>,
}

impl AccessEvent {
    pub fn new(
        client_addr: impl Into<String>,
        action: Action,
        status: u16,
        bytes: u64,
        method: impl Into<String>,
        target: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            client_addr: client_addr.into(),
            action,
            status,
            bytes,
            method: method.into(),
            target: target.into(),
            duration_ms,
            content_type: None,
        }
    }
}

/// Cloneable handle to the async access-log writer.
///
/// Submissions never block: the queue is bounded and overflow drops the
/// entry after logging a warning.
#[derive(Clone)]
pub struct AccessLog {
    tx: mpsc::Sender<AccessEvent>,
}

impl AccessLog {
    /// Spawn the single writer task. `file` appends (parent directories are
    /// created); `console` mirrors every line to stdout.
    pub fn spawn(file: Option<PathBuf>, console: bool) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(write_loop(rx, file, console));
        Self { tx }
    }

    /// A sink that formats and discards everything; used by tests.
    pub fn disabled() -> Self {
        Self::spawn(None, false)
    }

    pub fn log(&self, event: AccessEvent) {
        if self.tx.try_send(event).is_err() {
            warn!("access log queue full, dropping entry");
        }
    }
}

async fn write_loop(mut rx: mpsc::Receiver<AccessEvent>, file: Option<PathBuf>, console: bool) {
    let mut writer = match file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(dir).await {
                    error!("failed to create access log directory {}: {e}", dir.display());
                }
            }
            match OpenOptions::new().create(true).append(true).open(&path).await {
                Ok(f) => Some(f),
                Err(e) => {
                    error!("failed to open access log {}: {e}", path.display());
                    None
                }
            }
        }
        None => None,
    };

    while let Some(event) = rx.recv().await {
        let line = format_entry(&event);
        if console {
            println!("{line}");
        }
        if let Some(f) = writer.as_mut() {
            if let Err(e) = f.write_all(format!("{line}\n").as_bytes()).await {
                error!("access log write failed: {e}");
                writer = None;
            }
        }
    }
}

/// Squid-style line:
/// `timestamp duration client action/status bytes method target user hierarchy content-type`
fn format_entry(event: &AccessEvent) -> String {
    format!(
        "{} {} {} {}/{} {} {} {} - HIER_DIRECT/{} {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.duration_ms,
        event.client_addr,
        event.action.as_str(),
        event.status,
        event.bytes,
        event.method,
        event.target,
        extract_host(&event.target),
        event.content_type.as_deref().unwrap_or("-"),
    )
}

/// Host portion of `host:port`, a URI, or a bare host.
fn extract_host(target: &str) -> &str {
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .unwrap_or(target);
    let rest = rest.split('/').next().unwrap_or(rest);
    match rest.rfind(':') {
        Some(idx) if idx > 0 && !rest.ends_with(']') => &rest[..idx],
        _ => rest,
    }
}
