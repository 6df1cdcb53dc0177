use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::ProxyConfig;

/// Upper bound on the upstream CONNECT response head.
const CONNECT_RESPONSE_MAX: usize = 8 * 1024;

/// Plain-TCP and TLS upstream connections behind one stream type.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type UpstreamStream = Box<dyn ProxyStream>;

/// Error type for upstream dial and CONNECT handshake operations
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream dial failed: {0}")]
    Dial(#[source] io::Error),

    #[error("upstream TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("upstream CONNECT rejected: {status_line}")]
    HandshakeStatus { code: u16, status_line: String },

    #[error("upstream CONNECT handshake timed out")]
    HandshakeTimeout,

    #[error("malformed upstream CONNECT response: {0}")]
    HandshakeMalformed(String),
}

impl UpstreamError {
    /// True when the upstream TCP connection was actively refused, which
    /// SOCKS5 reports with a distinct reply code.
    pub fn is_connection_refused(&self) -> bool {
        matches!(self, UpstreamError::Dial(e) if e.kind() == io::ErrorKind::ConnectionRefused)
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Dials the configured upstream HTTP(S) proxy and performs the CONNECT
/// handshake on behalf of every inbound protocol.
pub struct UpstreamConnector {
    host: String,
    port: u16,
    tls: Option<TlsConnector>,
    auth_header: Option<String>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl UpstreamConnector {
    pub fn new(
        host: String,
        port: u16,
        use_tls: bool,
        auth_header: Option<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let tls = use_tls.then(|| {
            let mut roots = RootCertStore::empty();
            match rustls_native_certs::load_native_certs() {
                Ok(certs) => {
                    for cert in certs {
                        let _ = roots.add(cert);
                    }
                }
                Err(e) => warn!("failed to load native root certificates: {e}"),
            }
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        });

        Self {
            host,
            port,
            tls,
            auth_header,
            connect_timeout,
            read_timeout,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(
            config.upstream_host.clone(),
            config.upstream_port,
            config.upstream_tls,
            config.upstream_auth_header.clone(),
            config.connect_timeout,
            config.read_timeout,
        )
    }

    /// Upstream endpoint as `host:port` for log messages.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open the transport to the upstream proxy: TCP with connect timeout,
    /// then the TLS handshake with SNI set to the upstream host.
    pub async fn dial(&self) -> UpstreamResult<UpstreamStream> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            UpstreamError::Dial(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
        })?
        .map_err(UpstreamError::Dial)?;
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(self.host.clone())
                    .map_err(|e| UpstreamError::Tls(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(UpstreamError::Tls)?;
                Ok(Box::new(tls))
            }
            None => Ok(Box::new(stream)),
        }
    }

    /// Dial the upstream proxy and ask it to open a tunnel to the target.
    ///
    /// Sends `CONNECT host:port` with the configured auth header, gates on a
    /// 2xx status, and discards the rest of the response head. The head is
    /// read byte-wise so no tunnelled byte is pulled out of the stream.
    pub async fn connect(&self, target_host: &str, target_port: u16) -> UpstreamResult<UpstreamStream> {
        let mut stream = self.dial().await?;

        let mut head = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: keep-alive\r\n",
            host = target_host,
            port = target_port,
        );
        if let Some(auth) = &self.auth_header {
            head.push_str("Proxy-Authorization: ");
            head.push_str(auth);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        stream
            .write_all(head.as_bytes())
            .await
            .map_err(UpstreamError::Dial)?;

        let response = timeout(self.read_timeout, read_response_head(&mut stream))
            .await
            .map_err(|_| UpstreamError::HandshakeTimeout)??;

        let status_line = response
            .split("\r\n")
            .next()
            .unwrap_or_default()
            .to_string();
        let code = parse_status_code(&status_line)
            .ok_or_else(|| UpstreamError::HandshakeMalformed(status_line.clone()))?;

        if (200..300).contains(&code) {
            debug!("upstream CONNECT ok for {target_host}:{target_port}");
            Ok(stream)
        } else {
            Err(UpstreamError::HandshakeStatus { code, status_line })
        }
    }
}

/// Read the CONNECT response up to and including the blank line, one byte at
/// a time. Anything beyond the head stays in the socket for the relay.
async fn read_response_head(stream: &mut UpstreamStream) -> UpstreamResult<String> {
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    loop {
        let b = stream.read_u8().await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                UpstreamError::HandshakeMalformed("connection closed during CONNECT handshake".into())
            } else {
                UpstreamError::Dial(e)
            }
        })?;
        buf.push(b);
        if buf.ends_with(b"\r\n\r\n") {
            // HTTP heads are ISO-8859-1-clean; lossy only replaces what a
            // broken upstream sent.
            return Ok(String::from_utf8_lossy(&buf).into_owned());
        }
        if buf.len() > CONNECT_RESPONSE_MAX {
            return Err(UpstreamError::HandshakeMalformed(
                "CONNECT response head too large".into(),
            ));
        }
    }
}

fn parse_status_code(status_line: &str) -> Option<u16> {
    if !status_line.starts_with("HTTP/") {
        return None;
    }
    status_line.split_whitespace().nth(1)?.parse().ok()
}
