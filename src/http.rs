use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::access_log::{AccessEvent, AccessLog, Action};
use crate::config::ProxyConfig;
use crate::relay::relay;
use crate::upstream::{UpstreamConnector, UpstreamError};

/// Parsed inbound HTTP request head: the start line verbatim plus the
/// headers in wire order. Serialising a parsed head reproduces the input up
/// to whitespace trimming around names and values.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn method(&self) -> &str {
        self.start_line.split(' ').next().unwrap_or("")
    }

    pub fn target(&self) -> &str {
        self.start_line.split(' ').nth(1).unwrap_or("")
    }

    /// First header value by name, ASCII case-insensitive.
    pub fn first_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialise back to wire format (ISO-8859-1, one byte per char).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.start_line.len() + 64 * self.headers.len());
        out.push_str(&self.start_line);
        out.push_str("\r\n");
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.chars().map(|c| c as u8).collect()
    }

    /// Apply the upstream rewrite rules: the client's `Proxy-Authorization`
    /// never leaves this process; the configured upstream token and
    /// `Proxy-Connection: keep-alive` are appended; everything else keeps
    /// its position.
    pub fn rewrite_for_upstream(&self, upstream_auth: Option<&str>) -> RequestHead {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("Proxy-Authorization"))
            .cloned()
            .collect();
        if let Some(auth) = upstream_auth {
            headers.push(("Proxy-Authorization".to_string(), auth.to_string()));
        }
        headers.push(("Proxy-Connection".to_string(), "keep-alive".to_string()));
        RequestHead {
            start_line: self.start_line.clone(),
            headers,
        }
    }
}

#[derive(Debug)]
pub enum HeadReadError {
    /// The head did not terminate within the configured byte cap.
    TooLarge,
    /// EOF before the blank line, or an unparseable start line.
    Malformed,
    /// Rolling read deadline expired while waiting for head bytes.
    Timeout,
    Io(io::Error),
}

/// Read an HTTP request head until the blank line.
///
/// Bytes read past the head are returned untouched as the body prefix.
/// A head whose terminator lands exactly at `header_max` parses; one byte
/// more fails.
pub async fn read_request_head<R>(
    stream: &mut R,
    header_max: usize,
    start_line_max: usize,
    read_timeout: Duration,
) -> Result<(RequestHead, Vec<u8>), HeadReadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    let mut scanned = 0usize;

    let head_end = loop {
        if let Some(end) = find_head_end(&buf, scanned) {
            break end;
        }
        scanned = buf.len().saturating_sub(3);
        if buf.len() > header_max {
            return Err(HeadReadError::TooLarge);
        }
        let n = timeout(read_timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| HeadReadError::Timeout)?
            .map_err(HeadReadError::Io)?;
        if n == 0 {
            return Err(HeadReadError::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if head_end > header_max {
        return Err(HeadReadError::TooLarge);
    }

    let head = parse_head(&buf[..head_end], start_line_max)?;
    let leftover = buf[head_end..].to_vec();
    Ok((head, leftover))
}

/// Index one past the `\r\n\r\n` terminator, scanning from `start`.
fn find_head_end(buf: &[u8], start: usize) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    buf[start..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| start + pos + 4)
}

fn parse_head(bytes: &[u8], start_line_max: usize) -> Result<RequestHead, HeadReadError> {
    // ISO-8859-1 decode: one byte per char, nothing is ever lost.
    let text: String = bytes.iter().map(|&b| b as char).collect();
    let mut lines = text.split("\r\n");

    let start_line = lines.next().unwrap_or("").to_string();
    if start_line.len() > start_line_max {
        return Err(HeadReadError::TooLarge);
    }
    if start_line.split(' ').filter(|p| !p.is_empty()).count() < 3 {
        return Err(HeadReadError::Malformed);
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(sep) = line.find(':') else {
            continue;
        };
        if sep == 0 {
            continue;
        }
        let name = line[..sep].trim().to_string();
        let value = line[sep + 1..].trim().to_string();
        headers.push((name, value));
    }

    Ok(RequestHead { start_line, headers })
}

/// Split `host:port`, `[v6]:port`, or a bare host. IPv6 hosts keep their
/// brackets so they can be re-joined with a port for the upstream CONNECT
/// target.
pub fn parse_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    if target.is_empty() {
        return None;
    }
    if let Some(rest) = target.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = format!("[{}]", &rest[..end]);
        return match rest[end + 1..].strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if rest[end + 1..].is_empty() => Some((host, default_port)),
            None => None,
        };
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        Some(_) => None,
        None => Some((target.to_string(), default_port)),
    }
}

fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub async fn write_error_response<W>(
    writer: &mut W,
    status_line: &str,
    server_name: &str,
    message: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("<html><body><h1>{message}</h1></body></html>");
    let response = format!(
        "{status_line}\r\n\
         Date: {date}\r\n\
         Server: {server_name}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\r\n{body}",
        date = http_date(),
        len = body.len(),
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

pub async fn write_proxy_auth_required<W>(writer: &mut W, server_name: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Date: {date}\r\n\
         Proxy-Authenticate: Basic realm=\"{server_name}\"\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\r\n",
        date = http_date(),
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

async fn write_connect_established<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(b"HTTP/1.1 200 Connection Established\r\nProxy-Connection: keep-alive\r\n\r\n")
        .await?;
    writer.flush().await
}

async fn write_pac_response<W>(writer: &mut W, content: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/x-ns-proxy-autoconfig; charset=utf-8\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\r\n{content}",
        len = content.len(),
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}

/// Handle one accepted connection on the HTTP listener: parse the head,
/// route (PAC / auth / CONNECT / forward), and emit exactly one access-log
/// event when the connection is done.
pub async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    config: &ProxyConfig,
    upstream: &UpstreamConnector,
    access_log: &AccessLog,
) {
    let started = Instant::now();
    let client_ip = peer.ip().to_string();

    let (head, body_prefix) = match read_request_head(
        &mut client,
        config.header_max_bytes,
        config.http_max_initial_bytes,
        config.read_timeout,
    )
    .await
    {
        Ok(parsed) => parsed,
        Err(HeadReadError::Timeout) => {
            debug!("read timeout while parsing request head from {peer}");
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpMiss,
                400,
                0,
                "-",
                "-",
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
        Err(HeadReadError::Io(e)) => {
            debug!("client {peer} dropped during request head: {e}");
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpMiss,
                400,
                0,
                "-",
                "-",
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
        Err(e) => {
            warn!("malformed request head from {peer}: {e:?}");
            let _ = write_error_response(
                &mut client,
                "HTTP/1.1 400 Bad Request",
                &config.server_name,
                "Malformed request",
            )
            .await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpMiss,
                400,
                0,
                "-",
                "-",
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
    };

    let method = head.method().to_string();
    let target = head.target().to_string();

    // PAC is served before the auth gate so clients can bootstrap.
    if config.pac_enabled && method == "GET" && target == config.pac_path {
        let served = write_pac_response(&mut client, &config.pac_content).await.is_ok();
        debug!("served PAC file to {peer}");
        access_log.log(AccessEvent::new(
            client_ip,
            Action::TcpMiss,
            200,
            if served { config.pac_content.len() as u64 } else { 0 },
            method,
            target,
            started.elapsed().as_millis() as u64,
        ));
        return;
    }

    if config.require_client_auth {
        let supplied = head.first_header("Proxy-Authorization");
        if supplied != config.client_auth_expected.as_deref() {
            warn!("rejected unauthenticated request from {peer}");
            let _ = write_proxy_auth_required(&mut client, &config.server_name).await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpDenied,
                407,
                0,
                method,
                target,
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
    }

    if method == "CONNECT" {
        handle_connect(client, &client_ip, head, body_prefix, config, upstream, access_log, started)
            .await;
    } else {
        handle_forward(client, &client_ip, head, body_prefix, config, upstream, access_log, started)
            .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connect(
    mut client: TcpStream,
    client_ip: &str,
    head: RequestHead,
    body_prefix: Vec<u8>,
    config: &ProxyConfig,
    upstream: &UpstreamConnector,
    access_log: &AccessLog,
    started: Instant,
) {
    let target = head.target().to_string();
    let Some((host, port)) = parse_host_port(&target, 443) else {
        warn!("CONNECT target is not host:port: {target}");
        let _ = write_error_response(
            &mut client,
            "HTTP/1.1 400 Bad Request",
            &config.server_name,
            "CONNECT target must be host:port",
        )
        .await;
        access_log.log(AccessEvent::new(
            client_ip,
            Action::TcpMiss,
            400,
            0,
            "CONNECT",
            target,
            started.elapsed().as_millis() as u64,
        ));
        return;
    };

    info!("CONNECT {target} via upstream {}", upstream.endpoint());

    match upstream.connect(&host, port).await {
        Ok(mut tunnel) => {
            if write_connect_established(&mut client).await.is_err() {
                access_log.log(AccessEvent::new(
                    client_ip,
                    Action::TcpMiss,
                    200,
                    0,
                    "CONNECT",
                    target,
                    started.elapsed().as_millis() as u64,
                ));
                return;
            }
            // Bytes the client optimistically sent with its CONNECT head.
            let mut early_bytes = 0u64;
            if !body_prefix.is_empty() {
                if tunnel.write_all(&body_prefix).await.is_err() {
                    access_log.log(AccessEvent::new(
                        client_ip,
                        Action::TcpMiss,
                        502,
                        0,
                        "CONNECT",
                        target,
                        started.elapsed().as_millis() as u64,
                    ));
                    return;
                }
                early_bytes = body_prefix.len() as u64;
            }

            let outcome = relay(client, tunnel, config.buffer_size).await;
            if let Some(e) = &outcome.error {
                debug!("tunnel to {target} ended with: {e}");
            }
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpTunnel,
                200,
                early_bytes + outcome.total_bytes(),
                "CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
        Err(UpstreamError::HandshakeStatus { code, status_line }) => {
            info!("upstream refused CONNECT {target}: {status_line}");
            let response = format!("{status_line}\r\nConnection: close\r\n\r\n");
            let _ = client.write_all(response.as_bytes()).await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpMiss,
                code,
                0,
                "CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
        Err(e) => {
            warn!("upstream connect for {target} via {} failed: {e}", upstream.endpoint());
            let _ = write_error_response(
                &mut client,
                "HTTP/1.1 502 Bad Gateway",
                &config.server_name,
                "Failed to connect to upstream proxy",
            )
            .await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpMiss,
                502,
                0,
                "CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_forward(
    mut client: TcpStream,
    client_ip: &str,
    head: RequestHead,
    body_prefix: Vec<u8>,
    config: &ProxyConfig,
    upstream: &UpstreamConnector,
    access_log: &AccessLog,
    started: Instant,
) {
    let method = head.method().to_string();
    let target = head.target().to_string();

    info!("{method} {target} via upstream {}", upstream.endpoint());

    let mut tunnel = match upstream.dial().await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("upstream dial via {} failed: {e}", upstream.endpoint());
            let _ = write_error_response(
                &mut client,
                "HTTP/1.1 502 Bad Gateway",
                &config.server_name,
                "Failed to connect to upstream proxy",
            )
            .await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpMiss,
                502,
                0,
                method,
                target,
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
    };

    let rewritten = head.rewrite_for_upstream(config.upstream_auth_header.as_deref());
    let mut sent = rewritten.to_wire();
    sent.extend_from_slice(&body_prefix);
    if let Err(e) = tunnel.write_all(&sent).await {
        warn!("failed to forward request to upstream: {e}");
        let _ = write_error_response(
            &mut client,
            "HTTP/1.1 502 Bad Gateway",
            &config.server_name,
            "Failed to forward request upstream",
        )
        .await;
        access_log.log(AccessEvent::new(
            client_ip,
            Action::TcpMiss,
            502,
            0,
            method,
            target,
            started.elapsed().as_millis() as u64,
        ));
        return;
    }

    // From here the exchange is opaque: remaining request body flows up,
    // the response streams back, and upstream half-close ends the request.
    let outcome = relay(client, tunnel, config.buffer_size).await;
    if let Some(e) = &outcome.error {
        debug!("forward exchange for {target} ended with: {e}");
    }
    access_log.log(AccessEvent::new(
        client_ip,
        Action::TcpMiss,
        200,
        body_prefix.len() as u64 + outcome.total_bytes(),
        method,
        target,
        started.elapsed().as_millis() as u64,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const READ_TIMEOUT: Duration = Duration::from_secs(1);

    async fn parse_bytes(input: &[u8], header_max: usize) -> Result<(RequestHead, Vec<u8>), HeadReadError> {
        let (mut near, mut far) = tokio::io::duplex(4096);
        far.write_all(input).await.unwrap();
        far.shutdown().await.unwrap();
        read_request_head(&mut near, header_max, 8192, READ_TIMEOUT).await
    }

    #[tokio::test]
    async fn parses_head_and_preserves_body_prefix() {
        let input = b"POST http://x/ HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nBODY";
        let (head, leftover) = parse_bytes(input, 32 * 1024).await.unwrap();
        assert_eq!(head.start_line, "POST http://x/ HTTP/1.1");
        assert_eq!(head.method(), "POST");
        assert_eq!(head.target(), "http://x/");
        assert_eq!(head.first_header("host"), Some("x"));
        assert_eq!(head.first_header("CONTENT-LENGTH"), Some("4"));
        assert_eq!(leftover, b"BODY");
    }

    #[tokio::test]
    async fn round_trip_preserves_start_line_and_header_order() {
        let input = b"GET http://x/ HTTP/1.1\r\nB: 2\r\nA: 1\r\nHost: x\r\n\r\n";
        let (head, _) = parse_bytes(input, 32 * 1024).await.unwrap();
        assert_eq!(head.to_wire(), input.to_vec());
    }

    #[tokio::test]
    async fn malformed_header_lines_are_skipped() {
        let input = b"GET / HTTP/1.1\r\nno-colon-here\r\nHost: x\r\n\r\n";
        let (head, _) = parse_bytes(input, 32 * 1024).await.unwrap();
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.first_header("Host"), Some("x"));
    }

    #[tokio::test]
    async fn eof_before_terminator_is_malformed() {
        let input = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert!(matches!(
            parse_bytes(input, 32 * 1024).await,
            Err(HeadReadError::Malformed)
        ));
    }

    #[tokio::test]
    async fn head_at_cap_parses_and_one_more_fails() {
        let base = b"GET / HTTP/1.1\r\nX-Pad: ".len() + b"\r\n\r\n".len();
        let cap = 256;
        let pad = "a".repeat(cap - base);
        let input = format!("GET / HTTP/1.1\r\nX-Pad: {pad}\r\n\r\n");
        assert_eq!(input.len(), cap);
        assert!(parse_bytes(input.as_bytes(), cap).await.is_ok());

        let over = format!("GET / HTTP/1.1\r\nX-Pad: a{pad}\r\n\r\n");
        assert_eq!(over.len(), cap + 1);
        assert!(matches!(
            parse_bytes(over.as_bytes(), cap).await,
            Err(HeadReadError::TooLarge)
        ));
    }

    #[tokio::test]
    async fn oversized_start_line_is_rejected() {
        let input = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(16 * 1024));
        let (mut near, mut far) = tokio::io::duplex(64 * 1024);
        far.write_all(input.as_bytes()).await.unwrap();
        far.shutdown().await.unwrap();
        let result = read_request_head(&mut near, 32 * 1024, 1024, READ_TIMEOUT).await;
        assert!(matches!(result, Err(HeadReadError::TooLarge)));
    }

    #[test]
    fn rewrite_drops_client_auth_and_appends_upstream_headers() {
        let head = RequestHead {
            start_line: "GET http://x/ HTTP/1.1".to_string(),
            headers: vec![
                ("Host".to_string(), "x".to_string()),
                ("Proxy-Authorization".to_string(), "Basic bogus".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ],
        };
        let rewritten = head.rewrite_for_upstream(Some("Basic dTpw"));
        assert_eq!(
            rewritten.headers,
            vec![
                ("Host".to_string(), "x".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
                ("Proxy-Authorization".to_string(), "Basic dTpw".to_string()),
                ("Proxy-Connection".to_string(), "keep-alive".to_string()),
            ]
        );
        let wire = String::from_utf8(rewritten.to_wire()).unwrap();
        assert!(!wire.contains("Basic bogus"));
    }

    #[test]
    fn rewrite_without_upstream_auth_adds_no_credentials() {
        let head = RequestHead {
            start_line: "GET http://x/ HTTP/1.1".to_string(),
            headers: vec![("Proxy-Authorization".to_string(), "Basic abc".to_string())],
        };
        let rewritten = head.rewrite_for_upstream(None);
        assert_eq!(
            rewritten.headers,
            vec![("Proxy-Connection".to_string(), "keep-alive".to_string())]
        );
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            parse_host_port("example.com:8443", 443),
            Some(("example.com".to_string(), 8443))
        );
        assert_eq!(
            parse_host_port("example.com", 443),
            Some(("example.com".to_string(), 443))
        );
        assert_eq!(
            parse_host_port("[2001:db8::1]:443", 443),
            Some(("[2001:db8::1]".to_string(), 443))
        );
        assert_eq!(
            parse_host_port("[::1]", 443),
            Some(("[::1]".to_string(), 443))
        );
        assert_eq!(parse_host_port("example.com:notaport", 443), None);
        assert_eq!(parse_host_port("", 443), None);
    }
}
