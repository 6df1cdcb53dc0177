use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::access_log::{AccessEvent, AccessLog, Action};
use crate::auth::basic_token;
use crate::config::ProxyConfig;
use crate::relay::relay;
use crate::upstream::UpstreamConnector;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;

// SOCKS4 reply codes (reply version byte is 0)
const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

// SOCKS5 auth methods
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

// SOCKS5 address types
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

// SOCKS5 commands and reply codes
const CMD_CONNECT: u8 = 0x01;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONN_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Longest userid / domain field accepted in a SOCKS4 request.
const SOCKS4_FIELD_MAX: usize = 255;

/// Handle one accepted connection on the SOCKS listener.
///
/// The first byte picks the protocol version; both variants translate their
/// CONNECT into the shared upstream HTTP CONNECT and then drop into the
/// relay. Exactly one access-log event is emitted per connection.
pub async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    config: &ProxyConfig,
    upstream: &UpstreamConnector,
    access_log: &AccessLog,
) {
    let started = Instant::now();
    let client_ip = peer.ip().to_string();

    let version = match read_u8_within(&mut client, config.read_timeout).await {
        Ok(v) => v,
        Err(e) => {
            debug!("SOCKS client {peer} dropped before version byte: {e}");
            access_log.log(miss_event(&client_ip, 400, "-", started));
            return;
        }
    };

    match version {
        SOCKS4_VERSION => handle_socks4(client, &client_ip, peer, config, upstream, access_log, started).await,
        SOCKS5_VERSION => handle_socks5(client, &client_ip, peer, config, upstream, access_log, started).await,
        other => {
            warn!("unknown SOCKS version 0x{other:02x} from {peer}");
            access_log.log(miss_event(&client_ip, 400, "-", started));
        }
    }
}

fn miss_event(client_ip: &str, status: u16, target: &str, started: Instant) -> AccessEvent {
    AccessEvent::new(
        client_ip,
        Action::TcpMiss,
        status,
        0,
        "-",
        target,
        started.elapsed().as_millis() as u64,
    )
}

// ==================== SOCKS4 / SOCKS4a ====================

async fn handle_socks4(
    mut client: TcpStream,
    client_ip: &str,
    peer: SocketAddr,
    config: &ProxyConfig,
    upstream: &UpstreamConnector,
    access_log: &AccessLog,
    started: Instant,
) {
    let request = match read_socks4_request(&mut client, config.read_timeout).await {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed SOCKS4 request from {peer}: {e}");
            access_log.log(miss_event(client_ip, 400, "-", started));
            return;
        }
    };

    if request.command != CMD_CONNECT {
        warn!("unsupported SOCKS4 command 0x{:02x} from {peer}", request.command);
        let _ = write_socks4_reply(&mut client, SOCKS4_REJECTED, request.port, request.ip).await;
        access_log.log(miss_event(client_ip, 400, "-", started));
        return;
    }

    let target = format!("{}:{}", request.host, request.port);
    info!(
        "SOCKS4 CONNECT {target} via upstream {} (userid: {})",
        upstream.endpoint(),
        request.userid
    );

    match upstream.connect(&request.host, request.port).await {
        Ok(tunnel) => {
            if write_socks4_reply(&mut client, SOCKS4_GRANTED, request.port, request.ip)
                .await
                .is_err()
            {
                access_log.log(AccessEvent::new(
                    client_ip,
                    Action::TcpTunnel,
                    200,
                    0,
                    "SOCKS4_CONNECT",
                    target,
                    started.elapsed().as_millis() as u64,
                ));
                return;
            }
            let outcome = relay(client, tunnel, config.buffer_size).await;
            if let Some(e) = &outcome.error {
                debug!("SOCKS4 tunnel to {target} ended with: {e}");
            }
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpTunnel,
                200,
                outcome.total_bytes(),
                "SOCKS4_CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
        Err(e) => {
            warn!("upstream connect for SOCKS4 {target} failed: {e}");
            let _ = write_socks4_reply(&mut client, SOCKS4_REJECTED, request.port, request.ip).await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpDenied,
                403,
                0,
                "SOCKS4_CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
    }
}

struct Socks4Request {
    command: u8,
    port: u16,
    ip: [u8; 4],
    host: String,
    userid: String,
}

async fn read_socks4_request(
    client: &mut TcpStream,
    read_timeout: Duration,
) -> io::Result<Socks4Request> {
    let command = read_u8_within(client, read_timeout).await?;
    let mut port_bytes = [0u8; 2];
    read_exact_within(client, &mut port_bytes, read_timeout).await?;
    let port = u16::from_be_bytes(port_bytes);
    let mut ip = [0u8; 4];
    read_exact_within(client, &mut ip, read_timeout).await?;
    let userid = read_nul_terminated(client, read_timeout).await?;

    // SOCKS4a marker: 0.0.0.x with x != 0 means a domain follows the userid.
    let host = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        read_nul_terminated(client, read_timeout).await?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    Ok(Socks4Request {
        command,
        port,
        ip,
        host,
        userid,
    })
}

async fn write_socks4_reply(
    client: &mut TcpStream,
    code: u8,
    port: u16,
    ip: [u8; 4],
) -> io::Result<()> {
    let mut reply = [0u8; 8];
    reply[1] = code;
    reply[2..4].copy_from_slice(&port.to_be_bytes());
    reply[4..8].copy_from_slice(&ip);
    client.write_all(&reply).await?;
    client.flush().await
}

// ==================== SOCKS5 ====================

async fn handle_socks5(
    mut client: TcpStream,
    client_ip: &str,
    peer: SocketAddr,
    config: &ProxyConfig,
    upstream: &UpstreamConnector,
    access_log: &AccessLog,
    started: Instant,
) {
    // Method negotiation.
    let methods = match read_methods(&mut client, config.read_timeout).await {
        Ok(methods) => methods,
        Err(e) => {
            debug!("malformed SOCKS5 greeting from {peer}: {e}");
            access_log.log(miss_event(client_ip, 400, "-", started));
            return;
        }
    };

    if methods.is_empty() {
        let _ = client.write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE]).await;
        access_log.log(miss_event(client_ip, 400, "-", started));
        return;
    }

    if config.require_client_auth {
        if !methods.contains(&METHOD_USER_PASS) {
            warn!("SOCKS5 client {peer} offered no username/password method");
            let _ = client.write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE]).await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpDenied,
                403,
                0,
                "SOCKS5_CONNECT",
                "-",
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
        if client.write_all(&[SOCKS5_VERSION, METHOD_USER_PASS]).await.is_err() {
            access_log.log(miss_event(client_ip, 400, "-", started));
            return;
        }
        if !authenticate(&mut client, peer, config).await {
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpDenied,
                403,
                0,
                "SOCKS5_CONNECT",
                "-",
                started.elapsed().as_millis() as u64,
            ));
            return;
        }
    } else if client.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await.is_err() {
        access_log.log(miss_event(client_ip, 400, "-", started));
        return;
    }

    // CONNECT request.
    let (command, host, port) = match read_socks5_request(&mut client, config.read_timeout).await {
        Ok(request) => request,
        Err(e) => {
            debug!("malformed SOCKS5 request from {peer}: {e}");
            let _ = write_socks5_reply(&mut client, REP_GENERAL_FAILURE).await;
            access_log.log(miss_event(client_ip, 400, "-", started));
            return;
        }
    };

    if command != CMD_CONNECT {
        warn!("unsupported SOCKS5 command 0x{command:02x} from {peer}");
        let _ = write_socks5_reply(&mut client, REP_CMD_NOT_SUPPORTED).await;
        access_log.log(miss_event(client_ip, 400, "-", started));
        return;
    }

    let target = format!("{host}:{port}");
    info!("SOCKS5 CONNECT {target} via upstream {}", upstream.endpoint());

    match upstream.connect(&host, port).await {
        Ok(tunnel) => {
            if write_socks5_reply(&mut client, REP_SUCCESS).await.is_err() {
                access_log.log(AccessEvent::new(
                    client_ip,
                    Action::TcpTunnel,
                    200,
                    0,
                    "SOCKS5_CONNECT",
                    target,
                    started.elapsed().as_millis() as u64,
                ));
                return;
            }
            let outcome = relay(client, tunnel, config.buffer_size).await;
            if let Some(e) = &outcome.error {
                debug!("SOCKS5 tunnel to {target} ended with: {e}");
            }
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpTunnel,
                200,
                outcome.total_bytes(),
                "SOCKS5_CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
        Err(e) => {
            warn!("upstream connect for SOCKS5 {target} failed: {e}");
            let rep = if e.is_connection_refused() {
                REP_CONN_REFUSED
            } else {
                REP_GENERAL_FAILURE
            };
            let _ = write_socks5_reply(&mut client, rep).await;
            access_log.log(AccessEvent::new(
                client_ip,
                Action::TcpDenied,
                403,
                0,
                "SOCKS5_CONNECT",
                target,
                started.elapsed().as_millis() as u64,
            ));
        }
    }
}

async fn read_methods(client: &mut TcpStream, read_timeout: Duration) -> io::Result<Vec<u8>> {
    let nmethods = read_u8_within(client, read_timeout).await? as usize;
    let mut methods = vec![0u8; nmethods];
    if nmethods > 0 {
        read_exact_within(client, &mut methods, read_timeout).await?;
    }
    Ok(methods)
}

/// RFC 1929 username/password sub-negotiation. Credentials are re-encoded
/// as a Basic token and compared byte-for-byte against the configured one.
async fn authenticate(client: &mut TcpStream, peer: SocketAddr, config: &ProxyConfig) -> bool {
    let result = read_auth_request(client, config.read_timeout).await;
    let (username, password) = match result {
        Ok(pair) => pair,
        Err(e) => {
            debug!("malformed SOCKS5 auth request from {peer}: {e}");
            let _ = client.write_all(&[0x01, 0x01]).await;
            return false;
        }
    };

    let provided = basic_token(&username, &password);
    if Some(provided.as_str()) == config.client_auth_expected.as_deref() {
        debug!("SOCKS5 authentication successful for {peer}");
        client.write_all(&[0x01, 0x00]).await.is_ok()
    } else {
        warn!("SOCKS5 authentication failed for {peer}");
        let _ = client.write_all(&[0x01, 0x01]).await;
        false
    }
}

async fn read_auth_request(
    client: &mut TcpStream,
    read_timeout: Duration,
) -> io::Result<(String, String)> {
    let version = read_u8_within(client, read_timeout).await?;
    if version != 0x01 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad auth sub-negotiation version",
        ));
    }
    let ulen = read_u8_within(client, read_timeout).await? as usize;
    let mut username = vec![0u8; ulen];
    read_exact_within(client, &mut username, read_timeout).await?;
    let plen = read_u8_within(client, read_timeout).await? as usize;
    let mut password = vec![0u8; plen];
    read_exact_within(client, &mut password, read_timeout).await?;
    Ok((
        String::from_utf8_lossy(&username).into_owned(),
        String::from_utf8_lossy(&password).into_owned(),
    ))
}

async fn read_socks5_request(
    client: &mut TcpStream,
    read_timeout: Duration,
) -> io::Result<(u8, String, u16)> {
    let mut head = [0u8; 4];
    read_exact_within(client, &mut head, read_timeout).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request version"));
    }
    let command = head[1];

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            read_exact_within(client, &mut ip, read_timeout).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = read_u8_within(client, read_timeout).await? as usize;
            let mut name = vec![0u8; len];
            read_exact_within(client, &mut name, read_timeout).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            read_exact_within(client, &mut ip, read_timeout).await?;
            // Bracketed so the upstream CONNECT target stays unambiguous.
            format!("[{}]", Ipv6Addr::from(ip))
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported address type 0x{other:02x}"),
            ));
        }
    };

    let mut port_bytes = [0u8; 2];
    read_exact_within(client, &mut port_bytes, read_timeout).await?;
    Ok((command, host, u16::from_be_bytes(port_bytes)))
}

/// Success replies carry a zeroed IPv4 bound address, which every common
/// client accepts.
async fn write_socks5_reply(client: &mut TcpStream, rep: u8) -> io::Result<()> {
    let reply = [SOCKS5_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    client.write_all(&reply).await?;
    client.flush().await
}

// ==================== shared read helpers ====================

async fn read_u8_within<R>(reader: &mut R, dur: Duration) -> io::Result<u8>
where
    R: AsyncRead + Unpin,
{
    timeout(dur, reader.read_u8())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
}

async fn read_exact_within<R>(reader: &mut R, buf: &mut [u8], dur: Duration) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    timeout(dur, reader.read_exact(buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
        .map(|_| ())
}

/// Read a NUL-terminated field (SOCKS4 userid / SOCKS4a domain).
async fn read_nul_terminated<R>(reader: &mut R, dur: Duration) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let b = read_u8_within(reader, dur).await?;
        if b == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        if bytes.len() >= SOCKS4_FIELD_MAX {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "field too long"));
        }
        bytes.push(b);
    }
}
