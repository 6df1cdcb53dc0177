use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::auth::basic_token;
use crate::pac;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP/SOCKS proxy front-end forwarding through an upstream HTTP(S) proxy",
    long_about = "proxyup exposes a local HTTP proxy (with CONNECT tunnelling) and a \
SOCKS4/SOCKS5 proxy, and forwards every accepted connection through a single \
configured upstream HTTP(S) forward proxy.\n\nFeatures:\n\
- Optional Basic auth on the local listeners\n\
- Upstream TLS with auth injection\n\
- PAC file endpoint on the HTTP listener\n\
- Squid-style access log (file and/or console)\n"
)]
pub struct Cli {
    /// IP address to bind both listeners
    #[arg(long = "listen-host", default_value = "127.0.0.1")]
    pub listen_host: IpAddr,

    /// HTTP proxy listen port
    #[arg(long = "http-port", default_value_t = 8282)]
    pub http_port: u16,

    /// SOCKS4/SOCKS5 listen port (0 disables the SOCKS listener)
    #[arg(long = "socks-port", default_value_t = 0)]
    pub socks_port: u16,

    /// Require Basic auth from clients with this username
    #[arg(long = "listen-username")]
    pub listen_username: Option<String>,

    /// Password for client auth
    #[arg(long = "listen-password")]
    pub listen_password: Option<String>,

    /// Upstream HTTP(S) proxy host (required)
    #[arg(long = "upstream-host")]
    pub upstream_host: Option<String>,

    /// Upstream proxy port
    #[arg(long = "upstream-port", default_value_t = 443)]
    pub upstream_port: u16,

    /// Wrap the upstream connection in TLS: true or false
    #[arg(long = "upstream-tls", default_value_t = true, action = clap::ArgAction::Set)]
    pub upstream_tls: bool,

    /// Username for upstream proxy auth
    #[arg(long = "upstream-username")]
    pub upstream_username: Option<String>,

    /// Password for upstream proxy auth
    #[arg(long = "upstream-password")]
    pub upstream_password: Option<String>,

    /// Upstream TCP connect timeout in milliseconds
    #[arg(long = "connect-timeout-ms", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Socket read timeout in milliseconds (rolling, refreshed per read)
    #[arg(long = "read-timeout-ms", default_value_t = 60_000)]
    pub read_timeout_ms: u64,

    /// Relay buffer size in bytes
    #[arg(long = "buffer-size", default_value_t = 16 * 1024)]
    pub buffer_size: usize,

    /// Maximum bytes accepted for an inbound HTTP request head
    #[arg(long = "header-max-bytes", default_value_t = 32 * 1024)]
    pub header_max_bytes: usize,

    /// Maximum bytes accepted for the HTTP request start line
    #[arg(long = "http-max-initial-bytes", default_value_t = 8 * 1024)]
    pub http_max_initial_bytes: usize,

    /// Serve a PAC file on the HTTP listener: true or false
    #[arg(long = "pac-enabled", default_value_t = false, action = clap::ArgAction::Set)]
    pub pac_enabled: bool,

    /// URL path of the PAC endpoint
    #[arg(long = "pac-path", default_value = "/proxy.pac")]
    pub pac_path: String,

    /// Host advertised inside the generated PAC (defaults to the listen host)
    #[arg(long = "pac-host")]
    pub pac_host: Option<String>,

    /// Serve this file instead of the generated PAC
    #[arg(long = "pac-file")]
    pub pac_file: Option<PathBuf>,

    /// Server name used in the auth realm and error responses
    #[arg(long = "server-name", default_value = "proxyup")]
    pub server_name: String,

    /// Log level: error|warn|info|debug|trace
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Append Squid-style access log lines to this file
    #[arg(long = "access-log-file")]
    pub access_log_file: Option<PathBuf>,

    /// Mirror access log lines to stdout: true or false
    #[arg(long = "access-log-console", default_value_t = true, action = clap::ArgAction::Set)]
    pub access_log_console: bool,
}

/// Resolved immutable configuration shared by every connection handler.
///
/// Auth tokens are pre-encoded here so the per-request check is a byte
/// comparison. Credentials are trimmed once at build time.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_host: IpAddr,
    pub http_port: u16,
    pub socks_port: u16,

    pub require_client_auth: bool,
    pub client_auth_expected: Option<String>,

    pub upstream_host: String,
    pub upstream_port: u16,
    pub upstream_tls: bool,
    pub upstream_auth_header: Option<String>,

    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub buffer_size: usize,
    pub header_max_bytes: usize,
    pub http_max_initial_bytes: usize,

    pub pac_enabled: bool,
    pub pac_path: String,
    pub pac_content: String,

    pub server_name: String,
    pub log_level: String,
    pub access_log_file: Option<PathBuf>,
    pub access_log_console: bool,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let upstream_host = args
            .upstream_host
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if upstream_host.is_empty() {
            return Err(color_eyre::eyre::eyre!("upstream host must not be empty"));
        }

        let listen_user = args.listen_username.as_deref().map(str::trim).unwrap_or("");
        let listen_pass = args.listen_password.as_deref().map(str::trim).unwrap_or("");
        let require_client_auth = !listen_user.is_empty();
        let client_auth_expected =
            require_client_auth.then(|| basic_token(listen_user, listen_pass));

        let upstream_user = args.upstream_username.as_deref().map(str::trim).unwrap_or("");
        let upstream_pass = args.upstream_password.as_deref().map(str::trim).unwrap_or("");
        let upstream_auth_header =
            (!upstream_user.is_empty()).then(|| basic_token(upstream_user, upstream_pass));

        let pac_host = args
            .pac_host
            .clone()
            .unwrap_or_else(|| args.listen_host.to_string());
        let pac_content = pac::resolve_content(
            args.pac_file.as_deref(),
            &pac_host,
            args.http_port,
            args.socks_port,
        );

        Ok(Self {
            listen_host: args.listen_host,
            http_port: args.http_port,
            socks_port: args.socks_port,
            require_client_auth,
            client_auth_expected,
            upstream_host,
            upstream_port: args.upstream_port,
            upstream_tls: args.upstream_tls,
            upstream_auth_header,
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            read_timeout: Duration::from_millis(args.read_timeout_ms),
            buffer_size: args.buffer_size,
            header_max_bytes: args.header_max_bytes,
            http_max_initial_bytes: args.http_max_initial_bytes,
            pac_enabled: args.pac_enabled,
            pac_path: args.pac_path,
            pac_content,
            server_name: args.server_name,
            log_level: args.log_level,
            access_log_file: args.access_log_file,
            access_log_console: args.access_log_console,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from((self.listen_host, self.http_port))
    }

    pub fn socks_addr(&self) -> Option<SocketAddr> {
        (self.socks_port != 0).then(|| SocketAddr::from((self.listen_host, self.socks_port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli::parse_from(["proxyup", "--upstream-host", "proxy.corp.example"])
    }

    #[test]
    fn defaults_resolve() {
        let config = ProxyConfig::from_cli(base_cli()).unwrap();
        assert_eq!(config.http_port, 8282);
        assert_eq!(config.socks_port, 0);
        assert!(config.socks_addr().is_none());
        assert!(config.upstream_tls);
        assert_eq!(config.upstream_port, 443);
        assert!(!config.require_client_auth);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.buffer_size, 16 * 1024);
    }

    #[test]
    fn missing_upstream_host_is_rejected() {
        let mut cli = base_cli();
        cli.upstream_host = Some("   ".to_string());
        assert!(ProxyConfig::from_cli(cli).is_err());
    }

    #[test]
    fn client_auth_token_is_precomputed_and_trimmed() {
        let mut cli = base_cli();
        cli.listen_username = Some("  a ".to_string());
        cli.listen_password = Some(" b  ".to_string());
        let config = ProxyConfig::from_cli(cli).unwrap();
        assert!(config.require_client_auth);
        // base64("a:b") == "YTpi"
        assert_eq!(config.client_auth_expected.as_deref(), Some("Basic YTpi"));
    }

    #[test]
    fn upstream_auth_token_is_precomputed() {
        let mut cli = base_cli();
        cli.upstream_username = Some("u".to_string());
        cli.upstream_password = Some("p".to_string());
        let config = ProxyConfig::from_cli(cli).unwrap();
        assert_eq!(config.upstream_auth_header.as_deref(), Some("Basic dTpw"));
    }

    #[test]
    fn pac_content_points_at_listeners() {
        let mut cli = base_cli();
        cli.socks_port = 1080;
        cli.pac_enabled = true;
        let config = ProxyConfig::from_cli(cli).unwrap();
        assert!(config.pac_content.contains("SOCKS5 127.0.0.1:1080"));
        assert!(config.pac_content.contains("PROXY 127.0.0.1:8282"));
    }
}
