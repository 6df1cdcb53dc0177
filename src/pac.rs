use std::path::Path;

use tracing::warn;

/// Resolve the PAC document served on the HTTP listener.
///
/// A custom file wins when configured; a read failure falls back to the
/// generated document so a bad path never disables the endpoint.
pub fn resolve_content(
    pac_file: Option<&Path>,
    pac_host: &str,
    http_port: u16,
    socks_port: u16,
) -> String {
    if let Some(path) = pac_file {
        match std::fs::read_to_string(path) {
            Ok(content) => return content,
            Err(e) => {
                warn!("failed to read PAC file {}: {e}, using generated PAC", path.display());
            }
        }
    }
    generate(pac_host, http_port, socks_port)
}

/// Generated PAC: bypass plain hosts and private ranges, send everything
/// else through this proxy (SOCKS5 preferred when the listener is enabled).
fn generate(pac_host: &str, http_port: u16, socks_port: u16) -> String {
    let route = if socks_port != 0 {
        format!(
            "SOCKS5 {host}:{socks}; PROXY {host}:{http}; DIRECT",
            host = pac_host,
            socks = socks_port,
            http = http_port
        )
    } else {
        format!("PROXY {}:{}; DIRECT", pac_host, http_port)
    };

    format!(
        "function FindProxyForURL(url, host) {{\n\
         \x20   if (isPlainHostName(host) ||\n\
         \x20       shExpMatch(host, \"localhost\") ||\n\
         \x20       shExpMatch(host, \"127.*\") ||\n\
         \x20       shExpMatch(host, \"10.*\") ||\n\
         \x20       shExpMatch(host, \"172.16.*\") ||\n\
         \x20       shExpMatch(host, \"192.168.*\")) {{\n\
         \x20       return \"DIRECT\";\n\
         \x20   }}\n\
         \x20   return \"{route}\";\n\
         }}\n"
    )
}
