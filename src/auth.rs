use base64::engine::general_purpose;
use base64::Engine;

/// Build a pre-encoded `Basic <b64>` proxy-auth token from a credential pair.
///
/// The token is computed once at config build and compared by byte equality
/// afterwards; no per-request base64 work happens on the hot path.
pub fn basic_token(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    format!("Basic {}", general_purpose::STANDARD.encode(credentials))
}
