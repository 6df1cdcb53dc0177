pub mod access_log;
pub mod auth;
pub mod config;
pub mod http;
pub mod pac;
pub mod relay;
pub mod server;
pub mod socks;
pub mod upstream;
