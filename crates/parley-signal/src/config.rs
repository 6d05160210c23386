use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use parley_common::{Error, IceServer, Result};

use crate::router::RouterOptions;
use crate::signal::{
    GatewayLimits, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_OUTBOX_CAPACITY,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-signal")]
#[command(about = "Parley signaling server - relays WebRTC call setup between named peers")]
pub struct Config {
    /// HTTP/WebSocket listen address
    #[arg(long, env = "PARLEY_LISTEN", default_value = "0.0.0.0:8443")]
    pub listen: SocketAddr,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stdout; truncated on start
    #[arg(long, env = "PARLEY_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Largest accepted WebSocket message in bytes
    #[arg(long, env = "PARLEY_MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    pub max_message_bytes: usize,

    /// Per-connection outbound queue length
    #[arg(long, env = "PARLEY_OUTBOX_CAPACITY", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,

    /// Maximum concurrent WebSocket connections
    #[arg(long, env = "PARLEY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Send `{type:"error"}` replies for dropped requests instead of staying silent
    #[arg(long, env = "PARLEY_ERROR_REPLIES", default_value_t = false)]
    pub error_replies: bool,

    /// STUN server URL advertised to clients (repeatable)
    #[arg(long = "stun-url", env = "PARLEY_STUN_URLS", value_delimiter = ',')]
    pub stun_urls: Vec<String>,

    /// TURN server URL advertised to clients (repeatable)
    #[arg(long = "turn-url", env = "PARLEY_TURN_URLS", value_delimiter = ',')]
    pub turn_urls: Vec<String>,

    /// TURN username handed to clients
    #[arg(long, env = "PARLEY_TURN_USERNAME")]
    pub turn_username: Option<String>,

    /// TURN credential handed to clients
    #[arg(long, env = "PARLEY_TURN_CREDENTIAL")]
    pub turn_credential: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.outbox_capacity == 0 {
            return Err(Error::config("outbox capacity must be greater than zero"));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::config("max message size must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max connections must be greater than zero"));
        }
        for url in &self.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::config(format!("invalid STUN url: {url}")));
            }
        }
        for url in &self.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                return Err(Error::config(format!("invalid TURN url: {url}")));
            }
        }
        if !self.turn_urls.is_empty()
            && (self.turn_username.is_none() || self.turn_credential.is_none())
        {
            return Err(Error::config(
                "TURN urls require --turn-username and --turn-credential",
            ));
        }
        Ok(())
    }

    pub fn gateway_limits(&self) -> GatewayLimits {
        GatewayLimits {
            outbox_capacity: self.outbox_capacity,
            max_message_bytes: self.max_message_bytes,
            max_connections: self.max_connections,
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            error_replies: self.error_replies,
        }
    }

    /// ICE servers clients should use; the relay itself runs elsewhere.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}
