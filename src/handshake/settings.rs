use std::time::Duration;

use crate::codec::{DEFAULT_PROTOCOL_VERSION_ID, ModuleVersion};
use crate::heartbeat::DEFAULT_CHECK_INTERVAL;

pub const DEFAULT_API_KEY: &str = "missing-api-key";
pub const DEFAULT_HOST_SUFFIXES: [&str; 2] = [".foundcluster.com", ".found.no"];
pub const DEFAULT_SSL_PORTS: [u16; 1] = [9343];
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(20_000);

/// Everything the authenticating stage needs to know about the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSettings {
    pub cluster_name: String,
    pub api_key: String,
    pub protocol_version: i32,
    pub module_version: ModuleVersion,
    /// Hosts ending with any of these get the handshake.
    pub host_suffixes: Vec<String>,
    /// Handshake hosts on these ports are upgraded to TLS first.
    pub ssl_ports: Vec<u16>,
    pub allow_self_signed: bool,
    /// Zero disables the heartbeat.
    pub keepalive_interval: Duration,
    pub heartbeat_check_interval: Duration,
    /// Close connections whose handshake has not finished in time. Unset waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl HandshakeSettings {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            api_key: DEFAULT_API_KEY.to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION_ID,
            module_version: ModuleVersion::CURRENT,
            host_suffixes: DEFAULT_HOST_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            ssl_ports: DEFAULT_SSL_PORTS.to_vec(),
            allow_self_signed: false,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            heartbeat_check_interval: DEFAULT_CHECK_INTERVAL,
            handshake_timeout: None,
        }
    }
}
