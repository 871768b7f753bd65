use serde::{Deserialize, Serialize};

use crate::codec::{DEFAULT_PROTOCOL_VERSION_ID, ModuleVersion};
use crate::handshake::{
    DEFAULT_API_KEY, DEFAULT_HOST_SUFFIXES, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SSL_PORTS,
};
use crate::heartbeat::DEFAULT_CHECK_INTERVAL;
use crate::option_util::OneOrSome;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ShimConfig {
    pub cluster_name: String,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
    #[serde(default = "default_module_version")]
    pub module_version: i32,
    #[serde(alias = "host_suffix", default = "default_host_suffixes")]
    pub host_suffixes: OneOrSome<String>,
    #[serde(alias = "ssl_port", default = "default_ssl_ports")]
    pub ssl_ports: OneOrSome<u16>,
    #[serde(default)]
    pub allow_self_signed: bool,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_heartbeat_check_interval_ms")]
    pub heartbeat_check_interval_ms: u64,
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

fn default_api_key() -> String {
    DEFAULT_API_KEY.to_string()
}

fn default_protocol_version() -> i32 {
    DEFAULT_PROTOCOL_VERSION_ID
}

fn default_module_version() -> i32 {
    ModuleVersion::CURRENT.id()
}

fn default_host_suffixes() -> OneOrSome<String> {
    OneOrSome::Some(DEFAULT_HOST_SUFFIXES.iter().map(|s| s.to_string()).collect())
}

fn default_ssl_ports() -> OneOrSome<u16> {
    OneOrSome::Some(DEFAULT_SSL_PORTS.to_vec())
}

fn default_keepalive_interval_ms() -> u64 {
    DEFAULT_KEEPALIVE_INTERVAL.as_millis() as u64
}

fn default_heartbeat_check_interval_ms() -> u64 {
    DEFAULT_CHECK_INTERVAL.as_millis() as u64
}
