use std::time::Duration;

use super::types::ShimConfig;
use crate::codec::ModuleVersion;
use crate::handshake::HandshakeSettings;

/// Validates a loaded config and turns it into handshake settings.
pub fn create_handshake_settings(config: ShimConfig) -> std::io::Result<HandshakeSettings> {
    let ShimConfig {
        cluster_name,
        api_key,
        protocol_version,
        module_version,
        host_suffixes,
        ssl_ports,
        allow_self_signed,
        keepalive_interval_ms,
        heartbeat_check_interval_ms,
        handshake_timeout_ms,
    } = config;

    if cluster_name.trim().is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "cluster_name must not be empty",
        ));
    }

    let host_suffixes = host_suffixes.into_vec();
    if host_suffixes.iter().any(|s| s.is_empty()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "host_suffixes must not contain empty entries",
        ));
    }

    let ssl_ports = ssl_ports.into_vec();
    if ssl_ports.contains(&0) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "ssl_ports must not contain port 0",
        ));
    }

    if keepalive_interval_ms > 0 && heartbeat_check_interval_ms == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "heartbeat_check_interval_ms must be positive when keepalive is enabled",
        ));
    }

    if handshake_timeout_ms == Some(0) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "handshake_timeout_ms must be positive, omit it to wait indefinitely",
        ));
    }

    Ok(HandshakeSettings {
        cluster_name,
        api_key,
        protocol_version,
        module_version: ModuleVersion::new(module_version),
        host_suffixes,
        ssl_ports,
        allow_self_signed,
        keepalive_interval: Duration::from_millis(keepalive_interval_ms),
        heartbeat_check_interval: Duration::from_millis(heartbeat_check_interval_ms),
        handshake_timeout: handshake_timeout_ms.map(Duration::from_millis),
    })
}
