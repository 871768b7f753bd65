//! Configuration loading.
//!
//! - [`types`]: the YAML config structure and its defaults
//! - [`validate`]: validation and conversion into handshake settings

mod types;
mod validate;

pub use types::ShimConfig;
pub use validate::create_handshake_settings;

pub fn parse_config(config_str: &str) -> std::io::Result<ShimConfig> {
    serde_yaml::from_str::<ShimConfig>(config_str).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Could not parse config YAML: {e}"),
        )
    })
}

/// Reads and parses the config file at `config_filename`.
pub async fn load_config(config_filename: &str) -> std::io::Result<ShimConfig> {
    let config_bytes = match tokio::fs::read(config_filename).await {
        Ok(b) => b,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not read config file {config_filename}: {e}"),
            ));
        }
    };

    let config_str = match String::from_utf8(config_bytes) {
        Ok(s) => s,
        Err(e) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse config file {config_filename} as UTF8: {e}"),
            ));
        }
    };

    parse_config(&config_str).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid config file {config_filename}: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cluster_name() {
        let err = parse_config("api_key: abc").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(parse_config("{cluster_name: a, keepalive: 5}").is_err());
    }

    #[tokio::test]
    async fn test_load_config_file() {
        let path = std::env::temp_dir().join(format!("authgate-config-{}.yaml", std::process::id()));
        tokio::fs::write(&path, "cluster_name: from-file\nssl_port: 9443\n")
            .await
            .unwrap();

        let config = load_config(path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.cluster_name, "from-file");
        assert_eq!(config.ssl_ports.into_vec(), vec![9443]);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config("/nonexistent/authgate.yaml").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
