use std::net::Ipv6Addr;

/// Destination of a connection attempt. Fixed once the attempt begins.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[v6addr]:port`, or a bare host when `default_port` is given.
    pub fn parse(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        if let Some(rest) = s.strip_prefix('[') {
            let bracket_end = rest.find(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Unterminated ipv6 address: {s}"),
                )
            })?;
            let host = &rest[..bracket_end];
            host.parse::<Ipv6Addr>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid ipv6 address {host}: {e}"),
                )
            })?;
            let port = match rest[bracket_end + 1..].strip_prefix(':') {
                Some(port_str) => Some(parse_port(port_str)?),
                None if bracket_end + 1 == rest.len() => default_port,
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Invalid target: {s}"),
                    ));
                }
            };
            let port = port.ok_or_else(|| std::io::Error::other("No port"))?;
            return Ok(Self::new(host, port));
        }

        let (host, port) = match s.rfind(':') {
            Some(i) => {
                // A bare ipv6 address has several colons and no port.
                if s[..i].contains(':') {
                    (s, default_port)
                } else {
                    (&s[..i], Some(parse_port(&s[i + 1..])?))
                }
            }
            None => (s, default_port),
        };

        if host.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Missing host: {s}"),
            ));
        }

        let port = port.ok_or_else(|| std::io::Error::other("No port"))?;

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Plain byte-wise suffix test, no case folding or dot-boundary handling.
    pub fn matches_host_suffix(&self, suffixes: &[String]) -> bool {
        suffixes.iter().any(|suffix| self.host.ends_with(suffix.as_str()))
    }

    pub fn is_tls_port(&self, ssl_ports: &[u16]) -> bool {
        ssl_ports.contains(&self.port)
    }
}

fn parse_port(s: &str) -> std::io::Result<u16> {
    s.parse::<u16>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid port number {s}: {e}"),
        )
    })
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
