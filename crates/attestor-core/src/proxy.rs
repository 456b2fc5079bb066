//! Egress proxy endpoint specs and the `host:port[:user:pass]` list format.

use serde::{Deserialize, Serialize};

/// One egress endpoint as loaded from the proxy list file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySpec {
    /// Proxy host (name or address).
    pub host: String,
    /// Proxy port.
    pub port: u16,
    /// Optional basic-auth username.
    pub username: Option<String>,
    /// Optional basic-auth password.
    pub password: Option<String>,
}

impl ProxySpec {
    /// Proxy URL for an HTTP CONNECT proxy, without credentials.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// `host:port` label for logs and snapshots. Credentials never appear.
    pub fn label(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ProxySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Why a proxy list line was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProxyParseError {
    /// Not `host:port` or `host:port:user:pass`.
    #[error("expected host:port or host:port:user:pass, got {0} ':' fields")]
    BadShape(usize),
    /// Port field did not parse.
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    /// Host field was empty.
    #[error("empty host")]
    EmptyHost,
}

/// Parse one proxy list line: `host:port` or `host:port:user:pass`.
pub fn parse_proxy_line(line: &str) -> Result<ProxySpec, ProxyParseError> {
    let parts: Vec<&str> = line.split(':').map(str::trim).collect();
    if parts.len() != 2 && parts.len() != 4 {
        return Err(ProxyParseError::BadShape(parts.len()));
    }
    if parts[0].is_empty() {
        return Err(ProxyParseError::EmptyHost);
    }
    let port: u16 = parts[1]
        .parse()
        .map_err(|_| ProxyParseError::InvalidPort(parts[1].to_string()))?;

    let (username, password) = if parts.len() == 4 {
        (Some(parts[2].to_string()), Some(parts[3].to_string()))
    } else {
        (None, None)
    };

    Ok(ProxySpec {
        host: parts[0].to_string(),
        port,
        username,
        password,
    })
}
