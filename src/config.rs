use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenType {
    Plain,
    Tls,
}

impl Default for ListenType {
    fn default() -> Self {
        ListenType::Plain
    }
}

/// Where a matched origin host is dispatched: straight to the origin, or
/// through a TLS-terminating proxy hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteEndpoint {
    Direct,
    Tls { host: String, port: u16 },
}

/// One routing rule: a set of origin-host patterns mapped to an endpoint.
/// Host patterns match the exact host or any subdomain of it, the same
/// matching `dnsDomainIs` applies in the generated PAC script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRule {
    pub hosts: Vec<String>,
    pub remote: RemoteEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub listen_type: ListenType,
    /// Hostname that serves the generated PAC script instead of being proxied.
    pub pac_host: String,
    /// Port advertised inside the PAC script. Defaults to the listen port.
    #[serde(default)]
    pub pac_port: Option<u16>,
    #[serde(default)]
    pub rules: Vec<RemoteRule>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    // 3 minutes of total inactivity closes a connection.
    180
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            listen_type: ListenType::Plain,
            pac_host: "proxy.apn".to_string(),
            pac_port: None,
            rules: Vec::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            private_key: None,
            certificate: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Port advertised to user agents in the PAC script.
    pub fn pac_port(&self) -> u16 {
        self.pac_port.unwrap_or_else(|| self.listen_addr.port())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pac_host.is_empty() {
            return Err("pac_host must not be empty".to_string());
        }
        if self.listen_type == ListenType::Tls
            && (self.private_key.is_none() || self.certificate.is_none())
        {
            return Err(
                "listen_type 'tls' requires both private_key and certificate".to_string(),
            );
        }
        for rule in &self.rules {
            if rule.hosts.is_empty() {
                return Err("every rule needs at least one host pattern".to_string());
            }
        }
        Ok(())
    }
}
