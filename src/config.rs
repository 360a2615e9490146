//! Structured configuration, grounded on spec §6 and `zonblade-mini-gateway-rs`'s
//! `serde`+`serde_yaml` config loader. The original's recursive-descent
//! tokenizer (`cfg_tokenizer.c`/`cfg_parser.c`) is a named Non-goal (§1); a
//! `serde_yaml::Deserializer` into these structs replaces it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::address::Address;
use crate::error::ConfigError;
use crate::listener::Protocol;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub max_nofiles: Option<u64>,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub nameservers: Vec<SocketAddr>,
    #[serde(default)]
    pub search_domains: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub address: Address,
    pub protocol: Protocol,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub fallback_address: Option<Address>,
    #[serde(default)]
    pub source_address: Option<Address>,
    #[serde(default)]
    pub transparent_proxy: bool,
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub log_bad_requests: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub use_proxy_header_default: bool,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub pattern: String,
    pub target: Address,
    #[serde(default)]
    pub use_proxy_header: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate a config file, matching `config.c`'s
    /// `config_parse` + the cross-reference checks `sniproxy.c` runs after
    /// parsing (every listener's `table` must name a table that exists).
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            std::io::Error::new(e.kind(), ConfigError::Read {
                path: path.display().to_string(),
                source: e,
            })
        })?;
        let config: Config = serde_yaml::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, ConfigError::Parse(e)))?;
        config
            .validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for listener in &self.listeners {
            let wants = listener.table.clone().unwrap_or_default();
            let found = self
                .tables
                .iter()
                .any(|t| t.name.clone().unwrap_or_default() == wants);
            if !found {
                return Err(ConfigError::MissingTable(listener.address.to_string(), wants));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
listeners:
  - address: "0.0.0.0:443"
    protocol: tls
    table: main
tables:
  - name: main
    backends:
      - pattern: "^example\\.com$"
        target: "10.0.0.1:443"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].protocol, Protocol::Tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_listener_with_missing_table() {
        let yaml = r#"
listeners:
  - address: "0.0.0.0:443"
    protocol: tls
    table: missing
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingTable(_, _))));
    }
}
