//! YAML configuration file for the revtun binary
//!
//! ```yaml
//! common:
//!   server_addr: "gateway.example.com:7000"
//!   user: alice
//!   token: secret
//! proxies:
//!   - name: ssh
//!     type: tcp
//!     local_port: 22
//!     remote_port: 6000
//! visitors:
//!   - name: db
//!     type: stcp
//!     server_name: db
//!     secret_key: shh
//!     bind_port: 9000
//! ```

use anyhow::{Context, Result};
use revtun_client::{ClientConfig, ProxyConfig, VisitorConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub common: ClientConfig,
    pub proxies: Vec<ProxyConfig>,
    pub visitors: Vec<VisitorConfig>,
}

impl ConfigFile {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: ConfigFile =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.common.validate().context("Invalid [common] section")?;

        let mut names = HashSet::new();
        for proxy in &self.proxies {
            if !names.insert(proxy.name.as_str()) {
                anyhow::bail!("Duplicate proxy name: {}", proxy.name);
            }
            proxy.validate()?;
        }

        let mut names = HashSet::new();
        for visitor in &self.visitors {
            if !names.insert(visitor.name.as_str()) {
                anyhow::bail!("Duplicate visitor name: {}", visitor.name);
            }
            visitor.validate()?;
        }

        Ok(())
    }

    pub fn proxy_map(&self) -> HashMap<String, ProxyConfig> {
        revtun_client::proxy_map(self.proxies.iter().cloned())
    }

    pub fn visitor_map(&self) -> HashMap<String, VisitorConfig> {
        revtun_client::visitor_map(self.visitors.iter().cloned())
    }
}
