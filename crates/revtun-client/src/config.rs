//! Client configuration

use crate::backoff::RetryConfig;
use crate::ControlError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Common client settings shared by the session and its managers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway address (e.g., "gateway.example.com:7000")
    pub server_addr: String,
    /// Identity of this client; a forced disconnect must carry the same value
    pub user: String,
    /// Shared secret used for login, heartbeat and work connection signatures
    pub token: String,
    /// Ping interval; zero disables heartbeats entirely
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Maximum silence since the last pong; zero disables the timeout check
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,
    /// How often the heartbeat timeout is evaluated
    #[serde(with = "duration_secs")]
    pub heartbeat_check_interval: Duration,
    /// The transport multiplexes streams and runs its own keep-alive.
    /// Disables the heartbeat timeout check.
    pub tcp_mux: bool,
    /// Sign heartbeats with the token
    pub auth_heartbeats: bool,
    /// Sign new work connections with the token
    pub auth_new_work_conns: bool,
    /// Work connections the gateway may pre-open
    pub pool_count: u32,
    /// Stop instead of retrying when the first login fails
    pub login_fail_exit: bool,
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub login_timeout: Duration,
    /// Bound on waiting for StartWorkConn / NewVisitorConnResp / NatHoleResp
    #[serde(with = "duration_secs")]
    pub work_conn_timeout: Duration,
    /// Bound on waiting for NewProxyResp before a registration is retried
    #[serde(with = "duration_secs")]
    pub proxy_start_timeout: Duration,
    /// Retry policy for proxy registration and visitor tunnels
    pub retry: RetryConfig,
    /// Retry policy for re-establishing the session
    pub reconnect: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:7000".to_string(),
            user: String::new(),
            token: String::new(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            heartbeat_check_interval: Duration::from_secs(1),
            tcp_mux: false,
            auth_heartbeats: true,
            auth_new_work_conns: true,
            pool_count: 1,
            login_fail_exit: true,
            dial_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            work_conn_timeout: Duration::from_secs(10),
            proxy_start_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            reconnect: RetryConfig {
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(20),
                multiplier: 2.0,
                max_attempts: None,
            },
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    /// Whether the handler runs the last-pong watchdog
    pub fn heartbeat_check_enabled(&self) -> bool {
        self.heartbeat_enabled() && !self.heartbeat_timeout.is_zero() && !self.tcp_mux
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.server_addr.is_empty() {
            return Err(ControlError::ConfigError(
                "server_addr is required".to_string(),
            ));
        }
        if self.heartbeat_check_enabled() && self.heartbeat_check_interval.is_zero() {
            return Err(ControlError::ConfigError(
                "heartbeat_check_interval must be positive".to_string(),
            ));
        }
        validate_retry("retry", &self.retry)?;
        validate_retry("reconnect", &self.reconnect)?;
        Ok(())
    }
}

fn validate_retry(section: &str, retry: &RetryConfig) -> Result<(), ControlError> {
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(ControlError::ConfigError(format!(
            "{}.multiplier must be a finite number >= 1.0, got {}",
            section, retry.multiplier
        )));
    }
    if retry.max_backoff < retry.initial_backoff {
        return Err(ControlError::ConfigError(format!(
            "{}.max_backoff ({:?}) is below initial_backoff ({:?})",
            section, retry.max_backoff, retry.initial_backoff
        )));
    }
    Ok(())
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn heartbeat_check_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_check_interval = interval;
        self
    }

    pub fn tcp_mux(mut self, enabled: bool) -> Self {
        self.config.tcp_mux = enabled;
        self
    }

    pub fn work_conn_timeout(mut self, timeout: Duration) -> Self {
        self.config.work_conn_timeout = timeout;
        self
    }

    pub fn proxy_start_timeout(mut self, timeout: Duration) -> Self {
        self.config.proxy_start_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn login_fail_exit(mut self, enabled: bool) -> Self {
        self.config.login_fail_exit = enabled;
        self
    }

    pub fn build(self) -> Result<ClientConfig, ControlError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Kind-specific settings of a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyKind {
    /// TCP port forwarding (remote_port 0 lets the gateway choose)
    Tcp {
        #[serde(default)]
        remote_port: u16,
    },
    Udp {
        #[serde(default)]
        remote_port: u16,
    },
    Http {
        #[serde(default)]
        custom_domains: Vec<String>,
        #[serde(default)]
        subdomain: Option<String>,
    },
    Https {
        #[serde(default)]
        custom_domains: Vec<String>,
        #[serde(default)]
        subdomain: Option<String>,
    },
    /// Secret TCP: only reachable through a visitor knowing `secret_key`
    Stcp { secret_key: String },
    /// Like stcp, but visitors connect directly after NAT traversal
    Xtcp { secret_key: String },
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Tcp { .. } => "tcp",
            ProxyKind::Udp { .. } => "udp",
            ProxyKind::Http { .. } => "http",
            ProxyKind::Https { .. } => "https",
            ProxyKind::Stcp { .. } => "stcp",
            ProxyKind::Xtcp { .. } => "xtcp",
        }
    }
}

/// One exposed local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProxyKind,
    #[serde(default = "default_local_ip")]
    pub local_ip: String,
    pub local_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

impl ProxyConfig {
    pub fn tcp(name: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            name: name.into(),
            kind: ProxyKind::Tcp { remote_port },
            local_ip: default_local_ip(),
            local_port,
            use_encryption: false,
            use_compression: false,
        }
    }

    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.is_empty() {
            return Err(ControlError::ConfigError("proxy name is required".into()));
        }
        if self.local_port == 0 {
            return Err(ControlError::ConfigError(format!(
                "proxy [{}]: local_port is required",
                self.name
            )));
        }
        if let ProxyKind::Http {
            custom_domains,
            subdomain,
        }
        | ProxyKind::Https {
            custom_domains,
            subdomain,
        } = &self.kind
        {
            if custom_domains.is_empty() && subdomain.is_none() {
                return Err(ControlError::ConfigError(format!(
                    "proxy [{}]: custom_domains or subdomain is required",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// How a visitor reaches the remote proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitorKind {
    /// Traffic relayed through the gateway
    Stcp,
    /// Direct connection after NAT traversal signaling
    Xtcp,
}

impl VisitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitorKind::Stcp => "stcp",
            VisitorKind::Xtcp => "xtcp",
        }
    }
}

/// One local entry point to a remote stcp/xtcp proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: VisitorKind,
    /// Name of the remote proxy to reach
    pub server_name: String,
    /// Pre-shared secret of the remote proxy
    pub secret_key: String,
    #[serde(default = "default_local_ip")]
    pub bind_addr: String,
    pub bind_port: u16,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
}

impl VisitorConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.is_empty() {
            return Err(ControlError::ConfigError("visitor name is required".into()));
        }
        if self.server_name.is_empty() {
            return Err(ControlError::ConfigError(format!(
                "visitor [{}]: server_name is required",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_local_ip() -> String {
    "127.0.0.1".to_string()
}

/// Key a list of proxy definitions by name
pub fn proxy_map(proxies: impl IntoIterator<Item = ProxyConfig>) -> HashMap<String, ProxyConfig> {
    proxies.into_iter().map(|p| (p.name.clone(), p)).collect()
}

/// Key a list of visitor definitions by name
pub fn visitor_map(
    visitors: impl IntoIterator<Item = VisitorConfig>,
) -> HashMap<String, VisitorConfig> {
    visitors.into_iter().map(|v| (v.name.clone(), v)).collect()
}

/// Helper module for serializing Duration as seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for serializing Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
