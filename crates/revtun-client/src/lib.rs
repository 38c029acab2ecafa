//! Revtun client
//!
//! Keeps an authenticated control connection to a gateway, registers local
//! services ("proxies") on it, opens work connections on demand and runs
//! visitor tunnels to remote proxies.
//!
//! # Example
//!
//! ```no_run
//! use revtun_client::{proxy_map, ClientConfig, ProxyConfig, Service};
//! use std::collections::HashMap;
//!
//! # async fn example() -> Result<(), revtun_client::ControlError> {
//! let config = ClientConfig::builder()
//!     .server_addr("gateway.example.com:7000")
//!     .user("alice")
//!     .token("secret")
//!     .build()?;
//!
//! let proxies = proxy_map(vec![ProxyConfig::tcp("ssh", 22, 6000)]);
//! let service = Service::with_tcp(config, proxies, HashMap::new());
//! let end = service.run().await?;
//! println!("Session ended: {}", end);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
mod forward;
pub mod proxy;
pub mod service;
pub mod transporter;
pub mod visitor;

pub use auth::{sign_key, AuthSetter, TokenAuthSetter};
pub use backoff::{Backoff, BackoffError, RetryConfig};
pub use config::{
    proxy_map, visitor_map, ClientConfig, ClientConfigBuilder, ProxyConfig, ProxyKind,
    VisitorConfig, VisitorKind,
};
pub use connection::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use control::{Control, SessionEnd};
pub use error::ControlError;
pub use proxy::{ProxyManager, ProxyState, ProxyStatus, WorkConnStart};
pub use service::Service;
pub use transporter::{MessageTransporter, Waiter};
pub use visitor::{VisitorManager, VisitorStatus};

// Re-export protocol types
pub use revtun_proto::{Message, MessageKind};
