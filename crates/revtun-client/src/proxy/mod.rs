//! Proxy manager
//!
//! Owns the set of exposed local services. Reload diffs the configured set
//! against the running one by name: removed or changed proxies are stopped,
//! new ones started, identical ones keep running untouched.

mod handler;
mod wrapper;

pub use wrapper::ProxyWrapper;

use crate::backoff::RetryConfig;
use crate::config::{ClientConfig, ProxyConfig};
use crate::connection::BoxedStream;
use crate::transporter::MessageTransporter;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyState {
    #[default]
    New,
    /// NewProxy sent, waiting for the gateway's answer
    WaitStart,
    Running,
    /// Registration rejected or timed out; retrying
    StartError,
    Closed,
}

/// Point-in-time view of one proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    pub name: String,
    pub kind: &'static str,
    pub status: ProxyState,
    pub remote_addr: Option<String>,
    pub last_error: Option<String>,
}

/// Gateway metadata accompanying a work connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkConnStart {
    pub proxy_name: String,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
}

/// Settings and collaborators shared by all proxies of a session
#[derive(Clone)]
pub(crate) struct ProxyContext {
    pub transporter: Arc<MessageTransporter>,
    pub start_timeout: Duration,
    pub work_conn_timeout: Duration,
    pub retry: RetryConfig,
}

pub struct ProxyManager {
    proxies: Mutex<HashMap<String, Arc<ProxyWrapper>>>,
    /// Serializes reload and close
    reload_lock: tokio::sync::Mutex<()>,
    ctx: ProxyContext,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ProxyManager {
    pub fn new(transporter: Arc<MessageTransporter>, config: &ClientConfig) -> Self {
        Self {
            proxies: Mutex::new(HashMap::new()),
            reload_lock: tokio::sync::Mutex::new(()),
            ctx: ProxyContext {
                transporter,
                start_timeout: config.proxy_start_timeout,
                work_conn_timeout: config.work_conn_timeout,
                retry: config.retry.clone(),
            },
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Apply a new proxy set
    pub async fn reload(&self, configs: HashMap<String, ProxyConfig>) {
        let _guard = self.reload_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            warn!("Proxy manager is closed, ignoring reload");
            return;
        }

        let removed: Vec<Arc<ProxyWrapper>> = {
            let mut proxies = self.lock();
            let stale: Vec<String> = proxies
                .iter()
                .filter(|(name, proxy)| configs.get(*name) != Some(proxy.config()))
                .map(|(name, _)| name.clone())
                .collect();
            stale
                .iter()
                .filter_map(|name| proxies.remove(name))
                .collect()
        };

        // Stop before starting so a changed proxy's CloseProxy precedes its new NewProxy
        join_all(removed.iter().map(|proxy| proxy.stop())).await;
        if !removed.is_empty() {
            info!(
                "Proxies removed: {:?}",
                removed.iter().map(|p| p.name()).collect::<Vec<_>>()
            );
        }

        let mut added = Vec::new();
        {
            let mut proxies = self.lock();
            for (name, config) in configs {
                if proxies.contains_key(&name) {
                    continue;
                }
                if let Err(e) = config.validate() {
                    warn!(proxy = %name, "Skipping invalid proxy: {}", e);
                    continue;
                }
                let proxy =
                    ProxyWrapper::start(config, self.ctx.clone(), self.cancel.child_token());
                proxies.insert(name.clone(), proxy);
                added.push(name);
            }
        }
        if !added.is_empty() {
            info!("Proxies added: {:?}", added);
        }
    }

    /// Route a freshly established work connection to its proxy
    ///
    /// Returns false and closes the connection when the proxy is unknown or not running.
    pub async fn handle_work_conn(&self, conn: BoxedStream, start: WorkConnStart) -> bool {
        let proxy = self.get(&start.proxy_name);
        let rejected = match proxy {
            Some(proxy) => match proxy.handle_work_conn(conn, start.clone()) {
                Ok(()) => return true,
                Err(conn) => {
                    warn!(proxy = %start.proxy_name, "Proxy not running, closing work connection");
                    conn
                }
            },
            None => {
                warn!(proxy = %start.proxy_name, "Unknown proxy, closing work connection");
                conn
            }
        };

        let mut conn = rejected;
        if let Err(e) = conn.shutdown().await {
            debug!("Work connection shutdown: {}", e);
        }
        false
    }

    /// Record the gateway's answer to a proxy registration
    pub fn notify_registered(&self, proxy_name: &str, remote_addr: String, error: String) {
        match self.get(proxy_name) {
            Some(proxy) => proxy.notify_registered(remote_addr, error),
            None => warn!(proxy = %proxy_name, "NewProxyResp for unknown proxy"),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProxyWrapper>> {
        self.lock().get(name).cloned()
    }

    /// Status of every proxy, sorted by name
    pub fn statuses(&self) -> Vec<ProxyStatus> {
        let mut statuses: Vec<ProxyStatus> = self.lock().values().map(|p| p.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every proxy; returns once all of them released their resources
    pub async fn close(&self) {
        let _guard = self.reload_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let proxies: Vec<Arc<ProxyWrapper>> = self.lock().drain().map(|(_, p)| p).collect();
        join_all(proxies.iter().map(|proxy| proxy.stop())).await;
        debug!("Proxy manager closed ({} proxies stopped)", proxies.len());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ProxyWrapper>>> {
        self.proxies.lock().unwrap_or_else(|e| e.into_inner())
    }
}
