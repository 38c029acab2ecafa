//! Visitor manager
//!
//! Each visitor listens locally and, for every accepted connection, opens a
//! tunnel to a remote stcp/xtcp proxy. Reload follows the same diff rules as
//! the proxy manager.

mod stcp;
mod xtcp;

use crate::backoff::{Backoff, BackoffError, RetryConfig};
use crate::config::{ClientConfig, VisitorConfig, VisitorKind};
use crate::connection::Connector;
use crate::forward::splice;
use crate::transporter::MessageTransporter;
use crate::ControlError;
use futures::future::join_all;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time view of one visitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorStatus {
    pub name: String,
    pub kind: VisitorKind,
    /// None until the local listener is bound
    pub bound_addr: Option<SocketAddr>,
    pub active_connections: usize,
}

#[derive(Clone)]
pub(crate) struct VisitorContext {
    pub connector: Arc<dyn Connector>,
    pub transporter: Arc<MessageTransporter>,
    pub run_id: String,
    pub work_conn_timeout: Duration,
    pub retry: RetryConfig,
}

/// Decrements the active connection count when a user connection ends
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Visitor {
    config: VisitorConfig,
    bound_addr: Mutex<Option<SocketAddr>>,
    active: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Visitor {
    fn start(config: VisitorConfig, ctx: VisitorContext, cancel: CancellationToken) -> Arc<Self> {
        let visitor = Arc::new(Self {
            config,
            bound_addr: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            cancel,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(visitor.clone().run(ctx));
        *visitor.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        visitor
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VisitorConfig {
        &self.config
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> VisitorStatus {
        VisitorStatus {
            name: self.config.name.clone(),
            kind: self.config.kind,
            bound_addr: self.bound_addr(),
            active_connections: self.active.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting, cancel open tunnels and wait for them
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(visitor = %self.config.name, "Visitor task failed: {}", e);
            }
        }
    }

    async fn bind(&self, ctx: &VisitorContext) -> Option<TcpListener> {
        let mut backoff = Backoff::new(ctx.retry.clone(), self.cancel.clone());
        let addr = self.config.bind_address();

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = TcpListener::bind(&addr) => result,
            };
            match result {
                Ok(listener) => return Some(listener),
                Err(e) => {
                    warn!(visitor = %self.config.name, addr = %addr, "Bind failed: {}", e);
                    match backoff.wait().await {
                        Ok(()) => {}
                        Err(BackoffError::Cancelled) => return None,
                        Err(BackoffError::MaxAttemptsReached) => {
                            error!(visitor = %self.config.name, addr = %addr, "Giving up on bind");
                            return None;
                        }
                    }
                }
            }
        }
    }

    async fn run(self: Arc<Self>, ctx: VisitorContext) {
        let Some(listener) = self.bind(&ctx).await else {
            return;
        };
        let local_addr = listener.local_addr().ok();
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner()) = local_addr;
        info!(
            visitor = %self.config.name,
            kind = self.config.kind.as_str(),
            addr = ?local_addr,
            "Visitor listening"
        );

        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(visitor = %self.config.name, peer = %peer, "User connection accepted");
                        let guard = ActiveGuard::new(self.active.clone());
                        conns.spawn(handle_user_conn(
                            self.config.clone(),
                            stream,
                            ctx.clone(),
                            self.cancel.child_token(),
                            guard,
                        ));
                    }
                    Err(e) => warn!(visitor = %self.config.name, "Accept failed: {}", e),
                }
            }
        }

        drop(listener);
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner()) = None;
        while conns.join_next().await.is_some() {}
        debug!(visitor = %self.config.name, "Visitor stopped");
    }
}

async fn handle_user_conn(
    config: VisitorConfig,
    mut user: TcpStream,
    ctx: VisitorContext,
    cancel: CancellationToken,
    _guard: ActiveGuard,
) {
    let result = match config.kind {
        VisitorKind::Stcp => {
            let tunnel = tokio::select! {
                _ = cancel.cancelled() => Err(ControlError::SessionClosed),
                tunnel = stcp::open_tunnel(&config, &ctx) => tunnel,
            };
            match tunnel {
                Ok(mut tunnel) => Ok(splice(&mut user, &mut tunnel, &cancel).await),
                Err(e) => Err(e),
            }
        }
        VisitorKind::Xtcp => match xtcp::open_tunnel_with_retry(&config, &ctx, &cancel).await {
            Ok(mut tunnel) => Ok(splice(&mut user, &mut tunnel, &cancel).await),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok((to_peer, to_user)) => debug!(
            visitor = %config.name,
            bytes_to_peer = to_peer,
            bytes_to_user = to_user,
            "Visitor connection finished"
        ),
        Err(ControlError::SessionClosed) => {}
        Err(e) => warn!(visitor = %config.name, "Tunnel not established: {}", e),
    }
}

pub struct VisitorManager {
    visitors: Mutex<HashMap<String, Arc<Visitor>>>,
    /// Serializes reload and close
    reload_lock: tokio::sync::Mutex<()>,
    ctx: VisitorContext,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl VisitorManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        transporter: Arc<MessageTransporter>,
        run_id: impl Into<String>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            visitors: Mutex::new(HashMap::new()),
            reload_lock: tokio::sync::Mutex::new(()),
            ctx: VisitorContext {
                connector,
                transporter,
                run_id: run_id.into(),
                work_conn_timeout: config.work_conn_timeout,
                retry: config.retry.clone(),
            },
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Apply a new visitor set
    pub async fn reload(&self, configs: HashMap<String, VisitorConfig>) {
        let _guard = self.reload_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            warn!("Visitor manager is closed, ignoring reload");
            return;
        }

        let removed: Vec<Arc<Visitor>> = {
            let mut visitors = self.lock();
            let stale: Vec<String> = visitors
                .iter()
                .filter(|(name, visitor)| configs.get(*name) != Some(visitor.config()))
                .map(|(name, _)| name.clone())
                .collect();
            stale
                .iter()
                .filter_map(|name| visitors.remove(name))
                .collect()
        };

        // Release listeners before a changed visitor rebinds the same address
        join_all(removed.iter().map(|visitor| visitor.stop())).await;
        if !removed.is_empty() {
            info!(
                "Visitors removed: {:?}",
                removed.iter().map(|v| v.name()).collect::<Vec<_>>()
            );
        }

        let mut added = Vec::new();
        {
            let mut visitors = self.lock();
            for (name, config) in configs {
                if visitors.contains_key(&name) {
                    continue;
                }
                if let Err(e) = config.validate() {
                    warn!(visitor = %name, "Skipping invalid visitor: {}", e);
                    continue;
                }
                let visitor = Visitor::start(config, self.ctx.clone(), self.cancel.child_token());
                visitors.insert(name.clone(), visitor);
                added.push(name);
            }
        }
        if !added.is_empty() {
            info!("Visitors added: {:?}", added);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Visitor>> {
        self.lock().get(name).cloned()
    }

    /// Status of every visitor, sorted by name
    pub fn statuses(&self) -> Vec<VisitorStatus> {
        let mut statuses: Vec<VisitorStatus> = self.lock().values().map(|v| v.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every visitor, including ones waiting in a retry backoff
    pub async fn close(&self) {
        let _guard = self.reload_lock.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        let visitors: Vec<Arc<Visitor>> = self.lock().drain().map(|(_, v)| v).collect();
        join_all(visitors.iter().map(|visitor| visitor.stop())).await;
        debug!("Visitor manager closed ({} visitors stopped)", visitors.len());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Visitor>>> {
        self.visitors.lock().unwrap_or_else(|e| e.into_inner())
    }
}
