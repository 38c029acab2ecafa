//! One running proxy: registration with the gateway and its work connections

use super::handler::{handle_work_conn, WorkConnContext};
use super::{ProxyContext, ProxyState, ProxyStatus, WorkConnStart};
use crate::backoff::{Backoff, BackoffError};
use crate::config::{ProxyConfig, ProxyKind};
use crate::connection::BoxedStream;
use revtun_proto::Message;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gateway verdict on a NewProxy request
#[derive(Debug)]
struct Registration {
    remote_addr: String,
    error: String,
}

#[derive(Debug, Default)]
struct StatusCell {
    state: ProxyState,
    remote_addr: Option<String>,
    last_error: Option<String>,
}

pub struct ProxyWrapper {
    config: ProxyConfig,
    ctx: ProxyContext,
    status: Mutex<StatusCell>,
    registrations: mpsc::Sender<Registration>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    work_conns: Mutex<JoinSet<()>>,
}

impl ProxyWrapper {
    /// Create the proxy and start its registration task
    pub(crate) fn start(config: ProxyConfig, ctx: ProxyContext, cancel: CancellationToken) -> Arc<Self> {
        let (registrations, rx) = mpsc::channel(1);
        let wrapper = Arc::new(Self {
            config,
            ctx,
            status: Mutex::new(StatusCell::default()),
            registrations,
            cancel,
            task: Mutex::new(None),
            work_conns: Mutex::new(JoinSet::new()),
        });

        let handle = tokio::spawn(wrapper.clone().run(rx));
        *wrapper.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        wrapper
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn state(&self) -> ProxyState {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn status(&self) -> ProxyStatus {
        let cell = self.status.lock().unwrap_or_else(|e| e.into_inner());
        ProxyStatus {
            name: self.config.name.clone(),
            kind: self.config.kind.as_str(),
            status: cell.state,
            remote_addr: cell.remote_addr.clone(),
            last_error: cell.last_error.clone(),
        }
    }

    fn set_state(&self, state: ProxyState, error: Option<String>) {
        let mut cell = self.status.lock().unwrap_or_else(|e| e.into_inner());
        cell.state = state;
        if error.is_some() {
            cell.last_error = error;
        }
    }

    /// Record the gateway's answer to our NewProxy
    pub(crate) fn notify_registered(&self, remote_addr: String, error: String) {
        if self
            .registrations
            .try_send(Registration { remote_addr, error })
            .is_err()
        {
            debug!(proxy = %self.config.name, "Dropping unsolicited NewProxyResp");
        }
    }

    /// Take over a work connection, or hand it back when not running
    pub(crate) fn handle_work_conn(
        &self,
        conn: BoxedStream,
        start: WorkConnStart,
    ) -> Result<(), BoxedStream> {
        let mut work_conns = self.work_conns.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancel.is_cancelled() || self.state() != ProxyState::Running {
            return Err(conn);
        }

        // Reap finished connections
        while work_conns.try_join_next().is_some() {}

        let config = self.config.clone();
        let ctx = WorkConnContext {
            transporter: self.ctx.transporter.clone(),
            work_conn_timeout: self.ctx.work_conn_timeout,
            cancel: self.cancel.child_token(),
        };
        work_conns.spawn(async move {
            if let Err(e) = handle_work_conn(&config, conn, start, ctx).await {
                warn!(proxy = %config.name, "Work connection failed: {}", e);
            }
        });
        Ok(())
    }

    pub fn active_work_conns(&self) -> usize {
        self.work_conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Stop the proxy and wait until its task and work connections are gone
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(proxy = %self.config.name, "Proxy task failed: {}", e);
            }
        }
    }

    fn new_proxy_message(&self) -> Message {
        let (remote_port, custom_domains, subdomain, sk) = match &self.config.kind {
            ProxyKind::Tcp { remote_port } | ProxyKind::Udp { remote_port } => {
                (*remote_port, Vec::new(), String::new(), String::new())
            }
            ProxyKind::Http {
                custom_domains,
                subdomain,
            }
            | ProxyKind::Https {
                custom_domains,
                subdomain,
            } => (
                0,
                custom_domains.clone(),
                subdomain.clone().unwrap_or_default(),
                String::new(),
            ),
            ProxyKind::Stcp { secret_key } | ProxyKind::Xtcp { secret_key } => {
                (0, Vec::new(), String::new(), secret_key.clone())
            }
        };

        Message::NewProxy {
            proxy_name: self.config.name.clone(),
            proxy_type: self.config.kind.as_str().to_string(),
            use_encryption: self.config.use_encryption,
            use_compression: self.config.use_compression,
            remote_port,
            custom_domains,
            subdomain,
            sk,
        }
    }

    async fn run(self: Arc<Self>, mut registrations: mpsc::Receiver<Registration>) {
        let name = self.config.name.clone();
        let mut backoff = Backoff::new(self.ctx.retry.clone(), self.cancel.clone());
        let mut announced = false;

        loop {
            // Discard answers to an earlier attempt
            while registrations.try_recv().is_ok() {}

            self.set_state(ProxyState::WaitStart, None);
            if let Err(e) = self.ctx.transporter.send(self.new_proxy_message()).await {
                debug!(proxy = %name, "Cannot send NewProxy: {}", e);
                break;
            }
            announced = true;

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = timeout(self.ctx.start_timeout, registrations.recv()) => outcome,
            };

            let error = match outcome {
                Ok(Some(reg)) if reg.error.is_empty() => {
                    {
                        let mut cell = self.status.lock().unwrap_or_else(|e| e.into_inner());
                        cell.state = ProxyState::Running;
                        cell.remote_addr = Some(reg.remote_addr.clone());
                        cell.last_error = None;
                    }
                    info!(proxy = %name, remote_addr = %reg.remote_addr, "Proxy started");
                    backoff.reset();
                    self.cancel.cancelled().await;
                    break;
                }
                Ok(Some(reg)) => reg.error,
                Ok(None) => break,
                Err(_) => format!(
                    "no registration response within {:?}",
                    self.ctx.start_timeout
                ),
            };

            warn!(proxy = %name, "Proxy start failed: {}", error);
            self.set_state(ProxyState::StartError, Some(error));

            match backoff.wait().await {
                Ok(()) => {}
                Err(BackoffError::Cancelled) => break,
                Err(BackoffError::MaxAttemptsReached) => {
                    warn!(proxy = %name, "Giving up on proxy registration");
                    self.cancel.cancelled().await;
                    break;
                }
            }
        }

        if announced {
            let close = Message::CloseProxy {
                proxy_name: name.clone(),
            };
            if let Err(e) = self.ctx.transporter.send(close).await {
                debug!(proxy = %name, "CloseProxy not sent: {}", e);
            }
        }

        // Work connection tasks hold child tokens and are already cancelled
        let mut work_conns =
            std::mem::take(&mut *self.work_conns.lock().unwrap_or_else(|e| e.into_inner()));
        while work_conns.join_next().await.is_some() {}

        self.set_state(ProxyState::Closed, None);
        debug!(proxy = %name, "Proxy stopped");
    }
}
