//! Session service: login, run a Control, reconnect when it ends

use crate::auth::{AuthSetter, TokenAuthSetter};
use crate::backoff::{Backoff, BackoffError};
use crate::config::{ClientConfig, ProxyConfig, VisitorConfig};
use crate::connection::{BoxedStream, Connector, TcpConnector};
use crate::control::{Control, SessionEnd};
use crate::ControlError;
use revtun_proto::{read_message, write_message, Message, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Service {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthSetter>,
    proxies: Mutex<HashMap<String, ProxyConfig>>,
    visitors: Mutex<HashMap<String, VisitorConfig>>,
    /// Issued by the gateway; replayed on reconnect
    run_id: Mutex<String>,
    control: Mutex<Option<Arc<Control>>>,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        auth: Arc<dyn AuthSetter>,
        proxies: HashMap<String, ProxyConfig>,
        visitors: HashMap<String, VisitorConfig>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            auth,
            proxies: Mutex::new(proxies),
            visitors: Mutex::new(visitors),
            run_id: Mutex::new(String::new()),
            control: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Service over plain TCP with token authentication
    pub fn with_tcp(
        config: ClientConfig,
        proxies: HashMap<String, ProxyConfig>,
        visitors: HashMap<String, VisitorConfig>,
    ) -> Self {
        let connector = Arc::new(TcpConnector::new(
            config.server_addr.clone(),
            config.dial_timeout,
        ));
        let auth = Arc::new(TokenAuthSetter::from_config(&config));
        Self::new(config, connector, auth, proxies, visitors)
    }

    /// Keep a session alive until it is forced offline or closed
    pub async fn run(&self) -> Result<SessionEnd, ControlError> {
        let mut backoff = Backoff::new(self.config.reconnect.clone(), self.cancel.clone());
        let mut logged_in_once = false;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(SessionEnd::Closed);
            }

            let login = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Closed),
                login = self.login() => login,
            };

            match login {
                Ok((conn, run_id)) => {
                    logged_in_once = true;
                    backoff.reset();

                    let end = self.run_session(conn, run_id).await;
                    match end {
                        SessionEnd::ForcedOffline => return Ok(end),
                        _ if self.cancel.is_cancelled() => return Ok(SessionEnd::Closed),
                        _ => warn!("Session ended ({}), reconnecting", end),
                    }
                }
                Err(e) => {
                    error!("Login to {} failed: {}", self.config.server_addr, e);
                    if !logged_in_once && self.config.login_fail_exit {
                        return Err(e);
                    }
                }
            }

            match backoff.wait().await {
                Ok(()) => {}
                Err(BackoffError::Cancelled) => return Ok(SessionEnd::Closed),
                Err(BackoffError::MaxAttemptsReached) => {
                    return Err(ControlError::ConnectionError(format!(
                        "gave up reconnecting to {}",
                        self.config.server_addr
                    )))
                }
            }
        }
    }

    async fn run_session(&self, conn: BoxedStream, run_id: String) -> SessionEnd {
        let proxies = self.lock(&self.proxies).clone();
        let visitors = self.lock(&self.visitors).clone();
        let control = Arc::new(Control::new(
            run_id,
            conn,
            self.connector.clone(),
            self.auth.clone(),
            self.config.clone(),
            proxies,
            visitors,
        ));

        *self.lock(&self.control) = Some(control.clone());
        control.start().await;

        // graceful_close may have run before the control was published
        if self.cancel.is_cancelled() {
            control.close().await;
        }

        let end = control.wait_done().await;
        self.lock(&self.control).take();
        end
    }

    /// Dial the gateway and authenticate; returns the connection and the confirmed run id
    pub async fn login(&self) -> Result<(BoxedStream, String), ControlError> {
        let mut conn = self.connector.connect().await?;

        let mut login = Message::Login {
            version: PROTOCOL_VERSION.to_string(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user: self.config.user.clone(),
            privilege_key: String::new(),
            timestamp: 0,
            run_id: self.lock(&self.run_id).clone(),
            pool_count: self.config.pool_count,
        };
        self.auth.set_login(&mut login)?;
        write_message(&mut conn, &login).await?;

        let reply = timeout(self.config.login_timeout, read_message(&mut conn))
            .await
            .map_err(|_| ControlError::Timeout("waiting for LoginResp".into()))??;

        match reply {
            Message::LoginResp { error, .. } if !error.is_empty() => {
                Err(ControlError::AuthenticationFailed(error))
            }
            Message::LoginResp {
                run_id, version, ..
            } => {
                info!(run_id = %run_id, server_version = %version, "Logged in to {}", self.config.server_addr);
                *self.lock(&self.run_id) = run_id.clone();
                Ok((conn, run_id))
            }
            other => Err(ControlError::ProtocolError(format!(
                "expected LoginResp, got {}",
                other.kind()
            ))),
        }
    }

    /// Replace the proxy and visitor sets; a live session applies them immediately
    pub async fn reload(
        &self,
        proxies: HashMap<String, ProxyConfig>,
        visitors: HashMap<String, VisitorConfig>,
    ) {
        *self.lock(&self.proxies) = proxies.clone();
        *self.lock(&self.visitors) = visitors.clone();

        let control = self.control();
        if let Some(control) = control {
            control.reload(proxies, visitors).await;
        }
    }

    /// Stop reconnecting and close the live session after `drain`
    pub async fn graceful_close(&self, drain: Duration) {
        self.cancel.cancel();
        let control = self.control();
        if let Some(control) = control {
            control.graceful_close(drain).await;
        }
    }

    /// The live session, if any
    pub fn control(&self) -> Option<Arc<Control>> {
        self.lock(&self.control).clone()
    }

    pub fn run_id(&self) -> String {
        self.lock(&self.run_id).clone()
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}
