//! Control session
//!
//! One `Control` owns one authenticated control connection. Three tasks run
//! per connection:
//! - reader: decodes messages onto the inbound queue
//! - writer: the only task that writes to the connection
//! - handler: dispatches inbound messages and runs the heartbeat
//!
//! A supervisor waits for the reader to exit, then tears down in order:
//! handler, outbound queue and writer, proxy and visitor managers, the
//! completion signal, and finally the connector.

use crate::auth::AuthSetter;
use crate::config::{ClientConfig, ProxyConfig, VisitorConfig};
use crate::connection::{BoxedStream, Connector};
use crate::proxy::{ProxyManager, WorkConnStart};
use crate::transporter::MessageTransporter;
use crate::visitor::VisitorManager;
use crate::ControlError;
use futures::{SinkExt, StreamExt};
use revtun_proto::{read_message, write_message, Message, MessageCodec};
use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the inbound and outbound control queues
const QUEUE_CAPACITY: usize = 100;

/// Ticker period used when a ticker is disabled
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Why a session ended; published on the completion signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The gateway closed the connection or a read failed
    ConnectionLost,
    /// No pong within the heartbeat timeout
    HeartbeatTimeout,
    /// The gateway answered a ping with an error
    PongError(String),
    /// Writing to the control connection failed
    WriteFailed(String),
    /// Closed locally through `close` / `graceful_close`
    Closed,
    /// The gateway kicked this client; do not reconnect
    ForcedOffline,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::ConnectionLost => write!(f, "connection lost"),
            SessionEnd::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            SessionEnd::PongError(e) => write!(f, "pong error: {}", e),
            SessionEnd::WriteFailed(e) => write!(f, "write failed: {}", e),
            SessionEnd::Closed => write!(f, "closed"),
            SessionEnd::ForcedOffline => write!(f, "forced offline by gateway"),
        }
    }
}

/// Closes the control connection at most once; the first reason wins
struct ConnectionCloser {
    token: CancellationToken,
    reason: Mutex<Option<SessionEnd>>,
    closes: AtomicUsize,
}

impl ConnectionCloser {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            closes: AtomicUsize::new(0),
        }
    }

    fn close(&self, reason: SessionEnd) -> bool {
        let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            return false;
        }
        debug!("Closing control connection: {}", reason);
        *current = Some(reason);
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        true
    }

    fn reason(&self) -> Option<SessionEnd> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// State handed from `new` to `start`
struct Pending {
    conn: BoxedStream,
    outbound: mpsc::Receiver<Message>,
    proxies: HashMap<String, ProxyConfig>,
    visitors: HashMap<String, VisitorConfig>,
}

pub struct Control {
    run_id: String,
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthSetter>,
    transporter: Arc<MessageTransporter>,
    pm: Arc<ProxyManager>,
    vm: Arc<VisitorManager>,
    closer: Arc<ConnectionCloser>,
    /// Cancelled by the reader alone, when it exits
    reader_closed: CancellationToken,
    done: Arc<watch::Sender<Option<SessionEnd>>>,
    pending: Mutex<Option<Pending>>,
}

impl Control {
    /// Wrap a connection on which login already succeeded
    pub fn new(
        run_id: impl Into<String>,
        conn: BoxedStream,
        connector: Arc<dyn Connector>,
        auth: Arc<dyn AuthSetter>,
        config: Arc<ClientConfig>,
        proxies: HashMap<String, ProxyConfig>,
        visitors: HashMap<String, VisitorConfig>,
    ) -> Self {
        let run_id = run_id.into();
        let (outbound_tx, outbound) = mpsc::channel(QUEUE_CAPACITY);
        let transporter = Arc::new(MessageTransporter::new(outbound_tx));
        let pm = Arc::new(ProxyManager::new(transporter.clone(), &config));
        let vm = Arc::new(VisitorManager::new(
            connector.clone(),
            transporter.clone(),
            run_id.clone(),
            &config,
        ));
        let (done, _) = watch::channel(None);

        Self {
            run_id,
            config,
            connector,
            auth,
            transporter,
            pm,
            vm,
            closer: Arc::new(ConnectionCloser::new()),
            reader_closed: CancellationToken::new(),
            done: Arc::new(done),
            pending: Mutex::new(Some(Pending {
                conn,
                outbound,
                proxies,
                visitors,
            })),
        }
    }

    /// Spawn the connection tasks and start the configured proxies and visitors
    ///
    /// Returns once every proxy and visitor has been started; registration
    /// and binding continue in the background.
    pub async fn start(&self) {
        let Some(pending) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!(run_id = %self.run_id, "Control already started or closed");
            return;
        };

        if self.config.heartbeat_enabled() && self.config.tcp_mux {
            warn!("Heartbeat timeout check disabled; liveness relies on the multiplexed transport");
        }

        let (read_half, write_half) = tokio::io::split(pending.conn);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, MessageCodec::new()),
            inbound_tx,
            self.closer.clone(),
            self.reader_closed.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, MessageCodec::new()),
            pending.outbound,
            self.closer.clone(),
        ));
        let handler = Handler {
            config: self.config.clone(),
            run_id: self.run_id.clone(),
            connector: self.connector.clone(),
            auth: self.auth.clone(),
            transporter: self.transporter.clone(),
            pm: self.pm.clone(),
            closer: self.closer.clone(),
        };
        let handler = tokio::spawn(handler.run(inbound_rx));

        tokio::spawn(
            Supervisor {
                transporter: self.transporter.clone(),
                pm: self.pm.clone(),
                vm: self.vm.clone(),
                closer: self.closer.clone(),
                done: self.done.clone(),
                connector: self.connector.clone(),
            }
            .run(reader, handler, writer),
        );

        info!(run_id = %self.run_id, "Control session started");
        self.reload(pending.proxies, pending.visitors).await;
    }

    /// Hand new proxy and visitor sets to the managers and wait until both applied them
    pub async fn reload(
        &self,
        proxies: HashMap<String, ProxyConfig>,
        visitors: HashMap<String, VisitorConfig>,
    ) {
        tokio::join!(self.pm.reload(proxies), self.vm.reload(visitors));
    }

    /// Stop proxies and visitors, let traffic drain, then close the connection
    ///
    /// Returns after teardown finished. Safe to call more than once.
    pub async fn graceful_close(&self, drain: Duration) {
        self.pm.close().await;
        self.vm.close().await;
        if !drain.is_zero() && !self.closer.is_closed() {
            tokio::time::sleep(drain).await;
        }
        self.closer.close(SessionEnd::Closed);

        let never_started = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if never_started.is_some() {
            drop(never_started);
            self.transporter.close();
            let reason = self.closer.reason().unwrap_or(SessionEnd::Closed);
            self.done.send_replace(Some(reason));
            self.connector.close().await;
            return;
        }

        self.wait_done().await;
    }

    pub async fn close(&self) {
        self.graceful_close(Duration::ZERO).await
    }

    /// Completion signal: `Some(reason)` once teardown finished
    pub fn done(&self) -> watch::Receiver<Option<SessionEnd>> {
        self.done.subscribe()
    }

    /// Wait until teardown finished
    pub async fn wait_done(&self) -> SessionEnd {
        let mut done = self.done.subscribe();
        loop {
            if let Some(reason) = done.borrow_and_update().clone() {
                return reason;
            }
            if done.changed().await.is_err() {
                return self.closer.reason().unwrap_or(SessionEnd::ConnectionLost);
            }
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn proxy_manager(&self) -> &Arc<ProxyManager> {
        &self.pm
    }

    pub fn visitor_manager(&self) -> &Arc<VisitorManager> {
        &self.vm
    }

    pub fn transporter(&self) -> &Arc<MessageTransporter> {
        &self.transporter
    }

    /// True once the control connection has been closed (teardown may still be running)
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// True once the reader task exited
    pub fn reader_closed(&self) -> bool {
        self.reader_closed.is_cancelled()
    }

    /// How many times the control connection was actually closed
    pub fn connection_close_count(&self) -> usize {
        self.closer.closes.load(Ordering::SeqCst)
    }
}

type MessageReader = FramedRead<ReadHalf<BoxedStream>, MessageCodec>;
type MessageWriter = FramedWrite<WriteHalf<BoxedStream>, MessageCodec>;

async fn read_loop(
    mut stream: MessageReader,
    inbound: mpsc::Sender<Message>,
    closer: Arc<ConnectionCloser>,
    reader_closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closer.closed() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(msg)) => {
                trace!("Received {}", msg.kind());
                let queued = tokio::select! {
                    _ = closer.closed() => false,
                    sent = inbound.send(msg) => sent.is_ok(),
                };
                if !queued {
                    break;
                }
            }
            Some(Err(e)) => {
                if e.is_eof() {
                    debug!("Control connection closed mid-message");
                } else {
                    warn!("Control connection read failed: {}", e);
                }
                closer.close(SessionEnd::ConnectionLost);
                break;
            }
            None => {
                debug!("Control connection closed by gateway");
                closer.close(SessionEnd::ConnectionLost);
                break;
            }
        }
    }

    // Dropping `inbound` here closes the inbound queue
    reader_closed.cancel();
}

async fn write_loop(
    mut sink: MessageWriter,
    mut outbound: mpsc::Receiver<Message>,
    closer: Arc<ConnectionCloser>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = closer.closed() => break,
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!("Outbound queue closed, writer exiting");
                    return;
                }
            },
        };

        let kind = msg.kind();
        let result = tokio::select! {
            _ = closer.closed() => break,
            result = sink.send(msg) => result,
        };
        match result {
            Ok(()) => trace!("Sent {}", kind),
            Err(e) => {
                error!("Failed to write {}: {}", kind, e);
                closer.close(SessionEnd::WriteFailed(e.to_string()));
                break;
            }
        }
    }

    // The connection is closed: release our half and discard what is still queued
    drop(sink);
    let mut discarded = 0usize;
    while outbound.recv().await.is_some() {
        discarded += 1;
    }
    debug!("Writer exiting, {} queued message(s) discarded", discarded);
}

struct Handler {
    config: Arc<ClientConfig>,
    run_id: String,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthSetter>,
    transporter: Arc<MessageTransporter>,
    pm: Arc<ProxyManager>,
    closer: Arc<ConnectionCloser>,
}

impl Handler {
    async fn run(self, mut inbound: mpsc::Receiver<Message>) {
        let heartbeat_enabled = self.config.heartbeat_enabled();
        let check_enabled = self.config.heartbeat_check_enabled();

        let ping_period = if heartbeat_enabled {
            self.config.heartbeat_interval
        } else {
            IDLE_PERIOD
        };
        let check_period = if check_enabled {
            self.config.heartbeat_check_interval
        } else {
            IDLE_PERIOD
        };

        let mut ping = interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check = interval_at(Instant::now() + check_period, check_period);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Only this loop reads or writes the last pong time
        let mut last_pong = Instant::now();
        let mut work_conns = JoinSet::new();

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        if self.dispatch(msg, &mut last_pong, &mut work_conns).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick(), if heartbeat_enabled => self.send_ping().await,
                _ = check.tick(), if check_enabled => {
                    if last_pong.elapsed() > self.config.heartbeat_timeout {
                        warn!(
                            "Heartbeat timeout: no pong for {:?}",
                            last_pong.elapsed()
                        );
                        self.closer.close(SessionEnd::HeartbeatTimeout);
                        break;
                    }
                }
                Some(_) = work_conns.join_next(), if !work_conns.is_empty() => {}
            }
        }

        work_conns.shutdown().await;
        debug!("Message handler exiting");
    }

    fn dispatch(
        &self,
        msg: Message,
        last_pong: &mut Instant,
        work_conns: &mut JoinSet<()>,
    ) -> ControlFlow<()> {
        match msg {
            Message::ReqWorkConn => {
                work_conns.spawn(open_work_conn(
                    self.connector.clone(),
                    self.auth.clone(),
                    self.run_id.clone(),
                    self.config.work_conn_timeout,
                    self.pm.clone(),
                ));
            }
            Message::NewProxyResp {
                proxy_name,
                remote_addr,
                error,
            } => {
                self.pm.notify_registered(&proxy_name, remote_addr, error);
            }
            msg @ Message::NatHoleResp { .. } => {
                let tid = msg.transaction_id().unwrap_or_default().to_string();
                if !self.transporter.dispatch_message(msg) {
                    warn!(transaction_id = %tid, "No waiter for NatHoleResp, dropping");
                }
            }
            Message::CloseClient { token } => {
                if token == self.config.user {
                    info!("Gateway forced this client offline");
                    self.closer.close(SessionEnd::ForcedOffline);
                    return ControlFlow::Break(());
                }
                warn!("Ignoring CloseClient for a different identity");
            }
            Message::Pong { error } => {
                if !error.is_empty() {
                    error!("Pong contains error: {}", error);
                    self.closer.close(SessionEnd::PongError(error));
                    return ControlFlow::Break(());
                }
                *last_pong = Instant::now();
                debug!("Received heartbeat from gateway");
            }
            unexpected @ (Message::Login { .. }
            | Message::LoginResp { .. }
            | Message::NewProxy { .. }
            | Message::CloseProxy { .. }
            | Message::NewWorkConn { .. }
            | Message::StartWorkConn { .. }
            | Message::NewVisitorConn { .. }
            | Message::NewVisitorConnResp { .. }
            | Message::Ping { .. }
            | Message::UdpPacket { .. }
            | Message::NatHoleVisitor { .. }
            | Message::NatHoleClient { .. }
            | Message::NatHoleSid { .. }) => {
                warn!("Unexpected {} on control connection", unexpected.kind());
            }
        }
        ControlFlow::Continue(())
    }

    async fn send_ping(&self) {
        let mut ping = Message::ping();
        if let Err(e) = self.auth.set_ping(&mut ping) {
            warn!("Failed to sign heartbeat: {}", e);
            return;
        }
        debug!("Sending heartbeat to gateway");
        if let Err(e) = self.transporter.send(ping).await {
            debug!("Heartbeat not queued: {}", e);
        }
    }
}

/// Dial a work connection, announce it and hand it to the named proxy
async fn open_work_conn(
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthSetter>,
    run_id: String,
    reply_timeout: Duration,
    pm: Arc<ProxyManager>,
) {
    if let Err(e) = establish_work_conn(connector, auth, run_id, reply_timeout, pm).await {
        warn!("Work connection not established: {}", e);
    }
}

async fn establish_work_conn(
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthSetter>,
    run_id: String,
    reply_timeout: Duration,
    pm: Arc<ProxyManager>,
) -> Result<(), ControlError> {
    let mut conn = connector.connect().await?;

    let mut announce = Message::new_work_conn(run_id);
    auth.set_new_work_conn(&mut announce)?;
    write_message(&mut conn, &announce).await?;

    let reply = timeout(reply_timeout, read_message(&mut conn))
        .await
        .map_err(|_| ControlError::Timeout("waiting for StartWorkConn".into()))??;

    match reply {
        Message::StartWorkConn { error, .. } if !error.is_empty() => Err(
            ControlError::ProtocolError(format!("StartWorkConn error: {}", error)),
        ),
        Message::StartWorkConn {
            proxy_name,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            ..
        } => {
            let start = WorkConnStart {
                proxy_name,
                src_addr,
                src_port,
                dst_addr,
                dst_port,
            };
            pm.handle_work_conn(conn, start).await;
            Ok(())
        }
        other => Err(ControlError::ProtocolError(format!(
            "expected StartWorkConn, got {}",
            other.kind()
        ))),
    }
}

struct Supervisor {
    transporter: Arc<MessageTransporter>,
    pm: Arc<ProxyManager>,
    vm: Arc<VisitorManager>,
    closer: Arc<ConnectionCloser>,
    done: Arc<watch::Sender<Option<SessionEnd>>>,
    connector: Arc<dyn Connector>,
}

impl Supervisor {
    async fn run(self, reader: JoinHandle<()>, handler: JoinHandle<()>, writer: JoinHandle<()>) {
        if let Err(e) = reader.await {
            error!("Reader task failed: {}", e);
            self.closer.close(SessionEnd::ConnectionLost);
        }
        // The reader dropped its sender, so the handler's receive ends
        if let Err(e) = handler.await {
            error!("Handler task failed: {}", e);
        }

        self.transporter.close();
        if let Err(e) = writer.await {
            error!("Writer task failed: {}", e);
        }

        self.pm.close().await;
        self.vm.close().await;

        let reason = self.closer.reason().unwrap_or(SessionEnd::ConnectionLost);
        info!("Control session ended: {}", reason);
        self.done.send_replace(Some(reason));

        self.connector.close().await;
    }
}
