//! In-memory gateway used by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use revtun_client::{
    BoxedStream, ClientConfig, Connector, Control, ControlError, ProxyConfig, TokenAuthSetter,
    VisitorConfig,
};
use revtun_proto::{Message, MessageCodec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const USER: &str = "alice";
pub const TOKEN: &str = "secret";

/// Connector whose connections end up at the test instead of a network peer
#[derive(Debug)]
pub struct TestConnector {
    dialed: mpsc::UnboundedSender<DuplexStream>,
    pub closes: AtomicUsize,
}

impl TestConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
        let (dialed, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                dialed,
                closes: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self) -> Result<BoxedStream, ControlError> {
        let (client, gateway) = duplex(64 * 1024);
        self.dialed
            .send(gateway)
            .map_err(|_| ControlError::ConnectionError("gateway gone".into()))?;
        Ok(Box::new(client))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Gateway end of a control connection
///
/// Messages pushed into `to_client` are written in order; everything the
/// client sends arrives on `from_client` (pings are answered instead when
/// `auto_pong` is set). Dropping `to_client` closes the connection.
pub struct Gateway {
    pub to_client: mpsc::UnboundedSender<Message>,
    pub from_client: mpsc::UnboundedReceiver<Message>,
    pub task: JoinHandle<()>,
}

impl Gateway {
    pub fn spawn(stream: DuplexStream, auto_pong: bool) -> Self {
        let (to_client, mut outgoing) = mpsc::unbounded_channel::<Message>();
        let (incoming, from_client) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut framed = Framed::new(stream, MessageCodec::new());
            loop {
                tokio::select! {
                    msg = outgoing.recv() => match msg {
                        Some(msg) => {
                            if framed.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    frame = framed.next() => match frame {
                        Some(Ok(Message::Ping { .. })) if auto_pong => {
                            let pong = Message::Pong { error: String::new() };
                            if framed.send(pong).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(msg)) => {
                            let _ = incoming.send(msg);
                        }
                        _ => break,
                    },
                }
            }
        });

        Self {
            to_client,
            from_client,
            task,
        }
    }

    pub fn send(&self, msg: Message) {
        self.to_client.send(msg).expect("gateway task alive");
    }

    /// Next message from the client, skipping pings
    pub async fn recv(&mut self) -> Message {
        loop {
            match self.from_client.recv().await {
                Some(Message::Ping { .. }) => continue,
                Some(msg) => return msg,
                None => panic!("control connection closed"),
            }
        }
    }

    /// Answer the next NewProxy with a successful registration
    pub async fn accept_proxy(&mut self) -> String {
        match self.recv().await {
            Message::NewProxy {
                proxy_name,
                remote_port,
                ..
            } => {
                self.send(Message::NewProxyResp {
                    proxy_name: proxy_name.clone(),
                    remote_addr: format!(":{}", remote_port),
                    error: String::new(),
                });
                proxy_name
            }
            other => panic!("Expected NewProxy, got {:?}", other),
        }
    }
}

pub struct Session {
    pub control: Arc<Control>,
    pub gateway: Gateway,
    pub connector: Arc<TestConnector>,
    pub dialed: mpsc::UnboundedReceiver<DuplexStream>,
}

pub fn config() -> ClientConfig {
    ClientConfig::builder()
        .server_addr("gateway.test:7000")
        .user(USER)
        .token(TOKEN)
        .build()
        .unwrap()
}

/// A started Control whose control connection is driven by a test gateway
pub async fn start_session(
    config: ClientConfig,
    proxies: HashMap<String, ProxyConfig>,
    visitors: HashMap<String, VisitorConfig>,
    auto_pong: bool,
) -> Session {
    let (connector, dialed) = TestConnector::new();
    let (client, gateway) = duplex(64 * 1024);
    let auth = Arc::new(TokenAuthSetter::from_config(&config));

    let control = Arc::new(Control::new(
        "run-1",
        Box::new(client),
        connector.clone(),
        auth,
        Arc::new(config),
        proxies,
        visitors,
    ));
    control.start().await;

    Session {
        control,
        gateway: Gateway::spawn(gateway, auto_pong),
        connector,
        dialed,
    }
}
