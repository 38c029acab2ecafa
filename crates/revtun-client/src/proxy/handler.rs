//! Per-kind handling of work connections handed to a proxy

use super::WorkConnStart;
use crate::config::{ProxyConfig, ProxyKind};
use crate::connection::BoxedStream;
use crate::forward::splice;
use crate::transporter::MessageTransporter;
use crate::ControlError;
use futures::{SinkExt, StreamExt};
use revtun_proto::{read_message, write_message, Message, MessageCodec, MessageKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on the gateway's answer to a NAT hole request
const NAT_HOLE_TIMEOUT: Duration = Duration::from_secs(5);

const UDP_BUFFER_SIZE: usize = 64 * 1024;

/// A UDP peer with no traffic for this long loses its local socket
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Collaborators a work connection may need besides the connection itself
#[derive(Clone)]
pub(crate) struct WorkConnContext {
    pub transporter: Arc<MessageTransporter>,
    pub work_conn_timeout: Duration,
    pub cancel: CancellationToken,
}

pub(crate) async fn handle_work_conn(
    config: &ProxyConfig,
    mut conn: BoxedStream,
    start: WorkConnStart,
    ctx: WorkConnContext,
) -> Result<(), ControlError> {
    debug!(
        proxy = %config.name,
        src = %start.src_addr,
        src_port = start.src_port,
        "Work connection started"
    );

    match &config.kind {
        ProxyKind::Tcp { .. }
        | ProxyKind::Http { .. }
        | ProxyKind::Https { .. }
        | ProxyKind::Stcp { .. } => forward_tcp(config, &mut conn, &ctx.cancel).await,
        ProxyKind::Udp { .. } => relay_udp(config, conn, &ctx.cancel, UDP_IDLE_TIMEOUT).await,
        ProxyKind::Xtcp { .. } => accept_xtcp_peer(config, &mut conn, &ctx).await,
    }
}

async fn dial_local(config: &ProxyConfig) -> Result<TcpStream, ControlError> {
    TcpStream::connect(config.local_addr()).await.map_err(|e| {
        ControlError::ConnectionError(format!(
            "proxy [{}]: local service {} unreachable: {}",
            config.name,
            config.local_addr(),
            e
        ))
    })
}

async fn forward_tcp(
    config: &ProxyConfig,
    conn: &mut BoxedStream,
    cancel: &CancellationToken,
) -> Result<(), ControlError> {
    let mut local = dial_local(config).await?;
    let (to_local, to_tunnel) = splice(conn, &mut local, cancel).await;

    debug!(
        proxy = %config.name,
        bytes_to_local = to_local,
        bytes_to_tunnel = to_tunnel,
        "TCP forward completed"
    );
    Ok(())
}

/// One local socket per remote peer so replies can be attributed
struct UdpPeer {
    socket: Arc<UdpSocket>,
    reader: AbortHandle,
    last_active: Instant,
}

/// Relay UdpPacket messages between the work connection and the local UDP service
///
/// Peers silent in both directions for `idle_timeout` are evicted; their
/// socket and reader task are released.
async fn relay_udp(
    config: &ProxyConfig,
    conn: BoxedStream,
    cancel: &CancellationToken,
    idle_timeout: Duration,
) -> Result<(), ControlError> {
    let local_addr = config.local_addr();
    let mut framed = Framed::new(conn, MessageCodec::new());
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(64);
    let mut peers: HashMap<String, UdpPeer> = HashMap::new();
    let mut readers = JoinSet::new();
    let mut sweep = interval(idle_timeout);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(reply) = reply_rx.recv() => {
                if let Message::UdpPacket { remote_addr, .. } = &reply {
                    if let Some(peer) = peers.get_mut(remote_addr) {
                        peer.last_active = Instant::now();
                    }
                }
                if let Err(e) = framed.send(reply).await {
                    debug!(proxy = %config.name, "UDP work connection write failed: {}", e);
                    break;
                }
            }
            _ = sweep.tick() => {
                peers.retain(|addr, peer| {
                    if peer.last_active.elapsed() < idle_timeout {
                        return true;
                    }
                    debug!(proxy = %config.name, peer = %addr, "Evicting idle UDP peer");
                    peer.reader.abort();
                    false
                });
            }
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
            frame = framed.next() => match frame {
                Some(Ok(Message::UdpPacket { content, remote_addr, .. })) => {
                    let socket = match peers.get_mut(&remote_addr) {
                        Some(peer) => {
                            peer.last_active = Instant::now();
                            peer.socket.clone()
                        }
                        None => {
                            let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
                            socket.connect(&local_addr).await?;
                            let reader = readers.spawn(read_udp_replies(
                                socket.clone(),
                                local_addr.clone(),
                                remote_addr.clone(),
                                reply_tx.clone(),
                            ));
                            peers.insert(
                                remote_addr.clone(),
                                UdpPeer {
                                    socket: socket.clone(),
                                    reader,
                                    last_active: Instant::now(),
                                },
                            );
                            socket
                        }
                    };
                    if let Err(e) = socket.send(&content).await {
                        debug!(proxy = %config.name, peer = %remote_addr, "UDP send failed: {}", e);
                    }
                }
                Some(Ok(other)) => {
                    warn!(proxy = %config.name, "Unexpected {} on UDP work connection", other.kind());
                }
                Some(Err(e)) => {
                    debug!(proxy = %config.name, "UDP work connection read failed: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    readers.shutdown().await;
    debug!(proxy = %config.name, peers = peers.len(), "UDP relay finished");
    Ok(())
}

async fn read_udp_replies(
    socket: Arc<UdpSocket>,
    local_addr: String,
    remote_addr: String,
    reply_tx: mpsc::Sender<Message>,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(peer = %remote_addr, "UDP receive failed: {}", e);
                return;
            }
        };
        let packet = Message::UdpPacket {
            content: buf[..n].to_vec(),
            local_addr: local_addr.clone(),
            remote_addr: remote_addr.clone(),
        };
        if reply_tx.send(packet).await.is_err() {
            return;
        }
    }
}

/// Direct-connection flow of an xtcp proxy
///
/// The gateway announces a visitor through NatHoleSid on the work connection.
/// We open a listener, advertise it via NatHoleClient, wait for the visitor
/// to connect and prove the session id, then forward to the local service.
async fn accept_xtcp_peer(
    config: &ProxyConfig,
    conn: &mut BoxedStream,
    ctx: &WorkConnContext,
) -> Result<(), ControlError> {
    let sid = match timeout(ctx.work_conn_timeout, read_message(conn)).await {
        Ok(Ok(Message::NatHoleSid { sid, .. })) => sid,
        Ok(Ok(other)) => {
            return Err(ControlError::ProtocolError(format!(
                "expected NatHoleSid, got {}",
                other.kind()
            )))
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ControlError::Timeout("waiting for NatHoleSid".into())),
    };

    let listener = TcpListener::bind((config.local_ip.as_str(), 0)).await?;
    let mapped_addr = listener.local_addr()?.to_string();

    let request = Message::NatHoleClient {
        transaction_id: uuid::Uuid::new_v4().to_string(),
        proxy_name: config.name.clone(),
        sid: sid.clone(),
        mapped_addrs: vec![mapped_addr.clone()],
    };
    match ctx
        .transporter
        .request(request, MessageKind::NatHoleResp, NAT_HOLE_TIMEOUT)
        .await?
    {
        Message::NatHoleResp { error, .. } if !error.is_empty() => {
            return Err(ControlError::ProtocolError(format!(
                "gateway rejected NAT hole: {}",
                error
            )))
        }
        Message::NatHoleResp { .. } => {}
        other => {
            return Err(ControlError::ProtocolError(format!(
                "expected NatHoleResp, got {}",
                other.kind()
            )))
        }
    }

    debug!(proxy = %config.name, addr = %mapped_addr, "Waiting for xtcp visitor");

    let (mut peer, peer_addr) = tokio::select! {
        _ = ctx.cancel.cancelled() => return Ok(()),
        accepted = timeout(ctx.work_conn_timeout, listener.accept()) => accepted
            .map_err(|_| ControlError::Timeout("waiting for xtcp visitor".into()))??,
    };
    drop(listener);

    match timeout(ctx.work_conn_timeout, read_message(&mut peer)).await {
        Ok(Ok(Message::NatHoleSid {
            transaction_id,
            sid: peer_sid,
            nonce,
            ..
        })) if peer_sid == sid => {
            let ack = Message::NatHoleSid {
                transaction_id,
                sid: peer_sid,
                response: true,
                nonce,
            };
            write_message(&mut peer, &ack).await?;
        }
        Ok(Ok(_)) => {
            return Err(ControlError::AuthenticationFailed(format!(
                "xtcp visitor {} presented a wrong session id",
                peer_addr
            )))
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(ControlError::Timeout("xtcp handshake".into())),
    }

    info!(proxy = %config.name, peer = %peer_addr, "xtcp visitor connected");

    let mut local = dial_local(config).await?;
    let (to_local, to_peer) = splice(&mut peer, &mut local, &ctx.cancel).await;
    debug!(
        proxy = %config.name,
        bytes_to_local = to_local,
        bytes_to_peer = to_peer,
        "xtcp forward completed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn context() -> (WorkConnContext, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (
            WorkConnContext {
                transporter: Arc::new(MessageTransporter::new(tx)),
                work_conn_timeout: Duration::from_secs(5),
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn start() -> WorkConnStart {
        WorkConnStart {
            proxy_name: "svc".to_string(),
            src_addr: "198.51.100.7".to_string(),
            src_port: 40000,
            dst_addr: String::new(),
            dst_port: 0,
        }
    }

    #[tokio::test]
    async fn test_tcp_work_conn_reaches_local_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (conn, mut gateway) = duplex(1024);
        let (ctx, _rx) = context();
        let config = ProxyConfig::tcp("svc", port, 0);
        let work = tokio::spawn(async move {
            handle_work_conn(&config, Box::new(conn), start(), ctx).await
        });

        gateway.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        gateway.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echo.await.unwrap();
        drop(gateway);
        work.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_local_service_fails() {
        // Grab a free port and release it so nothing listens there
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (conn, _gateway) = duplex(64);
        let (ctx, _rx) = context();
        let result =
            handle_work_conn(&ProxyConfig::tcp("svc", port, 0), Box::new(conn), start(), ctx).await;
        assert!(matches!(result, Err(ControlError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_udp_work_conn_relays_datagrams() {
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = service.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = service.recv_from(&mut buf).await.unwrap();
            service.send_to(&buf[..n], from).await.unwrap();
        });

        let config = ProxyConfig {
            kind: ProxyKind::Udp { remote_port: 0 },
            ..ProxyConfig::tcp("dns", port, 0)
        };
        let (conn, gateway) = duplex(4096);
        let (ctx, _rx) = context();
        let cancel = ctx.cancel.clone();
        let work = tokio::spawn(async move {
            handle_work_conn(&config, Box::new(conn), start(), ctx).await
        });

        let mut gateway = Framed::new(gateway, MessageCodec::new());
        gateway
            .send(Message::UdpPacket {
                content: b"query".to_vec(),
                local_addr: String::new(),
                remote_addr: "203.0.113.9:5353".to_string(),
            })
            .await
            .unwrap();

        match gateway.next().await.unwrap().unwrap() {
            Message::UdpPacket {
                content,
                remote_addr,
                ..
            } => {
                assert_eq!(content, b"query");
                assert_eq!(remote_addr, "203.0.113.9:5353");
            }
            other => panic!("Expected UdpPacket, got {:?}", other),
        }

        echo.await.unwrap();
        cancel.cancel();
        work.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_udp_peer_gets_fresh_socket() {
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = service.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let mut sources = Vec::new();
            let mut buf = [0u8; 64];
            for _ in 0..3 {
                let (n, from) = service.recv_from(&mut buf).await.unwrap();
                service.send_to(&buf[..n], from).await.unwrap();
                sources.push(from);
            }
            sources
        });

        let config = ProxyConfig {
            kind: ProxyKind::Udp { remote_port: 0 },
            ..ProxyConfig::tcp("dns", port, 0)
        };
        let (conn, gateway) = duplex(4096);
        let cancel = CancellationToken::new();
        let relay_cancel = cancel.clone();
        let work = tokio::spawn(async move {
            relay_udp(
                &config,
                Box::new(conn),
                &relay_cancel,
                Duration::from_millis(200),
            )
            .await
        });

        let mut gateway = Framed::new(gateway, MessageCodec::new());
        let packet = || Message::UdpPacket {
            content: b"query".to_vec(),
            local_addr: String::new(),
            remote_addr: "203.0.113.9:5353".to_string(),
        };

        for pause in [Duration::ZERO, Duration::from_millis(800)] {
            tokio::time::sleep(pause).await;
            gateway.send(packet()).await.unwrap();
            assert!(matches!(
                gateway.next().await.unwrap().unwrap(),
                Message::UdpPacket { .. }
            ));
        }
        gateway.send(packet()).await.unwrap();
        gateway.next().await.unwrap().unwrap();

        // The second packet arrived after the peer went idle, the third right after it
        let sources = echo.await.unwrap();
        assert_ne!(sources[0], sources[1]);
        assert_eq!(sources[1], sources[2]);

        cancel.cancel();
        work.await.unwrap().unwrap();
    }

    fn xtcp_config(local_port: u16) -> ProxyConfig {
        ProxyConfig {
            kind: ProxyKind::Xtcp {
                secret_key: "abc".to_string(),
            },
            ..ProxyConfig::tcp("p2p", local_port, 0)
        }
    }

    /// Announce a visitor on the work connection and return the NatHoleClient it triggers
    async fn announce_visitor(
        gateway: &mut tokio::io::DuplexStream,
        rx: &mut mpsc::Receiver<Message>,
    ) -> (String, String) {
        let announce = Message::NatHoleSid {
            transaction_id: "gw-1".to_string(),
            sid: "sid-1".to_string(),
            response: false,
            nonce: String::new(),
        };
        write_message(gateway, &announce).await.unwrap();

        match rx.recv().await.unwrap() {
            Message::NatHoleClient {
                transaction_id,
                sid,
                mut mapped_addrs,
                ..
            } => {
                assert_eq!(sid, "sid-1");
                (transaction_id, mapped_addrs.remove(0))
            }
            other => panic!("Expected NatHoleClient, got {:?}", other),
        }
    }

    fn nat_hole_resp(transaction_id: String, error: &str) -> Message {
        Message::NatHoleResp {
            transaction_id,
            sid: "sid-1".to_string(),
            protocol: "tcp".to_string(),
            candidate_addrs: Vec::new(),
            error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn test_xtcp_visitor_reaches_local_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let (conn, mut gateway) = duplex(1024);
        let (ctx, mut rx) = context();
        let transporter = ctx.transporter.clone();
        let cancel = ctx.cancel.clone();
        let config = xtcp_config(port);
        let work = tokio::spawn(async move {
            handle_work_conn(&config, Box::new(conn), start(), ctx).await
        });

        let (tid, mapped_addr) = announce_visitor(&mut gateway, &mut rx).await;
        assert!(transporter.dispatch_message(nat_hole_resp(tid, "")));

        let mut peer = TcpStream::connect(&mapped_addr).await.unwrap();
        let hello = Message::NatHoleSid {
            transaction_id: "v-1".to_string(),
            sid: "sid-1".to_string(),
            response: false,
            nonce: "n-1".to_string(),
        };
        write_message(&mut peer, &hello).await.unwrap();
        match read_message(&mut peer).await.unwrap() {
            Message::NatHoleSid {
                response, nonce, ..
            } => {
                assert!(response);
                assert_eq!(nonce, "n-1");
            }
            other => panic!("Expected NatHoleSid, got {:?}", other),
        }

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        echo.await.unwrap();
        cancel.cancel();
        work.await.unwrap().unwrap();
        assert_eq!(transporter.pending(), 0);
    }

    #[tokio::test]
    async fn test_xtcp_visitor_with_wrong_sid_rejected() {
        let (conn, mut gateway) = duplex(1024);
        let (ctx, mut rx) = context();
        let transporter = ctx.transporter.clone();
        let config = xtcp_config(22);
        let work = tokio::spawn(async move {
            handle_work_conn(&config, Box::new(conn), start(), ctx).await
        });

        let (tid, mapped_addr) = announce_visitor(&mut gateway, &mut rx).await;
        assert!(transporter.dispatch_message(nat_hole_resp(tid, "")));

        let mut peer = TcpStream::connect(&mapped_addr).await.unwrap();
        let hello = Message::NatHoleSid {
            transaction_id: "v-1".to_string(),
            sid: "forged".to_string(),
            response: false,
            nonce: "n-1".to_string(),
        };
        write_message(&mut peer, &hello).await.unwrap();

        let result = work.await.unwrap();
        assert!(matches!(result, Err(ControlError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_xtcp_gateway_error_fails_work_conn() {
        let (conn, mut gateway) = duplex(1024);
        let (ctx, mut rx) = context();
        let transporter = ctx.transporter.clone();
        let config = xtcp_config(22);
        let work = tokio::spawn(async move {
            handle_work_conn(&config, Box::new(conn), start(), ctx).await
        });

        let (tid, _) = announce_visitor(&mut gateway, &mut rx).await;
        assert!(transporter.dispatch_message(nat_hole_resp(tid, "proxy p2p not found")));

        match work.await.unwrap() {
            Err(ControlError::ProtocolError(msg)) => assert!(msg.contains("proxy p2p not found")),
            other => panic!("Expected ProtocolError, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_xtcp_unanswered_nat_hole_times_out() {
        let (conn, mut gateway) = duplex(1024);
        let (ctx, mut rx) = context();
        let transporter = ctx.transporter.clone();
        let config = xtcp_config(22);
        let started = Instant::now();
        let work = tokio::spawn(async move {
            handle_work_conn(&config, Box::new(conn), start(), ctx).await
        });

        announce_visitor(&mut gateway, &mut rx).await;
        assert_eq!(transporter.pending(), 1);

        let result = work.await.unwrap();
        assert!(matches!(result, Err(ControlError::Timeout(_))));
        assert!(started.elapsed() >= NAT_HOLE_TIMEOUT);
        assert_eq!(transporter.pending(), 0);
    }

    #[tokio::test]
    async fn test_xtcp_rejects_unexpected_first_message() {
        let config = ProxyConfig {
            kind: ProxyKind::Xtcp {
                secret_key: "abc".to_string(),
            },
            ..ProxyConfig::tcp("p2p", 22, 0)
        };
        let (conn, mut gateway) = duplex(1024);
        let (ctx, _rx) = context();

        write_message(&mut gateway, &Message::ReqWorkConn)
            .await
            .unwrap();
        let result = handle_work_conn(&config, Box::new(conn), start(), ctx).await;
        assert!(matches!(result, Err(ControlError::ProtocolError(_))));
    }
}
