//! Direct visitor tunnels negotiated through the control channel

use super::VisitorContext;
use crate::auth::{sign_key, unix_timestamp};
use crate::backoff::{Backoff, RetryConfig};
use crate::config::VisitorConfig;
use crate::ControlError;
use revtun_proto::{read_message, write_message, Message, MessageKind};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tunnel attempts per user connection when the retry policy sets no limit
const DEFAULT_ATTEMPTS: usize = 3;

/// Establish a direct tunnel, retrying with backoff until attempts run out
pub(crate) async fn open_tunnel_with_retry(
    config: &VisitorConfig,
    ctx: &VisitorContext,
    cancel: &CancellationToken,
) -> Result<TcpStream, ControlError> {
    let retry = RetryConfig {
        max_attempts: Some(ctx.retry.max_attempts.unwrap_or(DEFAULT_ATTEMPTS)),
        ..ctx.retry.clone()
    };
    let mut backoff = Backoff::new(retry, cancel.clone());

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(ControlError::SessionClosed),
            result = open_tunnel(config, ctx) => result,
        };

        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(
                    visitor = %config.name,
                    attempt = backoff.attempt() + 1,
                    "xtcp tunnel failed: {}", e
                );
                backoff.wait().await.map_err(|e| {
                    ControlError::ConnectionError(format!(
                        "visitor [{}]: xtcp tunnel to [{}] not established: {}",
                        config.name, config.server_name, e
                    ))
                })?;
            }
        }
    }
}

/// One negotiation round: NatHoleVisitor → NatHoleResp, then dial the candidates
pub(crate) async fn open_tunnel(
    config: &VisitorConfig,
    ctx: &VisitorContext,
) -> Result<TcpStream, ControlError> {
    let transaction_id = uuid::Uuid::new_v4().to_string();
    let timestamp = unix_timestamp();
    let request = Message::NatHoleVisitor {
        transaction_id: transaction_id.clone(),
        proxy_name: config.server_name.clone(),
        protocol: "tcp".to_string(),
        sign_key: sign_key(&config.secret_key, timestamp),
        timestamp,
        mapped_addrs: Vec::new(),
    };

    let (sid, candidates) = match ctx
        .transporter
        .request(request, MessageKind::NatHoleResp, ctx.work_conn_timeout)
        .await?
    {
        Message::NatHoleResp { error, .. } if !error.is_empty() => {
            return Err(ControlError::ProtocolError(format!(
                "gateway rejected NAT hole: {}",
                error
            )))
        }
        Message::NatHoleResp {
            sid,
            candidate_addrs,
            ..
        } => (sid, candidate_addrs),
        other => {
            return Err(ControlError::ProtocolError(format!(
                "expected NatHoleResp, got {}",
                other.kind()
            )))
        }
    };

    for addr in &candidates {
        let mut stream = match timeout(ctx.work_conn_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(visitor = %config.name, candidate = %addr, "Dial failed: {}", e);
                continue;
            }
            Err(_) => {
                debug!(visitor = %config.name, candidate = %addr, "Dial timed out");
                continue;
            }
        };

        match handshake(&mut stream, &transaction_id, &sid, ctx).await {
            Ok(()) => {
                debug!(visitor = %config.name, peer = %addr, "xtcp tunnel open");
                return Ok(stream);
            }
            Err(e) => debug!(visitor = %config.name, candidate = %addr, "Handshake failed: {}", e),
        }
    }

    Err(ControlError::ConnectionError(format!(
        "none of {} candidate address(es) reachable",
        candidates.len()
    )))
}

/// Prove the session id to the peer and expect it echoed back with our nonce
async fn handshake(
    stream: &mut TcpStream,
    transaction_id: &str,
    sid: &str,
    ctx: &VisitorContext,
) -> Result<(), ControlError> {
    let nonce = uuid::Uuid::new_v4().to_string();
    let hello = Message::NatHoleSid {
        transaction_id: transaction_id.to_string(),
        sid: sid.to_string(),
        response: false,
        nonce: nonce.clone(),
    };
    write_message(stream, &hello).await?;

    let reply = timeout(ctx.work_conn_timeout, read_message(stream))
        .await
        .map_err(|_| ControlError::Timeout("xtcp handshake".into()))??;

    match reply {
        Message::NatHoleSid {
            sid: peer_sid,
            response: true,
            nonce: peer_nonce,
            ..
        } if peer_sid == sid && peer_nonce == nonce => Ok(()),
        other => Err(ControlError::ProtocolError(format!(
            "unexpected handshake reply {}",
            other.kind()
        ))),
    }
}
