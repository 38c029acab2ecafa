//! Server-relayed visitor tunnels

use super::VisitorContext;
use crate::auth::{sign_key, unix_timestamp};
use crate::config::VisitorConfig;
use crate::connection::BoxedStream;
use crate::ControlError;
use revtun_proto::{read_message, write_message, Message};
use tokio::time::timeout;
use tracing::debug;

/// Dial the gateway and ask it to bridge us to the named proxy
pub(crate) async fn open_tunnel(
    config: &VisitorConfig,
    ctx: &VisitorContext,
) -> Result<BoxedStream, ControlError> {
    let mut conn = ctx.connector.connect().await?;

    let timestamp = unix_timestamp();
    let request = Message::NewVisitorConn {
        run_id: ctx.run_id.clone(),
        proxy_name: config.server_name.clone(),
        sign_key: sign_key(&config.secret_key, timestamp),
        timestamp,
        use_encryption: config.use_encryption,
        use_compression: config.use_compression,
    };
    write_message(&mut conn, &request).await?;

    let response = timeout(ctx.work_conn_timeout, read_message(&mut conn))
        .await
        .map_err(|_| ControlError::Timeout("waiting for NewVisitorConnResp".into()))??;

    match response {
        Message::NewVisitorConnResp { error, .. } if !error.is_empty() => Err(
            ControlError::AuthenticationFailed(format!("visitor [{}]: {}", config.name, error)),
        ),
        Message::NewVisitorConnResp { .. } => {
            debug!(visitor = %config.name, server = %config.server_name, "stcp tunnel open");
            Ok(conn)
        }
        other => Err(ControlError::ProtocolError(format!(
            "expected NewVisitorConnResp, got {}",
            other.kind()
        ))),
    }
}
