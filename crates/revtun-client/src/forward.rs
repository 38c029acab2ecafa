//! Byte forwarding between a tunnel stream and a local socket

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy data in both directions until either side closes or `cancel` fires
///
/// Returns (bytes a→b, bytes b→a); a cancelled splice reports zeros.
pub(crate) async fn splice<A, B>(a: &mut A, b: &mut B, cancel: &CancellationToken) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Forwarding cancelled");
            (0, 0)
        }
        result = tokio::io::copy_bidirectional(a, b) => match result {
            Ok(counts) => counts,
            Err(e) => {
                debug!("Forwarding ended: {}", e);
                (0, 0)
            }
        }
    }
}
