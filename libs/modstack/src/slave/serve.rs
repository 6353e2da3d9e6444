//! Request loop shared by stream listeners

use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::RequestHandler;
use crate::error::ModbusError;
use crate::transport::{FrameKind, ModbusTransport};

/// How read failures affect the request loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinePolicy {
    /// Accepted TCP connection: a failed read ends the connection, except a
    /// damaged headless frame which the transport has already resynchronised
    Connection,
    /// Serial line: only a dead port ends the loop
    Line,
}

impl LinePolicy {
    fn survives(self, error: &ModbusError, headless: bool) -> bool {
        match (self, error) {
            (LinePolicy::Line, ModbusError::Protocol { .. } | ModbusError::Timeout { .. }) => true,
            (LinePolicy::Connection, ModbusError::Protocol { .. }) => headless,
            _ => false,
        }
    }
}

/// Read requests from `transport` and answer them until the peer goes away
/// or `cancel` fires, then close the transport
pub(crate) async fn serve_transport<T: ModbusTransport>(
    mut transport: T,
    handler: &RequestHandler,
    cancel: &CancellationToken,
    policy: LinePolicy,
) {
    let headless = transport.is_headless();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = transport.read_frame(FrameKind::Request) => frame,
        };

        match frame {
            Ok(frame) => {
                let Some(reply) = handler.handle(&frame) else {
                    continue;
                };
                if let Err(e) = transport.write_frame(&reply).await {
                    warn!("Failed to send response: {}", e);
                    break;
                }
            },
            Err(e) if policy.survives(&e, headless) => {
                debug!("Discarding unreadable request: {}", e);
            },
            Err(ModbusError::EndOfStream { .. }) => {
                debug!("Peer closed the connection");
                break;
            },
            Err(e) => {
                warn!("Closing connection after read failure: {}", e);
                break;
            },
        }
    }

    if let Err(e) = transport.close().await {
        debug!("Error closing transport: {}", e);
    }
}

/// Wait up to `grace` for `workers` to finish, then abort the rest
pub(crate) async fn drain_workers(workers: &mut JoinSet<()>, grace: Duration) {
    if workers.is_empty() {
        return;
    }
    let drained = timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} worker(s) still running after {:?}, aborting",
            workers.len(),
            grace
        );
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    } else {
        info!("All workers finished");
    }
}
