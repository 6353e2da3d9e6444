//! TCP listener: MBAP or RTU-over-TCP on accepted connections

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::RequestHandler;
use super::serve::{drain_workers, serve_transport, LinePolicy};
use crate::config::SlaveConfig;
use crate::constants::DEFAULT_BACKLOG;
use crate::error::{ModbusError, ModbusResult};
use crate::transport::{ModbusTransport, StreamTransport};

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the listening socket with the configured backlog
pub(crate) async fn bind(config: &SlaveConfig) -> ModbusResult<TcpListener> {
    let target = config.bind_target();
    let addr = lookup_host(&target)
        .await
        .map_err(|e| ModbusError::config(format!("cannot resolve {}: {}", target, e)))?
        .next()
        .ok_or_else(|| ModbusError::config(format!("no address for {}", target)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(DEFAULT_BACKLOG)?)
}

/// Start the accept loop; the returned task ends after `cancel` fires and
/// the connection handlers have drained
pub(crate) fn spawn(
    listener: TcpListener,
    handler: RequestHandler,
    config: &SlaveConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let pool = Arc::new(Semaphore::new(config.pool_size));
    let rtu_over_tcp = config.rtu_over_tcp;
    let timeout = config.timeout();
    let drain_timeout = config.drain_timeout();

    tokio::spawn(async move {
        let mut workers = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection handler panicked: {}", e);
                        }
                    }
                },
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        },
                    };

                    // Bounded pool: the connection waits here for a free worker
                    let permit = tokio::select! {
                        _ = cancel.cancelled() => break,
                        permit = pool.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    handler.stats().record_accept();
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Cannot set TCP_NODELAY for {}: {}", peer, e);
                    }
                    debug!("Accepted connection from {}", peer);

                    let mut transport: StreamTransport<_> = if rtu_over_tcp {
                        StreamTransport::rtu(stream, peer.to_string())
                    } else {
                        StreamTransport::mbap(stream, peer.to_string())
                    };
                    transport.set_timeout(timeout);

                    let handler = handler.clone();
                    let cancel = cancel.clone();
                    workers.spawn(async move {
                        serve_transport(transport, &handler, &cancel, LinePolicy::Connection).await;
                        drop(permit);
                    });
                },
            }
        }

        drop(listener);
        info!("TCP listener stopped accepting, {} connection(s) open", workers.len());
        drain_workers(&mut workers, drain_timeout).await;
    })
}
