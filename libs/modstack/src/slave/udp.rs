//! UDP listener
//!
//! Network I/O is decoupled from request processing: a receiver task queues
//! decoded requests and remembers each sender by transaction ID, a processor
//! task answers them and a sender task routes every response back to the
//! remembered peer. The request queue is bounded; datagrams that arrive
//! while it is full are dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::RequestHandler;
use super::serve::drain_workers;
use crate::config::SlaveConfig;
use crate::constants::{MAX_FRAME_SIZE, UDP_QUEUE_CAPACITY};
use crate::error::{ModbusError, ModbusResult};
use crate::message::Frame;
use crate::transport::{decode_mbap, encode_mbap};

/// Senders of requests that have not been answered yet
type Pending = Arc<Mutex<HashMap<u16, SocketAddr>>>;

pub(crate) async fn bind(config: &SlaveConfig) -> ModbusResult<UdpSocket> {
    let target = config.bind_target();
    let addr = lookup_host(&target)
        .await
        .map_err(|e| ModbusError::config(format!("cannot resolve {}: {}", target, e)))?
        .next()
        .ok_or_else(|| ModbusError::config(format!("no address for {}", target)))?;
    Ok(UdpSocket::bind(addr).await?)
}

pub(crate) fn spawn(
    socket: UdpSocket,
    handler: RequestHandler,
    config: &SlaveConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let socket = Arc::new(socket);
    let pending: Pending = Arc::default();
    let (request_tx, request_rx) = mpsc::channel(UDP_QUEUE_CAPACITY);
    let (response_tx, response_rx) = mpsc::channel(UDP_QUEUE_CAPACITY);
    let drain_timeout = config.drain_timeout();

    let mut tasks = JoinSet::new();
    tasks.spawn(receive(socket.clone(), pending.clone(), request_tx, cancel.clone()));
    tasks.spawn(process(handler, pending.clone(), request_rx, response_tx));
    tasks.spawn(send(socket, pending, response_rx));

    tokio::spawn(async move {
        cancel.cancelled().await;
        drain_workers(&mut tasks, drain_timeout).await;
        info!("UDP listener stopped");
    })
}

async fn receive(
    socket: Arc<UdpSocket>,
    pending: Pending,
    requests: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; MAX_FRAME_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable from an earlier reply surfaces here on some platforms
                    debug!("UDP receive failed: {}", e);
                    continue;
                },
            },
        };
        debug!("RX [udp {}]: {}", peer, hex::encode(&buf[..len]));

        let frame = match decode_mbap(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", peer, e);
                continue;
            },
        };

        let transaction_id = frame.header.transaction_id;
        if let Some(previous) = pending.lock().insert(transaction_id, peer) {
            if previous != peer {
                warn!(
                    "Transaction {} from {} replaces one still pending for {}",
                    transaction_id, peer, previous
                );
            }
        }

        match requests.try_send(frame) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                warn!("UDP request queue full, dropping transaction {} from {}", transaction_id, peer);
                pending.lock().remove(&transaction_id);
            },
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

async fn process(
    handler: RequestHandler,
    pending: Pending,
    mut requests: mpsc::Receiver<Frame>,
    responses: mpsc::Sender<Frame>,
) {
    while let Some(frame) = requests.recv().await {
        match handler.handle(&frame) {
            Some(reply) => {
                if responses.send(reply).await.is_err() {
                    break;
                }
            },
            None => {
                pending.lock().remove(&frame.header.transaction_id);
            },
        }
    }
}

async fn send(socket: Arc<UdpSocket>, pending: Pending, mut responses: mpsc::Receiver<Frame>) {
    while let Some(frame) = responses.recv().await {
        let transaction_id = frame.header.transaction_id;
        let Some(peer) = pending.lock().remove(&transaction_id) else {
            warn!("No sender recorded for transaction {}, response dropped", transaction_id);
            continue;
        };

        let bytes = encode_mbap(&frame);
        debug!("TX [udp {}]: {}", peer, hex::encode(&bytes));
        if let Err(e) = socket.send_to(&bytes, peer).await {
            warn!("Failed to send response to {}: {}", peer, e);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::image::{ProcessImage, Register};
    use crate::slave::handler::{ListenerStats, ProcessImageTable};
    use std::time::Duration;

    #[tokio::test]
    async fn test_responses_return_to_their_senders() {
        let images = Arc::new(ProcessImageTable::new());
        let image = ProcessImage::new(1);
        image.add_register(Arc::new(Register::new(0xBEEF)));
        images.add(Arc::new(image));
        let handler = RequestHandler::new(images, Arc::new(ListenerStats::default()), true);

        let config = SlaveConfig {
            bind_address: "127.0.0.1".to_string(),
            ..SlaveConfig::udp(0)
        };
        let socket = bind(&config).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = spawn(socket, handler, &config, cancel.clone());

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = |tid: u8| [0x00, tid, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        first.send_to(&request(1), addr).await.unwrap();
        second.send_to(&request(2), addr).await.unwrap();

        let mut buf = [0u8; 32];
        let n = tokio::time::timeout(Duration::from_secs(2), second.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0xBE, 0xEF]);
        let n = tokio::time::timeout(Duration::from_secs(2), first.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf[1], 0x01);
        assert_eq!(n, 11);

        cancel.cancel();
        task.await.unwrap();
    }
}
