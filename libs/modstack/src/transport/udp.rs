//! Master-side UDP transport: one MBAP frame per datagram

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::framing::{decode_mbap, encode_mbap};
use super::{FrameKind, ModbusTransport};
use crate::constants::{DEFAULT_TIMEOUT, MAX_FRAME_SIZE};
use crate::error::{ModbusError, ModbusResult};
use crate::message::Frame;

pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    timeout: Duration,
}

impl UdpTransport {
    /// Wrap a socket already connected to `peer`
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bind an ephemeral local port and connect it to `peer`
    pub async fn connect(peer: SocketAddr) -> ModbusResult<Self> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        Ok(Self::new(socket, peer))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl ModbusTransport for UdpTransport {
    async fn read_frame(&mut self, _kind: FrameKind) -> ModbusResult<Frame> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let len = timeout(self.timeout, self.socket.recv(&mut buf))
            .await
            .map_err(|_| {
                ModbusError::timeout(format!(
                    "no datagram from {} within {:?}",
                    self.peer, self.timeout
                ))
            })??;
        debug!("RX [udp {}]: {}", self.peer, hex::encode(&buf[..len]));
        decode_mbap(&buf[..len])
    }

    async fn write_frame(&mut self, frame: &Frame) -> ModbusResult<()> {
        let bytes = encode_mbap(frame);
        debug!("TX [udp {}]: {}", self.peer, hex::encode(&bytes));
        self.socket.send(&bytes).await?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_headless(&self) -> bool {
        false
    }

    async fn close(&mut self) -> ModbusResult<()> {
        Ok(())
    }
}
