//! Transport over any byte stream
//!
//! Used for TCP (MBAP or RTU-over-TCP), serial lines and in-memory pipes.
//! Serial lines additionally get RTU timing: a silent gap before every
//! transmitted message, optional echo suppression and resynchronisation
//! after a damaged frame.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::framing::{decode_headless, decode_mbap_header, encode_headless, encode_mbap};
use super::{FrameKind, ModbusTransport};
use crate::constants::{DEFAULT_TIMEOUT, MAX_MESSAGE_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::message::Frame;
use crate::pdu::FrameLen;

/// Bits per character on an RTU line: start + 8 data + parity/stop + stop
const BITS_PER_CHAR: u64 = 11;

/// Silence that ends a frame of unknown length on a non-serial headless stream
const HEADLESS_QUIET: Duration = Duration::from_millis(20);

/// Wire framing of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// MBAP header (Modbus TCP)
    Mbap,
    /// Unit ID + PDU, with a trailing CRC16 when `crc` is set
    Headless { crc: bool },
}

/// RTU line timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialTiming {
    /// Duration of one character on the line
    pub char_time: Duration,
    /// Silence that separates two messages
    pub message_gap: Duration,
    /// Discard the local echo of every transmitted frame
    pub echo: bool,
}

impl SerialTiming {
    /// Timing derived from the baud rate: the inter-character gap is 1.5
    /// character times and the message gap 4 character times, unless
    /// `transmit_delay` overrides the message gap.
    pub fn from_baud(baud_rate: u32, transmit_delay: Option<Duration>, echo: bool) -> Self {
        let char_time = Duration::from_micros(BITS_PER_CHAR * 1_000_000 / u64::from(baud_rate.max(1)));
        Self {
            char_time,
            message_gap: transmit_delay.unwrap_or(char_time * 4),
            echo,
        }
    }

    /// Maximum silence allowed between two characters of one frame
    pub fn char_gap(&self) -> Duration {
        self.char_time * 3 / 2
    }
}

/// Modbus transport over an `AsyncRead + AsyncWrite` stream
pub struct StreamTransport<S> {
    stream: S,
    framing: Framing,
    timeout: Duration,
    timing: Option<SerialTiming>,
    /// Peer description for frame logging
    label: String,
    last_activity: Option<Instant>,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, framing: Framing, label: impl Into<String>) -> Self {
        Self {
            stream,
            framing,
            timeout: DEFAULT_TIMEOUT,
            timing: None,
            label: label.into(),
            last_activity: None,
        }
    }

    /// MBAP framing (Modbus TCP)
    pub fn mbap(stream: S, label: impl Into<String>) -> Self {
        Self::new(stream, Framing::Mbap, label)
    }

    /// Headless framing with CRC (serial RTU, RTU-over-TCP)
    pub fn rtu(stream: S, label: impl Into<String>) -> Self {
        Self::new(stream, Framing::Headless { crc: true }, label)
    }

    pub fn with_timing(mut self, timing: SerialTiming) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn quiet_period(&self) -> Duration {
        self.timing
            .map(|timing| timing.message_gap.max(timing.char_gap()))
            .unwrap_or(HEADLESS_QUIET)
    }

    /// Read the first byte of a frame; returns the deadline for the rest
    async fn read_first(&mut self, kind: FrameKind, buf: &mut BytesMut) -> ModbusResult<Instant> {
        let mut first = [0u8; 1];
        let deadline = match kind {
            FrameKind::Request => {
                self.stream.read_exact(&mut first).await?;
                Instant::now() + self.timeout
            },
            FrameKind::Response => {
                let deadline = Instant::now() + self.timeout;
                self.read_exact_until(&mut first, deadline).await?;
                deadline
            },
        };
        buf.extend_from_slice(&first);
        Ok(deadline)
    }

    async fn read_exact_until(&mut self, buf: &mut [u8], deadline: Instant) -> ModbusResult<()> {
        match timeout_at(deadline, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ModbusError::timeout(format!(
                "no complete frame from {} within {:?}",
                self.label, self.timeout
            ))),
        }
    }

    /// Append exactly `n` more bytes to `buf`
    async fn read_more(&mut self, buf: &mut BytesMut, n: usize, deadline: Instant) -> ModbusResult<()> {
        if buf.len() + n > MAX_MESSAGE_LENGTH + MBAP_HEADER_LEN {
            self.drain().await;
            return Err(ModbusError::protocol(format!(
                "frame from {} exceeds {} bytes",
                self.label, MAX_MESSAGE_LENGTH
            )));
        }
        let start = buf.len();
        buf.resize(start + n, 0);
        self.read_exact_until(&mut buf[start..], deadline).await
    }

    /// Append bytes until the line has been quiet for one quiet period
    async fn read_until_quiet(&mut self, buf: &mut BytesMut, deadline: Instant) -> ModbusResult<()> {
        let quiet = self.quiet_period();
        let mut chunk = [0u8; 64];
        loop {
            let wait = quiet.min(deadline.saturating_duration_since(Instant::now()));
            match timeout(wait, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ModbusError::end_of_stream(format!("{} closed", self.label))),
                Ok(Ok(n)) => {
                    if buf.len() + n > MAX_MESSAGE_LENGTH {
                        self.drain().await;
                        return Err(ModbusError::protocol(format!(
                            "frame from {} exceeds {} bytes",
                            self.label, MAX_MESSAGE_LENGTH
                        )));
                    }
                    buf.extend_from_slice(&chunk[..n]);
                },
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(()),
            }
        }
    }

    /// Discard input until the line has been silent for one quiet period
    async fn drain(&mut self) {
        let quiet = self.quiet_period();
        let mut chunk = [0u8; 64];
        let mut discarded = 0usize;
        while let Ok(Ok(n)) = timeout(quiet, self.stream.read(&mut chunk)).await {
            if n == 0 {
                break;
            }
            discarded += n;
        }
        if discarded > 0 {
            debug!("Discarded {} bytes from {} to resynchronise", discarded, self.label);
        }
    }

    async fn read_mbap(&mut self, kind: FrameKind) -> ModbusResult<Frame> {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 1);
        let deadline = self.read_first(kind, &mut buf).await?;
        self.read_more(&mut buf, MBAP_HEADER_LEN, deadline).await?;
        // The rest of a frame with a bad header cannot be located, so the
        // stream is no longer aligned and must be reopened
        let (header, pdu_len) = decode_mbap_header(&buf).map_err(|e| {
            ModbusError::io(format!("{} on {}, stream out of sync", e, self.label))
        })?;
        self.read_more(&mut buf, pdu_len, deadline).await?;
        debug!("RX [{}]: {}", self.label, hex::encode(&buf));

        let pdu = buf.split_off(MBAP_HEADER_LEN + 1).freeze();
        Ok(Frame::new(header, pdu))
    }

    async fn read_headless(&mut self, kind: FrameKind, crc: bool) -> ModbusResult<Frame> {
        let mut buf = BytesMut::with_capacity(MAX_MESSAGE_LENGTH);
        let deadline = self.read_first(kind, &mut buf).await?;
        self.read_more(&mut buf, 1, deadline).await?;
        let function_code = buf[1];

        let shape = match kind {
            FrameKind::Request => FrameLen::request(function_code),
            FrameKind::Response => FrameLen::response(function_code),
        };
        match shape {
            Some(FrameLen::Fixed(n)) => self.read_more(&mut buf, n, deadline).await?,
            Some(FrameLen::Prefixed { offset, width }) => {
                self.read_more(&mut buf, offset + width, deadline).await?;
                let count = buf[2 + offset..2 + offset + width]
                    .iter()
                    .fold(0usize, |acc, b| (acc << 8) | *b as usize);
                self.read_more(&mut buf, count, deadline).await?;
            },
            None => {
                // Length unknown: take everything up to the next silence (CRC included)
                self.read_until_quiet(&mut buf, deadline).await?;
                if kind == FrameKind::Response {
                    debug!("RX [{}]: {}", self.label, hex::encode(&buf));
                    return Err(ModbusError::protocol(format!(
                        "unknown response function code 0x{:02X}",
                        function_code
                    )));
                }
            },
        }
        if crc && shape.is_some() {
            self.read_more(&mut buf, 2, deadline).await?;
        }
        debug!("RX [{}]: {}", self.label, hex::encode(&buf));

        match decode_headless(&buf, crc) {
            Ok(frame) => Ok(frame),
            Err(e) => {
                if self.timing.is_some() {
                    self.drain().await;
                }
                Err(e)
            },
        }
    }

    /// Wait out the message gap since the last frame on a serial line
    async fn wait_message_gap(&mut self) {
        if let (Some(timing), Some(last)) = (self.timing, self.last_activity) {
            let ready = last + timing.message_gap;
            if ready > Instant::now() {
                tokio::time::sleep_until(ready).await;
            }
        }
    }

    /// Read back and discard the echo of `sent`
    async fn suppress_echo(&mut self, sent: &[u8]) -> ModbusResult<()> {
        let mut echo = vec![0u8; sent.len()];
        let deadline = Instant::now() + self.timeout;
        self.read_exact_until(&mut echo, deadline).await?;
        if echo != sent {
            warn!(
                "Echo from {} differs from transmitted frame: {}",
                self.label,
                hex::encode(&echo)
            );
        }
        Ok(())
    }
}

#[async_trait]
impl<S> ModbusTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self, kind: FrameKind) -> ModbusResult<Frame> {
        let result = match self.framing {
            Framing::Mbap => self.read_mbap(kind).await,
            Framing::Headless { crc } => self.read_headless(kind, crc).await,
        };
        self.last_activity = Some(Instant::now());
        result
    }

    async fn write_frame(&mut self, frame: &Frame) -> ModbusResult<()> {
        let bytes = match self.framing {
            Framing::Mbap => encode_mbap(frame),
            Framing::Headless { crc } => encode_headless(frame, crc),
        };

        self.wait_message_gap().await;
        debug!("TX [{}]: {}", self.label, hex::encode(&bytes));
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        if self.timing.is_some_and(|timing| timing.echo) {
            self.suppress_echo(&bytes).await?;
        }
        self.last_activity = Some(Instant::now());
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn is_headless(&self) -> bool {
        matches!(self.framing, Framing::Headless { .. })
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
