//! Master-side connections
//!
//! A connection owns one medium and the transport bound to it. TCP and UDP
//! connections belong to the master that created them; serial ports are
//! shared per port name through a [`PortRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::constants::{DEFAULT_PORT, DEFAULT_TIMEOUT};
use crate::error::{ModbusError, ModbusResult};
use crate::message::{ModbusRequest, ModbusResponse};
use crate::transport::{ModbusTransport, StreamTransport, UdpTransport};

#[cfg(feature = "serial")]
use crate::config::SerialParameters;
#[cfg(feature = "serial")]
use crate::transport::{open_serial, SerialTransport};

/// Parsed connection target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `device:<portName>`
    Device(String),
    /// `tcp:<host>[:<port>]`
    Tcp { host: String, port: u16 },
    /// `udp:<host>[:<port>]`
    Udp { host: String, port: u16 },
}

impl Target {
    /// Parse `device:<portName>`, `tcp:<host>[:<port>]` or `udp:<host>[:<port>]`
    pub fn parse(address: &str) -> ModbusResult<Self> {
        let (scheme, rest) = address
            .split_once(':')
            .ok_or_else(|| ModbusError::config(format!("invalid connection target: {}", address)))?;
        if rest.is_empty() {
            return Err(ModbusError::config(format!(
                "connection target {} has no host or port name",
                address
            )));
        }
        match scheme {
            "device" => Ok(Target::Device(rest.to_string())),
            "tcp" => {
                let (host, port) = split_host_port(rest)?;
                Ok(Target::Tcp { host, port })
            },
            "udp" => {
                let (host, port) = split_host_port(rest)?;
                Ok(Target::Udp { host, port })
            },
            other => Err(ModbusError::config(format!(
                "unknown connection scheme '{}' in {}",
                other, address
            ))),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(name) => write!(f, "device:{}", name),
            Target::Tcp { host, port } => write!(f, "tcp:{}", host_port(host, *port)),
            Target::Udp { host, port } => write!(f, "udp:{}", host_port(host, *port)),
        }
    }
}

fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn split_host_port(value: &str) -> ModbusResult<(String, u16)> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| ModbusError::config(format!("invalid port '{}'", port)))
    };

    // [v6-address]:port
    if let Some(bracketed) = value.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| ModbusError::config(format!("unterminated '[' in {}", value)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(ModbusError::config(format!("invalid address {}", value))),
        };
        return Ok((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        // Bare IPv6 address without port
        Some((host, _)) if host.contains(':') => Ok((value.to_string(), DEFAULT_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((value.to_string(), DEFAULT_PORT)),
    }
}

async fn resolve(host: &str, port: u16) -> ModbusResult<SocketAddr> {
    lookup_host((host, port))
        .await
        .map_err(|e| ModbusError::config(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .ok_or_else(|| ModbusError::config(format!("no address for {}", host)))
}

/// Set the timeout, write the request and read its response
async fn exchange_on(
    transport: &mut dyn ModbusTransport,
    timeout: Duration,
    request: &ModbusRequest,
) -> ModbusResult<ModbusResponse> {
    transport.set_timeout(timeout);
    transport.write_request(request).await?;
    transport.read_response().await
}

/// A master-side connection to one slave (or one serial bus)
#[async_trait]
pub trait MasterConnection: Send {
    /// Open the medium; a no-op when already connected
    async fn connect(&mut self) -> ModbusResult<()>;

    /// Release the medium
    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Headless framings carry no transaction ID to check
    fn is_headless(&self) -> bool;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// Write `request` and read one response frame
    async fn exchange(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse>;

    /// Target description for logs
    fn describe(&self) -> String;
}

/// TCP connection, MBAP or RTU-over-TCP framing
pub struct TcpConnection {
    host: String,
    port: u16,
    rtu_over_tcp: bool,
    timeout: Duration,
    transport: Option<StreamTransport<TcpStream>>,
}

impl TcpConnection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            rtu_over_tcp: false,
            timeout: DEFAULT_TIMEOUT,
            transport: None,
        }
    }

    /// Use headless framing with CRC instead of MBAP
    pub fn rtu_over_tcp(mut self, enabled: bool) -> Self {
        self.rtu_over_tcp = enabled;
        self
    }
}

#[async_trait]
impl MasterConnection for TcpConnection {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let addr = resolve(&self.host, self.port).await?;
        debug!("TCP connecting: {}", addr);

        let stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ModbusError::timeout(format!("connection to {} timed out", addr)))??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }

        let label = addr.to_string();
        let mut transport = if self.rtu_over_tcp {
            StreamTransport::rtu(stream, label)
        } else {
            StreamTransport::mbap(stream, label)
        };
        transport.set_timeout(self.timeout);
        self.transport = Some(transport);
        info!("TCP connected: {}", addr);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("TCP close {}: {}", self.describe(), e);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn is_headless(&self) -> bool {
        self.rtu_over_tcp
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn exchange(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let timeout = self.timeout;
        let transport = self.transport.as_mut().ok_or(ModbusError::NotConnected)?;
        exchange_on(transport, timeout, request).await
    }

    fn describe(&self) -> String {
        format!("tcp:{}", host_port(&self.host, self.port))
    }
}

/// UDP connection, one MBAP frame per datagram
pub struct UdpConnection {
    host: String,
    port: u16,
    timeout: Duration,
    transport: Option<UdpTransport>,
}

impl UdpConnection {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            transport: None,
        }
    }
}

#[async_trait]
impl MasterConnection for UdpConnection {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        let addr = resolve(&self.host, self.port).await?;
        let mut transport = UdpTransport::connect(addr).await?;
        transport.set_timeout(self.timeout);
        self.transport = Some(transport);
        debug!("UDP socket connected to {}", addr);
        Ok(())
    }

    async fn close(&mut self) {
        self.transport = None;
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn is_headless(&self) -> bool {
        false
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn exchange(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let timeout = self.timeout;
        let transport = self.transport.as_mut().ok_or(ModbusError::NotConnected)?;
        exchange_on(transport, timeout, request).await
    }

    fn describe(&self) -> String {
        format!("udp:{}", host_port(&self.host, self.port))
    }
}

/// Process-wide registry of open ports, keyed by name
///
/// Entries are weak: a port stays open while at least one connection holds
/// it and is closed when the last holder drops it.
pub struct PortRegistry<T> {
    ports: Mutex<HashMap<String, Weak<tokio::sync::Mutex<T>>>>,
}

impl<T> Default for PortRegistry<T> {
    fn default() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PortRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to port `name`, opening it with `open` if nobody holds it
    pub fn get_or_open<F>(&self, name: &str, open: F) -> ModbusResult<Arc<tokio::sync::Mutex<T>>>
    where
        F: FnOnce() -> ModbusResult<T>,
    {
        let mut ports = self.ports.lock();
        ports.retain(|_, port| port.strong_count() > 0);
        if let Some(port) = ports.get(name).and_then(Weak::upgrade) {
            debug!("Sharing open port {}", name);
            return Ok(port);
        }
        let port = Arc::new(tokio::sync::Mutex::new(open()?));
        ports.insert(name.to_string(), Arc::downgrade(&port));
        Ok(port)
    }

    /// Forget `port` so the next [`get_or_open`](Self::get_or_open) opens the
    /// device again; holders of the old handle keep it until they drop it
    pub fn evict(&self, name: &str, port: &Arc<tokio::sync::Mutex<T>>) -> bool {
        let mut ports = self.ports.lock();
        let registered = ports
            .get(name)
            .is_some_and(|entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(port)));
        if registered {
            ports.remove(name);
        }
        registered
    }

    /// Number of ports currently held open
    pub fn open_count(&self) -> usize {
        self.ports
            .lock()
            .values()
            .filter(|port| port.strong_count() > 0)
            .count()
    }
}

#[cfg(feature = "serial")]
pub type SerialPortRegistry = PortRegistry<SerialTransport>;

#[cfg(feature = "serial")]
impl SerialPortRegistry {
    /// Registry shared by every serial connection in the process
    pub fn global() -> &'static SerialPortRegistry {
        static REGISTRY: std::sync::OnceLock<SerialPortRegistry> = std::sync::OnceLock::new();
        REGISTRY.get_or_init(SerialPortRegistry::new)
    }
}

/// Serial RTU connection on a port shared through [`SerialPortRegistry`]
#[cfg(feature = "serial")]
pub struct SerialConnection {
    parameters: SerialParameters,
    timeout: Duration,
    registry: &'static SerialPortRegistry,
    port: Option<Arc<tokio::sync::Mutex<SerialTransport>>>,
}

#[cfg(feature = "serial")]
impl SerialConnection {
    pub fn new(parameters: SerialParameters) -> Self {
        Self {
            parameters,
            timeout: DEFAULT_TIMEOUT,
            registry: SerialPortRegistry::global(),
            port: None,
        }
    }

    pub fn parameters(&self) -> &SerialParameters {
        &self.parameters
    }
}

#[cfg(feature = "serial")]
#[async_trait]
impl MasterConnection for SerialConnection {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let parameters = &self.parameters;
        let timeout = self.timeout;
        let port = self
            .registry
            .get_or_open(&parameters.port_name, || open_serial(parameters, timeout))?;
        self.port = Some(port);
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping the last handle closes the device
        self.port = None;
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn is_headless(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn exchange(&mut self, request: &ModbusRequest) -> ModbusResult<ModbusResponse> {
        let port = self.port.as_ref().ok_or(ModbusError::NotConnected)?;
        let mut transport = port.lock().await;
        let result = exchange_on(&mut *transport, self.timeout, request).await;
        drop(transport);
        if let Err(e) = &result {
            tracing::warn!("Serial exchange on {} failed: {}", self.parameters.port_name, e);
            // A silent slave leaves the port usable; a failed device does not
            if matches!(e, ModbusError::Io { .. } | ModbusError::EndOfStream { .. })
                && self.registry.evict(&self.parameters.port_name, port)
            {
                info!("Serial port {} evicted, reopening on next connect", self.parameters.port_name);
            }
        }
        result
    }

    fn describe(&self) -> String {
        format!("device:{}", self.parameters.port_name)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::pdu::RequestPdu;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            Target::parse("tcp:192.168.1.10").unwrap(),
            Target::Tcp {
                host: "192.168.1.10".to_string(),
                port: 502
            }
        );
        assert_eq!(
            Target::parse("udp:plc.local:1502").unwrap(),
            Target::Udp {
                host: "plc.local".to_string(),
                port: 1502
            }
        );
        assert_eq!(
            Target::parse("device:/dev/ttyUSB0").unwrap(),
            Target::Device("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            Target::parse("tcp:[::1]:5020").unwrap(),
            Target::Tcp {
                host: "::1".to_string(),
                port: 5020
            }
        );
        assert_eq!(
            Target::parse("tcp:fe80::1").unwrap(),
            Target::Tcp {
                host: "fe80::1".to_string(),
                port: 502
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        for bad in ["", "tcp", "tcp:", "ftp:host", "tcp:host:port", "udp:host:70000", "tcp:[::1"] {
            assert!(
                matches!(Target::parse(bad), Err(ModbusError::Config { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_target_display_roundtrip() {
        for text in ["tcp:10.0.0.1:502", "udp:[::1]:1502", "device:COM3"] {
            assert_eq!(Target::parse(text).unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_port_registry_shares_and_releases() {
        let registry: PortRegistry<u32> = PortRegistry::new();
        let mut opened = 0;

        let first = registry
            .get_or_open("/dev/ttyS0", || {
                opened += 1;
                Ok(7)
            })
            .unwrap();
        let second = registry.get_or_open("/dev/ttyS0", || Ok(8)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opened, 1);
        assert_eq!(registry.open_count(), 1);

        drop(first);
        drop(second);
        assert_eq!(registry.open_count(), 0);
        let reopened = registry.get_or_open("/dev/ttyS0", || Ok(9)).unwrap();
        assert_eq!(*reopened.try_lock().unwrap(), 9);
    }

    #[test]
    fn test_port_registry_evict_forces_reopen() {
        let registry: PortRegistry<u32> = PortRegistry::new();
        let broken = registry.get_or_open("/dev/ttyS1", || Ok(1)).unwrap();
        let other_master = Arc::clone(&broken);

        assert!(registry.evict("/dev/ttyS1", &broken));
        let reopened = registry.get_or_open("/dev/ttyS1", || Ok(2)).unwrap();
        assert!(!Arc::ptr_eq(&reopened, &other_master));
        assert_eq!(*reopened.try_lock().unwrap(), 2);

        // A stale handle cannot evict the fresh port
        assert!(!registry.evict("/dev/ttyS1", &other_master));
        let shared = registry.get_or_open("/dev/ttyS1", || Ok(3)).unwrap();
        assert!(Arc::ptr_eq(&shared, &reopened));
    }

    #[test]
    fn test_port_registry_open_failure_is_not_cached() {
        let registry: PortRegistry<u32> = PortRegistry::new();
        assert!(registry
            .get_or_open("COM9", || Err(ModbusError::config("busy")))
            .is_err());
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn test_exchange_requires_connection() {
        let mut connection = TcpConnection::new("127.0.0.1", 1);
        let request = ModbusRequest::new(
            1,
            RequestPdu::ReadHoldingRegisters {
                reference: 0,
                count: 1,
            },
        );
        assert!(matches!(
            connection.exchange(&request).await.unwrap_err(),
            ModbusError::NotConnected
        ));
        assert!(!connection.is_connected());
        assert_eq!(connection.describe(), "tcp:127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_exchange_applies_connection_timeout() {
        let (stream, _peer) = tokio::io::duplex(256);
        let mut transport = StreamTransport::mbap(stream, "duplex");
        transport.set_timeout(Duration::from_secs(30));
        let request = ModbusRequest::new(
            1,
            RequestPdu::ReadHoldingRegisters {
                reference: 0,
                count: 1,
            },
        );

        let started = tokio::time::Instant::now();
        let err = exchange_on(&mut transport, Duration::from_millis(20), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(transport.timeout(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_config_error() {
        let mut connection = TcpConnection::new("host.invalid", 502);
        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, ModbusError::Config { .. }));
    }
}
