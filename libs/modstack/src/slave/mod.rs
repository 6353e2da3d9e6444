//! Modbus slave (server)
//!
//! A [`ModbusSlave`] owns a table of process images keyed by unit ID and one
//! listener on its configured medium. Requests are answered from whichever
//! image the unit ID resolves to; handlers never hold an image lock across
//! an `.await`, so observers run on the task that served the request.
//!
//! ```text
//! Stopped -> Starting -> Listening -> Stopping -> Stopped
//! ```

mod handler;
mod registry;
mod serve;
mod tcp;
mod udp;

#[cfg(feature = "serial")]
mod serial;

pub use handler::{apply, respond, ListenerStats, ProcessImageTable, StatsSnapshot, WILDCARD_UNIT};
pub use registry::SlaveRegistry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{SerialParameters, SlaveConfig, TransportKind};
use crate::error::ModbusResult;
use crate::image::ProcessImage;
use handler::RequestHandler;

/// Lifecycle of a slave's listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Stopped => write!(f, "stopped"),
            ListenerState::Starting => write!(f, "starting"),
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Stopping => write!(f, "stopping"),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ModbusSlave {
    config: SlaveConfig,
    images: Arc<ProcessImageTable>,
    stats: Arc<ListenerStats>,
    state: Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl ModbusSlave {
    /// Create a stopped slave; the configuration is validated here
    pub fn new(config: SlaveConfig) -> ModbusResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            images: Arc::new(ProcessImageTable::new()),
            stats: Arc::new(ListenerStats::default()),
            state: Mutex::new(ListenerState::Stopped),
            local_addr: Mutex::new(None),
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn tcp(port: u16) -> ModbusResult<Self> {
        Self::new(SlaveConfig::tcp(port))
    }

    pub fn udp(port: u16) -> ModbusResult<Self> {
        Self::new(SlaveConfig::udp(port))
    }

    pub fn serial(parameters: SerialParameters) -> ModbusResult<Self> {
        Self::new(SlaveConfig::serial(parameters))
    }

    pub fn config(&self) -> &SlaveConfig {
        &self.config
    }

    pub fn transport(&self) -> TransportKind {
        self.config.transport
    }

    pub fn images(&self) -> &Arc<ProcessImageTable> {
        &self.images
    }

    /// Serve `image` under its unit ID; returns the image it replaces
    pub fn add_process_image(&self, image: Arc<ProcessImage>) -> Option<Arc<ProcessImage>> {
        self.images.add(image)
    }

    pub fn remove_process_image(&self, unit_id: u8) -> Option<Arc<ProcessImage>> {
        self.images.remove(unit_id)
    }

    pub fn process_image(&self, unit_id: u8) -> Option<Arc<ProcessImage>> {
        self.images.get(unit_id)
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    /// Bound address of a running TCP/UDP listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock() = state;
    }

    /// Bind the medium and start serving; a no-op if already listening
    pub async fn start(&self) -> ModbusResult<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        self.set_state(ListenerState::Starting);
        let cancel = CancellationToken::new();
        match self.spawn_listener(cancel.clone()).await {
            Ok(task) => {
                *running = Some(Running { cancel, task });
                self.set_state(ListenerState::Listening);
                match self.local_addr() {
                    Some(addr) => info!("Modbus {} slave listening on {}", self.transport(), addr),
                    None => info!(
                        "Modbus {} slave listening on {}",
                        self.transport(),
                        self.config.port_key()
                    ),
                }
                Ok(())
            },
            Err(e) => {
                self.set_state(ListenerState::Stopped);
                error!("Failed to start Modbus {} slave: {}", self.transport(), e);
                Err(e)
            },
        }
    }

    async fn spawn_listener(&self, cancel: CancellationToken) -> ModbusResult<JoinHandle<()>> {
        let shared_medium = self.config.transport != TransportKind::Serial;
        let handler = RequestHandler::new(self.images.clone(), self.stats.clone(), shared_medium);

        match self.config.transport {
            TransportKind::Tcp => {
                let listener = tcp::bind(&self.config).await?;
                *self.local_addr.lock() = Some(listener.local_addr()?);
                Ok(tcp::spawn(listener, handler, &self.config, cancel))
            },
            TransportKind::Udp => {
                let socket = udp::bind(&self.config).await?;
                *self.local_addr.lock() = Some(socket.local_addr()?);
                Ok(udp::spawn(socket, handler, &self.config, cancel))
            },
            #[cfg(feature = "serial")]
            TransportKind::Serial => {
                let transport = serial::open(&self.config)?;
                Ok(serial::spawn(transport, handler, cancel))
            },
            #[cfg(not(feature = "serial"))]
            TransportKind::Serial => Err(crate::error::ModbusError::config(
                "serial support is not compiled in",
            )),
        }
    }

    /// Stop listening and wait for open connections to drain
    ///
    /// Connections still busy after the drain timeout are aborted.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { cancel, task }) = running.take() else {
            return;
        };

        self.set_state(ListenerState::Stopping);
        cancel.cancel();
        if let Err(e) = task.await {
            if e.is_panic() {
                error!("Modbus {} listener panicked: {}", self.transport(), e);
            }
        }
        *self.local_addr.lock() = None;
        self.set_state(ListenerState::Stopped);
        info!("Modbus {} slave on {} stopped", self.transport(), self.config.port_key());
    }
}

impl Drop for ModbusSlave {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut() {
            running.cancel.cancel();
        }
    }
}

impl fmt::Debug for ModbusSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusSlave")
            .field("transport", &self.config.transport)
            .field("port", &self.config.port_key())
            .field("state", &self.state())
            .field("units", &self.images.units())
            .finish()
    }
}
