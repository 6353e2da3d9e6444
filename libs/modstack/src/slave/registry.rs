//! Running slaves keyed by medium and port

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::Mutex;
use tracing::info;

use super::ModbusSlave;
use crate::config::{SlaveConfig, TransportKind};
use crate::error::ModbusResult;

type SlaveKey = (TransportKind, String);

/// One running slave per `(transport, port)`
///
/// TCP/UDP slaves are keyed by port number, serial slaves by port name.
/// A slave bound to port 0 is registered under the port it actually got.
/// Entries live until [`close`](Self::close) or [`close_all`](Self::close_all);
/// call `close_all` on process shutdown.
#[derive(Debug, Default)]
pub struct SlaveRegistry {
    slaves: Mutex<HashMap<SlaveKey, Arc<ModbusSlave>>>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry, created on first use
    pub fn global() -> &'static SlaveRegistry {
        static REGISTRY: OnceLock<SlaveRegistry> = OnceLock::new();
        REGISTRY.get_or_init(SlaveRegistry::new)
    }

    /// Running slave for the configuration's key, started if there is none
    pub async fn get_or_start(&self, config: SlaveConfig) -> ModbusResult<Arc<ModbusSlave>> {
        let mut slaves = self.slaves.lock().await;
        let key = (config.transport, config.port_key());
        if let Some(slave) = slaves.get(&key) {
            return Ok(slave.clone());
        }

        let slave = Arc::new(ModbusSlave::new(config)?);
        slave.start().await?;
        let key = match slave.local_addr() {
            Some(addr) if slave.transport() != TransportKind::Serial => {
                (slave.transport(), addr.port().to_string())
            },
            _ => key,
        };
        slaves.insert(key, slave.clone());
        Ok(slave)
    }

    pub async fn get(&self, transport: TransportKind, port: &str) -> Option<Arc<ModbusSlave>> {
        self.slaves
            .lock()
            .await
            .get(&(transport, port.to_string()))
            .cloned()
    }

    /// Stop and forget one slave; returns whether it was registered
    pub async fn close(&self, transport: TransportKind, port: &str) -> bool {
        let removed = self
            .slaves
            .lock()
            .await
            .remove(&(transport, port.to_string()));
        match removed {
            Some(slave) => {
                slave.stop().await;
                true
            },
            None => false,
        }
    }

    /// Stop every registered slave
    pub async fn close_all(&self) {
        let slaves: Vec<_> = self.slaves.lock().await.drain().collect();
        if slaves.is_empty() {
            return;
        }
        info!("Closing {} Modbus slave(s)", slaves.len());
        for (_, slave) in slaves {
            slave.stop().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.slaves.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slaves.lock().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::slave::ListenerState;

    fn local(config: SlaveConfig) -> SlaveConfig {
        SlaveConfig {
            bind_address: "127.0.0.1".to_string(),
            ..config
        }
    }

    #[tokio::test]
    async fn test_same_key_returns_running_slave() {
        let registry = SlaveRegistry::new();
        let first = registry
            .get_or_start(local(SlaveConfig::tcp(0)))
            .await
            .unwrap();
        let port = first.local_addr().unwrap().port();

        let again = registry
            .get_or_start(local(SlaveConfig::tcp(port)))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registry.len().await, 1);

        // Same port number on another medium is a different slave
        let udp = registry
            .get_or_start(local(SlaveConfig::udp(0)))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &udp));
        assert_eq!(registry.len().await, 2);

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert_eq!(first.state(), ListenerState::Stopped);
        assert_eq!(udp.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_close_removes_entry() {
        let registry = SlaveRegistry::new();
        let slave = registry
            .get_or_start(local(SlaveConfig::udp(0)))
            .await
            .unwrap();
        let port = slave.local_addr().unwrap().port().to_string();

        assert!(registry.get(TransportKind::Udp, &port).await.is_some());
        assert!(registry.get(TransportKind::Tcp, &port).await.is_none());
        assert!(registry.close(TransportKind::Udp, &port).await);
        assert!(!registry.close(TransportKind::Udp, &port).await);
        assert!(!slave.is_listening());
    }
}
