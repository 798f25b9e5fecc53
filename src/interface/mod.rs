//! Hardware interfaces
//!
//! An interface is the domain object for one configured gateway: it owns
//! exactly one kernel while online, exposes the decoder / input / output
//! controllers, and follows the world state. Transport settings are
//! frozen while online.

pub mod dccex;
pub mod diy;
pub mod ecos;
pub mod loconet;
pub mod marklin_can;
pub mod selectrix;
pub mod withrottle;
pub mod xpressnet;
pub mod z21;

use crate::core::{EventLoop, World};
use crate::logging::{LogEntry, Logger};
use crate::transport::serial::SerialFlowControl;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Online/offline state machine of an interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterfaceStatus {
    #[default]
    Offline,
    Initializing,
    Online,
    Error,
}

/// Transport endpoint configuration
///
/// Which variants make sense depends on the protocol; validation happens
/// in `set_online`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial {
        device: String,
        baud_rate: u32,
        #[serde(default)]
        flow_control: SerialFlowControl,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
    },
}

impl TransportConfig {
    /// Hostname validation shared by the network variants
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Serial { device, .. } if device.is_empty() => {
                Err("serial device must not be empty".into())
            }
            Self::Tcp { host, .. } | Self::Udp { host, .. } if host.is_empty() => {
                Err("host must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

/// Uniform view of a concrete interface, for listing and lifecycle
pub trait Interface: Send + Sync {
    fn id(&self) -> &str;
    fn status(&self) -> InterfaceStatus;
    fn is_online(&self) -> bool {
        self.status() == InterfaceStatus::Online || self.status() == InterfaceStatus::Initializing
    }
    /// Bring the interface online or offline
    ///
    /// `simulation` selects the simulation IO handler instead of real
    /// hardware. Errors leave the interface offline.
    fn set_online(self: Arc<Self>, value: bool, simulation: bool) -> crate::Result<()>;
}

/// State shared by every concrete interface
pub struct InterfaceCore {
    pub id: String,
    pub status: Mutex<InterfaceStatus>,
    pub transport: Mutex<TransportConfig>,
    pub event_loop: EventLoop,
    pub logger: Logger,
    pub world: Arc<World>,
}

impl InterfaceCore {
    pub fn new(
        id: impl Into<String>,
        transport: TransportConfig,
        event_loop: EventLoop,
        logger: Logger,
        world: Arc<World>,
    ) -> Self {
        Self {
            id: id.into(),
            status: Mutex::new(InterfaceStatus::Offline),
            transport: Mutex::new(transport),
            event_loop,
            logger,
            world,
        }
    }

    pub fn status(&self) -> InterfaceStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: InterfaceStatus) {
        *self.status.lock() = status;
    }

    /// Update the transport settings; refused while online
    pub fn set_transport(&self, transport: TransportConfig) -> bool {
        let mut current = self.transport.lock();
        match self.status() {
            InterfaceStatus::Offline | InterfaceStatus::Error => {
                *current = transport;
                true
            }
            _ => false,
        }
    }

    pub fn transport(&self) -> TransportConfig {
        self.transport.lock().clone()
    }

    /// Record a fatal kernel error and flip to the error state
    ///
    /// The default `on_error` behaviour: one user-facing log line, status
    /// `Error`, interface no longer online.
    pub fn kernel_error(&self, code: &'static str, message: String) {
        self.logger.log(LogEntry::error(self.id.clone(), code, message));
        self.set_status(InterfaceStatus::Error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_validation() {
        assert!(TransportConfig::Tcp {
            host: "".into(),
            port: 1
        }
        .validate()
        .is_err());
        assert!(TransportConfig::Tcp {
            host: "192.0.2.1".into(),
            port: 15471
        }
        .validate()
        .is_ok());
        assert!(TransportConfig::Serial {
            device: "".into(),
            baud_rate: 19200,
            flow_control: SerialFlowControl::None
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_transport_frozen_while_online() {
        let (event_loop, _thread) = EventLoop::spawn();
        let core = InterfaceCore::new(
            "test",
            TransportConfig::Tcp {
                host: "192.0.2.1".into(),
                port: 1,
            },
            event_loop,
            Logger::default(),
            World::new(),
        );

        core.set_status(InterfaceStatus::Online);
        assert!(!core.set_transport(TransportConfig::Tcp {
            host: "192.0.2.2".into(),
            port: 2,
        }));

        core.set_status(InterfaceStatus::Offline);
        assert!(core.set_transport(TransportConfig::Tcp {
            host: "192.0.2.2".into(),
            port: 2,
        }));
    }
}
