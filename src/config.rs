//! Configuration management
//!
//! The hub reads a single TOML file describing the world defaults and
//! the configured interfaces. Per-protocol kernel options live under
//! each interface entry and are deserialized by the matching protocol's
//! config type, so unknown protocols fail loudly at load time.

use crate::constants::MEMORY_LOGGER_SIZE_DEFAULT;
use crate::core::{EventLoop, World};
use crate::error::{HubError, Result};
use crate::interface::{
    dccex::DccExInterface, diy::DiyInterface, ecos::EcosInterface, loconet::LocoNetInterface,
    marklin_can::MarklinCanInterface, selectrix::SelectrixInterface,
    withrottle::WiThrottleInterface, xpressnet::XpressNetInterface, z21::Z21Interface, Interface,
    TransportConfig,
};
use crate::logging::Logger;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Protocol selector of an interface entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    XpressNet,
    Z21,
    DccEx,
    LocoNet,
    Ecos,
    MarklinCan,
    Selectrix,
    TraintasticDiy,
    WiThrottle,
}

/// One configured interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceEntry {
    pub id: String,
    pub protocol: Protocol,
    pub transport: TransportConfig,
    /// Protocol-specific kernel options
    #[serde(default)]
    pub options: toml::Table,
}

/// Top-level hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of the in-memory log store
    pub log_size: usize,
    /// Start all interfaces with simulation IO handlers
    pub simulation: bool,
    #[serde(rename = "interface")]
    pub interfaces: Vec<InterfaceEntry>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            log_size: MEMORY_LOGGER_SIZE_DEFAULT,
            simulation: false,
            interfaces: Vec::new(),
        }
    }
}

impl HubConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HubError::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: HubConfig = toml::from_str(&text).map_err(|e| HubError::ConfigParse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        for entry in &config.interfaces {
            entry
                .transport
                .validate()
                .map_err(|reason| HubError::ConfigValidation {
                    field: "transport",
                    reason: format!("{}: {}", entry.id, reason),
                })?;
        }
        Ok(config)
    }
}

fn options<T: serde::de::DeserializeOwned>(entry: &InterfaceEntry) -> Result<T> {
    entry
        .options
        .clone()
        .try_into()
        .map_err(|e: toml::de::Error| HubError::ConfigValidation {
            field: "options",
            reason: format!("{}: {}", entry.id, e),
        })
}

/// Build the interface object for one config entry
pub fn create_interface(
    entry: &InterfaceEntry,
    event_loop: EventLoop,
    logger: Logger,
    world: Arc<World>,
) -> Result<Arc<dyn Interface>> {
    let id = entry.id.clone();
    let transport = entry.transport.clone();
    let interface: Arc<dyn Interface> = match entry.protocol {
        Protocol::XpressNet => {
            XpressNetInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::Z21 => Z21Interface::new(id, transport, options(entry)?, event_loop, logger, world),
        Protocol::DccEx => {
            DccExInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::LocoNet => {
            LocoNetInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::Ecos => {
            EcosInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::MarklinCan => {
            MarklinCanInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::Selectrix => {
            SelectrixInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::TraintasticDiy => {
            DiyInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
        Protocol::WiThrottle => {
            WiThrottleInterface::new(id, transport, options(entry)?, event_loop, logger, world)
        }
    };
    Ok(interface)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let text = r#"
log_size = 5000
simulation = true

[[interface]]
id = "station"
protocol = "z21"

[interface.transport]
type = "udp"
host = "192.0.2.10"
port = 21105

[interface.options]
debug_log_rx_tx = true

[[interface]]
id = "feedback"
protocol = "xpress_net"

[interface.transport]
type = "serial"
device = "/dev/ttyUSB0"
baud_rate = 62500
"#;
        let config: HubConfig = toml::from_str(text).unwrap();
        assert_eq!(config.log_size, 5000);
        assert!(config.simulation);
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[0].protocol, Protocol::Z21);
        assert_eq!(config.interfaces[1].protocol, Protocol::XpressNet);

        let z21: crate::protocol::z21::KernelConfig = options(&config.interfaces[0]).unwrap();
        assert!(z21.debug_log_rx_tx);
        let xpressnet: crate::protocol::xpressnet::KernelConfig =
            options(&config.interfaces[1]).unwrap();
        assert!(!xpressnet.debug_log_rx_tx);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let text = r#"
[[interface]]
id = "station"
protocol = "dcc_ex"

[interface.transport]
type = "tcp"
host = "192.0.2.1"
port = 2560

[interface.options]
no_such_option = 1
"#;
        let config: HubConfig = toml::from_str(text).unwrap();
        let result: Result<crate::protocol::dccex::KernelConfig> = options(&config.interfaces[0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_interface_all_protocols() {
        let (event_loop, _thread) = EventLoop::spawn();
        let logger = Logger::default();
        let world = World::new();
        for (protocol, transport) in [
            (
                Protocol::XpressNet,
                TransportConfig::Serial {
                    device: "/dev/ttyUSB0".into(),
                    baud_rate: 62500,
                    flow_control: Default::default(),
                },
            ),
            (
                Protocol::Z21,
                TransportConfig::Udp {
                    host: "192.0.2.1".into(),
                    port: 21105,
                },
            ),
            (
                Protocol::Ecos,
                TransportConfig::Tcp {
                    host: "192.0.2.1".into(),
                    port: 15471,
                },
            ),
        ] {
            let entry = InterfaceEntry {
                id: "test".into(),
                protocol,
                transport,
                options: toml::Table::new(),
            };
            let interface =
                create_interface(&entry, event_loop.clone(), logger.clone(), world.clone())
                    .unwrap();
            assert_eq!(interface.id(), "test");
        }
    }
}
