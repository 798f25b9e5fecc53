//! Serial link
//!
//! Uses blocking threads for low-latency I/O:
//! - Reader thread: reads from the serial port, sends to channel
//! - Writer thread: receives from channel, writes to the serial port
//!
//! The link stops when:
//! - `shutdown` flag is set
//! - the port disconnects (detected via consecutive read errors)
//! - a write error occurs

use super::{Link, LinkChannels};
use crate::constants::{CHANNEL_CAPACITY, LINK_BUFFER_SIZE, SERIAL_DISCONNECT_THRESHOLD};
use crate::error::{HubError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Serial flow control
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialFlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

impl From<SerialFlowControl> for serialport::FlowControl {
    fn from(value: SerialFlowControl) -> Self {
        match value {
            SerialFlowControl::None => serialport::FlowControl::None,
            SerialFlowControl::Hardware => serialport::FlowControl::Hardware,
            SerialFlowControl::Software => serialport::FlowControl::Software,
        }
    }
}

/// Serial link with configurable baud rate and flow control
///
/// Command station gateways are picky about both; the values come from
/// the interface transport settings.
pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    flow_control: SerialFlowControl,
}

impl SerialLink {
    pub fn new(
        port_name: impl Into<String>,
        baud_rate: u32,
        flow_control: SerialFlowControl,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            flow_control,
        }
    }

    fn open(&self) -> Result<Box<dyn serialport::SerialPort>> {
        serialport::new(&self.port_name, self.baud_rate)
            .flow_control(self.flow_control.into())
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| HubError::SerialOpen {
                port: self.port_name.clone(),
                source: std::io::Error::other(e.to_string()),
            })
    }
}

impl Link for SerialLink {
    fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<LinkChannels> {
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        let port_read = self.open()?;
        let port_write = port_read.try_clone().map_err(|e| HubError::SerialOpen {
            port: self.port_name.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;

        // Reader thread (blocking)
        let shutdown_reader = shutdown.clone();
        std::thread::spawn(move || {
            let mut port = port_read;
            let mut buf = [0u8; LINK_BUFFER_SIZE];
            let mut consecutive_errors = 0u32;

            while !shutdown_reader.load(Ordering::Relaxed) {
                match port.read(&mut buf) {
                    Ok(n) if n > 0 => {
                        consecutive_errors = 0;
                        if in_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            // Receiver dropped, kernel stopped
                            break;
                        }
                    }
                    Ok(_) => {
                        consecutive_errors += 1;
                        if consecutive_errors > SERIAL_DISCONNECT_THRESHOLD {
                            // Port likely disconnected
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        consecutive_errors = 0;
                    }
                    Err(_) => {
                        // Serial error - port disconnected
                        break;
                    }
                }
            }
        });

        // Writer thread (blocking)
        let shutdown_writer = shutdown.clone();
        std::thread::spawn(move || {
            let mut port = port_write;

            while !shutdown_writer.load(Ordering::Relaxed) {
                match out_rx.blocking_recv() {
                    Some(data) => {
                        if port.write_all(&data).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        });

        Ok(LinkChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_link_new() {
        let link = SerialLink::new("/dev/ttyUSB0", 19200, SerialFlowControl::Hardware);
        assert_eq!(link.port_name, "/dev/ttyUSB0");
        assert_eq!(link.baud_rate, 19200);
        assert_eq!(link.flow_control, SerialFlowControl::Hardware);
    }

    #[test]
    fn test_flow_control_mapping() {
        assert!(matches!(
            serialport::FlowControl::from(SerialFlowControl::None),
            serialport::FlowControl::None
        ));
        assert!(matches!(
            serialport::FlowControl::from(SerialFlowControl::Software),
            serialport::FlowControl::Software
        ));
    }
}
