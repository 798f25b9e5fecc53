//! TCP client link
//!
//! Connects to a command station (ECoS, DCC-EX over network, WiThrottle,
//! Traintastic DIY, CAN-over-TCP). Uses async tokio tasks:
//! - RX task: reads chunks, sends to channel
//! - TX task: receives from channel, writes to socket
//!
//! The connect itself is done synchronously with a timeout so that
//! `spawn` can report failure before the kernel considers itself started.

use super::{Link, LinkChannels};
use crate::constants::{CHANNEL_CAPACITY, LINK_BUFFER_SIZE};
use crate::error::{HubError, Result};
use bytes::Bytes;
use std::net::{SocketAddr, TcpStream as StdTcpStream, ToSocketAddrs};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP client link to `host:port`
pub struct TcpLink {
    host: String,
    port: u16,
}

impl TcpLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| HubError::MakeAddress {
                host: self.host.clone(),
            })
    }
}

impl Link for TcpLink {
    fn spawn(self, _shutdown: Arc<AtomicBool>) -> Result<LinkChannels> {
        let addr = self.resolve()?;
        let map_err = |e: std::io::Error| HubError::TcpConnect {
            host: self.host.clone(),
            port: self.port,
            source: e,
        };

        let stream = StdTcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(map_err)?;
        stream.set_nodelay(true).map_err(map_err)?;
        stream.set_nonblocking(true).map_err(map_err)?;
        let stream = TcpStream::from_std(stream).map_err(map_err)?;

        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        let (mut read_half, mut write_half) = stream.into_split();

        // RX task
        tokio::spawn(async move {
            let mut buf = [0u8; LINK_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break, // peer closed or error
                    Ok(n) => {
                        if in_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // TX task
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
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
    fn test_resolve_numeric() {
        let link = TcpLink::new("127.0.0.1", 15471);
        let addr = link.resolve().unwrap();
        assert_eq!(addr.port(), 15471);
    }

    #[test]
    fn test_resolve_failure() {
        let link = TcpLink::new("", 15471);
        assert!(link.resolve().is_err());
    }
}
