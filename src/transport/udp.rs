//! UDP endpoint link
//!
//! Client endpoint talking to one command station (Z21). The socket is
//! connected to the remote address, so one datagram equals one frame in
//! both directions.

use super::{Link, LinkChannels};
use crate::constants::{CHANNEL_CAPACITY, LINK_BUFFER_SIZE};
use crate::error::{HubError, Result};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// UDP endpoint link to `host:port`
pub struct UdpLink {
    host: String,
    port: u16,
}

impl UdpLink {
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

impl Link for UdpLink {
    fn spawn(self, _shutdown: Arc<AtomicBool>) -> Result<LinkChannels> {
        let remote = self.resolve()?;
        let map_err = |e: std::io::Error| HubError::UdpSocket {
            host: self.host.clone(),
            port: self.port,
            source: e,
        };

        // SO_REUSEADDR allows quick rebind after a restart
        let domain = if remote.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
        socket.set_reuse_address(true).map_err(map_err)?;
        socket.set_nonblocking(true).map_err(map_err)?;

        let local: SocketAddr = if remote.is_ipv6() {
            "[::]:0".parse().expect("valid wildcard address")
        } else {
            "0.0.0.0:0".parse().expect("valid wildcard address")
        };
        socket.bind(&local.into()).map_err(map_err)?;
        socket.connect(&remote.into()).map_err(map_err)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(std_socket).map_err(map_err)?);

        let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        // RX task: one datagram per channel message
        let socket_rx = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; LINK_BUFFER_SIZE];
            loop {
                match socket_rx.recv(&mut buf).await {
                    Ok(len) => {
                        if in_tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // TX task
        let socket_tx = socket.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if socket_tx.send(&data).await.is_err() {
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
    fn test_resolve() {
        let link = UdpLink::new("192.0.2.10", 21105);
        let addr = link.resolve().unwrap();
        assert_eq!(addr.port(), 21105);
    }
}
