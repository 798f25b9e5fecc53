//! Byte links for kernel I/O handlers
//!
//! Separates I/O concerns from protocol logic:
//! - **Link**: how bytes flow (serial, TCP client, UDP endpoint)
//! - framing and message codecs live with the kernel that owns the link
//!
//! Each link manages its own execution model internally:
//! - Serial: blocking threads for low latency
//! - TCP/UDP: async tokio tasks
//!
//! `spawn` must be called from within a tokio runtime (each kernel runs
//! one on its I/O thread).

pub mod serial;
pub mod tcp;
pub mod udp;

pub use serial::SerialLink;
pub use tcp::TcpLink;
pub use udp::UdpLink;

use crate::error::Result;
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Channels for bidirectional communication with a link
///
/// The link owns the underlying I/O (socket, serial port) and
/// communicates via these channels. When the link stops (shutdown or
/// error), it closes the channels.
pub struct LinkChannels {
    /// Receive raw bytes from the link
    ///
    /// Returns `None` when the link has stopped.
    pub rx: mpsc::Receiver<Bytes>,

    /// Send raw bytes to the link
    ///
    /// `try_send` returning an error means the write buffer is full or
    /// the link is gone; the kernel treats both as a transport error.
    pub tx: mpsc::Sender<Bytes>,
}

/// Trait for spawnable byte links
///
/// A link abstracts byte-level I/O. It does NOT handle message framing,
/// logging, or reconnection; those belong to the kernel.
pub trait Link: Send + 'static {
    /// Open the underlying I/O and start background readers/writers
    ///
    /// The link runs until `shutdown` is signaled, the channels are
    /// dropped, or a fatal I/O error occurs.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened (port not
    /// found, connect refused, bind failed).
    fn spawn(self, shutdown: Arc<AtomicBool>) -> Result<LinkChannels>;
}
