//! External layout simulator bridge
//!
//! A tiny fixed-record opcode protocol over TCP. A simulation IO handler
//! can connect to an external layout simulator: outgoing domain commands
//! fan out to the simulator, and simulator events (sensors, power,
//! locomotive echoes) are turned back into protocol messages and injected
//! through the kernel's normal receive path. This lets several simulated
//! interfaces share one layout.
//!
//! Wire format: every record starts with `size` (total length including
//! the two header bytes) and `opCode`; multi-byte fields are little
//! endian.

pub mod protocol;

pub use protocol::{Message, OpCode};

use crate::error::Result;
use crate::transport::{Link, LinkChannels, TcpLink};
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;

/// TCP client for the simulator protocol
///
/// Incoming records are delivered to the `on_message` callback on the
/// kernel's I/O thread context (the client is spawned on the kernel
/// runtime).
pub struct SimulatorClient {
    tx: mpsc::Sender<Bytes>,
}

impl SimulatorClient {
    /// Connect and start reading
    ///
    /// Must be called from within the kernel's runtime.
    pub fn connect(
        host: &str,
        port: u16,
        on_message: impl Fn(Message) + Send + 'static,
    ) -> Result<Self> {
        let LinkChannels { mut rx, tx } =
            TcpLink::new(host, port).spawn(Arc::new(AtomicBool::new(false)))?;

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::with_capacity(256);
            while let Some(chunk) = rx.recv().await {
                buffer.extend_from_slice(&chunk);
                loop {
                    let Some((message, used)) = Message::parse(&buffer) else {
                        break;
                    };
                    buffer.drain(..used);
                    on_message(message);
                }
            }
        });

        Ok(Self { tx })
    }

    /// Queue one record; returns `false` when the write buffer is full
    /// or the connection is gone
    pub fn send(&self, message: &Message) -> bool {
        self.tx.try_send(Bytes::from(message.to_bytes())).is_ok()
    }
}
