//! Selectrix bus codec
//!
//! Native framing is two bytes: `address` (bit 7 set for a write) and
//! `value`. Rautenhaus gateways prefix every frame with a `0x78` marker
//! byte. Bus reports use the same two bytes with bit 7 clear.

use crate::protocol::hex_dump;

pub const BUS_ADDRESS_COUNT: u8 = 112;
/// Central control byte: bit 7 is track power
pub const POWER_ADDRESS: u8 = 127;
pub const POWER_BIT: u8 = 0x80;

pub const RAUTENHAUS_MARKER: u8 = 0x78;

pub const WRITE_FLAG: u8 = 0x80;

/// Locomotive byte layout
pub mod loco_byte {
    pub const SPEED_MASK: u8 = 0x1F;
    pub const DIRECTION: u8 = 0x20;
    pub const HORN: u8 = 0x40;
    pub const LIGHT: u8 = 0x80;
}

/// One bus frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Drive one bus byte
    Write { address: u8, value: u8 },
    /// Bus monitor report of one byte
    Report { address: u8, value: u8 },
}

impl Message {
    pub fn serialize(&self, rautenhaus: bool) -> Vec<u8> {
        let (address, value) = match *self {
            Self::Write { address, value } => (address | WRITE_FLAG, value),
            Self::Report { address, value } => (address & !WRITE_FLAG, value),
        };
        if rautenhaus {
            vec![RAUTENHAUS_MARKER, address, value]
        } else {
            vec![address, value]
        }
    }

    pub fn parse(frame: &[u8]) -> Option<Message> {
        let (address, value) = match frame.len() {
            2 => (frame[0], frame[1]),
            3 if frame[0] == RAUTENHAUS_MARKER => (frame[1], frame[2]),
            _ => return None,
        };
        let message = if address & WRITE_FLAG != 0 {
            Self::Write {
                address: address & !WRITE_FLAG,
                value,
            }
        } else {
            Self::Report { address, value }
        };
        Some(message)
    }

    /// Debug dump: message name plus hex bytes
    pub fn to_string_dump(&self, rautenhaus: bool) -> String {
        let name = match self {
            Self::Write { .. } => "Write",
            Self::Report { .. } => "Report",
        };
        format!("{} [{}]", name, hex_dump(&self.serialize(rautenhaus)))
    }
}

/// Frame extractor; frame width depends on the gateway flavour
pub struct Framer {
    buffer: Vec<u8>,
    rautenhaus: bool,
}

impl Framer {
    pub fn new(rautenhaus: bool) -> Self {
        Self {
            buffer: Vec::with_capacity(16),
            rautenhaus,
        }
    }

    /// Feed raw bytes; returns complete frames and the dropped byte count
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<Message>, usize) {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        let mut dropped = 0;
        let width = if self.rautenhaus { 3 } else { 2 };

        while self.buffer.len() >= width {
            if self.rautenhaus && self.buffer[0] != RAUTENHAUS_MARKER {
                self.buffer.remove(0);
                dropped += 1;
                continue;
            }
            match Message::parse(&self.buffer[..width]) {
                Some(message) => {
                    messages.push(message);
                    self.buffer.drain(..width);
                }
                None => {
                    self.buffer.remove(0);
                    dropped += 1;
                }
            }
        }
        (messages, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_round_trip() {
        let message = Message::Write {
            address: 42,
            value: 0x5A,
        };
        let frame = message.serialize(false);
        assert_eq!(frame, vec![42 | WRITE_FLAG, 0x5A]);
        assert_eq!(Message::parse(&frame), Some(message));
    }

    #[test]
    fn test_rautenhaus_round_trip() {
        let message = Message::Report {
            address: 100,
            value: 0x01,
        };
        let frame = message.serialize(true);
        assert_eq!(frame, vec![RAUTENHAUS_MARKER, 100, 0x01]);
        assert_eq!(Message::parse(&frame), Some(message));
    }

    #[test]
    fn test_framer_rautenhaus_resync() {
        let mut framer = Framer::new(true);
        let mut stream = vec![0x11]; // garbage before marker
        stream.extend(
            Message::Write {
                address: 1,
                value: 2,
            }
            .serialize(true),
        );
        let (messages, dropped) = framer.feed(&stream);
        assert_eq!(messages.len(), 1);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_loco_byte_packing() {
        let byte = 12 | loco_byte::DIRECTION | loco_byte::LIGHT;
        assert_eq!(byte & loco_byte::SPEED_MASK, 12);
        assert_ne!(byte & loco_byte::DIRECTION, 0);
        assert_eq!(byte & loco_byte::HORN, 0);
    }
}
