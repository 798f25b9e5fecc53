//! Traintastic DIY message codec
//!
//! Frame layout: `length` (total frame size), `opCode`, payload, XOR
//! check byte over everything before it. Multi-byte fields are little
//! endian.

use crate::core::TriState;
use crate::protocol::hex_dump;

pub const OPC_HEARTBEAT: u8 = 0x01;
pub const OPC_GET_INFO: u8 = 0x02;
pub const OPC_INFO: u8 = 0x03;
pub const OPC_GET_INPUT_STATE: u8 = 0x10;
pub const OPC_INPUT_CHANGED: u8 = 0x11;
pub const OPC_GET_OUTPUT_STATE: u8 = 0x20;
pub const OPC_SET_OUTPUT: u8 = 0x21;
pub const OPC_OUTPUT_CHANGED: u8 = 0x22;

pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 65535;
pub const OUTPUT_ADDRESS_MIN: u32 = 1;
pub const OUTPUT_ADDRESS_MAX: u32 = 65535;

pub fn calc_checksum(frame: &[u8]) -> u8 {
    frame[..frame.len() - 1].iter().fold(0, |acc, b| acc ^ b)
}

pub fn is_checksum_valid(frame: &[u8]) -> bool {
    frame.len() >= 3 && calc_checksum(frame) == frame[frame.len() - 1]
}

/// A Traintastic DIY message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat,
    GetInfo,
    Info {
        version_major: u8,
        version_minor: u8,
    },
    GetInputState {
        address: u16,
    },
    InputChanged {
        address: u16,
        value: TriState,
    },
    GetOutputState {
        address: u16,
    },
    SetOutput {
        address: u16,
        value: bool,
    },
    OutputChanged {
        address: u16,
        value: TriState,
    },
    /// Checksum-valid frame this codec does not model
    Unknown(Vec<u8>),
}

fn tristate_byte(value: TriState) -> u8 {
    match value {
        TriState::Undefined => 2,
        TriState::False => 0,
        TriState::True => 1,
    }
}

fn byte_tristate(byte: u8) -> TriState {
    match byte {
        0 => TriState::False,
        1 => TriState::True,
        _ => TriState::Undefined,
    }
}

impl Message {
    /// Serialize to a checksummed frame
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = match self {
            Self::Heartbeat => vec![0, OPC_HEARTBEAT, 0],
            Self::GetInfo => vec![0, OPC_GET_INFO, 0],
            Self::Info {
                version_major,
                version_minor,
            } => vec![0, OPC_INFO, *version_major, *version_minor, 0],
            Self::GetInputState { address } => {
                let mut frame = vec![0, OPC_GET_INPUT_STATE];
                frame.extend_from_slice(&address.to_le_bytes());
                frame.push(0);
                frame
            }
            Self::InputChanged { address, value } => {
                let mut frame = vec![0, OPC_INPUT_CHANGED];
                frame.extend_from_slice(&address.to_le_bytes());
                frame.push(tristate_byte(*value));
                frame.push(0);
                frame
            }
            Self::GetOutputState { address } => {
                let mut frame = vec![0, OPC_GET_OUTPUT_STATE];
                frame.extend_from_slice(&address.to_le_bytes());
                frame.push(0);
                frame
            }
            Self::SetOutput { address, value } => {
                let mut frame = vec![0, OPC_SET_OUTPUT];
                frame.extend_from_slice(&address.to_le_bytes());
                frame.push(u8::from(*value));
                frame.push(0);
                frame
            }
            Self::OutputChanged { address, value } => {
                let mut frame = vec![0, OPC_OUTPUT_CHANGED];
                frame.extend_from_slice(&address.to_le_bytes());
                frame.push(tristate_byte(*value));
                frame.push(0);
                frame
            }
            Self::Unknown(frame) => return frame.clone(),
        };
        frame[0] = frame.len() as u8;
        let len = frame.len();
        frame[len - 1] = calc_checksum(&frame);
        frame
    }

    /// Parse a checksum-verified frame
    pub fn parse(frame: &[u8]) -> Option<Message> {
        if frame.len() < 3 || frame[0] as usize != frame.len() || !is_checksum_valid(frame) {
            return None;
        }
        let payload = &frame[2..frame.len() - 1];
        let message = match frame[1] {
            OPC_HEARTBEAT => Self::Heartbeat,
            OPC_GET_INFO => Self::GetInfo,
            OPC_INFO if payload.len() >= 2 => Self::Info {
                version_major: payload[0],
                version_minor: payload[1],
            },
            OPC_GET_INPUT_STATE if payload.len() >= 2 => Self::GetInputState {
                address: u16::from_le_bytes([payload[0], payload[1]]),
            },
            OPC_INPUT_CHANGED if payload.len() >= 3 => Self::InputChanged {
                address: u16::from_le_bytes([payload[0], payload[1]]),
                value: byte_tristate(payload[2]),
            },
            OPC_GET_OUTPUT_STATE if payload.len() >= 2 => Self::GetOutputState {
                address: u16::from_le_bytes([payload[0], payload[1]]),
            },
            OPC_SET_OUTPUT if payload.len() >= 3 => Self::SetOutput {
                address: u16::from_le_bytes([payload[0], payload[1]]),
                value: payload[2] != 0,
            },
            OPC_OUTPUT_CHANGED if payload.len() >= 3 => Self::OutputChanged {
                address: u16::from_le_bytes([payload[0], payload[1]]),
                value: byte_tristate(payload[2]),
            },
            _ => Self::Unknown(frame.to_vec()),
        };
        Some(message)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "Heartbeat",
            Self::GetInfo => "GetInfo",
            Self::Info { .. } => "Info",
            Self::GetInputState { .. } => "GetInputState",
            Self::InputChanged { .. } => "InputChanged",
            Self::GetOutputState { .. } => "GetOutputState",
            Self::SetOutput { .. } => "SetOutput",
            Self::OutputChanged { .. } => "OutputChanged",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Debug dump: message name plus hex bytes
    pub fn to_string_dump(&self) -> String {
        format!("{} [{}]", self.name(), hex_dump(&self.serialize()))
    }
}

/// Frame extractor: length byte first, resync by dropping one byte on a
/// checksum failure
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<Vec<u8>>, usize) {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut dropped = 0;

        loop {
            if self.buffer.is_empty() {
                break;
            }
            let size = self.buffer[0] as usize;
            if size < 3 {
                self.buffer.remove(0);
                dropped += 1;
                continue;
            }
            if self.buffer.len() < size {
                break;
            }
            if is_checksum_valid(&self.buffer[..size]) {
                frames.push(self.buffer[..size].to_vec());
                self.buffer.drain(..size);
            } else {
                self.buffer.remove(0);
                dropped += 1;
            }
        }

        if self.buffer.len() > crate::constants::FRAMER_MAX_BUFFER {
            dropped += self.buffer.len();
            self.buffer.clear();
        }
        (frames, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_bytes() {
        let frame = Message::Heartbeat.serialize();
        assert_eq!(frame, vec![3, OPC_HEARTBEAT, 3 ^ OPC_HEARTBEAT]);
    }

    #[test]
    fn test_round_trips() {
        for message in [
            Message::Heartbeat,
            Message::GetInfo,
            Message::Info {
                version_major: 1,
                version_minor: 2,
            },
            Message::InputChanged {
                address: 1234,
                value: TriState::True,
            },
            Message::SetOutput {
                address: 77,
                value: true,
            },
            Message::OutputChanged {
                address: 77,
                value: TriState::False,
            },
        ] {
            assert_eq!(Message::parse(&message.serialize()), Some(message));
        }
    }

    #[test]
    fn test_checksum_mutation_invalidates() {
        let frame = Message::InputChanged {
            address: 42,
            value: TriState::True,
        }
        .serialize();
        for i in 0..frame.len() {
            let mut mutated = frame.clone();
            mutated[i] ^= 0x04;
            assert!(!is_checksum_valid(&mutated) || mutated[0] as usize != mutated.len());
        }
    }

    #[test]
    fn test_framer_resync() {
        let mut framer = Framer::new();
        let mut stream = vec![0x00, 0x01]; // too-short length bytes
        stream.extend(Message::Heartbeat.serialize());
        let (frames, dropped) = framer.feed(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(dropped, 2);
    }
}
