//! Simulator protocol records
//!
//! `size` counts the whole record including the `size` and `opCode`
//! bytes. Unknown opcodes are skipped by their declared size so protocol
//! extensions do not break older peers.

use crate::core::Direction;

/// Record opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Power = 1,
    LocomotiveSpeedDirection = 2,
    SensorChanged = 3,
    AccessorySetState = 4,
}

/// Decoder protocol tag carried in locomotive records
///
/// Matches the domain decoder protocols; `0` means unspecified.
pub type ProtocolTag = u8;

/// A simulator protocol record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Power {
        on: bool,
    },
    LocomotiveSpeedDirection {
        address: u16,
        protocol: ProtocolTag,
        speed: u8,
        direction: Direction,
        emergency_stop: bool,
    },
    SensorChanged {
        channel: u16,
        address: u16,
        value: bool,
    },
    AccessorySetState {
        channel: u16,
        address: u16,
        state: u8,
    },
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Self::Power { .. } => OpCode::Power,
            Self::LocomotiveSpeedDirection { .. } => OpCode::LocomotiveSpeedDirection,
            Self::SensorChanged { .. } => OpCode::SensorChanged,
            Self::AccessorySetState { .. } => OpCode::AccessorySetState,
        }
    }

    /// Serialize to one wire record
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8, self.op_code() as u8];
        match *self {
            Self::Power { on } => {
                out.push(on as u8);
            }
            Self::LocomotiveSpeedDirection {
                address,
                protocol,
                speed,
                direction,
                emergency_stop,
            } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.push(protocol);
                out.push(speed);
                out.push((direction == Direction::Reverse) as u8);
                out.push(emergency_stop as u8);
            }
            Self::SensorChanged {
                channel,
                address,
                value,
            } => {
                out.extend_from_slice(&channel.to_le_bytes());
                out.extend_from_slice(&address.to_le_bytes());
                out.push(value as u8);
            }
            Self::AccessorySetState {
                channel,
                address,
                state,
            } => {
                out.extend_from_slice(&channel.to_le_bytes());
                out.extend_from_slice(&address.to_le_bytes());
                out.push(state);
            }
        }
        out[0] = out.len() as u8;
        out
    }

    /// Parse one record from the front of `buffer`
    ///
    /// Returns the message and the number of bytes consumed, or `None`
    /// if the buffer does not yet hold a complete record. Unknown
    /// opcodes consume their declared size and yield no message on the
    /// next call, so the stream stays in sync.
    pub fn parse(buffer: &[u8]) -> Option<(Message, usize)> {
        let mut offset = 0;
        loop {
            let rest = &buffer[offset..];
            if rest.len() < 2 {
                return None;
            }
            let size = rest[0] as usize;
            if size < 2 || rest.len() < size {
                return None;
            }
            let payload = &rest[2..size];
            let message = match rest[1] {
                1 if !payload.is_empty() => Some(Message::Power { on: payload[0] != 0 }),
                2 if payload.len() >= 6 => Some(Message::LocomotiveSpeedDirection {
                    address: u16::from_le_bytes([payload[0], payload[1]]),
                    protocol: payload[2],
                    speed: payload[3],
                    direction: if payload[4] != 0 {
                        Direction::Reverse
                    } else {
                        Direction::Forward
                    },
                    emergency_stop: payload[5] != 0,
                }),
                3 if payload.len() >= 5 => Some(Message::SensorChanged {
                    channel: u16::from_le_bytes([payload[0], payload[1]]),
                    address: u16::from_le_bytes([payload[2], payload[3]]),
                    value: payload[4] != 0,
                }),
                4 if payload.len() >= 5 => Some(Message::AccessorySetState {
                    channel: u16::from_le_bytes([payload[0], payload[1]]),
                    address: u16::from_le_bytes([payload[2], payload[3]]),
                    state: payload[4],
                }),
                _ => None, // unknown or short record, skip it
            };
            offset += size;
            if let Some(message) = message {
                return Some((message, offset));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_round_trip() {
        let message = Message::Power { on: true };
        let bytes = message.to_bytes();
        assert_eq!(bytes, vec![3, 1, 1]);
        let (parsed, used) = Message::parse(&bytes).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(used, 3);
    }

    #[test]
    fn test_locomotive_round_trip() {
        let message = Message::LocomotiveSpeedDirection {
            address: 1234,
            protocol: 2,
            speed: 63,
            direction: Direction::Reverse,
            emergency_stop: false,
        };
        let bytes = message.to_bytes();
        let (parsed, used) = Message::parse(&bytes).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_sensor_round_trip() {
        let message = Message::SensorChanged {
            channel: 1,
            address: 42,
            value: true,
        };
        let bytes = message.to_bytes();
        let (parsed, _) = Message::parse(&bytes).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_partial_record_waits() {
        let bytes = Message::AccessorySetState {
            channel: 0,
            address: 7,
            state: 1,
        }
        .to_bytes();
        assert!(Message::parse(&bytes[..bytes.len() - 1]).is_none());
    }

    #[test]
    fn test_unknown_opcode_skipped() {
        let mut stream = vec![4, 99, 0, 0]; // unknown record
        stream.extend(Message::Power { on: false }.to_bytes());
        let (parsed, used) = Message::parse(&stream).unwrap();
        assert_eq!(parsed, Message::Power { on: false });
        assert_eq!(used, stream.len());
    }
}
