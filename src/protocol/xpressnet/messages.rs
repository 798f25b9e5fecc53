//! XpressNet message codec
//!
//! Frame layout: `header` (high nibble identifies the message group, low
//! nibble is the data byte count), data bytes, XOR checksum over
//! everything before it. `parse` verifies the checksum before matching;
//! `serialize` computes it.

use crate::core::Direction;
use crate::protocol::hex_dump;

pub const SHORT_ADDRESS_MIN: u16 = 1;
pub const SHORT_ADDRESS_MAX: u16 = 99;
pub const LONG_ADDRESS_MIN: u16 = 100;
pub const LONG_ADDRESS_MAX: u16 = 9999;

pub const ID_FEEDBACK_BROADCAST: u8 = 0x40;

/// Total frame size for a header byte
pub fn frame_size(header: u8) -> usize {
    2 + (header & 0x0F) as usize
}

/// XOR over all bytes except the trailing checksum
pub fn calc_checksum(frame: &[u8]) -> u8 {
    frame[..frame.len() - 1].iter().fold(0, |acc, b| acc ^ b)
}

pub fn is_checksum_valid(frame: &[u8]) -> bool {
    frame.len() >= 2 && calc_checksum(frame) == frame[frame.len() - 1]
}

/// Speed step mode of a speed-and-direction instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedStepMode {
    Steps14,
    Steps27,
    Steps28,
    Steps128,
}

impl SpeedStepMode {
    pub fn from_count(steps: u8) -> Self {
        match steps {
            14 => Self::Steps14,
            27 => Self::Steps27,
            28 => Self::Steps28,
            _ => Self::Steps128,
        }
    }

    /// Instruction identification byte
    fn identification(self) -> u8 {
        match self {
            Self::Steps14 => 0x10,
            Self::Steps27 => 0x11,
            Self::Steps28 => 0x12,
            Self::Steps128 => 0x13,
        }
    }

    pub fn max_step(self) -> u8 {
        match self {
            Self::Steps14 => 14,
            Self::Steps27 => 27,
            Self::Steps28 => 28,
            Self::Steps128 => 126,
        }
    }
}

/// One `{address, data}` pair of a feedback broadcast
///
/// A feedback module pair carries four contiguous inputs in the status
/// nibble; accessory pairs report switching results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackPair {
    pub address: u8,
    pub data: u8,
}

/// What a feedback pair describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackType {
    AccessoryWithoutFeedback,
    AccessoryWithFeedback,
    FeedbackModule,
    Reserved,
}

impl FeedbackPair {
    pub fn new(group_address: u16, feedback_type: FeedbackType) -> Self {
        let mut pair = Self { address: 0, data: 0 };
        pair.set_group_address(group_address);
        pair.set_type(feedback_type);
        pair
    }

    /// 9 bit group address: 8 bits in `address`, low bit in `data`
    pub fn group_address(&self) -> u16 {
        (u16::from(self.address) << 1) | u16::from(self.data & 0x10 != 0)
    }

    pub fn set_group_address(&mut self, value: u16) {
        debug_assert!(value < 512);
        self.address = (value >> 1) as u8;
        if value & 1 != 0 {
            self.data |= 0x10;
        } else {
            self.data &= 0xEF;
        }
    }

    pub fn feedback_type(&self) -> FeedbackType {
        match (self.data & 0x60) >> 5 {
            0 => FeedbackType::AccessoryWithoutFeedback,
            1 => FeedbackType::AccessoryWithFeedback,
            2 => FeedbackType::FeedbackModule,
            _ => FeedbackType::Reserved,
        }
    }

    pub fn set_type(&mut self, value: FeedbackType) {
        let bits = match value {
            FeedbackType::AccessoryWithoutFeedback => 0,
            FeedbackType::AccessoryWithFeedback => 1,
            FeedbackType::FeedbackModule => 2,
            FeedbackType::Reserved => 3,
        };
        self.data = (self.data & 0x9F) | (bits << 5);
    }

    /// Four contiguous input bits
    pub fn status_nibble(&self) -> u8 {
        self.data & 0x0F
    }

    pub fn set_status(&mut self, index: u8, value: bool) {
        debug_assert!(index < 4);
        if value {
            self.data |= 1 << index;
        } else {
            self.data &= !(1 << index);
        }
    }
}

/// An XpressNet message
///
/// Builders normalize: with `emergency_stop` set the speed step is zero
/// (the wire cannot carry both), so `parse(serialize(m)) == m` holds for
/// every constructible value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // === broadcasts from the command station ===
    NormalOperationResumed,
    TrackPowerOff,
    /// All locomotives stopped, track power still on
    EmergencyStop,
    FeedbackBroadcast(Vec<FeedbackPair>),

    // === requests to the command station ===
    ResumeOperationsRequest,
    StopOperationsRequest,
    StopAllLocomotivesRequest,
    EmergencyStopLocomotive {
        address: u16,
    },
    SpeedAndDirection {
        address: u16,
        mode: SpeedStepMode,
        emergency_stop: bool,
        direction: Direction,
        speed_step: u8,
        /// F0, only on the wire in 14 step mode
        f0: bool,
    },
    /// Function group 1..=5 (F0-F4, F5-F8, F9-F12, F13-F20, F21-F28)
    FunctionGroup {
        address: u16,
        group: u8,
        functions: u8,
    },
    /// Roco MultiMAUS dedicated F13-F20 instruction
    RocoFunctionF13F20 {
        address: u16,
        functions: u8,
    },
    AccessoryOperation {
        /// 0-based full accessory address (address * 4 + output)
        address: u16,
        activate: bool,
    },

    // === RoSoft S88 gateway configuration ===
    S88StartAddress(u8),
    S88ModuleCount(u8),

    /// Checksum-valid frame this codec does not model
    Unknown(Vec<u8>),
}

fn address_high_low(address: u16) -> (u8, u8) {
    if address >= LONG_ADDRESS_MIN {
        debug_assert!(address <= LONG_ADDRESS_MAX);
        (0xC0 | (address >> 8) as u8, (address & 0xFF) as u8)
    } else {
        debug_assert!(address >= SHORT_ADDRESS_MIN);
        (0x00, (address & 0x7F) as u8)
    }
}

fn parse_address(high: u8, low: u8) -> u16 {
    if high & 0xC0 == 0xC0 {
        (u16::from(high & 0x3F) << 8) | u16::from(low)
    } else {
        u16::from(low & 0x7F)
    }
}

impl Message {
    /// Serialize to a checksummed frame
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = match self {
            Self::NormalOperationResumed => vec![0x61, 0x01, 0],
            Self::TrackPowerOff => vec![0x61, 0x00, 0],
            Self::EmergencyStop => vec![0x81, 0x00, 0],
            Self::FeedbackBroadcast(pairs) => {
                debug_assert!(pairs.len() <= 7);
                let mut frame = vec![ID_FEEDBACK_BROADCAST | (pairs.len() * 2) as u8];
                for pair in pairs {
                    frame.push(pair.address);
                    frame.push(pair.data);
                }
                frame.push(0);
                frame
            }
            Self::ResumeOperationsRequest => vec![0x21, 0x81, 0],
            Self::StopOperationsRequest => vec![0x21, 0x80, 0],
            Self::StopAllLocomotivesRequest => vec![0x80, 0],
            Self::EmergencyStopLocomotive { address } => {
                let (high, low) = address_high_low(*address);
                vec![0x92, high, low, 0]
            }
            Self::SpeedAndDirection {
                address,
                mode,
                emergency_stop,
                direction,
                speed_step,
                f0,
            } => {
                let (high, low) = address_high_low(*address);
                let mut sd: u8 = u8::from(*emergency_stop);
                if *direction == Direction::Forward {
                    sd |= 0x80;
                }
                if !emergency_stop && *speed_step > 0 {
                    debug_assert!(*speed_step <= mode.max_step());
                    let value = speed_step + 1;
                    match mode {
                        SpeedStepMode::Steps14 | SpeedStepMode::Steps128 => sd |= value & 0x7F,
                        SpeedStepMode::Steps27 | SpeedStepMode::Steps28 => {
                            sd |= ((value & 0x01) << 4) | (value >> 1)
                        }
                    }
                }
                if *mode == SpeedStepMode::Steps14 && *f0 {
                    sd |= 0x10;
                }
                vec![0xE4, mode.identification(), high, low, sd, 0]
            }
            Self::FunctionGroup {
                address,
                group,
                functions,
            } => {
                debug_assert!((1..=5).contains(group));
                let identification = if *group == 5 { 0x28 } else { 0x1F + group };
                let (high, low) = address_high_low(*address);
                vec![0xE4, identification, high, low, *functions, 0]
            }
            Self::RocoFunctionF13F20 { address, functions } => {
                let (high, low) = address_high_low(*address);
                vec![0xE4, 0xF3, high, low, *functions, 0]
            }
            Self::AccessoryOperation { address, activate } => {
                debug_assert!(*address < 2048);
                let data = 0x80 | ((address & 0x07) as u8) | (u8::from(*activate) << 6);
                vec![0x52, (address >> 3) as u8, data, 0]
            }
            Self::S88StartAddress(value) => vec![0xF2, 0xF1, *value, 0],
            Self::S88ModuleCount(value) => vec![0xF2, 0xF2, *value, 0],
            Self::Unknown(frame) => return frame.clone(),
        };
        let len = frame.len();
        frame[len - 1] = calc_checksum(&frame);
        frame
    }

    /// Parse a checksum-verified frame
    ///
    /// Returns `None` when the size or checksum is wrong; unrecognized
    /// but well-formed frames come back as [`Message::Unknown`].
    pub fn parse(frame: &[u8]) -> Option<Message> {
        if frame.len() < 2 || frame.len() != frame_size(frame[0]) || !is_checksum_valid(frame) {
            return None;
        }
        let header = frame[0];
        let message = match header {
            0x61 if frame[1] == 0x01 => Self::NormalOperationResumed,
            0x61 if frame[1] == 0x00 => Self::TrackPowerOff,
            0x81 if frame[1] == 0x00 => Self::EmergencyStop,
            0x21 if frame[1] == 0x81 => Self::ResumeOperationsRequest,
            0x21 if frame[1] == 0x80 => Self::StopOperationsRequest,
            0x80 => Self::StopAllLocomotivesRequest,
            0x92 => Self::EmergencyStopLocomotive {
                address: parse_address(frame[1], frame[2]),
            },
            _ if header & 0xF0 == ID_FEEDBACK_BROADCAST => {
                let pairs = frame[1..frame.len() - 1]
                    .chunks_exact(2)
                    .map(|chunk| FeedbackPair {
                        address: chunk[0],
                        data: chunk[1],
                    })
                    .collect();
                Self::FeedbackBroadcast(pairs)
            }
            0xE4 => {
                let identification = frame[1];
                let address = parse_address(frame[2], frame[3]);
                let db = frame[4];
                match identification {
                    0x10..=0x13 => {
                        let mode = match identification {
                            0x10 => SpeedStepMode::Steps14,
                            0x11 => SpeedStepMode::Steps27,
                            0x12 => SpeedStepMode::Steps28,
                            _ => SpeedStepMode::Steps128,
                        };
                        let raw = match mode {
                            SpeedStepMode::Steps14 => db & 0x0F,
                            SpeedStepMode::Steps128 => db & 0x7F,
                            SpeedStepMode::Steps27 | SpeedStepMode::Steps28 => {
                                ((db & 0x0F) << 1) | ((db >> 4) & 0x01)
                            }
                        };
                        Self::SpeedAndDirection {
                            address,
                            mode,
                            emergency_stop: raw == 1,
                            direction: if db & 0x80 != 0 {
                                Direction::Forward
                            } else {
                                Direction::Reverse
                            },
                            speed_step: if raw > 1 { raw - 1 } else { 0 },
                            f0: mode == SpeedStepMode::Steps14 && db & 0x10 != 0,
                        }
                    }
                    0x20..=0x23 => Self::FunctionGroup {
                        address,
                        group: identification - 0x1F,
                        functions: db,
                    },
                    0x28 => Self::FunctionGroup {
                        address,
                        group: 5,
                        functions: db,
                    },
                    0xF3 => Self::RocoFunctionF13F20 {
                        address,
                        functions: db,
                    },
                    _ => Self::Unknown(frame.to_vec()),
                }
            }
            0x52 => Self::AccessoryOperation {
                address: (u16::from(frame[1]) << 3) | u16::from(frame[2] & 0x07),
                activate: frame[2] & 0x40 != 0,
            },
            0xF2 if frame[1] == 0xF1 => Self::S88StartAddress(frame[2]),
            0xF2 if frame[1] == 0xF2 => Self::S88ModuleCount(frame[2]),
            _ => Self::Unknown(frame.to_vec()),
        };
        Some(message)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::NormalOperationResumed => "NormalOperationResumed",
            Self::TrackPowerOff => "TrackPowerOff",
            Self::EmergencyStop => "EmergencyStop",
            Self::FeedbackBroadcast(_) => "FeedbackBroadcast",
            Self::ResumeOperationsRequest => "ResumeOperationsRequest",
            Self::StopOperationsRequest => "StopOperationsRequest",
            Self::StopAllLocomotivesRequest => "StopAllLocomotivesRequest",
            Self::EmergencyStopLocomotive { .. } => "EmergencyStopLocomotive",
            Self::SpeedAndDirection { .. } => "SpeedAndDirection",
            Self::FunctionGroup { .. } => "FunctionGroup",
            Self::RocoFunctionF13F20 { .. } => "RocoFunctionF13F20",
            Self::AccessoryOperation { .. } => "AccessoryOperation",
            Self::S88StartAddress(_) => "S88StartAddress",
            Self::S88ModuleCount(_) => "S88ModuleCount",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Debug dump: message name plus hex bytes
    pub fn to_string_dump(&self) -> String {
        format!("{} [{}]", self.name(), hex_dump(&self.serialize()))
    }
}

/// Frame extractor for the serial/TCP byte stream
///
/// The low nibble of the first byte gives the frame length. A frame with
/// a bad checksum cannot be trusted as a length marker either, so one
/// byte is dropped and scanning resumes; the caller reports the dropped
/// count.
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
    /// Strip LI-USB `FF FE` / `FF FD` synchronization pairs
    pub strip_sync: bool,
}

impl Framer {
    pub fn new(strip_sync: bool) -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            strip_sync,
        }
    }

    /// Feed raw bytes; returns complete frames and the dropped byte count
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<Vec<u8>>, usize) {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut dropped = 0;

        loop {
            if self.strip_sync && self.buffer.len() >= 2 && self.buffer[0] == 0xFF {
                if self.buffer[1] == 0xFE || self.buffer[1] == 0xFD {
                    self.buffer.drain(..2);
                    continue;
                }
            }
            if self.buffer.is_empty() {
                break;
            }
            let size = frame_size(self.buffer[0]);
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
    fn test_fixed_frames_match_vendor_bytes() {
        assert_eq!(Message::NormalOperationResumed.serialize(), vec![0x61, 0x01, 0x60]);
        assert_eq!(Message::TrackPowerOff.serialize(), vec![0x61, 0x00, 0x61]);
        assert_eq!(Message::EmergencyStop.serialize(), vec![0x81, 0x00, 0x81]);
        assert_eq!(Message::ResumeOperationsRequest.serialize(), vec![0x21, 0x81, 0xA0]);
        assert_eq!(Message::StopOperationsRequest.serialize(), vec![0x21, 0x80, 0xA1]);
        assert_eq!(Message::StopAllLocomotivesRequest.serialize(), vec![0x80, 0x80]);
    }

    #[test]
    fn test_function_group_f9_f12_reference() {
        // F9..F12 group for short address 5 with F10 set
        let message = Message::FunctionGroup {
            address: 5,
            group: 3,
            functions: 0x02,
        };
        let frame = message.serialize();
        assert_eq!(&frame[..5], &[0xE4, 0x22, 0x00, 0x05, 0x02]);
        assert_eq!(frame[5], 0xE4 ^ 0x22 ^ 0x05 ^ 0x02);
        assert!(is_checksum_valid(&frame));
    }

    #[test]
    fn test_speed_and_direction_128_encoding() {
        let message = Message::SpeedAndDirection {
            address: 3,
            mode: SpeedStepMode::Steps128,
            emergency_stop: false,
            direction: Direction::Forward,
            speed_step: 63,
            f0: false,
        };
        let frame = message.serialize();
        assert_eq!(frame[0], 0xE4);
        assert_eq!(frame[1], 0x13);
        assert_eq!(frame[4], 0x80 | 0x40); // forward, step 63 -> raw 64
        assert_eq!(Message::parse(&frame), Some(message));
    }

    #[test]
    fn test_speed_and_direction_28_round_trip() {
        for step in 0..=28u8 {
            let message = Message::SpeedAndDirection {
                address: 1234,
                mode: SpeedStepMode::Steps28,
                emergency_stop: false,
                direction: Direction::Reverse,
                speed_step: step,
                f0: false,
            };
            assert_eq!(Message::parse(&message.serialize()), Some(message));
        }
    }

    #[test]
    fn test_emergency_stop_locomotive_round_trip() {
        for address in [1u16, 99, 100, 9999] {
            let message = Message::EmergencyStopLocomotive { address };
            assert_eq!(Message::parse(&message.serialize()), Some(message));
        }
    }

    #[test]
    fn test_feedback_broadcast_round_trip() {
        let mut pair = FeedbackPair::new(17, FeedbackType::FeedbackModule);
        pair.set_status(0, true);
        pair.set_status(3, true);
        let message = Message::FeedbackBroadcast(vec![pair]);
        let frame = message.serialize();
        assert_eq!(frame[0], 0x42);
        assert_eq!(Message::parse(&frame), Some(message));
    }

    #[test]
    fn test_feedback_pair_accessors() {
        let mut pair = FeedbackPair::new(511, FeedbackType::FeedbackModule);
        assert_eq!(pair.group_address(), 511);
        assert!(matches!(pair.feedback_type(), FeedbackType::FeedbackModule));
        pair.set_status(2, true);
        assert_eq!(pair.status_nibble(), 0x04);
        pair.set_status(2, false);
        assert_eq!(pair.status_nibble(), 0x00);
    }

    #[test]
    fn test_accessory_operation_round_trip() {
        let message = Message::AccessoryOperation {
            address: 100,
            activate: true,
        };
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_checksum_mutation_invalidates() {
        let frame = Message::NormalOperationResumed.serialize();
        for i in 0..frame.len() {
            let mut mutated = frame.clone();
            mutated[i] ^= 0x01;
            assert!(!is_checksum_valid(&mutated), "mutating byte {} still valid", i);
        }
    }

    #[test]
    fn test_framer_resyncs_on_garbage() {
        let mut framer = Framer::new(false);
        let mut stream = vec![0x07, 0x99]; // garbage
        stream.extend(Message::TrackPowerOff.serialize());
        let (frames, dropped) = framer.feed(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(dropped, 2);
        assert_eq!(Message::parse(&frames[0]), Some(Message::TrackPowerOff));
    }

    #[test]
    fn test_framer_handles_partial_frames() {
        let mut framer = Framer::new(false);
        let frame = Message::NormalOperationResumed.serialize();
        let (frames, _) = framer.feed(&frame[..2]);
        assert!(frames.is_empty());
        let (frames, dropped) = framer.feed(&frame[2..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_framer_strips_li_usb_sync() {
        let mut framer = Framer::new(true);
        let mut stream = vec![0xFF, 0xFE];
        stream.extend(Message::TrackPowerOff.serialize());
        let (frames, dropped) = framer.feed(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(dropped, 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_speed_round_trip(
            address in 1u16..=99,
            step in 0u8..=126,
            forward in proptest::bool::ANY,
        ) {
            let message = Message::SpeedAndDirection {
                address,
                mode: SpeedStepMode::Steps128,
                emergency_stop: false,
                direction: if forward { Direction::Forward } else { Direction::Reverse },
                speed_step: step,
                f0: false,
            };
            proptest::prop_assert_eq!(Message::parse(&message.serialize()), Some(message));
        }

        #[test]
        fn prop_single_bit_flip_breaks_checksum(
            address in 1u16..=99,
            functions in proptest::num::u8::ANY,
            byte in 0usize..6,
            bit in 0u8..8,
        ) {
            let mut frame = Message::FunctionGroup {
                address,
                group: 3,
                functions,
            }
            .serialize();
            let idx = byte % frame.len();
            frame[idx] ^= 1 << bit;
            proptest::prop_assert!(!is_checksum_valid(&frame));
        }
    }

    #[test]
    fn test_s88_config_frames() {
        assert_eq!(Message::S88StartAddress(64).serialize(), {
            let mut frame = vec![0xF2, 0xF1, 64, 0];
            frame[3] = calc_checksum(&frame);
            frame
        });
        let message = Message::S88ModuleCount(2);
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }
}
