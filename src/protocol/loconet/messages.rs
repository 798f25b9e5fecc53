//! LocoNet message codec
//!
//! Opcode high bits encode the frame length: `0x80..0x9F` two bytes,
//! `0xA0..0xBF` four, `0xC0..0xDF` six, `0xE0..` variable with the
//! length in the second byte. The check byte is the ones' complement of
//! the XOR over all preceding bytes, so a valid frame XORs to `0xFF`.

use crate::core::Direction;
use crate::protocol::hex_dump;

pub const OPC_GPOFF: u8 = 0x82;
pub const OPC_GPON: u8 = 0x83;
pub const OPC_IDLE: u8 = 0x85;
pub const OPC_LOCO_SPD: u8 = 0xA0;
pub const OPC_LOCO_DIRF: u8 = 0xA1;
pub const OPC_LOCO_SND: u8 = 0xA2;
pub const OPC_SW_REQ: u8 = 0xB0;
pub const OPC_INPUT_REP: u8 = 0xB2;
pub const OPC_LONG_ACK: u8 = 0xB4;
pub const OPC_MOVE_SLOTS: u8 = 0xBA;
pub const OPC_RQ_SL_DATA: u8 = 0xBB;
pub const OPC_LOCO_ADR: u8 = 0xBF;
pub const OPC_PEER_XFER: u8 = 0xE5;
pub const OPC_SL_RD_DATA: u8 = 0xE7;
pub const OPC_WR_SL_DATA: u8 = 0xEF;

/// Slot number of the fast clock
pub const FAST_CLOCK_SLOT: u8 = 0x7B;

pub const SLOT_MIN: u8 = 1;
pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 4096;
pub const SWITCH_ADDRESS_MIN: u32 = 1;
pub const SWITCH_ADDRESS_MAX: u32 = 2048;
pub const ADDRESS_MAX: u16 = 9983;

/// Expected total frame length for an opcode, `None` when the second
/// byte carries it
pub fn frame_size(opcode: u8) -> Option<usize> {
    match opcode & 0x60 {
        0x00 => Some(2),
        0x20 => Some(4),
        0x40 => Some(6),
        _ => None,
    }
}

/// Check byte: ones' complement of the XOR over all preceding bytes
pub fn calc_checksum(frame: &[u8]) -> u8 {
    0xFF ^ frame[..frame.len() - 1].iter().fold(0u8, |acc, b| acc ^ b)
}

/// A valid frame XORs to 0xFF over all bytes
pub fn is_checksum_valid(frame: &[u8]) -> bool {
    frame.len() >= 2 && frame.iter().fold(0u8, |acc, b| acc ^ b) == 0xFF
}

/// Command station slot record (read and write share the layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotData {
    pub slot: u8,
    pub stat1: u8,
    pub address: u16,
    pub speed: u8,
    pub dirf: u8,
    pub snd: u8,
}

impl SlotData {
    pub const STAT1_IN_USE: u8 = 0x30;

    pub fn in_use(&self) -> bool {
        self.stat1 & Self::STAT1_IN_USE == Self::STAT1_IN_USE
    }

    pub fn direction(&self) -> Direction {
        if self.dirf & 0x20 != 0 {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }
}

/// Fast clock slot contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastClock {
    /// Clock speed ratio, 0 pauses the clock
    pub rate: u8,
    pub hours: u8,
    pub minutes: u8,
}

/// One LocoNet message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Global power on
    PowerOn,
    /// Global power off
    PowerOff,
    /// Force idle, emergency stop all locomotives
    Idle,
    LocoSpeed {
        slot: u8,
        /// 0 stop, 1 emergency stop, 2..=127 real speeds
        speed: u8,
    },
    LocoDirFunc {
        slot: u8,
        direction: Direction,
        f0: bool,
        f1: bool,
        f2: bool,
        f3: bool,
        f4: bool,
    },
    LocoSound {
        slot: u8,
        f5: bool,
        f6: bool,
        f7: bool,
        f8: bool,
    },
    SwitchRequest {
        /// 0-based 11 bit accessory address
        address: u16,
        thrown: bool,
        on: bool,
    },
    InputReport {
        /// 0-based sensor address
        address: u16,
        value: bool,
    },
    LongAck {
        opcode: u8,
        ack: u8,
    },
    MoveSlots {
        source: u8,
        destination: u8,
    },
    RequestSlotData {
        slot: u8,
    },
    /// Request a slot for a locomotive address
    LocoAddress {
        address: u16,
    },
    SlotReadData(SlotData),
    SlotWriteData(SlotData),
    FastClockRead(FastClock),
    FastClockWrite(FastClock),
    /// Uhlenbrock LNCV programming, tunneled through peer transfer
    Lncv(LncvMessage),
    /// Checksum-valid frame this codec does not model
    Unknown(Vec<u8>),
}

/// LNCV programming sub-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LncvMessage {
    /// Open a programming session on a module type (+ its address)
    Start { module_id: u16, module_address: u16 },
    Read { module_id: u16, lncv: u16 },
    ReadResponse { module_id: u16, lncv: u16, value: u16 },
    Write { module_id: u16, lncv: u16, value: u16 },
    Stop { module_id: u16, module_address: u16 },
}

impl LncvMessage {
    const CMD_START: u8 = 0x21;
    const CMD_READ: u8 = 0x22;
    const CMD_READ_RESPONSE: u8 = 0x1F;
    const CMD_WRITE: u8 = 0x20;
    const CMD_STOP: u8 = 0x23;

    fn command(&self) -> u8 {
        match self {
            Self::Start { .. } => Self::CMD_START,
            Self::Read { .. } => Self::CMD_READ,
            Self::ReadResponse { .. } => Self::CMD_READ_RESPONSE,
            Self::Write { .. } => Self::CMD_WRITE,
            Self::Stop { .. } => Self::CMD_STOP,
        }
    }

    fn words(&self) -> (u16, u16, u16) {
        match *self {
            Self::Start {
                module_id,
                module_address,
            }
            | Self::Stop {
                module_id,
                module_address,
            } => (module_id, 0, module_address),
            Self::Read { module_id, lncv } => (module_id, lncv, 0),
            Self::ReadResponse {
                module_id,
                lncv,
                value,
            }
            | Self::Write {
                module_id,
                lncv,
                value,
            } => (module_id, lncv, value),
        }
    }

    fn from_parts(command: u8, words: (u16, u16, u16)) -> Option<Self> {
        let (module_id, lncv, value) = words;
        let message = match command {
            Self::CMD_START => Self::Start {
                module_id,
                module_address: value,
            },
            Self::CMD_READ => Self::Read { module_id, lncv },
            Self::CMD_READ_RESPONSE => Self::ReadResponse {
                module_id,
                lncv,
                value,
            },
            Self::CMD_WRITE => Self::Write {
                module_id,
                lncv,
                value,
            },
            Self::CMD_STOP => Self::Stop {
                module_id,
                module_address: value,
            },
            _ => return None,
        };
        Some(message)
    }
}

/// Pack eight data bytes into seven 7-bit bytes plus a high-bit carrier
///
/// LocoNet payload bytes may not have bit 7 set; peer transfer moves the
/// high bits into a leading `PXCT` byte.
fn pack_peer_data(data: [u8; 7]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, byte) in data.iter().enumerate() {
        out[i + 1] = byte & 0x7F;
        if byte & 0x80 != 0 {
            out[0] |= 1 << i;
        }
    }
    out
}

fn unpack_peer_data(packed: &[u8]) -> [u8; 7] {
    let mut out = [0u8; 7];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = packed[i + 1] & 0x7F;
        if packed[0] & (1 << i) != 0 {
            *slot |= 0x80;
        }
    }
    out
}

fn slot_data_bytes(opcode: u8, data: &SlotData) -> Vec<u8> {
    vec![
        opcode,
        0x0E,
        data.slot,
        data.stat1,
        (data.address & 0x7F) as u8,
        data.speed & 0x7F,
        data.dirf & 0x7F,
        0x00, // trk
        0x00, // ss2
        (data.address >> 7) as u8 & 0x7F,
        data.snd & 0x0F,
        0x00, // id1
        0x00, // id2
        0x00,
    ]
}

fn fast_clock_bytes(opcode: u8, clock: &FastClock) -> Vec<u8> {
    vec![
        opcode,
        0x0E,
        FAST_CLOCK_SLOT,
        clock.rate & 0x7F,
        0x00, // frac_minsl
        0x00, // frac_minsh
        (256u16 - 60 + u16::from(clock.minutes % 60)) as u8 & 0x7F,
        0x00, // trk
        (256u16 - 24 + u16::from(clock.hours % 24)) as u8 & 0x7F,
        0x00, // days
        0x40, // clock running
        0x00, // id1
        0x00, // id2
        0x00,
    ]
}

impl Message {
    /// Serialize to a checksummed frame
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = match self {
            Self::PowerOn => vec![OPC_GPON, 0],
            Self::PowerOff => vec![OPC_GPOFF, 0],
            Self::Idle => vec![OPC_IDLE, 0],
            Self::LocoSpeed { slot, speed } => vec![OPC_LOCO_SPD, *slot, speed & 0x7F, 0],
            Self::LocoDirFunc {
                slot,
                direction,
                f0,
                f1,
                f2,
                f3,
                f4,
            } => {
                let mut dirf = 0u8;
                if *direction == Direction::Reverse {
                    dirf |= 0x20;
                }
                if *f0 {
                    dirf |= 0x10;
                }
                for (i, f) in [f1, f2, f3, f4].into_iter().enumerate() {
                    if *f {
                        dirf |= 1 << i;
                    }
                }
                vec![OPC_LOCO_DIRF, *slot, dirf, 0]
            }
            Self::LocoSound { slot, f5, f6, f7, f8 } => {
                let mut snd = 0u8;
                for (i, f) in [f5, f6, f7, f8].into_iter().enumerate() {
                    if *f {
                        snd |= 1 << i;
                    }
                }
                vec![OPC_LOCO_SND, *slot, snd, 0]
            }
            Self::SwitchRequest { address, thrown, on } => {
                debug_assert!(*address < 2048);
                let sw1 = (address & 0x7F) as u8;
                let mut sw2 = ((address >> 7) & 0x0F) as u8;
                if *thrown {
                    sw2 |= 0x20;
                }
                if *on {
                    sw2 |= 0x10;
                }
                vec![OPC_SW_REQ, sw1, sw2, 0]
            }
            Self::InputReport { address, value } => {
                let in1 = ((address >> 1) & 0x7F) as u8;
                let mut in2 = ((address >> 8) & 0x0F) as u8;
                if address & 1 != 0 {
                    in2 |= 0x20;
                }
                if *value {
                    in2 |= 0x10;
                }
                // source bit: sensor report
                in2 |= 0x40;
                vec![OPC_INPUT_REP, in1, in2, 0]
            }
            Self::LongAck { opcode, ack } => vec![OPC_LONG_ACK, opcode & 0x7F, *ack, 0],
            Self::MoveSlots {
                source,
                destination,
            } => vec![OPC_MOVE_SLOTS, *source, *destination, 0],
            Self::RequestSlotData { slot } => vec![OPC_RQ_SL_DATA, *slot, 0, 0],
            Self::LocoAddress { address } => vec![
                OPC_LOCO_ADR,
                (address >> 7) as u8 & 0x7F,
                (address & 0x7F) as u8,
                0,
            ],
            Self::SlotReadData(data) => slot_data_bytes(OPC_SL_RD_DATA, data),
            Self::SlotWriteData(data) => slot_data_bytes(OPC_WR_SL_DATA, data),
            Self::FastClockRead(clock) => fast_clock_bytes(OPC_SL_RD_DATA, clock),
            Self::FastClockWrite(clock) => fast_clock_bytes(OPC_WR_SL_DATA, clock),
            Self::Lncv(lncv) => {
                let (w1, w2, w3) = lncv.words();
                let data = pack_peer_data([
                    lncv.command(),
                    (w1 & 0xFF) as u8,
                    (w1 >> 8) as u8,
                    (w2 & 0xFF) as u8,
                    (w2 >> 8) as u8,
                    (w3 & 0xFF) as u8,
                    (w3 >> 8) as u8,
                ]);
                let mut frame = vec![OPC_PEER_XFER, 0x0F, 0x01, 0x05, 0x00];
                frame.extend_from_slice(&data);
                frame.push(0);
                frame
            }
            Self::Unknown(frame) => return frame.clone(),
        };
        let len = frame.len();
        frame[len - 1] = calc_checksum(&frame);
        frame
    }

    /// Parse a checksum-verified frame
    pub fn parse(frame: &[u8]) -> Option<Message> {
        if frame.len() < 2 || !is_checksum_valid(frame) {
            return None;
        }
        let opcode = frame[0];
        if let Some(size) = frame_size(opcode) {
            if frame.len() != size {
                return None;
            }
        } else if frame.len() != frame[1] as usize {
            return None;
        }

        let message = match opcode {
            OPC_GPON => Self::PowerOn,
            OPC_GPOFF => Self::PowerOff,
            OPC_IDLE => Self::Idle,
            OPC_LOCO_SPD => Self::LocoSpeed {
                slot: frame[1],
                speed: frame[2],
            },
            OPC_LOCO_DIRF => {
                let dirf = frame[2];
                Self::LocoDirFunc {
                    slot: frame[1],
                    direction: if dirf & 0x20 != 0 {
                        Direction::Reverse
                    } else {
                        Direction::Forward
                    },
                    f0: dirf & 0x10 != 0,
                    f1: dirf & 0x01 != 0,
                    f2: dirf & 0x02 != 0,
                    f3: dirf & 0x04 != 0,
                    f4: dirf & 0x08 != 0,
                }
            }
            OPC_LOCO_SND => {
                let snd = frame[2];
                Self::LocoSound {
                    slot: frame[1],
                    f5: snd & 0x01 != 0,
                    f6: snd & 0x02 != 0,
                    f7: snd & 0x04 != 0,
                    f8: snd & 0x08 != 0,
                }
            }
            OPC_SW_REQ => {
                let address = u16::from(frame[1] & 0x7F) | (u16::from(frame[2] & 0x0F) << 7);
                Self::SwitchRequest {
                    address,
                    thrown: frame[2] & 0x20 != 0,
                    on: frame[2] & 0x10 != 0,
                }
            }
            OPC_INPUT_REP => {
                let half = u16::from(frame[1] & 0x7F) | (u16::from(frame[2] & 0x0F) << 7);
                let address = (half << 1) | u16::from(frame[2] & 0x20 != 0);
                Self::InputReport {
                    address,
                    value: frame[2] & 0x10 != 0,
                }
            }
            OPC_LONG_ACK => Self::LongAck {
                opcode: frame[1],
                ack: frame[2],
            },
            OPC_MOVE_SLOTS => Self::MoveSlots {
                source: frame[1],
                destination: frame[2],
            },
            OPC_RQ_SL_DATA => Self::RequestSlotData { slot: frame[1] },
            OPC_LOCO_ADR => Self::LocoAddress {
                address: (u16::from(frame[1] & 0x7F) << 7) | u16::from(frame[2] & 0x7F),
            },
            OPC_SL_RD_DATA | OPC_WR_SL_DATA if frame.len() == 14 => {
                if frame[2] == FAST_CLOCK_SLOT {
                    let clock = FastClock {
                        rate: frame[3] & 0x7F,
                        minutes: (60 - (256u16 - u16::from(frame[6] | 0x80)) as u8).min(59),
                        hours: (24 - (256u16 - u16::from(frame[8] | 0x80)) as u8) % 24,
                    };
                    if opcode == OPC_SL_RD_DATA {
                        Self::FastClockRead(clock)
                    } else {
                        Self::FastClockWrite(clock)
                    }
                } else {
                    let data = SlotData {
                        slot: frame[2],
                        stat1: frame[3],
                        address: u16::from(frame[4] & 0x7F) | (u16::from(frame[9] & 0x7F) << 7),
                        speed: frame[5] & 0x7F,
                        dirf: frame[6] & 0x7F,
                        snd: frame[10] & 0x0F,
                    };
                    if opcode == OPC_SL_RD_DATA {
                        Self::SlotReadData(data)
                    } else {
                        Self::SlotWriteData(data)
                    }
                }
            }
            OPC_PEER_XFER if frame.len() == 15 && frame[2] == 0x01 && frame[3] == 0x05 => {
                let data = unpack_peer_data(&frame[5..13]);
                let words = (
                    u16::from(data[1]) | (u16::from(data[2]) << 8),
                    u16::from(data[3]) | (u16::from(data[4]) << 8),
                    u16::from(data[5]) | (u16::from(data[6]) << 8),
                );
                match LncvMessage::from_parts(data[0], words) {
                    Some(lncv) => Self::Lncv(lncv),
                    None => Self::Unknown(frame.to_vec()),
                }
            }
            _ => Self::Unknown(frame.to_vec()),
        };
        Some(message)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::PowerOn => "OPC_GPON",
            Self::PowerOff => "OPC_GPOFF",
            Self::Idle => "OPC_IDLE",
            Self::LocoSpeed { .. } => "OPC_LOCO_SPD",
            Self::LocoDirFunc { .. } => "OPC_LOCO_DIRF",
            Self::LocoSound { .. } => "OPC_LOCO_SND",
            Self::SwitchRequest { .. } => "OPC_SW_REQ",
            Self::InputReport { .. } => "OPC_INPUT_REP",
            Self::LongAck { .. } => "OPC_LONG_ACK",
            Self::MoveSlots { .. } => "OPC_MOVE_SLOTS",
            Self::RequestSlotData { .. } => "OPC_RQ_SL_DATA",
            Self::LocoAddress { .. } => "OPC_LOCO_ADR",
            Self::SlotReadData(_) => "OPC_SL_RD_DATA",
            Self::SlotWriteData(_) => "OPC_WR_SL_DATA",
            Self::FastClockRead(_) => "OPC_SL_RD_DATA (fast clock)",
            Self::FastClockWrite(_) => "OPC_WR_SL_DATA (fast clock)",
            Self::Lncv(_) => "OPC_PEER_XFER (LNCV)",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Debug dump: message name plus hex bytes
    pub fn to_string_dump(&self) -> String {
        format!("{} [{}]", self.name(), hex_dump(&self.serialize()))
    }
}

/// Frame extractor for the LocoNet byte stream
///
/// Resynchronizes on the next byte with the opcode bit set when a
/// checksum fails; the caller reports the dropped count.
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
            // an opcode always has bit 7 set
            let start = self.buffer.iter().position(|b| b & 0x80 != 0);
            match start {
                Some(0) => {}
                Some(n) => {
                    dropped += n;
                    self.buffer.drain(..n);
                }
                None => {
                    dropped += self.buffer.len();
                    self.buffer.clear();
                    break;
                }
            }
            if self.buffer.is_empty() {
                break;
            }
            let size = match frame_size(self.buffer[0]) {
                Some(size) => size,
                None => {
                    if self.buffer.len() < 2 {
                        break;
                    }
                    let size = self.buffer[1] as usize;
                    if size < 2 {
                        self.buffer.remove(0);
                        dropped += 1;
                        continue;
                    }
                    size
                }
            };
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
    fn test_power_frames_match_vendor_bytes() {
        assert_eq!(Message::PowerOn.serialize(), vec![0x83, 0x7C]);
        assert_eq!(Message::PowerOff.serialize(), vec![0x82, 0x7D]);
        assert_eq!(Message::Idle.serialize(), vec![0x85, 0x7A]);
    }

    #[test]
    fn test_checksum_xors_to_ff() {
        for message in [
            Message::PowerOn,
            Message::LocoSpeed { slot: 5, speed: 64 },
            Message::LocoAddress { address: 1234 },
        ] {
            let frame = message.serialize();
            assert_eq!(frame.iter().fold(0u8, |acc, b| acc ^ b), 0xFF);
        }
    }

    #[test]
    fn test_checksum_mutation_invalidates() {
        let frame = Message::LocoSpeed { slot: 5, speed: 64 }.serialize();
        for i in 0..frame.len() {
            let mut mutated = frame.clone();
            mutated[i] ^= 0x01;
            assert!(!is_checksum_valid(&mutated));
        }
    }

    #[test]
    fn test_loco_dirf_round_trip() {
        let message = Message::LocoDirFunc {
            slot: 9,
            direction: Direction::Reverse,
            f0: true,
            f1: false,
            f2: true,
            f3: false,
            f4: true,
        };
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_input_report_round_trip() {
        for address in [0u16, 1, 2047, 4095] {
            for value in [false, true] {
                let message = Message::InputReport { address, value };
                assert_eq!(Message::parse(&message.serialize()), Some(message));
            }
        }
    }

    #[test]
    fn test_switch_request_round_trip() {
        let message = Message::SwitchRequest {
            address: 1000,
            thrown: true,
            on: true,
        };
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_slot_data_round_trip() {
        let message = Message::SlotReadData(SlotData {
            slot: 7,
            stat1: SlotData::STAT1_IN_USE,
            address: 4711,
            speed: 42,
            dirf: 0x30,
            snd: 0x05,
        });
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_fast_clock_round_trip() {
        let message = Message::FastClockWrite(FastClock {
            rate: 10,
            hours: 13,
            minutes: 37,
        });
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_lncv_round_trip() {
        for lncv in [
            LncvMessage::Start {
                module_id: 5033,
                module_address: 1,
            },
            LncvMessage::Read {
                module_id: 5033,
                lncv: 2,
            },
            LncvMessage::ReadResponse {
                module_id: 5033,
                lncv: 2,
                value: 0x1234,
            },
            LncvMessage::Write {
                module_id: 5033,
                lncv: 2,
                value: 768,
            },
            LncvMessage::Stop {
                module_id: 5033,
                module_address: 1,
            },
        ] {
            let message = Message::Lncv(lncv);
            assert_eq!(Message::parse(&message.serialize()), Some(message));
        }
    }

    #[test]
    fn test_framer_resync_and_partials() {
        let mut framer = Framer::new();
        let frame = Message::LocoSpeed { slot: 3, speed: 10 }.serialize();
        let mut stream = vec![0x01, 0x02]; // garbage without opcode bit
        stream.extend_from_slice(&frame[..2]);
        let (frames, dropped) = framer.feed(&stream);
        assert!(frames.is_empty());
        assert_eq!(dropped, 2);
        let (frames, dropped) = framer.feed(&frame[2..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(dropped, 0);
        assert_eq!(frames[0], frame);
    }

    #[test]
    fn test_peer_data_packing() {
        let data = [0x80, 0x01, 0xFF, 0x00, 0x7F, 0xAA, 0x55];
        assert_eq!(unpack_peer_data(&pack_peer_data(data)), data);
    }
}
