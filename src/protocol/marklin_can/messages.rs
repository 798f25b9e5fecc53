//! Märklin CAN record codec
//!
//! Record layout: CAN id (4 bytes big endian), DLC, 8 data bytes.
//! The CAN id packs `priority (4) | command (8) | response (1) |
//! hash (16)`. Locomotives are addressed by UID: the protocol selects a
//! base offset the track address is added to.

use crate::core::Direction;
use crate::protocol::hex_dump;

pub const RECORD_SIZE: usize = 13;

/// Command codes
pub mod command {
    pub const SYSTEM: u8 = 0x00;
    pub const LOCO_SPEED: u8 = 0x04;
    pub const LOCO_DIRECTION: u8 = 0x05;
    pub const LOCO_FUNCTION: u8 = 0x06;
    pub const ACCESSORY_SWITCH: u8 = 0x0B;
    pub const S88_EVENT: u8 = 0x11;
    pub const PING: u8 = 0x18;
    pub const STATUS_DATA_CONFIG: u8 = 0x1D;
}

/// `SYSTEM` sub-commands, first data byte after the UID
pub mod system_subcommand {
    pub const STOP: u8 = 0x00;
    pub const GO: u8 = 0x01;
    pub const HALT: u8 = 0x02;
}

/// UID base offsets per addressing protocol
pub mod uid_base {
    pub const MOTOROLA: u32 = 0x0000;
    pub const SELECTRIX: u32 = 0x0800;
    pub const MFX: u32 = 0x4000;
    pub const DCC: u32 = 0xC000;
    pub const ACCESSORY_MOTOROLA: u32 = 0x3000;
    pub const ACCESSORY_DCC: u32 = 0x3800;
}

/// Hash chunks of a fragmented status data reply start here
pub const STATUS_DATA_CHUNK_HASH: u16 = 0x0301;

/// Sender hash derived from a UID
///
/// The two UID halves are folded and the CS2 marker bits forced so the
/// hash never collides with the fragment hash window.
pub fn hash_from_uid(uid: u32) -> u16 {
    let folded = ((uid >> 16) ^ (uid & 0xFFFF)) as u16;
    (folded & 0xFF7F) | 0x0300
}

/// One CAN record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub priority: u8,
    pub command: u8,
    pub response: bool,
    pub hash: u16,
    pub dlc: u8,
    pub data: [u8; 8],
}

impl Message {
    pub fn new(command: u8, response: bool, hash: u16) -> Self {
        Self {
            priority: 0,
            command,
            response,
            hash,
            dlc: 0,
            data: [0; 8],
        }
    }

    /// Record with the destination UID in the first four data bytes
    pub fn with_uid(command: u8, response: bool, hash: u16, uid: u32) -> Self {
        let mut message = Self::new(command, response, hash);
        message.dlc = 4;
        message.data[..4].copy_from_slice(&uid.to_be_bytes());
        message
    }

    pub fn uid(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn serialize(&self) -> [u8; RECORD_SIZE] {
        let id: u32 = (u32::from(self.priority & 0x0F) << 25)
            | (u32::from(self.command) << 17)
            | (u32::from(self.response) << 16)
            | u32::from(self.hash);
        let mut out = [0u8; RECORD_SIZE];
        out[..4].copy_from_slice(&id.to_be_bytes());
        out[4] = self.dlc;
        out[5..13].copy_from_slice(&self.data);
        out
    }

    pub fn parse(record: &[u8]) -> Option<Self> {
        if record.len() < RECORD_SIZE {
            return None;
        }
        let id = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let mut data = [0u8; 8];
        data.copy_from_slice(&record[5..13]);
        let dlc = record[4];
        if dlc > 8 {
            return None;
        }
        Some(Self {
            priority: ((id >> 25) & 0x0F) as u8,
            command: ((id >> 17) & 0xFF) as u8,
            response: id & 0x0001_0000 != 0,
            hash: (id & 0xFFFF) as u16,
            dlc,
            data,
        })
    }

    /// Debug dump: command name plus hex bytes
    pub fn to_string_dump(&self) -> String {
        let name = match self.command {
            command::SYSTEM => "System",
            command::LOCO_SPEED => "LocoSpeed",
            command::LOCO_DIRECTION => "LocoDirection",
            command::LOCO_FUNCTION => "LocoFunction",
            command::ACCESSORY_SWITCH => "AccessorySwitch",
            command::S88_EVENT => "S88Event",
            command::PING => "Ping",
            command::STATUS_DATA_CONFIG => "StatusDataConfig",
            _ => "unknown",
        };
        format!(
            "{}{} [{}]",
            name,
            if self.response { " (response)" } else { "" },
            hex_dump(&self.serialize())
        )
    }
}

// === builders ===

pub fn system_stop(hash: u16, uid: u32) -> Message {
    system(hash, uid, system_subcommand::STOP)
}

pub fn system_go(hash: u16, uid: u32) -> Message {
    system(hash, uid, system_subcommand::GO)
}

pub fn system_halt(hash: u16, uid: u32) -> Message {
    system(hash, uid, system_subcommand::HALT)
}

fn system(hash: u16, uid: u32, subcommand: u8) -> Message {
    let mut message = Message::with_uid(command::SYSTEM, false, hash, uid);
    message.dlc = 5;
    message.data[4] = subcommand;
    message
}

/// Speed is 0..=1000 on the wire
pub fn loco_speed(hash: u16, loco_uid: u32, speed: u16) -> Message {
    let mut message = Message::with_uid(command::LOCO_SPEED, false, hash, loco_uid);
    message.dlc = 6;
    message.data[4..6].copy_from_slice(&speed.min(1000).to_be_bytes());
    message
}

pub fn loco_direction(hash: u16, loco_uid: u32, direction: Direction) -> Message {
    let mut message = Message::with_uid(command::LOCO_DIRECTION, false, hash, loco_uid);
    message.dlc = 5;
    message.data[4] = match direction {
        Direction::Forward => 1,
        Direction::Reverse => 2,
    };
    message
}

pub fn loco_function(hash: u16, loco_uid: u32, function: u8, value: bool) -> Message {
    let mut message = Message::with_uid(command::LOCO_FUNCTION, false, hash, loco_uid);
    message.dlc = 6;
    message.data[4] = function;
    message.data[5] = u8::from(value);
    message
}

/// `position` selects the coil (0 = round/red, 1 = straight/green)
pub fn accessory_switch(hash: u16, accessory_uid: u32, position: u8, current: bool) -> Message {
    let mut message = Message::with_uid(command::ACCESSORY_SWITCH, false, hash, accessory_uid);
    message.dlc = 6;
    message.data[4] = position;
    message.data[5] = u8::from(current);
    message
}

pub fn ping(hash: u16) -> Message {
    Message::new(command::PING, false, hash)
}

/// Probe one status data index of a node
pub fn status_data_config(hash: u16, node_uid: u32, index: u8) -> Message {
    let mut message = Message::with_uid(command::STATUS_DATA_CONFIG, false, hash, node_uid);
    message.dlc = 5;
    message.data[4] = index;
    message
}

/// Decoded S88 event payload
pub struct S88Event {
    pub device: u16,
    pub contact: u16,
    pub old_value: bool,
    pub value: bool,
}

pub fn parse_s88_event(message: &Message) -> Option<S88Event> {
    if message.command != command::S88_EVENT || message.dlc < 6 {
        return None;
    }
    Some(S88Event {
        device: u16::from_be_bytes([message.data[0], message.data[1]]),
        contact: u16::from_be_bytes([message.data[2], message.data[3]]),
        old_value: message.data[4] != 0,
        value: message.data[5] != 0,
    })
}

pub fn build_s88_event(hash: u16, device: u16, contact: u16, old_value: bool, value: bool) -> Message {
    let mut message = Message::new(command::S88_EVENT, true, hash);
    message.dlc = 6;
    message.data[..2].copy_from_slice(&device.to_be_bytes());
    message.data[2..4].copy_from_slice(&contact.to_be_bytes());
    message.data[4] = u8::from(old_value);
    message.data[5] = u8::from(value);
    message
}

/// Record extractor: fixed 13-byte records, no resynchronization needed
/// on a stream that starts aligned
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Message> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        while self.buffer.len() >= RECORD_SIZE {
            if let Some(message) = Message::parse(&self.buffer[..RECORD_SIZE]) {
                messages.push(message);
            }
            self.buffer.drain(..RECORD_SIZE);
        }
        messages
    }
}

// === status data assembly ===

/// Device description assembled from status data index 0
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDescription {
    pub readings_count: u8,
    pub configuration_channels: u8,
    pub serial_number: u32,
    pub article_number: String,
    pub device_name: String,
}

impl DeviceDescription {
    /// Decode the assembled payload of status data index 0
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let article_end = bytes[8..16]
            .iter()
            .position(|&b| b == 0)
            .map(|p| 8 + p)
            .unwrap_or(16);
        let name_end = bytes[16..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| 16 + p)
            .unwrap_or(bytes.len());
        Some(Self {
            readings_count: bytes[0],
            configuration_channels: bytes[1],
            serial_number: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            article_number: String::from_utf8_lossy(&bytes[8..article_end]).into_owned(),
            device_name: String::from_utf8_lossy(&bytes[16..name_end]).into_owned(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.readings_count, self.configuration_channels, 0, 0];
        out.extend_from_slice(&self.serial_number.to_be_bytes());
        let mut article = self.article_number.clone().into_bytes();
        article.resize(8, 0);
        out.extend_from_slice(&article);
        out.extend_from_slice(self.device_name.as_bytes());
        out.push(0);
        out
    }
}

/// Reassembles fragmented status data config replies
///
/// Data chunks arrive as records with hashes counting up from
/// [`STATUS_DATA_CHUNK_HASH`]; the closing response (dlc 6) carries the
/// index and expected packet count.
#[derive(Default)]
pub struct StatusDataAssembler {
    chunks: Vec<[u8; 8]>,
}

impl StatusDataAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record; returns `(index, payload)` when complete
    pub fn feed(&mut self, message: &Message) -> Option<(u8, Vec<u8>)> {
        if message.command != command::STATUS_DATA_CONFIG {
            return None;
        }
        if message.dlc == 8 && message.hash >= STATUS_DATA_CHUNK_HASH {
            self.chunks.push(message.data);
            return None;
        }
        if message.response && message.dlc >= 6 {
            let index = message.data[4];
            let expected = message.data[5] as usize;
            let payload: Vec<u8> = self
                .chunks
                .drain(..)
                .take(expected.max(1))
                .flatten()
                .collect();
            return Some((index, payload));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let message = loco_speed(hash_from_uid(0xDEADBEEF), uid_base::DCC + 3, 500);
        let record = message.serialize();
        assert_eq!(record.len(), RECORD_SIZE);
        assert_eq!(Message::parse(&record), Some(message));
    }

    #[test]
    fn test_can_id_packing() {
        let message = system_go(0x0310, 0);
        let record = message.serialize();
        // priority 0, command 0x00, no response, hash 0x0310
        assert_eq!(&record[..4], &[0x00, 0x00, 0x03, 0x10]);
        assert_eq!(record[4], 5);
        assert_eq!(record[9], system_subcommand::GO);
    }

    #[test]
    fn test_response_bit() {
        let mut message = ping(0x0300);
        message.response = true;
        let parsed = Message::parse(&message.serialize()).unwrap();
        assert!(parsed.response);
        assert_eq!(parsed.command, command::PING);
    }

    #[test]
    fn test_hash_marker_bits() {
        for uid in [0u32, 1, 0xDEAD_BEEF, 0xFFFF_FFFF] {
            let hash = hash_from_uid(uid);
            assert_eq!(hash & 0x0380, 0x0300, "uid {:#X}", uid);
        }
    }

    #[test]
    fn test_uid_is_big_endian() {
        let message = Message::with_uid(command::LOCO_SPEED, false, 0x0300, 0xC003);
        assert_eq!(&message.serialize()[5..9], &[0x00, 0x00, 0xC0, 0x03]);
        assert_eq!(message.uid(), 0xC003);
    }

    #[test]
    fn test_s88_event_round_trip() {
        let message = build_s88_event(0x0300, 0, 42, false, true);
        let event = parse_s88_event(&message).unwrap();
        assert_eq!(event.contact, 42);
        assert!(!event.old_value);
        assert!(event.value);
    }

    #[test]
    fn test_framer_aligns_records() {
        let mut framer = Framer::new();
        let a = ping(0x0300).serialize();
        let b = system_go(0x0300, 0).serialize();
        let mut stream = a.to_vec();
        stream.extend_from_slice(&b);
        let messages = framer.feed(&stream[..20]);
        assert_eq!(messages.len(), 1);
        let messages = framer.feed(&stream[20..]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, command::SYSTEM);
    }

    #[test]
    fn test_device_description_round_trip() {
        let description = DeviceDescription {
            readings_count: 4,
            configuration_channels: 2,
            serial_number: 1234567,
            article_number: "60226".into(),
            device_name: "Gleisbox".into(),
        };
        let decoded = DeviceDescription::from_bytes(&description.to_bytes()).unwrap();
        assert_eq!(decoded, description);
    }

    #[test]
    fn test_status_data_assembly() {
        let description = DeviceDescription {
            readings_count: 1,
            configuration_channels: 0,
            serial_number: 42,
            article_number: "60113".into(),
            device_name: "CS2".into(),
        };
        let payload = description.to_bytes();

        let mut assembler = StatusDataAssembler::new();
        let mut count = 0u8;
        for (i, chunk) in payload.chunks(8).enumerate() {
            let mut data = [0u8; 8];
            data[..chunk.len()].copy_from_slice(chunk);
            let mut message = Message::new(command::STATUS_DATA_CONFIG, false, 0);
            message.hash = STATUS_DATA_CHUNK_HASH + i as u16;
            message.dlc = 8;
            message.data = data;
            assert!(assembler.feed(&message).is_none());
            count += 1;
        }
        let mut closing = Message::with_uid(command::STATUS_DATA_CONFIG, true, 0x0300, 0);
        closing.dlc = 6;
        closing.data[4] = 0;
        closing.data[5] = count;
        let (index, assembled) = assembler.feed(&closing).unwrap();
        assert_eq!(index, 0);
        assert_eq!(
            DeviceDescription::from_bytes(&assembled).unwrap().device_name,
            "CS2"
        );
    }
}
