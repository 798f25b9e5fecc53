//! Z21 LAN message codec
//!
//! Frame layout: `dataLen` (LE, includes itself), `header` (LE), data.
//! `LAN_X` frames nest an X-BUS message whose trailing checksum is the
//! XOR of the X-header and data bytes. Loco addresses inside X-BUS
//! frames are big endian with the two top bits marking long addresses.

use crate::core::Direction;
use crate::protocol::hex_dump;

pub const HEADER_GET_SERIAL_NUMBER: u16 = 0x10;
pub const HEADER_GET_HWINFO: u16 = 0x1A;
pub const HEADER_LOGOFF: u16 = 0x30;
pub const HEADER_X: u16 = 0x40;
pub const HEADER_SET_BROADCASTFLAGS: u16 = 0x50;
pub const HEADER_RMBUS_DATACHANGED: u16 = 0x80;
pub const HEADER_RMBUS_GETDATA: u16 = 0x81;
pub const HEADER_SYSTEMSTATE_DATACHANGED: u16 = 0x84;
pub const HEADER_SYSTEMSTATE_GETDATA: u16 = 0x85;
pub const HEADER_LOCONET_RX: u16 = 0xA0;
pub const HEADER_LOCONET_TX: u16 = 0xA1;

/// Broadcast subscriptions set once at kernel start
pub mod broadcast_flags {
    /// Power, loco and turnout events
    pub const POWER_LOCO_TURNOUT: u32 = 0x0000_0001;
    /// R-BUS feedback changes
    pub const RBUS: u32 = 0x0000_0002;
    /// System state changes
    pub const SYSTEM_STATE: u32 = 0x0000_0100;

    pub const STARTUP: u32 = POWER_LOCO_TURNOUT | RBUS | SYSTEM_STATE;
}

/// `centralState` bits of the system state
pub mod central_state {
    pub const EMERGENCY_STOP: u8 = 0x01;
    pub const TRACK_VOLTAGE_OFF: u8 = 0x02;
    pub const SHORT_CIRCUIT: u8 = 0x04;
    pub const PROGRAMMING_MODE: u8 = 0x20;
}

/// Speed step count on the X-BUS wire; 128 step mode carries 126 steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedSteps {
    Steps14,
    Steps28,
    Steps128,
}

impl SpeedSteps {
    pub fn from_count(steps: u8) -> Self {
        match steps {
            14 => Self::Steps14,
            28 => Self::Steps28,
            _ => Self::Steps128,
        }
    }

    pub fn count(self) -> u8 {
        match self {
            Self::Steps14 => 14,
            Self::Steps28 => 28,
            Self::Steps128 => 126,
        }
    }

    /// `db0` low nibble of a set-loco-drive frame
    fn drive_db0(self) -> u8 {
        match self {
            Self::Steps14 => 0x10,
            Self::Steps28 => 0x12,
            Self::Steps128 => 0x13,
        }
    }

    /// `db2` bits of a loco-info frame
    fn info_bits(self) -> u8 {
        match self {
            Self::Steps14 => 0x00,
            Self::Steps28 => 0x02,
            Self::Steps128 => 0x04,
        }
    }
}

/// Speed-and-direction byte packing shared by drive and info frames
///
/// Bit 7 is the direction (set = forward); the remaining bits carry the
/// speed. Raw value 0 is stop, 1 is emergency stop, `n >= 2` is step
/// `n - 1`.
pub mod speed_byte {
    use super::SpeedSteps;
    use crate::core::Direction;

    pub const DIRECTION_FLAG: u8 = 0x80;

    pub fn direction(db: u8) -> Direction {
        if db & DIRECTION_FLAG != 0 {
            Direction::Forward
        } else {
            Direction::Reverse
        }
    }

    pub fn raw_speed(db: u8, steps: SpeedSteps) -> u8 {
        match steps {
            SpeedSteps::Steps128 => db & 0x7F,
            SpeedSteps::Steps28 => ((db & 0x0F) << 1) | ((db & 0x10) >> 4),
            SpeedSteps::Steps14 => db & 0x0F,
        }
    }

    pub fn is_emergency_stop(db: u8, steps: SpeedSteps) -> bool {
        raw_speed(db, steps) == 1
    }

    pub fn speed_step(db: u8, steps: SpeedSteps) -> u8 {
        let raw = raw_speed(db, steps);
        if raw > 1 {
            raw - 1
        } else {
            0
        }
    }

    pub fn pack(steps: SpeedSteps, step: u8, emergency_stop: bool, direction: Direction) -> u8 {
        let mut db = if direction == Direction::Forward {
            DIRECTION_FLAG
        } else {
            0
        };
        let raw = if emergency_stop {
            1
        } else if step == 0 {
            0
        } else {
            step + 1
        };
        match steps {
            SpeedSteps::Steps128 => db |= raw & 0x7F,
            SpeedSteps::Steps28 => db |= ((raw >> 1) & 0x0F) | ((raw & 0x01) << 4),
            SpeedSteps::Steps14 => db |= raw & 0x0F,
        }
        db
    }
}

/// Loco address bytes inside X-BUS frames
fn address_bytes(address: u16, long: bool) -> (u8, u8) {
    if long {
        (0xC0 | (address >> 8) as u8, (address & 0xFF) as u8)
    } else {
        (0x00, (address & 0x7F) as u8)
    }
}

fn parse_address(high: u8, low: u8) -> (u16, bool) {
    if high & 0xC0 == 0xC0 {
        ((u16::from(high & 0x3F) << 8) | u16::from(low), true)
    } else {
        (u16::from(low & 0x7F), false)
    }
}

/// Turnout coil of a set-turnout command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnoutOutput {
    First,
    Second,
}

/// Decoded `LAN_SYSTEMSTATE_DATACHANGED` payload
///
/// The full field layout is decoded; what is surfaced to the domain is
/// configurable in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemState {
    pub main_current: i16,
    pub prog_current: i16,
    pub filtered_main_current: i16,
    pub temperature: i16,
    pub supply_voltage: u16,
    pub vcc_voltage: u16,
    pub central_state: u8,
    pub central_state_ex: u8,
}

impl SystemState {
    pub fn emergency_stop(&self) -> bool {
        self.central_state & central_state::EMERGENCY_STOP != 0
    }

    pub fn track_voltage_off(&self) -> bool {
        self.central_state & central_state::TRACK_VOLTAGE_OFF != 0
    }
}

/// Decoded `LAN_X_LOCO_INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocoInfo {
    pub address: u16,
    pub long_address: bool,
    pub busy: bool,
    pub speed_steps: SpeedSteps,
    pub direction: Direction,
    pub emergency_stop: bool,
    pub speed_step: u8,
    /// F0..=F28
    pub functions: [bool; 29],
}

impl Default for LocoInfo {
    fn default() -> Self {
        Self {
            address: 0,
            long_address: false,
            busy: false,
            speed_steps: SpeedSteps::Steps128,
            direction: Direction::Forward,
            emergency_stop: false,
            speed_step: 0,
            functions: [false; 29],
        }
    }
}

/// A Z21 LAN message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    LanGetSerialNumber,
    LanGetSerialNumberReply { serial_number: u32 },
    LanGetHardwareInfo,
    LanGetHardwareInfoReply { hardware_type: u32, firmware_version: u32 },
    LanLogoff,
    LanSetBroadcastFlags { flags: u32 },
    LanSystemStateGetData,
    LanSystemStateDataChanged(SystemState),
    LanRmBusGetData { group: u8 },
    LanRmBusDataChanged { group: u8, status: [u8; 10] },
    /// LocoNet tunnel frames; payload passed through for diagnostics
    LanLocoNetRx { payload: Vec<u8> },
    LanLocoNetTx { payload: Vec<u8> },

    // === LAN_X ===
    LanXSetTrackPowerOn,
    LanXSetTrackPowerOff,
    LanXGetStatus,
    LanXStatusChanged { status: u8 },
    LanXSetStop,
    LanXBcStopped,
    LanXBcTrackPowerOn,
    LanXBcTrackPowerOff,
    LanXBcTrackShortCircuit,
    LanXUnknownCommand,
    LanXGetLocoInfo { address: u16, long_address: bool },
    LanXLocoInfo(LocoInfo),
    LanXSetLocoDrive {
        address: u16,
        long_address: bool,
        speed_steps: SpeedSteps,
        emergency_stop: bool,
        direction: Direction,
        speed_step: u8,
    },
    LanXSetLocoFunction {
        address: u16,
        long_address: bool,
        function: u8,
        on: bool,
    },
    LanXSetTurnout {
        address: u16,
        output: TurnoutOutput,
        activate: bool,
    },
    LanXTurnoutInfo {
        address: u16,
        /// `None` while the turnout has not reached an end position
        position: Option<TurnoutOutput>,
    },
    LanXGetFirmwareVersion,

    /// Well-formed frame this codec does not model
    Unknown { header: u16, data: Vec<u8> },
}

fn frame(header: u16, data: &[u8]) -> Vec<u8> {
    let len = (4 + data.len()) as u16;
    let mut out = Vec::with_capacity(len as usize);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&header.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// X-BUS frame with trailing XOR checksum appended
fn x_frame(xbus: &[u8]) -> Vec<u8> {
    let checksum = xbus.iter().fold(0u8, |acc, b| acc ^ b);
    let mut data = xbus.to_vec();
    data.push(checksum);
    frame(HEADER_X, &data)
}

/// Checksum check for the X-BUS part of a `LAN_X` frame
pub fn is_x_checksum_valid(frame: &[u8]) -> bool {
    if frame.len() < 6 {
        return false;
    }
    let xbus = &frame[4..];
    xbus[..xbus.len() - 1].iter().fold(0u8, |acc, b| acc ^ b) == xbus[xbus.len() - 1]
}

impl Message {
    /// Serialize to one UDP datagram
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::LanGetSerialNumber => frame(HEADER_GET_SERIAL_NUMBER, &[]),
            Self::LanGetSerialNumberReply { serial_number } => {
                frame(HEADER_GET_SERIAL_NUMBER, &serial_number.to_le_bytes())
            }
            Self::LanGetHardwareInfo => frame(HEADER_GET_HWINFO, &[]),
            Self::LanGetHardwareInfoReply {
                hardware_type,
                firmware_version,
            } => {
                let mut data = hardware_type.to_le_bytes().to_vec();
                data.extend_from_slice(&firmware_version.to_le_bytes());
                frame(HEADER_GET_HWINFO, &data)
            }
            Self::LanLogoff => frame(HEADER_LOGOFF, &[]),
            Self::LanSetBroadcastFlags { flags } => {
                frame(HEADER_SET_BROADCASTFLAGS, &flags.to_le_bytes())
            }
            Self::LanSystemStateGetData => frame(HEADER_SYSTEMSTATE_GETDATA, &[]),
            Self::LanSystemStateDataChanged(state) => {
                let mut data = Vec::with_capacity(16);
                data.extend_from_slice(&state.main_current.to_le_bytes());
                data.extend_from_slice(&state.prog_current.to_le_bytes());
                data.extend_from_slice(&state.filtered_main_current.to_le_bytes());
                data.extend_from_slice(&state.temperature.to_le_bytes());
                data.extend_from_slice(&state.supply_voltage.to_le_bytes());
                data.extend_from_slice(&state.vcc_voltage.to_le_bytes());
                data.push(state.central_state);
                data.push(state.central_state_ex);
                data.push(0);
                data.push(0);
                frame(HEADER_SYSTEMSTATE_DATACHANGED, &data)
            }
            Self::LanRmBusGetData { group } => frame(HEADER_RMBUS_GETDATA, &[*group]),
            Self::LanRmBusDataChanged { group, status } => {
                let mut data = vec![*group];
                data.extend_from_slice(status);
                frame(HEADER_RMBUS_DATACHANGED, &data)
            }
            Self::LanLocoNetRx { payload } => frame(HEADER_LOCONET_RX, payload),
            Self::LanLocoNetTx { payload } => frame(HEADER_LOCONET_TX, payload),

            Self::LanXSetTrackPowerOn => x_frame(&[0x21, 0x81]),
            Self::LanXSetTrackPowerOff => x_frame(&[0x21, 0x80]),
            Self::LanXGetStatus => x_frame(&[0x21, 0x24]),
            Self::LanXStatusChanged { status } => x_frame(&[0x62, 0x22, *status]),
            Self::LanXSetStop => x_frame(&[0x80]),
            Self::LanXBcStopped => x_frame(&[0x81, 0x00]),
            Self::LanXBcTrackPowerOn => x_frame(&[0x61, 0x01]),
            Self::LanXBcTrackPowerOff => x_frame(&[0x61, 0x00]),
            Self::LanXBcTrackShortCircuit => x_frame(&[0x61, 0x08]),
            Self::LanXUnknownCommand => x_frame(&[0x61, 0x82]),
            Self::LanXGetLocoInfo {
                address,
                long_address,
            } => {
                let (high, low) = address_bytes(*address, *long_address);
                x_frame(&[0xE3, 0xF0, high, low])
            }
            Self::LanXLocoInfo(info) => {
                let (high, low) = address_bytes(info.address, info.long_address);
                let mut db2 = info.speed_steps.info_bits();
                if info.busy {
                    db2 |= 0x08;
                }
                let speed = speed_byte::pack(
                    info.speed_steps,
                    info.speed_step,
                    info.emergency_stop,
                    info.direction,
                );
                let mut db4 = 0u8;
                if info.functions[0] {
                    db4 |= 0x10;
                }
                for bit in 1..=4 {
                    if info.functions[bit] {
                        db4 |= 1 << (bit - 1);
                    }
                }
                let pack_bits = |from: usize| -> u8 {
                    (0..8).fold(0u8, |acc, i| {
                        if info.functions[from + i] {
                            acc | (1 << i)
                        } else {
                            acc
                        }
                    })
                };
                x_frame(&[
                    0xEF,
                    high,
                    low,
                    db2,
                    speed,
                    db4,
                    pack_bits(5),
                    pack_bits(13),
                    pack_bits(21),
                ])
            }
            Self::LanXSetLocoDrive {
                address,
                long_address,
                speed_steps,
                emergency_stop,
                direction,
                speed_step,
            } => {
                let (high, low) = address_bytes(*address, *long_address);
                let speed = speed_byte::pack(*speed_steps, *speed_step, *emergency_stop, *direction);
                x_frame(&[0xE4, speed_steps.drive_db0(), high, low, speed])
            }
            Self::LanXSetLocoFunction {
                address,
                long_address,
                function,
                on,
            } => {
                let (high, low) = address_bytes(*address, *long_address);
                let db3 = (u8::from(*on) << 6) | (function & 0x3F);
                x_frame(&[0xE4, 0xF8, high, low, db3])
            }
            Self::LanXSetTurnout {
                address,
                output,
                activate,
            } => {
                let wire = address - 1; // wire addresses are 0 based
                let db = 0x80
                    | (u8::from(*activate) << 3)
                    | u8::from(*output == TurnoutOutput::Second);
                x_frame(&[0x53, (wire >> 8) as u8, (wire & 0xFF) as u8, db])
            }
            Self::LanXTurnoutInfo { address, position } => {
                let wire = address - 1;
                let db = match position {
                    None => 0x00,
                    Some(TurnoutOutput::First) => 0x01,
                    Some(TurnoutOutput::Second) => 0x02,
                };
                x_frame(&[0x43, (wire >> 8) as u8, (wire & 0xFF) as u8, db])
            }
            Self::LanXGetFirmwareVersion => x_frame(&[0xF1, 0x0A]),

            Self::Unknown { header, data } => frame(*header, data),
        }
    }

    /// Parse one datagram
    ///
    /// Returns `None` on truncated frames or an invalid X-BUS checksum.
    pub fn parse(datagram: &[u8]) -> Option<Message> {
        if datagram.len() < 4 {
            return None;
        }
        let data_len = u16::from_le_bytes([datagram[0], datagram[1]]) as usize;
        if data_len < 4 || datagram.len() < data_len {
            return None;
        }
        let header = u16::from_le_bytes([datagram[2], datagram[3]]);
        let data = &datagram[4..data_len];

        let message = match header {
            HEADER_GET_SERIAL_NUMBER if data.is_empty() => Self::LanGetSerialNumber,
            HEADER_GET_SERIAL_NUMBER if data.len() == 4 => Self::LanGetSerialNumberReply {
                serial_number: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            },
            HEADER_GET_HWINFO if data.is_empty() => Self::LanGetHardwareInfo,
            HEADER_GET_HWINFO if data.len() == 8 => Self::LanGetHardwareInfoReply {
                hardware_type: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
                firmware_version: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            },
            HEADER_LOGOFF => Self::LanLogoff,
            HEADER_SET_BROADCASTFLAGS if data.len() == 4 => Self::LanSetBroadcastFlags {
                flags: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            },
            HEADER_SYSTEMSTATE_GETDATA => Self::LanSystemStateGetData,
            HEADER_SYSTEMSTATE_DATACHANGED if data.len() >= 16 => {
                Self::LanSystemStateDataChanged(SystemState {
                    main_current: i16::from_le_bytes([data[0], data[1]]),
                    prog_current: i16::from_le_bytes([data[2], data[3]]),
                    filtered_main_current: i16::from_le_bytes([data[4], data[5]]),
                    temperature: i16::from_le_bytes([data[6], data[7]]),
                    supply_voltage: u16::from_le_bytes([data[8], data[9]]),
                    vcc_voltage: u16::from_le_bytes([data[10], data[11]]),
                    central_state: data[12],
                    central_state_ex: data[13],
                })
            }
            HEADER_RMBUS_GETDATA if data.len() == 1 => Self::LanRmBusGetData { group: data[0] },
            HEADER_RMBUS_DATACHANGED if data.len() == 11 => {
                let mut status = [0u8; 10];
                status.copy_from_slice(&data[1..]);
                Self::LanRmBusDataChanged {
                    group: data[0],
                    status,
                }
            }
            HEADER_LOCONET_RX => Self::LanLocoNetRx {
                payload: data.to_vec(),
            },
            HEADER_LOCONET_TX => Self::LanLocoNetTx {
                payload: data.to_vec(),
            },
            HEADER_X => {
                if !is_x_checksum_valid(&datagram[..data_len]) {
                    return None;
                }
                let xbus = &data[..data.len() - 1];
                Self::parse_x(xbus)?
            }
            _ => Self::Unknown {
                header,
                data: data.to_vec(),
            },
        };
        Some(message)
    }

    fn parse_x(xbus: &[u8]) -> Option<Message> {
        let message = match (*xbus.first()?, xbus.get(1).copied()) {
            (0x21, Some(0x81)) => Self::LanXSetTrackPowerOn,
            (0x21, Some(0x80)) => Self::LanXSetTrackPowerOff,
            (0x21, Some(0x24)) => Self::LanXGetStatus,
            (0x62, Some(0x22)) => Self::LanXStatusChanged { status: *xbus.get(2)? },
            (0x80, None) => Self::LanXSetStop,
            (0x81, Some(0x00)) => Self::LanXBcStopped,
            (0x61, Some(0x01)) => Self::LanXBcTrackPowerOn,
            (0x61, Some(0x00)) => Self::LanXBcTrackPowerOff,
            (0x61, Some(0x08)) => Self::LanXBcTrackShortCircuit,
            (0x61, Some(0x82)) => Self::LanXUnknownCommand,
            (0xE3, Some(0xF0)) => {
                let (address, long_address) = parse_address(*xbus.get(2)?, *xbus.get(3)?);
                Self::LanXGetLocoInfo {
                    address,
                    long_address,
                }
            }
            (0xEF, _) if xbus.len() >= 9 => {
                let (address, long_address) = parse_address(xbus[1], xbus[2]);
                let db2 = xbus[3];
                let speed_steps = match db2 & 0x07 {
                    0x00 => SpeedSteps::Steps14,
                    0x02 => SpeedSteps::Steps28,
                    _ => SpeedSteps::Steps128,
                };
                let speed = xbus[4];
                let db4 = xbus[5];
                let mut functions = [false; 29];
                functions[0] = db4 & 0x10 != 0;
                for bit in 1..=4 {
                    functions[bit] = db4 & (1 << (bit - 1)) != 0;
                }
                for (base, byte) in [(5usize, xbus[6]), (13, xbus[7]), (21, xbus[8])] {
                    for i in 0..8 {
                        functions[base + i] = byte & (1 << i) != 0;
                    }
                }
                Self::LanXLocoInfo(LocoInfo {
                    address,
                    long_address,
                    busy: db2 & 0x08 != 0,
                    speed_steps,
                    direction: speed_byte::direction(speed),
                    emergency_stop: speed_byte::is_emergency_stop(speed, speed_steps),
                    speed_step: speed_byte::speed_step(speed, speed_steps),
                    functions,
                })
            }
            (0xE4, Some(db0)) if db0 == 0x10 || db0 == 0x12 || db0 == 0x13 => {
                let speed_steps = match db0 {
                    0x10 => SpeedSteps::Steps14,
                    0x12 => SpeedSteps::Steps28,
                    _ => SpeedSteps::Steps128,
                };
                let (address, long_address) = parse_address(*xbus.get(2)?, *xbus.get(3)?);
                let speed = *xbus.get(4)?;
                Self::LanXSetLocoDrive {
                    address,
                    long_address,
                    speed_steps,
                    emergency_stop: speed_byte::is_emergency_stop(speed, speed_steps),
                    direction: speed_byte::direction(speed),
                    speed_step: speed_byte::speed_step(speed, speed_steps),
                }
            }
            (0xE4, Some(0xF8)) => {
                let (address, long_address) = parse_address(*xbus.get(2)?, *xbus.get(3)?);
                let db3 = *xbus.get(4)?;
                Self::LanXSetLocoFunction {
                    address,
                    long_address,
                    function: db3 & 0x3F,
                    on: (db3 >> 6) & 0x03 == 1,
                }
            }
            (0x53, _) if xbus.len() >= 4 => {
                let wire = (u16::from(xbus[1]) << 8) | u16::from(xbus[2]);
                let db = xbus[3];
                Self::LanXSetTurnout {
                    address: wire + 1,
                    output: if db & 0x01 != 0 {
                        TurnoutOutput::Second
                    } else {
                        TurnoutOutput::First
                    },
                    activate: db & 0x08 != 0,
                }
            }
            (0x43, _) if xbus.len() >= 4 => {
                let wire = (u16::from(xbus[1]) << 8) | u16::from(xbus[2]);
                Self::LanXTurnoutInfo {
                    address: wire + 1,
                    position: match xbus[3] & 0x03 {
                        0x01 => Some(TurnoutOutput::First),
                        0x02 => Some(TurnoutOutput::Second),
                        _ => None,
                    },
                }
            }
            (0xF1, Some(0x0A)) => Self::LanXGetFirmwareVersion,
            _ => Self::Unknown {
                header: HEADER_X,
                data: {
                    let mut data = xbus.to_vec();
                    data.push(xbus.iter().fold(0u8, |acc, b| acc ^ b));
                    data
                },
            },
        };
        Some(message)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::LanGetSerialNumber => "LAN_GET_SERIAL_NUMBER",
            Self::LanGetSerialNumberReply { .. } => "LAN_GET_SERIAL_NUMBER reply",
            Self::LanGetHardwareInfo => "LAN_GET_HWINFO",
            Self::LanGetHardwareInfoReply { .. } => "LAN_GET_HWINFO reply",
            Self::LanLogoff => "LAN_LOGOFF",
            Self::LanSetBroadcastFlags { .. } => "LAN_SET_BROADCASTFLAGS",
            Self::LanSystemStateGetData => "LAN_SYSTEMSTATE_GETDATA",
            Self::LanSystemStateDataChanged(_) => "LAN_SYSTEMSTATE_DATACHANGED",
            Self::LanRmBusGetData { .. } => "LAN_RMBUS_GETDATA",
            Self::LanRmBusDataChanged { .. } => "LAN_RMBUS_DATACHANGED",
            Self::LanLocoNetRx { .. } => "LAN_LOCONET_Z21_RX",
            Self::LanLocoNetTx { .. } => "LAN_LOCONET_Z21_TX",
            Self::LanXSetTrackPowerOn => "LAN_X_SET_TRACK_POWER_ON",
            Self::LanXSetTrackPowerOff => "LAN_X_SET_TRACK_POWER_OFF",
            Self::LanXGetStatus => "LAN_X_GET_STATUS",
            Self::LanXStatusChanged { .. } => "LAN_X_STATUS_CHANGED",
            Self::LanXSetStop => "LAN_X_SET_STOP",
            Self::LanXBcStopped => "LAN_X_BC_STOPPED",
            Self::LanXBcTrackPowerOn => "LAN_X_BC_TRACK_POWER_ON",
            Self::LanXBcTrackPowerOff => "LAN_X_BC_TRACK_POWER_OFF",
            Self::LanXBcTrackShortCircuit => "LAN_X_BC_TRACK_SHORT_CIRCUIT",
            Self::LanXUnknownCommand => "LAN_X_UNKNOWN_COMMAND",
            Self::LanXGetLocoInfo { .. } => "LAN_X_GET_LOCO_INFO",
            Self::LanXLocoInfo(_) => "LAN_X_LOCO_INFO",
            Self::LanXSetLocoDrive { .. } => "LAN_X_SET_LOCO_DRIVE",
            Self::LanXSetLocoFunction { .. } => "LAN_X_SET_LOCO_FUNCTION",
            Self::LanXSetTurnout { .. } => "LAN_X_SET_TURNOUT",
            Self::LanXTurnoutInfo { .. } => "LAN_X_TURNOUT_INFO",
            Self::LanXGetFirmwareVersion => "LAN_X_GET_FIRMWARE_VERSION",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Debug dump: message name plus hex bytes
    pub fn to_string_dump(&self) -> String {
        format!("{} [{}]", self.name(), hex_dump(&self.serialize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_loco_drive_reference_bytes() {
        // DCC long address 3, 128 steps, forward, step 63 (throttle 0.5)
        let message = Message::LanXSetLocoDrive {
            address: 3,
            long_address: true,
            speed_steps: SpeedSteps::Steps128,
            emergency_stop: false,
            direction: Direction::Forward,
            speed_step: 63,
        };
        let datagram = message.serialize();
        assert_eq!(&datagram[..4], &[0x0A, 0x00, 0x40, 0x00]);
        assert_eq!(&datagram[4..9], &[0xE4, 0x13, 0xC0, 0x03, 0xC0]);
        assert_eq!(datagram[9], 0xE4 ^ 0x13 ^ 0xC0 ^ 0x03 ^ 0xC0);
        assert!(is_x_checksum_valid(&datagram));
        assert_eq!(Message::parse(&datagram), Some(message));
    }

    #[test]
    fn test_power_frames_match_vendor_bytes() {
        assert_eq!(
            Message::LanXSetTrackPowerOff.serialize(),
            vec![0x07, 0x00, 0x40, 0x00, 0x21, 0x80, 0xA1]
        );
        assert_eq!(
            Message::LanXSetTrackPowerOn.serialize(),
            vec![0x07, 0x00, 0x40, 0x00, 0x21, 0x81, 0xA0]
        );
        assert_eq!(
            Message::LanXBcTrackPowerOn.serialize(),
            vec![0x07, 0x00, 0x40, 0x00, 0x61, 0x01, 0x60]
        );
        assert_eq!(
            Message::LanXSetStop.serialize(),
            vec![0x06, 0x00, 0x40, 0x00, 0x80, 0x80]
        );
    }

    #[test]
    fn test_x_checksum_mutation_invalidates() {
        let datagram = Message::LanXSetTrackPowerOn.serialize();
        for i in 4..datagram.len() {
            let mut mutated = datagram.clone();
            mutated[i] ^= 0x10;
            assert!(!is_x_checksum_valid(&mutated), "byte {} still valid", i);
        }
    }

    #[test]
    fn test_speed_byte_pack_unpack() {
        for steps in [SpeedSteps::Steps14, SpeedSteps::Steps28, SpeedSteps::Steps128] {
            for step in 0..=steps.count() {
                let db = speed_byte::pack(steps, step, false, Direction::Forward);
                assert_eq!(speed_byte::speed_step(db, steps), step);
                assert_eq!(speed_byte::direction(db), Direction::Forward);
                assert!(!speed_byte::is_emergency_stop(db, steps));
            }
            let estop = speed_byte::pack(steps, 0, true, Direction::Reverse);
            assert!(speed_byte::is_emergency_stop(estop, steps));
        }
    }

    #[test]
    fn test_loco_info_round_trip() {
        let mut info = LocoInfo {
            address: 1234,
            long_address: true,
            busy: true,
            speed_steps: SpeedSteps::Steps128,
            direction: Direction::Reverse,
            emergency_stop: false,
            speed_step: 100,
            ..LocoInfo::default()
        };
        info.functions[0] = true;
        info.functions[10] = true;
        info.functions[28] = true;
        let message = Message::LanXLocoInfo(info);
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_set_loco_function_round_trip() {
        let message = Message::LanXSetLocoFunction {
            address: 5,
            long_address: false,
            function: 10,
            on: true,
        };
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_turnout_round_trip() {
        let set = Message::LanXSetTurnout {
            address: 17,
            output: TurnoutOutput::Second,
            activate: true,
        };
        assert_eq!(Message::parse(&set.serialize()), Some(set));

        let info = Message::LanXTurnoutInfo {
            address: 17,
            position: Some(TurnoutOutput::First),
        };
        assert_eq!(Message::parse(&info.serialize()), Some(info));
    }

    #[test]
    fn test_rmbus_round_trip() {
        let mut status = [0u8; 10];
        status[2] = 0x81;
        let message = Message::LanRmBusDataChanged { group: 0, status };
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_system_state_round_trip() {
        let message = Message::LanSystemStateDataChanged(SystemState {
            main_current: 1200,
            prog_current: 0,
            filtered_main_current: 1100,
            temperature: 38,
            supply_voltage: 18000,
            vcc_voltage: 17500,
            central_state: central_state::TRACK_VOLTAGE_OFF,
            central_state_ex: 0,
        });
        assert_eq!(Message::parse(&message.serialize()), Some(message));
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let datagram = Message::LanXSetTrackPowerOn.serialize();
        assert!(Message::parse(&datagram[..3]).is_none());
    }
}
