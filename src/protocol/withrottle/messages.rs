//! WiThrottle line builders and parser
//!
//! Lines are newline-terminated ASCII. Multi-throttle commands use a
//! one-character throttle key, `<;>` separated from the payload.

use crate::core::Direction;

pub const SEPARATOR: &str = "<;>";

/// Loco id on the wire: `L` for long, `S` for short addresses
pub fn loco_id(address: u16, long: bool) -> String {
    format!("{}{}", if long { 'L' } else { 'S' }, address)
}

// === client line builders ===

pub fn set_name(name: &str) -> String {
    format!("N{}\n", name)
}

pub fn set_device_id(id: &str) -> String {
    format!("HU{}\n", id)
}

pub fn heartbeat() -> String {
    "*\n".into()
}

pub fn power(on: bool) -> String {
    format!("PPA{}\n", u8::from(on))
}

/// Acquire a loco on multi-throttle `key`
pub fn throttle_acquire(key: char, address: u16, long: bool) -> String {
    format!("MT+{}{}{}\n", key, SEPARATOR, loco_id(address, long))
}

pub fn throttle_release(key: char) -> String {
    format!("MT-{}{}r\n", key, SEPARATOR)
}

/// Velocity 0..=126
pub fn throttle_velocity(key: char, velocity: u8) -> String {
    format!("MTA{}{}V{}\n", key, SEPARATOR, velocity.min(126))
}

pub fn throttle_direction(key: char, direction: Direction) -> String {
    format!(
        "MTA{}{}R{}\n",
        key,
        SEPARATOR,
        u8::from(direction == Direction::Forward)
    )
}

pub fn throttle_function(key: char, function: u32, value: bool) -> String {
    format!("MTA{}{}F{}{}\n", key, SEPARATOR, u8::from(value), function)
}

pub fn throttle_emergency_stop(key: char) -> String {
    format!("MTA{}{}X\n", key, SEPARATOR)
}

/// Throw (`T`) or close (`C`) a turnout by system name
pub fn turnout(thrown: bool, system_name: &str) -> String {
    format!("PTA{}{}\n", if thrown { 'T' } else { 'C' }, system_name)
}

pub fn quit() -> String {
    "Q\n".into()
}

// === server line parsing ===

/// A parsed server line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// `VN2.0`
    ProtocolVersion(String),
    /// `PPA0|1|2`; `None` is the server's unknown state
    Power(Option<bool>),
    /// `*<seconds>`: expected heartbeat interval
    HeartbeatInterval(u16),
    /// `PTA<2|4|T|C><sysname>`: turnout state report
    Turnout {
        system_name: String,
        thrown: Option<bool>,
    },
    /// Multi-throttle action echo: `M<key>A<loco><;><cmd>`
    ThrottleAction {
        key: char,
        command: String,
    },
    Other(String),
}

pub fn parse_server_line(line: &str) -> ServerLine {
    let line = line.trim();
    if let Some(version) = line.strip_prefix("VN") {
        return ServerLine::ProtocolVersion(version.to_string());
    }
    if let Some(state) = line.strip_prefix("PPA") {
        let power = match state.chars().next() {
            Some('0') => Some(false),
            Some('1') => Some(true),
            _ => None,
        };
        return ServerLine::Power(power);
    }
    if let Some(interval) = line.strip_prefix('*') {
        if let Ok(seconds) = interval.parse() {
            return ServerLine::HeartbeatInterval(seconds);
        }
    }
    if let Some(rest) = line.strip_prefix("PTA") {
        let mut chars = rest.chars();
        if let Some(state) = chars.next() {
            let thrown = match state {
                'T' | '4' => Some(true),
                'C' | '2' => Some(false),
                _ => None,
            };
            return ServerLine::Turnout {
                system_name: chars.collect(),
                thrown,
            };
        }
    }
    if let Some(rest) = line.strip_prefix('M') {
        let mut chars = rest.chars();
        if let (Some(key), Some('A')) = (chars.next(), chars.next()) {
            if let Some((_, command)) = rest[2..].split_once(SEPARATOR) {
                return ServerLine::ThrottleAction {
                    key,
                    command: command.to_string(),
                };
            }
        }
    }
    ServerLine::Other(line.to_string())
}

/// Line extractor for the byte stream
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.buffer.last() == Some(&b'\r') {
                    self.buffer.pop();
                }
                if !self.buffer.is_empty() {
                    if let Ok(line) = String::from_utf8(std::mem::take(&mut self.buffer)) {
                        lines.push(line);
                    } else {
                        self.buffer.clear();
                    }
                }
            } else {
                self.buffer.push(byte);
                if self.buffer.len() > crate::constants::FRAMER_MAX_BUFFER {
                    self.buffer.clear();
                }
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        assert_eq!(power(true), "PPA1\n");
        assert_eq!(throttle_acquire('T', 3, false), "MT+T<;>S3\n");
        assert_eq!(throttle_velocity('T', 63), "MTAT<;>V63\n");
        assert_eq!(
            throttle_direction('T', Direction::Forward),
            "MTAT<;>R1\n"
        );
        assert_eq!(throttle_function('T', 10, true), "MTAT<;>F110\n");
        assert_eq!(turnout(true, "17"), "PTAT17\n");
    }

    #[test]
    fn test_parse_power() {
        assert_eq!(parse_server_line("PPA1"), ServerLine::Power(Some(true)));
        assert_eq!(parse_server_line("PPA0"), ServerLine::Power(Some(false)));
        assert_eq!(parse_server_line("PPA2"), ServerLine::Power(None));
    }

    #[test]
    fn test_parse_heartbeat_interval() {
        assert_eq!(parse_server_line("*10"), ServerLine::HeartbeatInterval(10));
    }

    #[test]
    fn test_parse_turnout() {
        assert_eq!(
            parse_server_line("PTAT17"),
            ServerLine::Turnout {
                system_name: "17".into(),
                thrown: Some(true)
            }
        );
        assert_eq!(
            parse_server_line("PTA2IT21"),
            ServerLine::Turnout {
                system_name: "IT21".into(),
                thrown: Some(false)
            }
        );
    }

    #[test]
    fn test_parse_throttle_action() {
        assert_eq!(
            parse_server_line("MTAS3<;>V42"),
            ServerLine::ThrottleAction {
                key: 'T',
                command: "V42".into()
            }
        );
    }

    #[test]
    fn test_framer() {
        let mut framer = Framer::new();
        let lines = framer.feed(b"VN2.0\r\nPPA1\n*1");
        assert_eq!(lines, vec!["VN2.0".to_string(), "PPA1".into()]);
        let lines = framer.feed(b"0\n");
        assert_eq!(lines, vec!["*10".to_string()]);
    }
}
