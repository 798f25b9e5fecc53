//! DCC-EX command builders and response parser
//!
//! Requests are plain ASCII `<...>` commands terminated by a newline.
//! Responses reuse the same bracket framing; anything outside brackets
//! is diagnostic chatter and is skipped.

use crate::core::Direction;

pub const ADDRESS_MAX: u16 = 10293;
pub const ACCESSORY_ADDRESS_MIN: u32 = 1;
pub const ACCESSORY_ADDRESS_MAX: u32 = 2044;
pub const ID_MIN: u32 = 0;
pub const ID_MAX: u32 = 32767;
pub const FUNCTION_NUMBER_MAX: u32 = 68;

// === request builders ===

pub fn power_on() -> String {
    "<1>\n".into()
}

pub fn power_off() -> String {
    "<0>\n".into()
}

/// Stops all locos but leaves power on
pub fn emergency_stop() -> String {
    "<!>\n".into()
}

pub fn status() -> String {
    "<s>\n".into()
}

pub fn set_loco_speed_and_direction(
    address: u16,
    speed: u8,
    emergency_stop: bool,
    direction: Direction,
) -> String {
    debug_assert!(address <= ADDRESS_MAX);
    debug_assert!(speed <= 126);
    format!(
        "<t {} {} {}>\n",
        address,
        if emergency_stop {
            "-1".into()
        } else {
            speed.to_string()
        },
        if direction == Direction::Forward { 1 } else { 0 }
    )
}

pub fn set_loco_function(address: u16, function: u8, value: bool) -> String {
    debug_assert!(address <= ADDRESS_MAX);
    format!("<F {} {} {}>\n", address, function, u8::from(value))
}

pub fn forget_loco(address: u16) -> String {
    format!("<- {}>\n", address)
}

pub fn set_accessory(linear_address: u32, activate: bool) -> String {
    debug_assert!((ACCESSORY_ADDRESS_MIN..=ACCESSORY_ADDRESS_MAX).contains(&linear_address));
    format!("<a {} {}>\n", linear_address, u8::from(activate))
}

pub fn set_turnout(id: u32, thrown: bool) -> String {
    format!("<T {} {}>\n", id, u8::from(thrown))
}

pub fn set_output(id: u32, value: bool) -> String {
    format!("<Z {} {}>\n", id, u8::from(value))
}

/// Track speed step mode, announced whenever the config changes
pub fn set_speed_steps(steps: u8) -> Option<String> {
    match steps {
        28 => Some("<D SPEED28>\n".into()),
        128 => Some("<D SPEED128>\n".into()),
        _ => None,
    }
}

/// Sensor transition line as the command station broadcasts it
pub fn sensor_transition(id: u32, value: bool) -> String {
    if value {
        format!("<Q {}>\n", id)
    } else {
        format!("<q {}>\n", id)
    }
}

// === responses ===

/// A parsed command station response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    PowerOn,
    PowerOff,
    /// `<Q id>` / `<q id>`
    Sensor { id: u32, active: bool },
    /// `<H id 1|0|T|C>`
    Turnout { id: u32, thrown: bool },
    /// `<Y id 1|0>`
    Output { id: u32, value: bool },
    /// Anything else inside brackets
    Other(String),
}

/// Parse one bracketed line
pub fn parse_response(line: &str) -> Option<Response> {
    let inner = line.trim().strip_prefix('<')?.strip_suffix('>')?;
    let mut parts = inner.split_ascii_whitespace();
    let head = parts.next()?;
    let response = match head {
        "p0" => Response::PowerOff,
        "p1" => Response::PowerOn,
        "Q" | "q" => Response::Sensor {
            id: parts.next()?.parse().ok()?,
            active: head == "Q",
        },
        "H" => {
            let id = parts.next()?.parse().ok()?;
            let thrown = match parts.next()? {
                "1" | "T" => true,
                "0" | "C" => false,
                _ => return Some(Response::Other(inner.to_string())),
            };
            Response::Turnout { id, thrown }
        }
        "Y" => {
            let id = parts.next()?.parse().ok()?;
            let value = match parts.next()? {
                "1" => true,
                "0" => false,
                _ => return Some(Response::Other(inner.to_string())),
            };
            Response::Output { id, value }
        }
        _ => Response::Other(inner.to_string()),
    };
    Some(response)
}

/// Line extractor for the byte stream
///
/// Emits complete lines without the terminator. Bytes outside any
/// `<...>` bracket are command station boot chatter; lines without
/// brackets still come through so the kernel can log them.
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
    fn test_builders_match_reference() {
        assert_eq!(power_on(), "<1>\n");
        assert_eq!(power_off(), "<0>\n");
        assert_eq!(emergency_stop(), "<!>\n");
        assert_eq!(
            set_loco_speed_and_direction(3, 63, false, Direction::Forward),
            "<t 3 63 1>\n"
        );
        assert_eq!(
            set_loco_speed_and_direction(3, 0, true, Direction::Reverse),
            "<t 3 -1 0>\n"
        );
        assert_eq!(set_loco_function(3, 10, true), "<F 3 10 1>\n");
        assert_eq!(set_accessory(100, true), "<a 100 1>\n");
        assert_eq!(set_speed_steps(28), Some("<D SPEED28>\n".into()));
        assert_eq!(set_speed_steps(128), Some("<D SPEED128>\n".into()));
        assert_eq!(set_speed_steps(14), None);
    }

    #[test]
    fn test_parse_power_responses() {
        assert_eq!(parse_response("<p0>"), Some(Response::PowerOff));
        assert_eq!(parse_response("<p1>"), Some(Response::PowerOn));
    }

    #[test]
    fn test_parse_sensor_responses() {
        assert_eq!(
            parse_response("<Q 42>"),
            Some(Response::Sensor {
                id: 42,
                active: true
            })
        );
        assert_eq!(
            parse_response("<q 42>"),
            Some(Response::Sensor {
                id: 42,
                active: false
            })
        );
    }

    #[test]
    fn test_parse_turnout_and_output() {
        assert_eq!(
            parse_response("<H 7 T>"),
            Some(Response::Turnout {
                id: 7,
                thrown: true
            })
        );
        assert_eq!(
            parse_response("<H 7 0>"),
            Some(Response::Turnout {
                id: 7,
                thrown: false
            })
        );
        assert_eq!(
            parse_response("<Y 9 1>"),
            Some(Response::Output { id: 9, value: true })
        );
    }

    #[test]
    fn test_parse_rejects_unbracketed() {
        assert_eq!(parse_response("DCC-EX V-5.0.0"), None);
    }

    #[test]
    fn test_framer_splits_lines() {
        let mut framer = Framer::new();
        let lines = framer.feed(b"<p1>\n<Q 4");
        assert_eq!(lines, vec!["<p1>".to_string()]);
        let lines = framer.feed(b"2>\r\n");
        assert_eq!(lines, vec!["<Q 42>".to_string()]);
    }
}
