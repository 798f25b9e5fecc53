//! ECoS wire format
//!
//! Command builders and block/line parsers. Option syntax is
//! key-bracket: `option[value]`, `option[v1,v2]`, quoted strings as
//! `option["value"]`.

/// Well-known object ids
pub mod object_id {
    pub const ECOS: u16 = 1;
    pub const PROGRAMMING_TRACK: u16 = 5;
    pub const LOCOMOTIVE_MANAGER: u16 = 10;
    pub const SWITCH_MANAGER: u16 = 11;
    pub const FEEDBACK_MANAGER: u16 = 26;
    pub const S88_MIN: u16 = 100;
    pub const S88_MAX: u16 = 199;
    pub const LOCOMOTIVE_MIN: u16 = 1000;
    pub const SWITCH_MIN: u16 = 20000;
    pub const SWITCH_MAX: u16 = 29999;
}

/// Option names used by this kernel
pub mod option {
    pub const ADDR: &str = "addr";
    pub const CONTROL: &str = "control";
    pub const DIR: &str = "dir";
    pub const FORCE: &str = "force";
    pub const FUNC: &str = "func";
    pub const GO: &str = "go";
    pub const INFO: &str = "info";
    pub const NAME: &str = "name";
    pub const PORTS: &str = "ports";
    pub const PROTOCOL: &str = "protocol";
    pub const SPEED_STEP: &str = "speedstep";
    pub const STATE: &str = "state";
    pub const STATUS: &str = "status";
    pub const STOP: &str = "stop";
    pub const SWITCHING: &str = "switching";
    pub const VIEW: &str = "view";
}

/// Reply status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    UnknownOption,
    UnknownObject,
    NoManagerObject,
    Other(u32),
}

impl Status {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            11 => Self::UnknownOption,
            15 => Self::UnknownObject,
            22 => Self::NoManagerObject,
            other => Self::Other(other),
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

// === command builders ===

pub fn build_command(command: &str, object_id: u16, options: &[String]) -> String {
    let mut out = String::with_capacity(32);
    out.push_str(command);
    out.push('(');
    out.push_str(&object_id.to_string());
    for option in options {
        out.push_str(", ");
        out.push_str(option);
    }
    out.push_str(")\n");
    out
}

pub fn query_objects(object_id: u16, options: &[&str]) -> String {
    build_command(
        "queryObjects",
        object_id,
        &options.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )
}

pub fn get(object_id: u16, options: &[&str]) -> String {
    build_command(
        "get",
        object_id,
        &options.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )
}

/// `set(id, option[value])`
pub fn set_value(object_id: u16, option: &str, value: impl std::fmt::Display) -> String {
    build_command("set", object_id, &[format!("{}[{}]", option, value)])
}

/// `set(id, option[v1,v2])`
pub fn set_pair(
    object_id: u16,
    option: &str,
    value1: impl std::fmt::Display,
    value2: impl std::fmt::Display,
) -> String {
    build_command(
        "set",
        object_id,
        &[format!("{}[{},{}]", option, value1, value2)],
    )
}

/// `set(id, option)`
pub fn set_flag(object_id: u16, option: &str) -> String {
    build_command("set", object_id, &[option.to_string()])
}

pub fn request(object_id: u16, options: &[&str]) -> String {
    build_command(
        "request",
        object_id,
        &options.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )
}

pub fn release(object_id: u16, options: &[&str]) -> String {
    build_command(
        "release",
        object_id,
        &options.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )
}

// === block parsing ===

/// What a reply block answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyHeader {
    pub command: String,
    pub object_id: u16,
    pub options: Vec<String>,
}

/// One `<REPLY ...>` or `<EVENT ...>` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Reply {
        header: ReplyHeader,
        lines: Vec<String>,
        status: Status,
        status_message: String,
    },
    Event {
        object_id: u16,
        lines: Vec<String>,
        status: Status,
        status_message: String,
    },
}

impl Block {
    pub fn lines(&self) -> &[String] {
        match self {
            Self::Reply { lines, .. } | Self::Event { lines, .. } => lines,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Reply { status, .. } | Self::Event { status, .. } => *status,
        }
    }
}

/// `command(id, opt, ...)` of a REPLY header
fn parse_reply_header(text: &str) -> Option<ReplyHeader> {
    let open = text.find('(')?;
    let close = text.rfind(')')?;
    let command = text[..open].trim().to_string();
    let mut parts = text[open + 1..close].split(',').map(str::trim);
    let object_id = parts.next()?.parse().ok()?;
    Some(ReplyHeader {
        command,
        object_id,
        options: parts.map(str::to_string).collect(),
    })
}

/// `<END status (text)>`
fn parse_end(line: &str) -> Option<(Status, String)> {
    let inner = line.strip_prefix("<END")?.trim_end().strip_suffix('>')?.trim();
    let (code, rest) = match inner.find(' ') {
        Some(space) => (&inner[..space], inner[space..].trim()),
        None => (inner, ""),
    };
    let code: u32 = code.parse().ok()?;
    let message = rest
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(rest)
        .to_string();
    Some((Status::from_code(code), message))
}

/// Accumulates lines into reply/event blocks
///
/// Lines outside a block are dropped and counted as malformed.
#[derive(Default)]
pub struct Framer {
    buffer: Vec<u8>,
    current: Option<(Option<ReplyHeader>, Option<u16>, Vec<String>)>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns complete blocks and the dropped byte count
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<Block>, usize) {
        self.buffer.extend_from_slice(chunk);
        let mut blocks = Vec::new();
        let mut dropped = 0;

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let Ok(mut line) = String::from_utf8(raw) else {
                dropped += newline + 1;
                continue;
            };
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("<REPLY") {
                let header = rest
                    .trim_end()
                    .strip_suffix('>')
                    .and_then(parse_reply_header);
                self.current = Some((header, None, Vec::new()));
            } else if let Some(rest) = line.strip_prefix("<EVENT") {
                let object_id = rest
                    .trim_end()
                    .strip_suffix('>')
                    .and_then(|s| s.trim().parse().ok());
                self.current = Some((None, object_id, Vec::new()));
            } else if line.starts_with("<END") {
                let Some((header, event_id, lines)) = self.current.take() else {
                    dropped += line.len() + 1;
                    continue;
                };
                let (status, status_message) =
                    parse_end(&line).unwrap_or((Status::Other(u32::MAX), String::new()));
                let block = match (header, event_id) {
                    (Some(header), _) => Block::Reply {
                        header,
                        lines,
                        status,
                        status_message,
                    },
                    (None, Some(object_id)) => Block::Event {
                        object_id,
                        lines,
                        status,
                        status_message,
                    },
                    (None, None) => {
                        dropped += line.len() + 1;
                        continue;
                    }
                };
                blocks.push(block);
            } else if let Some((_, _, lines)) = &mut self.current {
                lines.push(line);
            } else {
                dropped += line.len() + 1;
            }
        }

        if self.buffer.len() > crate::constants::FRAMER_MAX_BUFFER {
            dropped += self.buffer.len();
            self.buffer.clear();
        }
        (blocks, dropped)
    }
}

// === line parsing ===

/// One data line: leading object id plus `key[value]` options
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Line {
    pub object_id: u16,
    pub values: Vec<(String, String)>,
}

impl Line {
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse `"1000 addr[3] protocol[DCC128] name[\"V 100\"]"`
pub fn parse_line(text: &str) -> Option<Line> {
    let text = text.trim();
    let id_end = text.find(|c: char| !c.is_ascii_digit())?;
    let object_id: u16 = text[..id_end].parse().ok()?;
    let mut line = Line {
        object_id,
        values: Vec::new(),
    };

    let mut rest = text[id_end..].trim_start();
    while !rest.is_empty() {
        let Some(open) = rest.find('[') else {
            break;
        };
        let key = rest[..open].trim().to_string();
        let value_part = &rest[open + 1..];
        let close = if value_part.starts_with('"') {
            // quoted value, find the closing quote then the bracket
            let end_quote = value_part[1..].find('"')? + 1;
            value_part[end_quote..].find(']')? + end_quote
        } else {
            value_part.find(']')?
        };
        let raw = &value_part[..close];
        let value = raw.trim().trim_matches('"').to_string();
        line.values.push((key, value));
        rest = value_part[close + 1..].trim_start();
    }
    Some(line)
}

/// Parse a full line id when no options are needed
pub fn parse_id(text: &str) -> Option<u16> {
    let text = text.trim();
    let id_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..id_end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_syntax() {
        assert_eq!(
            query_objects(10, &["addr", "protocol"]),
            "queryObjects(10, addr, protocol)\n"
        );
        assert_eq!(set_value(1000, "speedstep", 42), "set(1000, speedstep[42])\n");
        assert_eq!(set_pair(1000, "func", 3, 1), "set(1000, func[3,1])\n");
        assert_eq!(set_flag(1, "go"), "set(1, go)\n");
        assert_eq!(
            request(1000, &["control", "force"]),
            "request(1000, control, force)\n"
        );
    }

    #[test]
    fn test_parse_line_options() {
        let line = parse_line("1000 addr[3] protocol[DCC128]").unwrap();
        assert_eq!(line.object_id, 1000);
        assert_eq!(line.value("addr"), Some("3"));
        assert_eq!(line.value("protocol"), Some("DCC128"));
    }

    #[test]
    fn test_parse_line_quoted_value() {
        // brackets inside a quoted value do not end the option
        let line = parse_line("1001 name[\"BR 218 [DB]\"] addr[5]").unwrap();
        assert_eq!(line.value("name"), Some("BR 218 [DB]"));
        assert_eq!(line.value("addr"), Some("5"));
        let simple = parse_line("1001 name[\"V 100\"] addr[5]").unwrap();
        assert_eq!(simple.value("name"), Some("V 100"));
        assert_eq!(simple.value("addr"), Some("5"));
    }

    #[test]
    fn test_parse_end_line() {
        assert_eq!(parse_end("<END 0 (OK)>"), Some((Status::Ok, "OK".into())));
        assert_eq!(
            parse_end("<END 15 (unknown objectid)>"),
            Some((Status::UnknownObject, "unknown objectid".into()))
        );
    }

    #[test]
    fn test_framer_reply_block() {
        let mut framer = Framer::new();
        let stream = b"<REPLY queryObjects(10, addr, protocol)>\n1000 addr[3] protocol[DCC128]\n1001 addr[5] protocol[MM28]\n<END 0 (OK)>\n";
        let (blocks, dropped) = framer.feed(stream);
        assert_eq!(dropped, 0);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Reply {
                header,
                lines,
                status,
                ..
            } => {
                assert_eq!(header.command, "queryObjects");
                assert_eq!(header.object_id, 10);
                assert_eq!(lines.len(), 2);
                assert!(status.is_ok());
            }
            _ => panic!("expected reply block"),
        }
    }

    #[test]
    fn test_framer_event_block() {
        let mut framer = Framer::new();
        let (blocks, _) = framer.feed(b"<EVENT 1000>\n1000 speedstep[12]\n<END 0 (OK)>\n");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::Event {
                object_id, lines, ..
            } => {
                assert_eq!(*object_id, 1000);
                assert_eq!(lines, &vec!["1000 speedstep[12]".to_string()]);
            }
            _ => panic!("expected event block"),
        }
    }

    #[test]
    fn test_framer_partial_feed() {
        let mut framer = Framer::new();
        let (blocks, _) = framer.feed(b"<EVENT 26>\n100 state[0x");
        assert!(blocks.is_empty());
        let (blocks, _) = framer.feed(b"5]\n<END 0 (OK)>\n");
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_framer_drops_stray_lines() {
        let mut framer = Framer::new();
        let (blocks, dropped) = framer.feed(b"garbage line\n");
        assert!(blocks.is_empty());
        assert!(dropped > 0);
    }
}
