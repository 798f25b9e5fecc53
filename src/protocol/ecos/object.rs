//! ECoS object mirror
//!
//! The station owns the objects; the kernel mirrors the ones it cares
//! about. Each type knows how to absorb its own reply/event lines.

use super::messages::Line;
use crate::core::Direction;
use std::collections::HashMap;

/// Locomotive protocol as the station reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcosProtocol {
    Mm14,
    Mm27,
    Mm28,
    Dcc14,
    Dcc28,
    Dcc128,
    Sx32,
    Mmfkt,
    #[default]
    Unknown,
}

impl EcosProtocol {
    pub fn from_str(text: &str) -> Self {
        match text {
            "MM14" => Self::Mm14,
            "MM27" => Self::Mm27,
            "MM28" => Self::Mm28,
            "DCC14" => Self::Dcc14,
            "DCC28" => Self::Dcc28,
            "DCC128" => Self::Dcc128,
            "SX32" => Self::Sx32,
            "MMFKT" => Self::Mmfkt,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mm14 => "MM14",
            Self::Mm27 => "MM27",
            Self::Mm28 => "MM28",
            Self::Dcc14 => "DCC14",
            Self::Dcc28 => "DCC28",
            Self::Dcc128 => "DCC128",
            Self::Sx32 => "SX32",
            Self::Mmfkt => "MMFKT",
            Self::Unknown => "?",
        }
    }

    /// Speed steps of the protocol's wire encoding
    pub fn speed_steps(self) -> u8 {
        match self {
            Self::Mm14 | Self::Dcc14 | Self::Mmfkt => 14,
            Self::Mm27 => 27,
            Self::Mm28 | Self::Dcc28 => 28,
            Self::Dcc128 => 126,
            Self::Sx32 => 31,
            Self::Unknown => 126,
        }
    }

    pub fn is_dcc(self) -> bool {
        matches!(self, Self::Dcc14 | Self::Dcc28 | Self::Dcc128)
    }
}

/// What changed when a locomotive absorbed a line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocoChange {
    SpeedStep(u8),
    Direction(Direction),
    Function { index: u8, value: bool },
}

/// Mirror of one station locomotive
#[derive(Debug, Clone, Default)]
pub struct Locomotive {
    pub id: u16,
    pub address: u16,
    pub protocol: EcosProtocol,
    pub name: String,
    /// `request(id, control, force)` issued
    pub control_requested: bool,
    /// station granted control
    pub control: bool,
    pub speed_step: u8,
    pub direction: Direction,
    pub functions: HashMap<u8, bool>,
}

impl Locomotive {
    pub fn from_line(line: &Line) -> Self {
        let mut loco = Self {
            id: line.object_id,
            ..Self::default()
        };
        loco.absorb(line);
        loco
    }

    /// Absorb one data line; returns what changed
    pub fn absorb(&mut self, line: &Line) -> Vec<LocoChange> {
        let mut changes = Vec::new();
        for (key, value) in &line.values {
            match key.as_str() {
                "addr" => {
                    if let Ok(address) = value.parse() {
                        self.address = address;
                    }
                }
                "protocol" => self.protocol = EcosProtocol::from_str(value),
                "name" => self.name = value.clone(),
                "speedstep" | "speed" => {
                    if let Ok(step) = value.parse::<u8>() {
                        if self.speed_step != step {
                            self.speed_step = step;
                            changes.push(LocoChange::SpeedStep(step));
                        }
                    }
                }
                "dir" => {
                    let direction = if value == "1" {
                        Direction::Reverse
                    } else {
                        Direction::Forward
                    };
                    if self.direction != direction {
                        self.direction = direction;
                        changes.push(LocoChange::Direction(direction));
                    }
                }
                "func" => {
                    // func[index,value]
                    if let Some((index, value)) = value.split_once(',') {
                        if let (Ok(index), Some(value)) =
                            (index.trim().parse::<u8>(), value.trim().chars().next())
                        {
                            let value = value == '1';
                            if self.functions.insert(index, value) != Some(value) {
                                changes.push(LocoChange::Function { index, value });
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        changes
    }
}

/// Mirror of one station switch (turnout, signal)
#[derive(Debug, Clone, Default)]
pub struct Switch {
    pub id: u16,
    pub address: u16,
    pub name: String,
    pub state: u8,
    /// Drive in progress, end position not yet reached
    pub switching: bool,
}

impl Switch {
    pub fn from_line(line: &Line) -> Self {
        let mut switch = Self {
            id: line.object_id,
            ..Self::default()
        };
        switch.absorb(line);
        switch
    }

    /// Absorb one data line; true when the state changed
    pub fn absorb(&mut self, line: &Line) -> bool {
        let mut state_changed = false;
        for (key, value) in &line.values {
            match key.as_str() {
                "addr" => {
                    if let Ok(address) = value.parse() {
                        self.address = address;
                    }
                }
                "name1" | "name" => self.name = value.clone(),
                "state" => {
                    if let Ok(state) = value.parse::<u8>() {
                        if self.state != state {
                            self.state = state;
                            state_changed = true;
                        }
                    }
                }
                "switching" => self.switching = value == "1",
                _ => {}
            }
        }
        state_changed
    }
}

/// Mirror of one S88 feedback module
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    pub id: u16,
    pub ports: u8,
    pub state: u32,
}

impl Feedback {
    pub fn from_line(line: &Line) -> Self {
        let mut feedback = Self {
            id: line.object_id,
            ports: 16,
            ..Self::default()
        };
        feedback.absorb(line);
        feedback
    }

    /// Absorb one data line; returns `(port, value)` for changed ports
    pub fn absorb(&mut self, line: &Line) -> Vec<(u8, bool)> {
        let mut changes = Vec::new();
        for (key, value) in &line.values {
            match key.as_str() {
                "ports" => {
                    if let Ok(ports) = value.parse() {
                        self.ports = ports;
                    }
                }
                "state" => {
                    let raw = value.trim_start_matches("0x");
                    if let Ok(state) = u32::from_str_radix(raw, 16) {
                        let diff = self.state ^ state;
                        for port in 0..self.ports.min(32) {
                            if diff & (1 << port) != 0 {
                                changes.push((port, state & (1 << port) != 0));
                            }
                        }
                        self.state = state;
                    }
                }
                _ => {}
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ecos::messages::parse_line;

    #[test]
    fn test_locomotive_from_query_line() {
        let line = parse_line("1000 addr[3] protocol[DCC128]").unwrap();
        let loco = Locomotive::from_line(&line);
        assert_eq!(loco.id, 1000);
        assert_eq!(loco.address, 3);
        assert_eq!(loco.protocol, EcosProtocol::Dcc128);
        assert!(!loco.control_requested);
    }

    #[test]
    fn test_locomotive_absorb_changes() {
        let mut loco = Locomotive::from_line(&parse_line("1000 addr[3] protocol[DCC28]").unwrap());
        let changes = loco.absorb(&parse_line("1000 speedstep[12] dir[1]").unwrap());
        assert_eq!(
            changes,
            vec![
                LocoChange::SpeedStep(12),
                LocoChange::Direction(Direction::Reverse)
            ]
        );
        // same values again, no changes
        let changes = loco.absorb(&parse_line("1000 speedstep[12] dir[1]").unwrap());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_locomotive_function_line() {
        let mut loco = Locomotive::default();
        let changes = loco.absorb(&parse_line("1000 func[3,1]").unwrap());
        assert_eq!(
            changes,
            vec![LocoChange::Function {
                index: 3,
                value: true
            }]
        );
    }

    #[test]
    fn test_feedback_state_diff() {
        let mut feedback = Feedback::from_line(&parse_line("100 ports[16]").unwrap());
        let changes = feedback.absorb(&parse_line("100 state[0x5]").unwrap());
        assert_eq!(changes, vec![(0, true), (2, true)]);
        let changes = feedback.absorb(&parse_line("100 state[0x4]").unwrap());
        assert_eq!(changes, vec![(0, false)]);
    }

    #[test]
    fn test_switch_state() {
        let mut switch = Switch::from_line(&parse_line("20000 addr[1] state[0]").unwrap());
        assert!(switch.absorb(&parse_line("20000 state[1]").unwrap()));
        assert!(!switch.absorb(&parse_line("20000 state[1]").unwrap()));
        assert_eq!(switch.state, 1);
    }

    #[test]
    fn test_protocol_speed_steps() {
        assert_eq!(EcosProtocol::Dcc128.speed_steps(), 126);
        assert_eq!(EcosProtocol::Mm28.speed_steps(), 28);
        assert_eq!(EcosProtocol::Sx32.speed_steps(), 31);
    }
}
