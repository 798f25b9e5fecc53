//! Canned ECoS station used by the simulation IO handler

use super::messages::{object_id, Block, ReplyHeader, Status};
use std::collections::HashMap;

struct SimLoco {
    id: u16,
    address: u16,
    protocol: &'static str,
    speed_step: u8,
    direction: u8,
    functions: HashMap<u8, bool>,
}

struct SimSwitch {
    id: u16,
    address: u16,
    state: u8,
}

struct SimFeedback {
    id: u16,
    ports: u8,
    state: u32,
}

/// Station inventory plus GO/STOP state
pub struct Station {
    go: bool,
    locos: Vec<SimLoco>,
    switches: Vec<SimSwitch>,
    feedbacks: Vec<SimFeedback>,
}

fn ok_reply(header: ReplyHeader, lines: Vec<String>) -> Block {
    Block::Reply {
        header,
        lines,
        status: Status::Ok,
        status_message: "OK".into(),
    }
}

fn event(object_id: u16, lines: Vec<String>) -> Block {
    Block::Event {
        object_id,
        lines,
        status: Status::Ok,
        status_message: "OK".into(),
    }
}

impl Station {
    pub fn new() -> Self {
        Self {
            go: false,
            locos: vec![
                SimLoco {
                    id: 1000,
                    address: 3,
                    protocol: "DCC128",
                    speed_step: 0,
                    direction: 0,
                    functions: HashMap::new(),
                },
                SimLoco {
                    id: 1001,
                    address: 5,
                    protocol: "MM28",
                    speed_step: 0,
                    direction: 0,
                    functions: HashMap::new(),
                },
            ],
            switches: vec![
                SimSwitch {
                    id: 20000,
                    address: 1,
                    state: 0,
                },
                SimSwitch {
                    id: 20001,
                    address: 2,
                    state: 0,
                },
            ],
            feedbacks: vec![
                SimFeedback {
                    id: 100,
                    ports: 16,
                    state: 0,
                },
                SimFeedback {
                    id: 101,
                    ports: 16,
                    state: 0,
                },
            ],
        }
    }

    /// Answer one request with reply (and possibly event) blocks
    pub fn handle(&mut self, request: &ReplyHeader) -> Vec<Block> {
        let mut blocks = Vec::new();
        match (request.command.as_str(), request.object_id) {
            ("queryObjects", object_id::LOCOMOTIVE_MANAGER) => {
                let lines = self
                    .locos
                    .iter()
                    .map(|loco| format!("{} addr[{}] protocol[{}]", loco.id, loco.address, loco.protocol))
                    .collect();
                blocks.push(ok_reply(request.clone(), lines));
            }
            ("queryObjects", object_id::SWITCH_MANAGER) => {
                let lines = self
                    .switches
                    .iter()
                    .map(|switch| format!("{} addr[{}]", switch.id, switch.address))
                    .collect();
                blocks.push(ok_reply(request.clone(), lines));
            }
            ("queryObjects", object_id::FEEDBACK_MANAGER) => {
                let lines = self
                    .feedbacks
                    .iter()
                    .map(|feedback| format!("{} ports[{}]", feedback.id, feedback.ports))
                    .collect();
                blocks.push(ok_reply(request.clone(), lines));
            }
            ("get", object_id::ECOS) => {
                let status = if self.go { "GO" } else { "STOP" };
                blocks.push(ok_reply(
                    request.clone(),
                    vec![
                        format!("1 status[{}]", status),
                        "1 info[\"ECoS simulation\"]".into(),
                    ],
                ));
            }
            ("set", object_id::ECOS) => {
                let go = request.options.iter().any(|o| o == "go");
                let stop = request.options.iter().any(|o| o == "stop");
                if go || stop {
                    self.go = go;
                    let status = if self.go { "GO" } else { "STOP" };
                    blocks.push(ok_reply(request.clone(), Vec::new()));
                    blocks.push(event(
                        object_id::ECOS,
                        vec![format!("1 status[{}]", status)],
                    ));
                }
            }
            ("set", id) => {
                blocks.push(ok_reply(request.clone(), Vec::new()));
                if let Some(lines) = self.apply_set(id, &request.options) {
                    blocks.push(event(id, lines));
                }
            }
            ("request", _) | ("release", _) => {
                blocks.push(ok_reply(request.clone(), Vec::new()));
            }
            ("get", id) => {
                if let Some(loco) = self.locos.iter().find(|l| l.id == id) {
                    blocks.push(ok_reply(
                        request.clone(),
                        vec![format!(
                            "{} speedstep[{}] dir[{}]",
                            id, loco.speed_step, loco.direction
                        )],
                    ));
                }
            }
            _ => {}
        }
        blocks
    }

    /// Apply a `set` to an object; returns the event lines it broadcasts
    fn apply_set(&mut self, id: u16, options: &[String]) -> Option<Vec<String>> {
        for option in options {
            let (key, value) = match option.find('[') {
                Some(open) => (
                    &option[..open],
                    option[open + 1..].trim_end_matches(']'),
                ),
                None => (option.as_str(), ""),
            };
            if let Some(loco) = self.locos.iter_mut().find(|l| l.id == id) {
                match key {
                    "speedstep" => {
                        if let Ok(step) = value.parse() {
                            loco.speed_step = step;
                            return Some(vec![format!("{} speedstep[{}]", id, step)]);
                        }
                    }
                    "dir" => {
                        if let Ok(dir) = value.parse() {
                            loco.direction = dir;
                            return Some(vec![format!("{} dir[{}]", id, dir)]);
                        }
                    }
                    "func" => {
                        if let Some((index, val)) = value.split_once(',') {
                            if let Ok(index) = index.trim().parse::<u8>() {
                                let val = val.trim() == "1";
                                loco.functions.insert(index, val);
                                return Some(vec![format!(
                                    "{} func[{},{}]",
                                    id,
                                    index,
                                    u8::from(val)
                                )]);
                            }
                        }
                    }
                    "stop" => {
                        loco.speed_step = 0;
                        return Some(vec![format!("{} speedstep[0]", id)]);
                    }
                    _ => {}
                }
            } else if let Some(switch) = self.switches.iter_mut().find(|s| s.id == id) {
                if key == "state" {
                    if let Ok(state) = value.parse() {
                        switch.state = state;
                        return Some(vec![format!("{} state[{}]", id, state)]);
                    }
                }
            }
        }
        None
    }
}
