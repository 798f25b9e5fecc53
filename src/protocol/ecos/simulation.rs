//! ECoS simulation IO handler
//!
//! A miniature command station: two locomotives, a pair of switches and
//! two S88 feedback modules. Requests are parsed from the outgoing
//! command text and answered with well-formed reply blocks; accepted
//! `set` commands additionally produce the event block a real station
//! would broadcast to view holders.

use super::kernel::Kernel;
use super::messages::{object_id, Block, ReplyHeader, Status};
use super::simulation_station::Station;
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    station: Station,
}

impl SimulationIoHandler {
    pub fn new(
        handle: KernelHandle<Kernel>,
        simulator: Option<&SimulatorConfig>,
    ) -> Result<Self> {
        let simulator = match simulator {
            Some(config) => {
                let client_handle = handle.clone();
                Some(SimulatorClient::connect(
                    &config.host,
                    config.port,
                    move |message| match message {
                        simulator::Message::Power { on } => {
                            let status = if on { "GO" } else { "STOP" };
                            let block = Block::Event {
                                object_id: object_id::ECOS,
                                lines: vec![format!("1 status[{}]", status)],
                                status: Status::Ok,
                                status_message: "OK".into(),
                            };
                            client_handle.post(move |k| k.receive(block));
                        }
                        simulator::Message::SensorChanged { address, value, .. } => {
                            let address = u32::from(address);
                            let action = if value {
                                SimulateInputAction::SetTrue
                            } else {
                                SimulateInputAction::SetFalse
                            };
                            client_handle.post(move |k| k.simulate_input_change(address, action));
                        }
                        _ => {}
                    },
                )?)
            }
            None => None,
        };
        Ok(Self {
            handle,
            simulator,
            station: Station::new(),
        })
    }

    /// Answer one outgoing command line
    pub fn send(&mut self, line: &str) {
        let Some(request) = parse_request(line) else {
            return;
        };

        let blocks = self.station.handle(&request);
        for block in blocks {
            self.reply(block);
        }

        // fan out power changes to the layout simulator
        if request.command == "set" && request.object_id == object_id::ECOS {
            if let Some(simulator) = &self.simulator {
                if request.options.iter().any(|o| o == "go") {
                    simulator.send(&simulator::Message::Power { on: true });
                } else if request.options.iter().any(|o| o == "stop") {
                    simulator.send(&simulator::Message::Power { on: false });
                }
            }
        }
    }

    /// Post a block through the kernel's receive path
    fn reply(&self, block: Block) {
        self.handle.post(move |kernel| kernel.receive(block));
    }
}

/// Parse `command(id, opt, ...)` from an outgoing line
fn parse_request(line: &str) -> Option<ReplyHeader> {
    let line = line.trim();
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    let command = line[..open].trim().to_string();
    let mut parts = line[open + 1..close].split(',').map(str::trim);
    let object_id = parts.next()?.parse().ok()?;
    Some(ReplyHeader {
        command,
        object_id,
        options: parts.map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let request = parse_request("queryObjects(10, addr, protocol)\n").unwrap();
        assert_eq!(request.command, "queryObjects");
        assert_eq!(request.object_id, 10);
        assert_eq!(request.options, vec!["addr".to_string(), "protocol".into()]);
    }
}
