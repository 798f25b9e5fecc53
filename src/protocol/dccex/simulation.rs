//! DCC-EX simulation IO handler
//!
//! Parses outgoing command lines, keeps a small command station mirror
//! and posts the replies a real DCC-EX would produce back through the
//! kernel's receive path.

use super::kernel::{Kernel, INPUT_ADDRESS_MAX};
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};
use std::collections::HashMap;

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    power_on: bool,
    turnouts: HashMap<u32, bool>,
    outputs: HashMap<u32, bool>,
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
                            let line = if on { "<p1>" } else { "<p0>" };
                            client_handle.post(move |k| k.receive(line));
                        }
                        simulator::Message::SensorChanged { address, value, .. } => {
                            let address = u32::from(address);
                            if address <= INPUT_ADDRESS_MAX {
                                let action = if value {
                                    SimulateInputAction::SetTrue
                                } else {
                                    SimulateInputAction::SetFalse
                                };
                                client_handle
                                    .post(move |k| k.simulate_input_change(address, action));
                            }
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
            power_on: false,
            turnouts: HashMap::new(),
            outputs: HashMap::new(),
        })
    }

    /// Answer one outgoing command line
    pub fn send(&mut self, line: &str) {
        let Some(inner) = line.trim().strip_prefix('<').and_then(|s| s.strip_suffix('>')) else {
            return;
        };
        let mut parts = inner.split_ascii_whitespace();
        match parts.next() {
            Some("1") => {
                self.power_on = true;
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: true });
                }
                self.reply("<p1>");
            }
            Some("0") => {
                self.power_on = false;
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: false });
                }
                self.reply("<p0>");
            }
            Some("s") => {
                self.reply(if self.power_on { "<p1>" } else { "<p0>" });
            }
            Some("T") => {
                if let (Some(id), Some(state)) = (parts.next(), parts.next()) {
                    if let Ok(id) = id.parse::<u32>() {
                        let thrown = state == "1" || state == "T";
                        self.turnouts.insert(id, thrown);
                        self.reply(&format!("<H {} {}>", id, u8::from(thrown)));
                    }
                }
            }
            Some("Z") => {
                if let (Some(id), Some(state)) = (parts.next(), parts.next()) {
                    if let Ok(id) = id.parse::<u32>() {
                        let value = state == "1";
                        self.outputs.insert(id, value);
                        self.reply(&format!("<Y {} {}>", id, u8::from(value)));
                    }
                }
            }
            Some("a") => {
                // Accessory commands are unacknowledged, fan out to the
                // layout simulator only.
                if let (Some(address), Some(state), Some(simulator)) =
                    (parts.next(), parts.next(), self.simulator.as_ref())
                {
                    if let Ok(address) = address.parse::<u16>() {
                        simulator.send(&simulator::Message::AccessorySetState {
                            channel: super::kernel::CHANNEL_ACCESSORY,
                            address,
                            state: u8::from(state == "1"),
                        });
                    }
                }
            }
            Some("t") => {
                if let Some(simulator) = &self.simulator {
                    let fields: Vec<&str> = parts.collect();
                    if let [address, speed, direction] = fields[..] {
                        if let (Ok(address), Ok(speed)) =
                            (address.parse::<u16>(), speed.parse::<i16>())
                        {
                            simulator.send(&simulator::Message::LocomotiveSpeedDirection {
                                address,
                                protocol: 0,
                                speed: speed.max(0) as u8,
                                direction: if direction == "1" {
                                    crate::core::Direction::Forward
                                } else {
                                    crate::core::Direction::Reverse
                                },
                                emergency_stop: speed < 0,
                            });
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Post a reply line through the kernel's receive path
    fn reply(&self, line: &str) {
        let line = line.to_string();
        self.handle.post(move |kernel| kernel.receive(&line));
    }
}
