//! WiThrottle simulation IO handler
//!
//! Plays a minimal JMRI-like server: greets with a protocol version and
//! heartbeat interval, confirms power changes and echoes throttle
//! commands the way a server reports them back to the client.

use super::kernel::Kernel;
use super::messages::SEPARATOR;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};
use std::collections::HashMap;

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    greeted: bool,
    /// key -> loco id ("S3", "L1234")
    throttles: HashMap<char, String>,
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
                    move |message| {
                        if let simulator::Message::Power { on } = message {
                            let line = format!("PPA{}", u8::from(on));
                            client_handle.post(move |k| k.receive(&line));
                        }
                    },
                )?)
            }
            None => None,
        };
        Ok(Self {
            handle,
            simulator,
            greeted: false,
            throttles: HashMap::new(),
        })
    }

    /// Answer one outgoing line
    pub fn send(&mut self, line: &str) {
        if !self.greeted {
            self.greeted = true;
            self.reply("VN2.0");
            self.reply("*10");
        }

        let line = line.trim();
        if let Some(state) = line.strip_prefix("PPA") {
            let on = state.starts_with('1');
            if let Some(simulator) = &self.simulator {
                simulator.send(&simulator::Message::Power { on });
            }
            self.reply(&format!("PPA{}", u8::from(on)));
        } else if let Some(rest) = line.strip_prefix("MT+") {
            // acquire: confirm with the loco id the server assigned
            if let Some((key_part, loco)) = rest.split_once(SEPARATOR) {
                if let Some(key) = key_part.chars().next() {
                    self.throttles.insert(key, loco.to_string());
                    self.reply(&format!("M{}+{}{}", key, loco, SEPARATOR));
                }
            }
        } else if let Some(rest) = line.strip_prefix("MTA") {
            // action: echo it back as the server does
            if let Some((key_part, command)) = rest.split_once(SEPARATOR) {
                if let Some(key) = key_part.chars().next() {
                    if let Some(loco) = self.throttles.get(&key) {
                        self.reply(&format!("M{}A{}{}{}", key, loco, SEPARATOR, command));
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("PTA") {
            // turnout command: report the resulting state
            let mut chars = rest.chars();
            if let Some(state) = chars.next() {
                let system_name: String = chars.collect();
                if state == 'T' || state == 'C' {
                    if let Some(simulator) = &self.simulator {
                        if let Ok(address) = system_name.parse::<u16>() {
                            simulator.send(&simulator::Message::AccessorySetState {
                                channel: crate::output::CHANNEL_DEFAULT,
                                address,
                                state: u8::from(state == 'T'),
                            });
                        }
                    }
                    self.reply(&format!("PTA{}{}", state, system_name));
                }
            }
        }
    }

    /// Post a line through the kernel's receive path
    fn reply(&self, line: &str) {
        let line = line.to_string();
        self.handle.post(move |kernel| kernel.receive(&line));
    }
}
