//! Traintastic DIY simulation IO handler
//!
//! Answers the handshake and heartbeats like a healthy device and
//! acknowledges output writes with the matching change report.

use super::kernel::Kernel;
use super::messages::{Message, INPUT_ADDRESS_MAX, INPUT_ADDRESS_MIN};
use crate::core::{SimulateInputAction, TriState};
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};
use std::collections::HashMap;

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    outputs: HashMap<u16, bool>,
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
                        if let simulator::Message::SensorChanged { address, value, .. } = message {
                            let address = u32::from(address);
                            if (INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
                                let action = if value {
                                    SimulateInputAction::SetTrue
                                } else {
                                    SimulateInputAction::SetFalse
                                };
                                client_handle
                                    .post(move |k| k.simulate_input_change(address, action));
                            }
                        }
                    },
                )?)
            }
            None => None,
        };
        Ok(Self {
            handle,
            simulator,
            outputs: HashMap::new(),
        })
    }

    /// Answer an outgoing frame
    pub fn send(&mut self, message: &Message) {
        match message {
            Message::Heartbeat => self.reply(Message::Heartbeat),
            Message::GetInfo => self.reply(Message::Info {
                version_major: 1,
                version_minor: 0,
            }),
            Message::SetOutput { address, value } => {
                self.outputs.insert(*address, *value);
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::AccessorySetState {
                        channel: crate::output::CHANNEL_DEFAULT,
                        address: *address,
                        state: u8::from(*value),
                    });
                }
                self.reply(Message::OutputChanged {
                    address: *address,
                    value: TriState::from(*value),
                });
            }
            Message::GetOutputState { address } => {
                let value = self
                    .outputs
                    .get(address)
                    .map(|v| TriState::from(*v))
                    .unwrap_or(TriState::Undefined);
                self.reply(Message::OutputChanged {
                    address: *address,
                    value,
                });
            }
            _ => {}
        }
    }

    /// Post a frame through the kernel's receive path
    fn reply(&self, message: Message) {
        self.handle.post(move |kernel| kernel.receive(message));
    }
}
