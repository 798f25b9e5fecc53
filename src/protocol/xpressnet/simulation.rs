//! XpressNet simulation IO handler
//!
//! Answers requests with protocol-legal replies. Broadcast replies are
//! sent three times, mimicking the retransmit behaviour of real command
//! stations; the kernel's mirrors deduplicate them.
//!
//! With an external layout simulator configured, power commands fan out
//! to it and its sensor events are injected back through the kernel's
//! `simulate_input_change`, which routes them through `receive` like any
//! hardware feedback broadcast.

use super::kernel::{Kernel, INPUT_ADDRESS_MAX, INPUT_ADDRESS_MIN};
use super::messages::Message;
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};

const BROADCAST_REPEAT: usize = 3;

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
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
                            let reply = if on {
                                Message::NormalOperationResumed
                            } else {
                                Message::TrackPowerOff
                            };
                            for _ in 0..BROADCAST_REPEAT {
                                let reply = reply.clone();
                                client_handle.post(move |k| k.receive(reply));
                            }
                        }
                        simulator::Message::SensorChanged { address, value, .. } => {
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
                        _ => {}
                    },
                )?)
            }
            None => None,
        };
        Ok(Self { handle, simulator })
    }

    /// Answer an outgoing frame
    pub fn send(&mut self, message: &Message) {
        match message {
            Message::ResumeOperationsRequest => {
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: true });
                }
                self.reply_n(Message::NormalOperationResumed, BROADCAST_REPEAT);
            }
            Message::StopOperationsRequest => {
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: false });
                }
                self.reply_n(Message::TrackPowerOff, BROADCAST_REPEAT);
            }
            Message::StopAllLocomotivesRequest => {
                self.reply_n(Message::EmergencyStop, BROADCAST_REPEAT);
            }
            Message::AccessoryOperation { address, activate } => {
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::AccessorySetState {
                        channel: crate::output::CHANNEL_DEFAULT,
                        address: *address,
                        state: u8::from(*activate),
                    });
                }
            }
            _ => {}
        }
    }

    /// Post a reply through the kernel's receive path with posting delay
    fn reply(&self, message: Message) {
        self.handle.post(move |kernel| kernel.receive(message));
    }

    fn reply_n(&self, message: Message, count: usize) {
        for _ in 0..count {
            self.reply(message.clone());
        }
    }
}
