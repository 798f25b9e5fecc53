//! Selectrix simulation IO handler
//!
//! Keeps its own bus image and echoes every write back as a bus report,
//! which is exactly what a gateway in monitor mode does.

use super::kernel::Kernel;
use super::messages::{Message, BUS_ADDRESS_COUNT, POWER_ADDRESS, POWER_BIT};
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    bus: [u8; BUS_ADDRESS_COUNT as usize],
}

impl SimulationIoHandler {
    pub fn new(
        handle: KernelHandle<Kernel>,
        simulator: Option<&SimulatorConfig>,
        _rautenhaus: bool,
    ) -> Result<Self> {
        let simulator = match simulator {
            Some(config) => {
                let client_handle = handle.clone();
                Some(SimulatorClient::connect(
                    &config.host,
                    config.port,
                    move |message| match message {
                        simulator::Message::Power { on } => {
                            let report = Message::Report {
                                address: POWER_ADDRESS,
                                value: if on { POWER_BIT } else { 0 },
                            };
                            client_handle.post(move |k| k.receive(report));
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
            bus: [0; BUS_ADDRESS_COUNT as usize],
        })
    }

    /// Answer an outgoing frame: writes echo back as reports
    pub fn send(&mut self, message: &Message) {
        let Message::Write { address, value } = *message else {
            return;
        };
        if address == POWER_ADDRESS {
            if let Some(simulator) = &self.simulator {
                simulator.send(&simulator::Message::Power {
                    on: value & POWER_BIT != 0,
                });
            }
            self.reply(Message::Report {
                address: POWER_ADDRESS,
                value,
            });
            return;
        }
        if address < BUS_ADDRESS_COUNT {
            self.bus[address as usize] = value;
        }
        self.reply(Message::Report { address, value });
    }

    /// Post a frame through the kernel's receive path
    fn reply(&self, message: Message) {
        self.handle.post(move |kernel| kernel.receive(message));
    }
}
