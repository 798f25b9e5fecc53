//! Z21 simulation IO handler
//!
//! Keeps a local command station mirror (power, locos, turnouts, R-BUS
//! bitmap) and answers every request with the reply a real Z21 would
//! produce, so the kernel's full receive path runs offline.

use super::kernel::{Kernel, INPUT_ADDRESS_MAX, INPUT_ADDRESS_MIN};
use super::messages::{LocoInfo, Message, SystemState, TurnoutOutput};
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};
use std::collections::HashMap;

const SERIAL_NUMBER: u32 = 123456;
const HARDWARE_TYPE: u32 = 0x0000_0201; // black Z21 (2013)
const FIRMWARE_VERSION: u32 = 0x0142;

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    power_on: bool,
    locos: HashMap<(u16, bool), LocoInfo>,
    turnouts: HashMap<u16, TurnoutOutput>,
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
                                Message::LanXBcTrackPowerOn
                            } else {
                                Message::LanXBcTrackPowerOff
                            };
                            client_handle.post(move |k| k.receive(reply));
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
        Ok(Self {
            handle,
            simulator,
            power_on: false,
            locos: HashMap::new(),
            turnouts: HashMap::new(),
        })
    }

    /// Answer an outgoing datagram
    pub fn send(&mut self, message: &Message) {
        match message {
            Message::LanGetSerialNumber => {
                self.reply(Message::LanGetSerialNumberReply {
                    serial_number: SERIAL_NUMBER,
                });
            }
            Message::LanGetHardwareInfo => {
                self.reply(Message::LanGetHardwareInfoReply {
                    hardware_type: HARDWARE_TYPE,
                    firmware_version: FIRMWARE_VERSION,
                });
            }
            Message::LanSystemStateGetData => {
                let state = self.system_state();
                self.reply(Message::LanSystemStateDataChanged(state));
            }
            Message::LanXSetTrackPowerOn => {
                self.power_on = true;
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: true });
                }
                self.reply(Message::LanXBcTrackPowerOn);
            }
            Message::LanXSetTrackPowerOff => {
                self.power_on = false;
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: false });
                }
                self.reply(Message::LanXBcTrackPowerOff);
            }
            Message::LanXSetStop => {
                for loco in self.locos.values_mut() {
                    loco.emergency_stop = true;
                    loco.speed_step = 0;
                }
                self.reply(Message::LanXBcStopped);
            }
            Message::LanXGetLocoInfo {
                address,
                long_address,
            } => {
                let info = self
                    .locos
                    .entry((*address, *long_address))
                    .or_insert_with(|| LocoInfo {
                        address: *address,
                        long_address: *long_address,
                        ..LocoInfo::default()
                    })
                    .clone();
                self.reply(Message::LanXLocoInfo(info));
            }
            Message::LanXSetLocoDrive {
                address,
                long_address,
                speed_steps,
                emergency_stop,
                direction,
                speed_step,
            } => {
                let info = self
                    .locos
                    .entry((*address, *long_address))
                    .or_insert_with(|| LocoInfo {
                        address: *address,
                        long_address: *long_address,
                        ..LocoInfo::default()
                    });
                info.speed_steps = *speed_steps;
                info.emergency_stop = *emergency_stop;
                info.direction = *direction;
                info.speed_step = *speed_step;
                let echo = info.clone();
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::LocomotiveSpeedDirection {
                        address: *address,
                        protocol: 0,
                        speed: *speed_step,
                        direction: *direction,
                        emergency_stop: *emergency_stop,
                    });
                }
                self.reply(Message::LanXLocoInfo(echo));
            }
            Message::LanXSetLocoFunction {
                address,
                long_address,
                function,
                on,
            } => {
                let info = self
                    .locos
                    .entry((*address, *long_address))
                    .or_insert_with(|| LocoInfo {
                        address: *address,
                        long_address: *long_address,
                        ..LocoInfo::default()
                    });
                if let Some(slot) = info.functions.get_mut(*function as usize) {
                    *slot = *on;
                }
                let echo = info.clone();
                self.reply(Message::LanXLocoInfo(echo));
            }
            Message::LanXSetTurnout {
                address,
                output,
                activate,
            } => {
                if *activate {
                    self.turnouts.insert(*address, *output);
                    if let Some(simulator) = &self.simulator {
                        simulator.send(&simulator::Message::AccessorySetState {
                            channel: crate::output::CHANNEL_DEFAULT,
                            address: *address,
                            state: u8::from(*output == TurnoutOutput::Second),
                        });
                    }
                    self.reply(Message::LanXTurnoutInfo {
                        address: *address,
                        position: Some(*output),
                    });
                }
            }
            Message::LanXGetStatus => {
                let status = if self.power_on { 0x00 } else { 0x02 };
                self.reply(Message::LanXStatusChanged { status });
            }
            _ => {}
        }
    }

    fn system_state(&self) -> SystemState {
        SystemState {
            main_current: 850,
            filtered_main_current: 840,
            temperature: 34,
            supply_voltage: 18200,
            vcc_voltage: 17900,
            central_state: if self.power_on { 0x00 } else { 0x02 },
            ..SystemState::default()
        }
    }

    /// Post a reply through the kernel's receive path
    fn reply(&self, message: Message) {
        self.handle.post(move |kernel| kernel.receive(message));
    }
}
