//! Märklin CAN simulation IO handler
//!
//! Plays a Gleisbox-like node: system commands are confirmed with the
//! response bit set, pings are answered with our node UID, and status
//! data probes stream a canned device description.

use super::kernel::Kernel;
use super::messages::{
    self, command, Message, DeviceDescription, STATUS_DATA_CHUNK_HASH,
};
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};

const NODE_UID: u32 = 0x4753_0001;

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
                            let subcommand = if on {
                                messages::system_subcommand::GO
                            } else {
                                messages::system_subcommand::STOP
                            };
                            let mut reply =
                                Message::with_uid(command::SYSTEM, true, 0x0300, 0);
                            reply.dlc = 5;
                            reply.data[4] = subcommand;
                            client_handle.post(move |k| k.receive(reply));
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
        Ok(Self { handle, simulator })
    }

    /// Answer an outgoing record
    pub fn send(&mut self, message: &Message) {
        match message.command {
            command::SYSTEM => {
                // the station confirms system commands
                let mut echo = *message;
                echo.response = true;
                self.reply(echo);
                if let Some(simulator) = &self.simulator {
                    if message.dlc >= 5 {
                        match message.data[4] {
                            messages::system_subcommand::GO => {
                                simulator.send(&simulator::Message::Power { on: true });
                            }
                            messages::system_subcommand::STOP => {
                                simulator.send(&simulator::Message::Power { on: false });
                            }
                            _ => {}
                        }
                    }
                }
            }
            command::PING => {
                let mut reply = Message::with_uid(command::PING, true, 0x0301, NODE_UID);
                reply.dlc = 8;
                // software version 1.0, device type Gleisbox (0x0010)
                reply.data[4] = 0x01;
                reply.data[5] = 0x00;
                reply.data[6] = 0x00;
                reply.data[7] = 0x10;
                self.reply(reply);
            }
            command::STATUS_DATA_CONFIG if message.dlc >= 5 && message.data[4] == 0 => {
                let description = DeviceDescription {
                    readings_count: 0,
                    configuration_channels: 0,
                    serial_number: 77001,
                    article_number: "60116".into(),
                    device_name: "Gleisbox".into(),
                };
                let payload = description.to_bytes();
                let mut count = 0u8;
                for (i, chunk) in payload.chunks(8).enumerate() {
                    let mut data = [0u8; 8];
                    data[..chunk.len()].copy_from_slice(chunk);
                    let mut record =
                        Message::new(command::STATUS_DATA_CONFIG, false, 0);
                    record.hash = STATUS_DATA_CHUNK_HASH + i as u16;
                    record.dlc = 8;
                    record.data = data;
                    self.reply(record);
                    count += 1;
                }
                let mut closing =
                    Message::with_uid(command::STATUS_DATA_CONFIG, true, 0x0301, message.uid());
                closing.dlc = 6;
                closing.data[4] = 0;
                closing.data[5] = count;
                self.reply(closing);
            }
            command::LOCO_SPEED => {
                let mut echo = *message;
                echo.response = true;
                self.reply(echo);
                if let Some(simulator) = &self.simulator {
                    let speed =
                        u16::from_be_bytes([message.data[4], message.data[5]]);
                    simulator.send(&simulator::Message::LocomotiveSpeedDirection {
                        address: (message.uid() & 0x3FFF) as u16,
                        protocol: 0,
                        speed: (speed / 8) as u8,
                        direction: crate::core::Direction::Forward,
                        emergency_stop: false,
                    });
                }
            }
            command::LOCO_DIRECTION | command::LOCO_FUNCTION => {
                let mut echo = *message;
                echo.response = true;
                self.reply(echo);
            }
            command::ACCESSORY_SWITCH => {
                let mut echo = *message;
                echo.response = true;
                self.reply(echo);
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::AccessorySetState {
                        channel: crate::output::CHANNEL_DEFAULT,
                        address: (message.uid() & 0x07FF) as u16,
                        state: message.data[4],
                    });
                }
            }
            _ => {}
        }
    }

    /// Post a record through the kernel's receive path
    fn reply(&self, message: Message) {
        self.handle.post(move |kernel| kernel.receive(message));
    }
}
