//! LocoNet simulation IO handler
//!
//! LocoNet is a bus: everything transmitted is echoed back to the
//! sender. The handler echoes every frame, assigns slots for address
//! requests from a small local slot table, and answers LNCV reads from
//! a scratch module memory.

use super::kernel::Kernel;
use super::messages::{INPUT_ADDRESS_MAX, INPUT_ADDRESS_MIN};
use super::messages::{
    FastClock, LncvMessage, Message, SlotData, FAST_CLOCK_SLOT, SLOT_MIN,
};
use crate::core::SimulateInputAction;
use crate::error::Result;
use crate::kernel::{KernelHandle, SimulatorConfig};
use crate::simulator::{self, SimulatorClient};
use std::collections::HashMap;

pub struct SimulationIoHandler {
    handle: KernelHandle<Kernel>,
    simulator: Option<SimulatorClient>,
    slots: HashMap<u16, u8>,
    next_slot: u8,
    fast_clock: FastClock,
    lncv_memory: HashMap<(u16, u16), u16>,
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
                            let reply = if on { Message::PowerOn } else { Message::PowerOff };
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
            slots: HashMap::new(),
            next_slot: SLOT_MIN,
            fast_clock: FastClock {
                rate: 1,
                hours: 0,
                minutes: 0,
            },
            lncv_memory: HashMap::new(),
        })
    }

    /// Answer an outgoing frame; everything is echoed first
    pub fn send(&mut self, message: &Message) {
        self.reply(message.clone());

        match message {
            Message::PowerOn => {
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: true });
                }
            }
            Message::PowerOff => {
                if let Some(simulator) = &self.simulator {
                    simulator.send(&simulator::Message::Power { on: false });
                }
            }
            Message::LocoAddress { address } => {
                let slot = match self.slots.get(address) {
                    Some(slot) => *slot,
                    None => {
                        let slot = self.next_slot;
                        self.next_slot = self.next_slot.wrapping_add(1).max(SLOT_MIN);
                        self.slots.insert(*address, slot);
                        slot
                    }
                };
                self.reply(Message::SlotReadData(SlotData {
                    slot,
                    stat1: 0,
                    address: *address,
                    speed: 0,
                    dirf: 0,
                    snd: 0,
                }));
            }
            Message::RequestSlotData { slot } if *slot == FAST_CLOCK_SLOT => {
                let clock = self.fast_clock;
                self.reply(Message::FastClockRead(clock));
            }
            Message::RequestSlotData { slot } => {
                if let Some((address, _)) =
                    self.slots.iter().find(|(_, s)| **s == *slot)
                {
                    let data = SlotData {
                        slot: *slot,
                        stat1: SlotData::STAT1_IN_USE,
                        address: *address,
                        speed: 0,
                        dirf: 0,
                        snd: 0,
                    };
                    self.reply(Message::SlotReadData(data));
                }
            }
            Message::FastClockWrite(clock) => {
                self.fast_clock = *clock;
            }
            Message::LocoSpeed { slot, speed } => {
                if let Some(simulator) = &self.simulator {
                    if let Some((address, _)) = self.slots.iter().find(|(_, s)| **s == *slot) {
                        simulator.send(&simulator::Message::LocomotiveSpeedDirection {
                            address: *address,
                            protocol: 0,
                            speed: if *speed > 1 { speed - 1 } else { 0 },
                            direction: crate::core::Direction::Forward,
                            emergency_stop: *speed == 1,
                        });
                    }
                }
            }
            Message::SwitchRequest { address, thrown, on } => {
                if *on {
                    if let Some(simulator) = &self.simulator {
                        simulator.send(&simulator::Message::AccessorySetState {
                            channel: crate::output::CHANNEL_DEFAULT,
                            address: *address,
                            state: u8::from(*thrown),
                        });
                    }
                }
            }
            Message::Lncv(LncvMessage::Read { module_id, lncv }) => {
                let value = self
                    .lncv_memory
                    .get(&(*module_id, *lncv))
                    .copied()
                    .unwrap_or(0);
                self.reply(Message::Lncv(LncvMessage::ReadResponse {
                    module_id: *module_id,
                    lncv: *lncv,
                    value,
                }));
            }
            Message::Lncv(LncvMessage::Write {
                module_id,
                lncv,
                value,
            }) => {
                self.lncv_memory.insert((*module_id, *lncv), *value);
                self.reply(Message::LongAck {
                    opcode: super::messages::OPC_PEER_XFER & 0x7F,
                    ack: 0x7F,
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
