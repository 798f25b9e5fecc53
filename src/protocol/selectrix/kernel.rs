//! Selectrix kernel
//!
//! The mirror is the whole bus image. Feedback addresses are a
//! configured window of the bus; their bits become inputs, one address
//! byte carrying eight contiguous sensors.

use super::messages::{loco_byte, Framer, Message, BUS_ADDRESS_COUNT, POWER_ADDRESS, POWER_BIT};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{Direction, EventLoop, SimulateInputAction, TriState};
use crate::decoder::{DecoderChangeFlags, DecoderSnapshot};
use crate::error::HubError;
use crate::input;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::OutputValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SPEED_STEPS: u8 = 31;
pub const LOCO_ADDRESS_MIN: u16 = 1;
pub const LOCO_ADDRESS_MAX: u16 = 112;
/// Inputs: eight sensors per feedback bus address
pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 8 * BUS_ADDRESS_COUNT as u32;
pub const OUTPUT_ADDRESS_MIN: u32 = 1;
pub const OUTPUT_ADDRESS_MAX: u32 = 8 * BUS_ADDRESS_COUNT as u32;

/// Selectrix kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Rautenhaus gateway framing
    pub rautenhaus: bool,
    /// First bus address treated as feedback
    pub feedback_address_first: u8,
    /// Number of feedback bus addresses
    pub feedback_address_count: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            rautenhaus: false,
            feedback_address_first: 96,
            feedback_address_count: 16,
        }
    }
}

/// Domain callbacks, invoked on the event loop thread
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_power_on_changed: Option<Arc<dyn Fn(bool) + Send + Sync>>,
}

pub struct StartOptions {
    pub log_id: String,
    pub config: KernelConfig,
    pub io: IoConfig,
    pub world: WorldSnapshot,
    pub event_loop: EventLoop,
    pub logger: Logger,
    pub controllers: ControllerLinks,
    pub callbacks: Callbacks,
}

pub type KernelThread = kernel::KernelThread<Kernel>;

enum Io {
    Hardware { tx: mpsc::Sender<Bytes> },
    Simulation(SimulationIoHandler),
}

/// Selectrix protocol engine; lives on its I/O thread
pub struct Kernel {
    log_id: String,
    config: KernelConfig,
    simulation: bool,
    event_loop: EventLoop,
    logger: Logger,
    io: Io,
    framer: Framer,
    world: WorldSnapshot,
    controllers: ControllerLinks,
    callbacks: Callbacks,
    power_on: TriState,
    emergency_stop: TriState,
    /// Observed bus image; `None` until a byte is seen or written
    bus: [Option<u8>; BUS_ADDRESS_COUNT as usize],
    started: bool,
}

/// Launch the kernel on its own I/O thread
pub fn start(options: StartOptions) -> KernelThread {
    let StartOptions {
        log_id,
        config,
        io,
        world,
        event_loop,
        logger,
        controllers,
        callbacks,
    } = options;

    let error_log_id = log_id.clone();
    let error_event_loop = event_loop.clone();
    let error_callbacks = callbacks.clone();

    kernel::spawn(
        "selectrix",
        move |handle, shutdown| {
            let simulation = io.is_simulation();
            let (io, io_rx) = match &io {
                IoConfig::Hardware(transport) => {
                    let channels = kernel::open_link(transport, shutdown)?;
                    (Io::Hardware { tx: channels.tx }, Some(channels.rx))
                }
                IoConfig::Simulation { simulator } => (
                    Io::Simulation(SimulationIoHandler::new(
                        handle.clone(),
                        simulator.as_ref(),
                        config.rautenhaus,
                    )?),
                    None,
                ),
            };

            let framer = Framer::new(config.rautenhaus);
            handle.post_delayed(
                Duration::from_millis(config.startup_delay_ms),
                Kernel::started,
            );

            Ok((
                Kernel {
                    log_id,
                    config,
                    simulation,
                    event_loop,
                    logger,
                    io,
                    framer,
                    world,
                    controllers,
                    callbacks,
                    power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    bus: [None; BUS_ADDRESS_COUNT as usize],
                    started: false,
                },
                io_rx,
            ))
        },
        move |error: HubError| {
            let message = error.to_string();
            error_event_loop.call(move || {
                if let Some(on_error) = &error_callbacks.on_error {
                    on_error(message);
                }
            });
            tracing::error!(object = %error_log_id, "kernel start failed: {}", error);
        },
    )
}

impl KernelState for Kernel {
    fn bytes_received(&mut self, chunk: Bytes) {
        let (messages, dropped) = self.framer.feed(&chunk);
        if dropped > 0 {
            self.logger.log(LogEntry::malformed(self.log_id.clone(), dropped));
        }
        for message in messages {
            self.receive(message);
        }
    }

    fn link_closed(&mut self) {
        self.logger.log(LogEntry::error(
            self.log_id.clone(),
            codes::TRANSPORT,
            "connection to gateway lost",
        ));
        let callbacks = self.callbacks.clone();
        self.event_loop.call(move || {
            if let Some(on_error) = &callbacks.on_error {
                on_error("connection to gateway lost".into());
            }
        });
    }
}

impl Kernel {
    /// Startup delay expired: reconcile with the world state
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if !self.world.run {
            // no bus-wide e-stop; stopped locos are written individually
            self.emergency_stop = TriState::True;
        }
        self.write_power(self.world.power_on);
        if self.world.run {
            self.emergency_stop = TriState::False;
            if let Some(decoder) = self.controllers.decoder.clone() {
                self.event_loop.call(move || {
                    if let Some(controller) = decoder.upgrade() {
                        controller.restore_decoder_speed();
                    }
                });
            }
        }

        self.logger.log(LogEntry::info(
            self.log_id.clone(),
            codes::STARTED,
            "started",
        ));
        if let Some(on_started) = self.callbacks.on_started.clone() {
            self.event_loop.call(move || on_started());
        }
    }

    fn is_feedback_address(&self, address: u8) -> bool {
        address >= self.config.feedback_address_first
            && address
                < self
                    .config
                    .feedback_address_first
                    .saturating_add(self.config.feedback_address_count)
    }

    /// Dispatch one bus frame
    pub fn receive(&mut self, message: Message) {
        if self.config.debug_log_rx_tx {
            self.logger.log(LogEntry::rx(
                self.log_id.clone(),
                message.to_string_dump(self.config.rautenhaus),
            ));
        }

        let (address, value) = match message {
            Message::Report { address, value } | Message::Write { address, value } => {
                (address, value)
            }
        };

        if address == POWER_ADDRESS {
            let on = value & POWER_BIT != 0;
            if self.power_on != TriState::from(on) {
                self.power_on = TriState::from(on);
                if let Some(callback) = self.callbacks.on_power_on_changed.clone() {
                    self.event_loop.call(move || callback(on));
                }
            }
            return;
        }
        if address >= BUS_ADDRESS_COUNT {
            return;
        }

        let previous = self.bus[address as usize];
        self.bus[address as usize] = Some(value);

        if self.is_feedback_address(address) {
            let changed = previous.map(|p| p ^ value).unwrap_or(0xFF);
            for bit in 0..8u32 {
                if changed & (1 << bit) != 0 {
                    let domain_address = u32::from(address) * 8 + bit + INPUT_ADDRESS_MIN;
                    let tri = TriState::from(value & (1 << bit) != 0);
                    if let Some(input) = self.controllers.input.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = input.upgrade() {
                                controller.update_input_value(
                                    input::CHANNEL_DEFAULT,
                                    domain_address,
                                    tri,
                                );
                            }
                        });
                    }
                }
            }
        }
    }

    // === domain-facing commands (arrive via post) ===

    pub fn power_on(&mut self) {
        if self.power_on != TriState::True {
            self.write_power(true);
        }
    }

    pub fn power_off(&mut self) {
        if self.power_on != TriState::False {
            self.write_power(false);
        }
    }

    fn write_power(&mut self, on: bool) {
        self.send(&Message::Write {
            address: POWER_ADDRESS,
            value: if on { POWER_BIT } else { 0 },
        });
    }

    pub fn emergency_stop(&mut self) {
        self.emergency_stop = TriState::True;
    }

    pub fn clear_emergency_stop(&mut self) {
        self.emergency_stop = TriState::False;
    }

    /// Emit the bus byte for a decoder change
    ///
    /// Speed, direction, light (F0) and horn (F1) share the byte, so
    /// every change writes the full image.
    pub fn decoder_changed(
        &mut self,
        decoder: DecoderSnapshot,
        _changes: DecoderChangeFlags,
        _function_number: u32,
    ) {
        if decoder.address < LOCO_ADDRESS_MIN || decoder.address > LOCO_ADDRESS_MAX {
            return;
        }
        let address = (decoder.address - LOCO_ADDRESS_MIN) as u8;
        let stopped = decoder.emergency_stop || self.emergency_stop.is_true();
        let mut value = if stopped {
            0
        } else {
            decoder.speed_step(SPEED_STEPS) & loco_byte::SPEED_MASK
        };
        if decoder.direction == Direction::Reverse {
            value |= loco_byte::DIRECTION;
        }
        if decoder.function(1) {
            value |= loco_byte::HORN;
        }
        if decoder.function(0) {
            value |= loco_byte::LIGHT;
        }
        if self.bus[address as usize] == Some(value) {
            return;
        }
        self.bus[address as usize] = Some(value);
        self.send(&Message::Write { address, value });
    }

    /// Command one output bit; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, value: bool) {
        let bus_address = ((address - OUTPUT_ADDRESS_MIN) / 8) as u8;
        let bit = ((address - OUTPUT_ADDRESS_MIN) % 8) as u8;
        if bus_address >= BUS_ADDRESS_COUNT {
            return;
        }
        let current = self.bus[bus_address as usize].unwrap_or(0);
        let target = if value {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        if self.bus[bus_address as usize] == Some(target) {
            return;
        }
        self.bus[bus_address as usize] = Some(target);
        self.send(&Message::Write {
            address: bus_address,
            value: target,
        });
        // Bus writes are not acknowledged; mirror the commanded value.
        let tri = OutputValue::from(TriState::from(value));
        if let Some(output) = self.controllers.output.clone() {
            self.event_loop.call(move || {
                if let Some(controller) = output.upgrade() {
                    controller.update_output_value(crate::output::CHANNEL_DEFAULT, address, tri);
                }
            });
        }
    }

    /// Inject a sensor change; only valid in simulation mode
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let bus_address = ((address - INPUT_ADDRESS_MIN) / 8) as u8;
        let bit = ((address - INPUT_ADDRESS_MIN) % 8) as u8;
        if !self.is_feedback_address(bus_address) {
            return;
        }
        let current = self.bus[bus_address as usize].unwrap_or(0);
        let is_set = current & (1 << bit) != 0;
        let target_bit = match action {
            SimulateInputAction::SetFalse => {
                if !is_set {
                    return;
                }
                false
            }
            SimulateInputAction::SetTrue => {
                if is_set {
                    return;
                }
                true
            }
            SimulateInputAction::Toggle => !is_set,
        };
        let value = if target_bit {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        self.receive(Message::Report {
            address: bus_address,
            value,
        });
    }

    fn send(&mut self, message: &Message) {
        if self.config.debug_log_rx_tx {
            self.logger.log(LogEntry::tx(
                self.log_id.clone(),
                message.to_string_dump(self.config.rautenhaus),
            ));
        }
        match &mut self.io {
            Io::Hardware { tx } => {
                if tx
                    .try_send(Bytes::from(message.serialize(self.config.rautenhaus)))
                    .is_err()
                {
                    self.logger.log(LogEntry::error(
                        self.log_id.clone(),
                        codes::WRITE_BUFFER_FULL,
                        "write buffer full, dropping frame",
                    ));
                }
            }
            Io::Simulation(simulation) => simulation.send(message),
        }
    }
}
