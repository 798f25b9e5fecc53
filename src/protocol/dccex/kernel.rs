//! DCC-EX kernel

use super::messages::{self, Framer, Response, ACCESSORY_ADDRESS_MAX, ACCESSORY_ADDRESS_MIN,
    FUNCTION_NUMBER_MAX, ID_MAX, ID_MIN};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DCCEX_MS;
use crate::core::{EventLoop, SimulateInputAction, TriState};
use crate::decoder::{DecoderChangeFlags, DecoderSnapshot};
use crate::error::HubError;
use crate::input;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::OutputValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output channels: DCC accessories are addressed linearly, turnouts and
/// output pins by their command station id
pub const CHANNEL_ACCESSORY: u16 = 1;
pub const CHANNEL_TURNOUT: u16 = 2;
pub const CHANNEL_OUTPUT: u16 = 3;

pub const INPUT_ADDRESS_MIN: u32 = ID_MIN;
pub const INPUT_ADDRESS_MAX: u32 = ID_MAX;

/// DCC-EX kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Track speed step mode, 28 or 128
    pub speed_steps: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DCCEX_MS,
            debug_log_rx_tx: false,
            speed_steps: 128,
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

/// DCC-EX protocol engine; lives on its I/O thread
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
    input_values: HashMap<u32, bool>,
    accessory_values: HashMap<u32, bool>,
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
        "dccex",
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
                    )?),
                    None,
                ),
            };

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
                    framer: Framer::new(),
                    world,
                    controllers,
                    callbacks,
                    power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    input_values: HashMap::new(),
                    accessory_values: HashMap::new(),
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
        let lines = self.framer.feed(&chunk);
        for line in lines {
            self.receive(&line);
        }
    }

    fn link_closed(&mut self) {
        self.logger.log(LogEntry::error(
            self.log_id.clone(),
            codes::TRANSPORT,
            "connection to command station lost",
        ));
        let callbacks = self.callbacks.clone();
        self.event_loop.call(move || {
            if let Some(on_error) = &callbacks.on_error {
                on_error("connection to command station lost".into());
            }
        });
    }
}

impl Kernel {
    /// Startup delay expired: announce speed steps, reconcile with the
    /// world state
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if let Some(line) = messages::set_speed_steps(self.config.speed_steps) {
            self.send(&line);
        }
        self.send(&messages::status());

        if !self.world.run {
            self.send(&messages::emergency_stop());
            self.emergency_stop = TriState::True;
        }
        if self.world.power_on {
            self.send(&messages::power_on());
        } else {
            self.send(&messages::power_off());
        }
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

    /// Config changed while online; re-announce the speed step mode
    pub fn set_config(&mut self, config: KernelConfig) {
        if config.speed_steps != self.config.speed_steps {
            if let Some(line) = messages::set_speed_steps(config.speed_steps) {
                self.send(&line);
            }
        }
        self.config = config;
    }

    /// Dispatch one response line
    pub fn receive(&mut self, line: &str) {
        if self.config.debug_log_rx_tx {
            self.logger.log(LogEntry::rx(self.log_id.clone(), line.to_string()));
        }

        let Some(response) = messages::parse_response(line) else {
            return;
        };
        match response {
            Response::PowerOn => self.mirror_power(true),
            Response::PowerOff => self.mirror_power(false),
            Response::Sensor { id, active } => {
                if id > ID_MAX {
                    return;
                }
                if self.input_values.get(&id) != Some(&active) {
                    self.input_values.insert(id, active);
                    let value = TriState::from(active);
                    if let Some(input) = self.controllers.input.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = input.upgrade() {
                                controller.update_input_value(input::CHANNEL_DEFAULT, id, value);
                            }
                        });
                    }
                }
            }
            Response::Turnout { id, thrown } => {
                self.update_output(CHANNEL_TURNOUT, id, thrown);
            }
            Response::Output { id, value } => {
                self.update_output(CHANNEL_OUTPUT, id, value);
            }
            Response::Other(_) => {}
        }
    }

    fn mirror_power(&mut self, on: bool) {
        let target = TriState::from(on);
        if self.power_on != target {
            self.power_on = target;
            if let Some(callback) = self.callbacks.on_power_on_changed.clone() {
                self.event_loop.call(move || callback(on));
            }
        }
    }

    fn update_output(&mut self, channel: u16, address: u32, value: bool) {
        let value = OutputValue::from(TriState::from(value));
        if let Some(output) = self.controllers.output.clone() {
            self.event_loop.call(move || {
                if let Some(controller) = output.upgrade() {
                    controller.update_output_value(channel, address, value);
                }
            });
        }
    }

    // === domain-facing commands (arrive via post) ===

    pub fn power_on(&mut self) {
        if self.power_on != TriState::True {
            self.send(&messages::power_on());
        }
    }

    pub fn power_off(&mut self) {
        if self.power_on != TriState::False {
            self.send(&messages::power_off());
        }
    }

    pub fn emergency_stop(&mut self) {
        if self.emergency_stop != TriState::True {
            self.emergency_stop = TriState::True;
            self.send(&messages::emergency_stop());
        }
    }

    pub fn clear_emergency_stop(&mut self) {
        self.emergency_stop = TriState::False;
    }

    /// Emit the command(s) for a decoder change
    pub fn decoder_changed(
        &mut self,
        decoder: DecoderSnapshot,
        changes: DecoderChangeFlags,
        function_number: u32,
    ) {
        if changes.has(DecoderChangeFlags::SPEED) {
            let speed = decoder.speed_step(126);
            let emergency_stop =
                decoder.emergency_stop || self.emergency_stop != TriState::False;
            self.send(&messages::set_loco_speed_and_direction(
                decoder.address,
                speed,
                emergency_stop,
                decoder.direction,
            ));
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE)
            && function_number <= FUNCTION_NUMBER_MAX
        {
            self.send(&messages::set_loco_function(
                decoder.address,
                function_number as u8,
                decoder.function(function_number),
            ));
        }
    }

    /// Command an output on one of the three channels
    pub fn set_output(&mut self, channel: u16, address: u32, value: bool) {
        match channel {
            CHANNEL_ACCESSORY => {
                if !(ACCESSORY_ADDRESS_MIN..=ACCESSORY_ADDRESS_MAX).contains(&address) {
                    return;
                }
                if self.accessory_values.get(&address) == Some(&value) {
                    return;
                }
                self.accessory_values.insert(address, value);
                self.send(&messages::set_accessory(address, value));
                // Accessory commands are fire and forget; mirror the
                // commanded value into the domain.
                self.update_output(CHANNEL_ACCESSORY, address, value);
            }
            CHANNEL_TURNOUT => {
                self.send(&messages::set_turnout(address, value));
            }
            CHANNEL_OUTPUT => {
                self.send(&messages::set_output(address, value));
            }
            _ => {}
        }
    }

    /// Inject a sensor change; only valid in simulation mode
    ///
    /// Synthesizes the broadcast line and routes it through `receive`.
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || address > ID_MAX {
            return;
        }
        let current = self.input_values.get(&address).copied();
        let value = match action {
            SimulateInputAction::SetFalse => {
                if current == Some(false) {
                    return;
                }
                false
            }
            SimulateInputAction::SetTrue => {
                if current == Some(true) {
                    return;
                }
                true
            }
            SimulateInputAction::Toggle => !current.unwrap_or(false),
        };
        let line = messages::sensor_transition(address, value);
        self.receive(line.trim_end());
    }

    fn send(&mut self, line: &str) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::tx(self.log_id.clone(), line.trim_end().to_string()));
        }
        match &mut self.io {
            Io::Hardware { tx } => {
                if tx
                    .try_send(Bytes::copy_from_slice(line.as_bytes()))
                    .is_err()
                {
                    self.logger.log(LogEntry::error(
                        self.log_id.clone(),
                        codes::WRITE_BUFFER_FULL,
                        "write buffer full, dropping frame",
                    ));
                }
            }
            Io::Simulation(simulation) => simulation.send(line),
        }
    }
}
