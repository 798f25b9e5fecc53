//! XpressNet kernel

use super::messages::{FeedbackPair, FeedbackType, Framer, Message, SpeedStepMode};
use super::simulation::SimulationIoHandler;
use super::GatewayVariant;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
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

pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 2048;
pub const OUTPUT_ADDRESS_MIN: u32 = 1;
pub const OUTPUT_ADDRESS_MAX: u32 = 2048;

/// XpressNet kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Per-loco e-stop uses the dedicated command instead of a
    /// zero-speed stop
    pub use_emergency_stop_locomotive_command: bool,
    /// Emit Roco's dedicated F13-F20 group command
    pub use_roco_f13_f20_command: bool,
    pub gateway: GatewayVariant,
    pub s88_start_address: u8,
    pub s88_module_count: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            use_emergency_stop_locomotive_command: false,
            use_roco_f13_f20_command: false,
            gateway: GatewayVariant::Generic,
            s88_start_address: 64,
            s88_module_count: 2,
        }
    }
}

/// Domain callbacks, invoked on the event loop thread
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_normal_operation_resumed: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_track_power_off: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_emergency_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Everything a kernel needs at start
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

/// XpressNet protocol engine; lives on its I/O thread
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
    track_power_on: TriState,
    emergency_stop: TriState,
    input_values: Vec<TriState>,
    output_values: HashMap<u16, bool>,
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
        "xpressnet",
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

            let strip_sync = config.gateway == GatewayVariant::LenzLiUsb;
            let startup_delay = Duration::from_millis(config.startup_delay_ms);
            handle.post_delayed(startup_delay, Kernel::started);

            Ok((
                Kernel {
                    log_id,
                    config,
                    simulation,
                    event_loop,
                    logger,
                    io,
                    framer: Framer::new(strip_sync),
                    world,
                    controllers,
                    callbacks,
                    track_power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    input_values: vec![TriState::Undefined; INPUT_ADDRESS_MAX as usize],
                    output_values: HashMap::new(),
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
        let (frames, dropped) = self.framer.feed(&chunk);
        if dropped > 0 {
            self.logger.log(LogEntry::malformed(self.log_id.clone(), dropped));
        }
        for frame in frames {
            if let Some(message) = Message::parse(&frame) {
                self.receive(message);
            }
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
    /// Startup delay expired: reconcile the device with the world state
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if self.config.gateway == GatewayVariant::RoSoftS88 {
            let start_address = self.config.s88_start_address;
            let module_count = self.config.s88_module_count;
            self.send(&Message::S88StartAddress(start_address));
            self.send(&Message::S88ModuleCount(module_count));
        }

        if !self.world.run {
            self.send(&Message::StopAllLocomotivesRequest);
            self.emergency_stop = TriState::True;
        }
        if self.world.power_on {
            self.send(&Message::ResumeOperationsRequest);
        } else {
            self.send(&Message::StopOperationsRequest);
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

    /// Dispatch one verified frame
    pub fn receive(&mut self, message: Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::rx(self.log_id.clone(), message.to_string_dump()));
        }

        match &message {
            Message::FeedbackBroadcast(pairs) => {
                for pair in pairs {
                    if matches!(pair.feedback_type(), FeedbackType::FeedbackModule) {
                        self.feedback_module_pair(*pair);
                    }
                }
            }
            Message::NormalOperationResumed => {
                if self.track_power_on != TriState::True || self.emergency_stop != TriState::False {
                    self.track_power_on = TriState::True;
                    self.emergency_stop = TriState::False;
                    if let Some(callback) = self.callbacks.on_normal_operation_resumed.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            Message::TrackPowerOff => {
                if self.track_power_on != TriState::False {
                    self.track_power_on = TriState::False;
                    if let Some(callback) = self.callbacks.on_track_power_off.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            Message::EmergencyStop => {
                if self.emergency_stop != TriState::True {
                    self.emergency_stop = TriState::True;
                    if let Some(callback) = self.callbacks.on_emergency_stop.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            _ => {}
        }
    }

    /// Four inputs of one feedback-module pair
    fn feedback_module_pair(&mut self, pair: FeedbackPair) {
        let base_address = pair.group_address() << 2;
        for bit in 0..4u16 {
            let full_address = base_address + bit;
            let value = TriState::from(pair.status_nibble() & (1 << bit) != 0);
            let slot = &mut self.input_values[full_address as usize];
            if *slot != value {
                *slot = value;
                let address = INPUT_ADDRESS_MIN + u32::from(full_address);
                if let Some(input) = self.controllers.input.clone() {
                    self.event_loop.call(move || {
                        if let Some(controller) = input.upgrade() {
                            controller.update_input_value(input::CHANNEL_DEFAULT, address, value);
                        }
                    });
                }
            }
        }
    }

    // === domain-facing commands (arrive via post) ===

    /// Track power on / normal operation
    pub fn resume_operations(&mut self) {
        if self.track_power_on != TriState::True || self.emergency_stop != TriState::False {
            self.send(&Message::ResumeOperationsRequest);
        }
    }

    /// Track power off
    pub fn stop_operations(&mut self) {
        if self.track_power_on != TriState::False {
            self.send(&Message::StopOperationsRequest);
        }
    }

    /// Emergency stop every locomotive, track power stays on
    pub fn stop_all_locomotives(&mut self) {
        if self.emergency_stop != TriState::True {
            self.send(&Message::StopAllLocomotivesRequest);
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
        if self.config.use_emergency_stop_locomotive_command
            && changes.is(DecoderChangeFlags::EMERGENCY_STOP)
            && decoder.emergency_stop
        {
            self.send(&Message::EmergencyStopLocomotive {
                address: decoder.address,
            });
        } else if changes.has(DecoderChangeFlags::SPEED) {
            let mode = SpeedStepMode::from_count(decoder.speed_steps);
            let speed_step = if decoder.emergency_stop {
                0
            } else {
                decoder.speed_step(mode.max_step())
            };
            self.send(&Message::SpeedAndDirection {
                address: decoder.address,
                mode,
                emergency_stop: decoder.emergency_stop,
                direction: decoder.direction,
                speed_step,
                f0: mode == SpeedStepMode::Steps14 && decoder.function(0),
            });
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE) {
            self.send_function_group(&decoder, function_number);
        }
    }

    fn send_function_group(&mut self, decoder: &DecoderSnapshot, function_number: u32) {
        let bits = |numbers: &[u32], shifts: &[u8]| -> u8 {
            numbers
                .iter()
                .zip(shifts)
                .filter(|(n, _)| decoder.function(**n))
                .fold(0u8, |acc, (_, shift)| acc | (1 << shift))
        };
        let message = match function_number {
            0..=4 => Message::FunctionGroup {
                address: decoder.address,
                group: 1,
                functions: bits(&[0, 1, 2, 3, 4], &[4, 0, 1, 2, 3]),
            },
            5..=8 => Message::FunctionGroup {
                address: decoder.address,
                group: 2,
                functions: bits(&[5, 6, 7, 8], &[0, 1, 2, 3]),
            },
            9..=12 => Message::FunctionGroup {
                address: decoder.address,
                group: 3,
                functions: bits(&[9, 10, 11, 12], &[0, 1, 2, 3]),
            },
            13..=20 => {
                let functions = bits(&[13, 14, 15, 16, 17, 18, 19, 20], &[0, 1, 2, 3, 4, 5, 6, 7]);
                if self.config.use_roco_f13_f20_command {
                    Message::RocoFunctionF13F20 {
                        address: decoder.address,
                        functions,
                    }
                } else {
                    Message::FunctionGroup {
                        address: decoder.address,
                        group: 4,
                        functions,
                    }
                }
            }
            21..=28 => Message::FunctionGroup {
                address: decoder.address,
                group: 5,
                functions: bits(&[21, 22, 23, 24, 25, 26, 27, 28], &[0, 1, 2, 3, 4, 5, 6, 7]),
            },
            _ => return,
        };
        self.send(&message);
    }

    /// Command an accessory; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, value: bool) {
        let wire_address = (address - OUTPUT_ADDRESS_MIN) as u16;
        if self.output_values.get(&wire_address) == Some(&value) {
            return;
        }
        self.output_values.insert(wire_address, value);
        self.send(&Message::AccessoryOperation {
            address: wire_address,
            activate: value,
        });
        // No acknowledgement for plain accessory decoders; mirror the
        // commanded value into the domain.
        if let Some(output) = self.controllers.output.clone() {
            self.event_loop.call(move || {
                if let Some(controller) = output.upgrade() {
                    controller.update_output_value(
                        crate::output::CHANNEL_DEFAULT,
                        address,
                        OutputValue::from(TriState::from(value)),
                    );
                }
            });
        }
    }

    /// Inject a sensor change; only valid in simulation mode
    ///
    /// Builds a feedback broadcast and routes it through `receive`, so
    /// tests exercise the same path as hardware input.
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation
            || !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address)
        {
            return;
        }
        let index = (address - INPUT_ADDRESS_MIN) as u16;
        let current = self.input_values[index as usize];
        let target = match action {
            SimulateInputAction::SetFalse => {
                if current == TriState::False {
                    return;
                }
                false
            }
            SimulateInputAction::SetTrue => {
                if current == TriState::True {
                    return;
                }
                true
            }
            SimulateInputAction::Toggle => current != TriState::True,
        };

        let group_address = index >> 2;
        let slot = (index & 0x03) as u8;
        let mut pair = FeedbackPair::new(group_address, FeedbackType::FeedbackModule);
        for bit in 0..4u8 {
            let n = (group_address << 2) + u16::from(bit);
            let value = if bit == slot {
                target
            } else {
                self.input_values[n as usize] == TriState::True
            };
            pair.set_status(bit, value);
        }
        debug_assert_eq!(pair.group_address(), group_address);
        self.receive(Message::FeedbackBroadcast(vec![pair]));
    }

    fn send(&mut self, message: &Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::tx(self.log_id.clone(), message.to_string_dump()));
        }
        match &mut self.io {
            Io::Hardware { tx } => {
                let mut bytes = message.serialize();
                if self.config.gateway == GatewayVariant::LenzLiUsb {
                    bytes.splice(0..0, [0xFF, 0xFE]);
                }
                if tx.try_send(Bytes::from(bytes)).is_err() {
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
