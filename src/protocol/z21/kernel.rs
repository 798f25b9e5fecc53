//! Z21 kernel

use super::messages::{broadcast_flags, LocoInfo, Message, SpeedSteps, SystemState, TurnoutOutput};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{EventLoop, SimulateInputAction, TriState};
use crate::decoder::{
    speed_step_to_throttle, DecoderChangeFlags, DecoderProtocol, DecoderSnapshot,
};
use crate::error::HubError;
use crate::input;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelHandle, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::{OutputValue, CHANNEL_DEFAULT as OUTPUT_CHANNEL};
use crate::protocol::hex_dump;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// R-BUS feedback: two groups of ten modules with eight inputs each
pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 160;
pub const OUTPUT_ADDRESS_MIN: u32 = 1;
pub const OUTPUT_ADDRESS_MAX: u32 = 1024;

/// Z21 kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Log current/temperature/voltage readings from the system state
    pub surface_system_state: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            surface_system_state: false,
        }
    }
}

/// Domain callbacks, invoked on the event loop thread
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_track_power_on: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_track_power_off: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_emergency_stop: Option<Arc<dyn Fn() + Send + Sync>>,
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

/// Z21 protocol engine; lives on its I/O thread
pub struct Kernel {
    log_id: String,
    config: KernelConfig,
    simulation: bool,
    handle: KernelHandle<Kernel>,
    event_loop: EventLoop,
    logger: Logger,
    io: Io,
    world: WorldSnapshot,
    controllers: ControllerLinks,
    callbacks: Callbacks,
    power_on: TriState,
    emergency_stop: TriState,
    input_values: Vec<TriState>,
    turnout_values: HashMap<u16, TurnoutOutput>,
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
        "z21",
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
                    handle: handle.clone(),
                    event_loop,
                    logger,
                    io,
                    world,
                    controllers,
                    callbacks,
                    power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    input_values: vec![TriState::Undefined; INPUT_ADDRESS_MAX as usize],
                    turnout_values: HashMap::new(),
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
        // One datagram per chunk; a datagram may hold several frames
        // back to back.
        let mut rest = &chunk[..];
        while rest.len() >= 4 {
            let data_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            if data_len < 4 || rest.len() < data_len {
                self.logger.log(LogEntry::malformed(self.log_id.clone(), rest.len()));
                break;
            }
            match Message::parse(&rest[..data_len]) {
                Some(message) => self.receive(message),
                None => self
                    .logger
                    .log(LogEntry::malformed(self.log_id.clone(), data_len)),
            }
            rest = &rest[data_len..];
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

    fn stopping(&mut self) {
        self.send(&Message::LanLogoff);
    }
}

impl Kernel {
    /// Startup delay expired: subscribe broadcasts, prime the mirrors,
    /// reconcile with the world state
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        self.send(&Message::LanSetBroadcastFlags {
            flags: broadcast_flags::STARTUP,
        });
        self.send(&Message::LanGetSerialNumber);
        self.send(&Message::LanGetHardwareInfo);
        self.send(&Message::LanSystemStateGetData);

        if !self.world.run {
            self.send(&Message::LanXSetStop);
            self.emergency_stop = TriState::True;
        }
        if self.world.power_on {
            self.send(&Message::LanXSetTrackPowerOn);
        } else {
            self.send(&Message::LanXSetTrackPowerOff);
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

        // Prime the loco mirror with one LAN_X_GET_LOCO_INFO per owned
        // decoder.
        if let Some(decoder) = self.controllers.decoder.clone() {
            let handle = self.handle.clone();
            self.event_loop.call(move || {
                let Some(controller) = decoder.upgrade() else {
                    return;
                };
                for decoder in controller.decoders().all() {
                    let address = decoder.address();
                    let long = decoder.protocol() == DecoderProtocol::DccLong;
                    handle.post(move |k| {
                        k.send(&Message::LanXGetLocoInfo {
                            address,
                            long_address: long,
                        });
                    });
                }
            });
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

    /// Dispatch one datagram
    pub fn receive(&mut self, message: Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::rx(self.log_id.clone(), message.to_string_dump()));
        }

        match message {
            Message::LanXBcTrackPowerOn => self.mirror_power(true),
            Message::LanXBcTrackPowerOff | Message::LanXBcTrackShortCircuit => {
                self.mirror_power(false)
            }
            Message::LanXBcStopped => {
                if self.emergency_stop != TriState::True {
                    self.emergency_stop = TriState::True;
                    if let Some(callback) = self.callbacks.on_emergency_stop.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            Message::LanGetSerialNumberReply { serial_number } => {
                self.logger.log(LogEntry::info(
                    self.log_id.clone(),
                    codes::STARTED,
                    format!("command station serial number: {}", serial_number),
                ));
            }
            Message::LanGetHardwareInfoReply {
                hardware_type,
                firmware_version,
            } => {
                self.logger.log(LogEntry::info(
                    self.log_id.clone(),
                    codes::STARTED,
                    format!(
                        "hardware type {:#010X}, firmware {}.{}",
                        hardware_type,
                        (firmware_version >> 8) & 0xFF,
                        firmware_version & 0xFF
                    ),
                ));
            }
            Message::LanSystemStateDataChanged(state) => self.system_state_changed(state),
            Message::LanRmBusDataChanged { group, status } => {
                self.rbus_changed(group, &status);
            }
            Message::LanXTurnoutInfo { address, position } => {
                if let Some(position) = position {
                    self.turnout_values.insert(address, position);
                    let value = match position {
                        TurnoutOutput::First => OutputValue::PairFirst,
                        TurnoutOutput::Second => OutputValue::PairSecond,
                    };
                    if let Some(output) = self.controllers.output.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = output.upgrade() {
                                controller.update_output_value(
                                    OUTPUT_CHANNEL,
                                    u32::from(address),
                                    value,
                                );
                            }
                        });
                    }
                }
            }
            Message::LanXLocoInfo(info) => self.loco_info(info),
            Message::LanLocoNetRx { payload } | Message::LanLocoNetTx { payload } => {
                if self.config.debug_log_rx_tx {
                    self.logger.log(LogEntry::rx(
                        self.log_id.clone(),
                        format!("loconet tunnel [{}]", hex_dump(&payload)),
                    ));
                }
            }
            _ => {}
        }
    }

    fn mirror_power(&mut self, on: bool) {
        let target = TriState::from(on);
        if self.power_on != target {
            self.power_on = target;
            let callback = if on {
                self.callbacks.on_track_power_on.clone()
            } else {
                self.callbacks.on_track_power_off.clone()
            };
            if let Some(callback) = callback {
                self.event_loop.call(move || callback());
            }
        }
    }

    fn system_state_changed(&mut self, state: SystemState) {
        self.mirror_power(!state.track_voltage_off());
        if state.emergency_stop() && self.emergency_stop != TriState::True {
            self.emergency_stop = TriState::True;
            if let Some(callback) = self.callbacks.on_emergency_stop.clone() {
                self.event_loop.call(move || callback());
            }
        }
        if self.config.surface_system_state {
            self.logger.log(LogEntry::info(
                self.log_id.clone(),
                codes::STARTED,
                format!(
                    "main {} mA, temperature {} C, supply {} mV",
                    state.main_current, state.temperature, state.supply_voltage
                ),
            ));
        }
    }

    /// Diff one R-BUS group against the mirror
    fn rbus_changed(&mut self, group: u8, status: &[u8; 10]) {
        if group > 1 {
            return;
        }
        let base = u32::from(group) * 80;
        for (module, byte) in status.iter().enumerate() {
            for bit in 0..8u32 {
                let address = base + module as u32 * 8 + bit + 1;
                if address > INPUT_ADDRESS_MAX {
                    break;
                }
                let value = TriState::from(byte & (1 << bit) != 0);
                let slot = &mut self.input_values[(address - 1) as usize];
                if *slot != value {
                    *slot = value;
                    if let Some(input) = self.controllers.input.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = input.upgrade() {
                                controller.update_input_value(
                                    input::CHANNEL_DEFAULT,
                                    address,
                                    value,
                                );
                            }
                        });
                    }
                }
            }
        }
    }

    /// Mirror a device-reported loco state back into the domain
    fn loco_info(&mut self, info: LocoInfo) {
        let Some(decoder) = self.controllers.decoder.clone() else {
            return;
        };
        let protocol = if info.long_address {
            DecoderProtocol::DccLong
        } else {
            DecoderProtocol::DccShort
        };
        self.event_loop.call(move || {
            let Some(controller) = decoder.upgrade() else {
                return;
            };
            let Some(decoder) = controller.get_decoder(protocol, info.address) else {
                return;
            };
            let throttle = speed_step_to_throttle(info.speed_step, info.speed_steps.count());
            decoder.mirror_speed(throttle, info.direction, info.emergency_stop);
            for (number, value) in info.functions.iter().enumerate() {
                decoder.mirror_function(number as u32, *value);
            }
        });
    }

    // === domain-facing commands (arrive via post) ===

    pub fn power_on(&mut self) {
        if self.power_on != TriState::True {
            self.send(&Message::LanXSetTrackPowerOn);
        }
    }

    pub fn power_off(&mut self) {
        if self.power_on != TriState::False {
            self.send(&Message::LanXSetTrackPowerOff);
        }
    }

    pub fn emergency_stop(&mut self) {
        if self.emergency_stop != TriState::True {
            self.send(&Message::LanXSetStop);
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
        let long_address = decoder.protocol == DecoderProtocol::DccLong;
        if changes.has(DecoderChangeFlags::SPEED) {
            let speed_steps = SpeedSteps::from_count(decoder.speed_steps);
            let speed_step = if decoder.emergency_stop {
                0
            } else {
                decoder.speed_step(speed_steps.count())
            };
            self.send(&Message::LanXSetLocoDrive {
                address: decoder.address,
                long_address,
                speed_steps,
                emergency_stop: decoder.emergency_stop,
                direction: decoder.direction,
                speed_step,
            });
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE) && function_number <= 28 {
            self.send(&Message::LanXSetLocoFunction {
                address: decoder.address,
                long_address,
                function: function_number as u8,
                on: decoder.function(function_number),
            });
        }
    }

    /// Command a turnout; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, value: OutputValue) {
        let output = match value {
            OutputValue::PairFirst => TurnoutOutput::First,
            OutputValue::PairSecond => TurnoutOutput::Second,
            _ => return,
        };
        let address = address as u16;
        if self.turnout_values.get(&address) == Some(&output) {
            return;
        }
        self.send(&Message::LanXSetTurnout {
            address,
            output,
            activate: true,
        });
    }

    /// Inject a sensor change; only valid in simulation mode
    ///
    /// Builds an R-BUS data-changed frame and routes it through
    /// `receive`, the same path hardware feedback takes.
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let index = (address - 1) as usize;
        let current = self.input_values[index];
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

        let group = (index / 80) as u8;
        let mut status = [0u8; 10];
        let base = group as usize * 80;
        for (module, byte) in status.iter_mut().enumerate() {
            for bit in 0..8usize {
                let n = base + module * 8 + bit;
                let value = if n == index {
                    target
                } else {
                    self.input_values[n] == TriState::True
                };
                if value {
                    *byte |= 1 << bit;
                }
            }
        }
        self.receive(Message::LanRmBusDataChanged { group, status });
    }

    fn send(&mut self, message: &Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::tx(self.log_id.clone(), message.to_string_dump()));
        }
        match &mut self.io {
            Io::Hardware { tx } => {
                if tx.try_send(Bytes::from(message.serialize())).is_err() {
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
