//! WiThrottle kernel

use super::messages::{self, Framer, ServerLine};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{Direction, EventLoop, TriState};
use crate::decoder::{speed_step_to_throttle, DecoderChangeFlags, DecoderSnapshot};
use crate::error::HubError;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelHandle, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::OutputValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const OUTPUT_ADDRESS_MIN: u32 = 1;
pub const OUTPUT_ADDRESS_MAX: u32 = 2048;

/// Keys usable for multi-throttle entries
const THROTTLE_KEYS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// WiThrottle kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Throttle name announced to the server
    pub throttle_name: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            throttle_name: "railhub".into(),
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

/// WiThrottle protocol engine; lives on its I/O thread
pub struct Kernel {
    log_id: String,
    config: KernelConfig,
    handle: KernelHandle<Kernel>,
    event_loop: EventLoop,
    logger: Logger,
    io: Io,
    framer: Framer,
    world: WorldSnapshot,
    controllers: ControllerLinks,
    callbacks: Callbacks,
    power_on: TriState,
    emergency_stop: TriState,
    /// address -> multi-throttle key
    throttles: HashMap<u16, char>,
    key_to_address: HashMap<char, (u16, bool)>,
    turnout_values: HashMap<String, bool>,
    heartbeat_task: Option<tokio::task::JoinHandle<()>>,
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
        "withrottle",
        move |handle, shutdown| {
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
                    handle: handle.clone(),
                    event_loop,
                    logger,
                    io,
                    framer: Framer::new(),
                    world,
                    controllers,
                    callbacks,
                    power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    throttles: HashMap::new(),
                    key_to_address: HashMap::new(),
                    turnout_values: HashMap::new(),
                    heartbeat_task: None,
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
            "connection to server lost",
        ));
        let callbacks = self.callbacks.clone();
        self.event_loop.call(move || {
            if let Some(on_error) = &callbacks.on_error {
                on_error("connection to server lost".into());
            }
        });
    }

    fn stopping(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        let quit = messages::quit();
        self.send(&quit);
    }
}

impl Kernel {
    /// Startup delay expired: register, reconcile with the world state
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        let name = messages::set_name(&self.config.throttle_name);
        self.send(&name);
        let device = messages::set_device_id(&self.log_id.clone());
        self.send(&device);

        if !self.world.run {
            self.emergency_stop = TriState::True;
        }
        let power = messages::power(self.world.power_on);
        self.send(&power);
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

    /// Dispatch one server line
    pub fn receive(&mut self, line: &str) {
        if self.config.debug_log_rx_tx {
            self.logger.log(LogEntry::rx(self.log_id.clone(), line.to_string()));
        }

        match messages::parse_server_line(line) {
            ServerLine::Power(Some(on)) => {
                if self.power_on != TriState::from(on) {
                    self.power_on = TriState::from(on);
                    if let Some(callback) = self.callbacks.on_power_on_changed.clone() {
                        self.event_loop.call(move || callback(on));
                    }
                }
            }
            ServerLine::HeartbeatInterval(seconds) => {
                if let Some(task) = self.heartbeat_task.take() {
                    task.abort();
                }
                if seconds > 0 {
                    let period = Duration::from_secs(u64::from(seconds).max(2) / 2);
                    self.heartbeat_task =
                        Some(self.handle.post_interval(period, |kernel| {
                            let line = messages::heartbeat();
                            kernel.send(&line);
                        }));
                }
            }
            ServerLine::Turnout {
                system_name,
                thrown,
            } => {
                if let Some(thrown) = thrown {
                    self.turnout_values.insert(system_name.clone(), thrown);
                    if let Ok(address) = system_name.parse::<u32>() {
                        let value = OutputValue::from(TriState::from(thrown));
                        if let Some(output) = self.controllers.output.clone() {
                            self.event_loop.call(move || {
                                if let Some(controller) = output.upgrade() {
                                    controller.update_output_value(
                                        crate::output::CHANNEL_DEFAULT,
                                        address,
                                        value,
                                    );
                                }
                            });
                        }
                    }
                }
            }
            ServerLine::ThrottleAction { key, command } => self.throttle_action(key, &command),
            ServerLine::ProtocolVersion(version) => {
                self.logger.log(LogEntry::info(
                    self.log_id.clone(),
                    codes::STARTED,
                    format!("server protocol version {}", version),
                ));
            }
            _ => {}
        }
    }

    /// Server-side echo of a throttle command; mirror it into the domain
    fn throttle_action(&mut self, key: char, command: &str) {
        let Some((address, _)) = self.key_to_address.get(&key).copied() else {
            return;
        };
        let Some(decoder) = self.controllers.decoder.clone() else {
            return;
        };
        let command = command.to_string();
        self.event_loop.call(move || {
            let Some(controller) = decoder.upgrade() else {
                return;
            };
            let candidates = [
                crate::decoder::DecoderProtocol::DccShort,
                crate::decoder::DecoderProtocol::DccLong,
            ];
            let Some(decoder) = candidates
                .iter()
                .find_map(|p| controller.get_decoder(*p, address))
            else {
                return;
            };
            if let Some(velocity) = command.strip_prefix('V') {
                if let Ok(velocity) = velocity.parse::<u8>() {
                    decoder.mirror_speed(
                        speed_step_to_throttle(velocity, 126),
                        decoder.direction(),
                        false,
                    );
                }
            } else if let Some(direction) = command.strip_prefix('R') {
                let direction = if direction == "1" {
                    Direction::Forward
                } else {
                    Direction::Reverse
                };
                decoder.mirror_speed(decoder.throttle(), direction, decoder.emergency_stop());
            } else if let Some(function) = command.strip_prefix('F') {
                if function.len() >= 2 {
                    let value = function.starts_with('1');
                    if let Ok(number) = function[1..].parse::<u32>() {
                        decoder.mirror_function(number, value);
                    }
                }
            }
        });
    }

    // === domain-facing commands (arrive via post) ===

    pub fn power_on(&mut self) {
        if self.power_on != TriState::True {
            let line = messages::power(true);
            self.send(&line);
        }
    }

    pub fn power_off(&mut self) {
        if self.power_on != TriState::False {
            let line = messages::power(false);
            self.send(&line);
        }
    }

    /// Emergency stop every acquired throttle
    pub fn emergency_stop(&mut self) {
        if self.emergency_stop == TriState::True {
            return;
        }
        self.emergency_stop = TriState::True;
        let keys: Vec<char> = self.throttles.values().copied().collect();
        for key in keys {
            let line = messages::throttle_emergency_stop(key);
            self.send(&line);
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
        let long = decoder.protocol == crate::decoder::DecoderProtocol::DccLong;
        let Some(key) = self.acquire_throttle(decoder.address, long) else {
            return;
        };

        if changes.is(DecoderChangeFlags::EMERGENCY_STOP) && decoder.emergency_stop {
            let line = messages::throttle_emergency_stop(key);
            self.send(&line);
        } else if changes.has(DecoderChangeFlags::SPEED) {
            if decoder.emergency_stop {
                let line = messages::throttle_emergency_stop(key);
                self.send(&line);
            } else {
                let line = messages::throttle_velocity(key, decoder.speed_step(126));
                self.send(&line);
            }
            let line = messages::throttle_direction(key, decoder.direction);
            self.send(&line);
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE) && function_number <= 28 {
            let line = messages::throttle_function(
                key,
                function_number,
                decoder.function(function_number),
            );
            self.send(&line);
        }
    }

    /// Acquire a multi-throttle entry for an address
    fn acquire_throttle(&mut self, address: u16, long: bool) -> Option<char> {
        if let Some(key) = self.throttles.get(&address) {
            return Some(*key);
        }
        let key = THROTTLE_KEYS
            .iter()
            .map(|b| *b as char)
            .find(|key| !self.key_to_address.contains_key(key))?;
        self.throttles.insert(address, key);
        self.key_to_address.insert(key, (address, long));
        let line = messages::throttle_acquire(key, address, long);
        self.send(&line);
        Some(key)
    }

    /// Command a turnout; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, thrown: bool) {
        let system_name = address.to_string();
        if self.turnout_values.get(&system_name) == Some(&thrown) {
            return;
        }
        let line = messages::turnout(thrown, &system_name);
        self.send(&line);
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
