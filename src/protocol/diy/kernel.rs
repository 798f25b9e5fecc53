//! Traintastic DIY kernel
//!
//! Heartbeats run in both directions: we transmit one every half
//! timeout, and a peer that stays silent for a full timeout is treated
//! as dead.

use super::messages::{
    Framer, Message, INPUT_ADDRESS_MAX, INPUT_ADDRESS_MIN, OUTPUT_ADDRESS_MAX, OUTPUT_ADDRESS_MIN,
};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{EventLoop, SimulateInputAction, TriState};
use crate::error::HubError;
use crate::input;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelHandle, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::OutputValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Traintastic DIY kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Dead-peer threshold
    pub heartbeat_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            heartbeat_timeout_ms: 1000,
        }
    }
}

/// Domain callbacks, invoked on the event loop thread
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
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

/// Traintastic DIY protocol engine; lives on its I/O thread
pub struct Kernel {
    log_id: String,
    config: KernelConfig,
    simulation: bool,
    handle: KernelHandle<Kernel>,
    event_loop: EventLoop,
    logger: Logger,
    io: Io,
    framer: Framer,
    controllers: ControllerLinks,
    callbacks: Callbacks,
    input_values: HashMap<u16, TriState>,
    output_values: HashMap<u16, TriState>,
    last_received: Instant,
    heartbeat_task: Option<tokio::task::JoinHandle<()>>,
    peer_dead: bool,
    started: bool,
}

/// Launch the kernel on its own I/O thread
pub fn start(options: StartOptions) -> KernelThread {
    let StartOptions {
        log_id,
        config,
        io,
        world: _,
        event_loop,
        logger,
        controllers,
        callbacks,
    } = options;

    let error_log_id = log_id.clone();
    let error_event_loop = event_loop.clone();
    let error_callbacks = callbacks.clone();

    kernel::spawn(
        "traintastic-diy",
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
                    framer: Framer::new(),
                    controllers,
                    callbacks,
                    input_values: HashMap::new(),
                    output_values: HashMap::new(),
                    last_received: Instant::now(),
                    heartbeat_task: None,
                    peer_dead: false,
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
            "connection to device lost",
        ));
        let callbacks = self.callbacks.clone();
        self.event_loop.call(move || {
            if let Some(on_error) = &callbacks.on_error {
                on_error("connection to device lost".into());
            }
        });
    }

    fn stopping(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

impl Kernel {
    /// Startup delay expired: handshake and start the heartbeat
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        self.send(&Message::GetInfo);
        self.last_received = Instant::now();

        let half = Duration::from_millis(self.config.heartbeat_timeout_ms.max(2) / 2);
        self.heartbeat_task = Some(
            self.handle
                .post_interval(half, |kernel| kernel.heartbeat_tick()),
        );

        self.logger.log(LogEntry::info(
            self.log_id.clone(),
            codes::STARTED,
            "started",
        ));
        if let Some(on_started) = self.callbacks.on_started.clone() {
            self.event_loop.call(move || on_started());
        }
    }

    fn heartbeat_tick(&mut self) {
        if self.peer_dead {
            return;
        }
        let timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        if self.last_received.elapsed() > timeout {
            self.peer_dead = true;
            self.logger.log(LogEntry::error(
                self.log_id.clone(),
                codes::HEARTBEAT_TIMEOUT,
                "heartbeat timeout, device considered dead",
            ));
            let callbacks = self.callbacks.clone();
            self.event_loop.call(move || {
                if let Some(on_error) = &callbacks.on_error {
                    on_error("heartbeat timeout".into());
                }
            });
            return;
        }
        self.send(&Message::Heartbeat);
    }

    /// Dispatch one verified frame
    pub fn receive(&mut self, message: Message) {
        self.last_received = Instant::now();
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::rx(self.log_id.clone(), message.to_string_dump()));
        }

        match message {
            Message::Heartbeat => {}
            Message::Info {
                version_major,
                version_minor,
            } => {
                self.logger.log(LogEntry::info(
                    self.log_id.clone(),
                    codes::STARTED,
                    format!("device protocol version {}.{}", version_major, version_minor),
                ));
            }
            Message::InputChanged { address, value } => {
                if self.input_values.get(&address) != Some(&value) {
                    self.input_values.insert(address, value);
                    let domain_address = u32::from(address);
                    if let Some(input) = self.controllers.input.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = input.upgrade() {
                                controller.update_input_value(
                                    input::CHANNEL_DEFAULT,
                                    domain_address,
                                    value,
                                );
                            }
                        });
                    }
                }
            }
            Message::OutputChanged { address, value } => {
                if self.output_values.get(&address) != Some(&value) {
                    self.output_values.insert(address, value);
                    let domain_address = u32::from(address);
                    if let Some(output) = self.controllers.output.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = output.upgrade() {
                                controller.update_output_value(
                                    crate::output::CHANNEL_DEFAULT,
                                    domain_address,
                                    OutputValue::from(value),
                                );
                            }
                        });
                    }
                }
            }
            _ => {}
        }
    }

    // === domain-facing commands (arrive via post) ===

    /// Command an output; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, value: bool) {
        if !(OUTPUT_ADDRESS_MIN..=OUTPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let address = address as u16;
        if self.output_values.get(&address) == Some(&TriState::from(value)) {
            return;
        }
        self.send(&Message::SetOutput { address, value });
    }

    /// Inject a sensor change; only valid in simulation mode
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let wire = address as u16;
        let current = self
            .input_values
            .get(&wire)
            .copied()
            .unwrap_or(TriState::Undefined);
        let value = match action {
            SimulateInputAction::SetFalse => {
                if current == TriState::False {
                    return;
                }
                TriState::False
            }
            SimulateInputAction::SetTrue => {
                if current == TriState::True {
                    return;
                }
                TriState::True
            }
            SimulateInputAction::Toggle => current.invert().as_bool().unwrap_or(true).into(),
        };
        self.receive(Message::InputChanged {
            address: wire,
            value,
        });
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
