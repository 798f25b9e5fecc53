//! Märklin CAN kernel

use super::messages::{
    self, command, system_subcommand, uid_base, DeviceDescription, Framer, Message,
    StatusDataAssembler,
};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{EventLoop, SimulateInputAction, TriState};
use crate::decoder::{DecoderChangeFlags, DecoderProtocol, DecoderSnapshot};
use crate::error::HubError;
use crate::input;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelHandle, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::OutputValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 4096;
pub const OUTPUT_ADDRESS_MIN: u32 = 1;
pub const OUTPUT_ADDRESS_MAX: u32 = 2048;

/// Our node UID on the bus
const OWN_UID: u32 = 0x5248_0001;

/// A node discovered on the CAN bus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub uid: u32,
    pub description: Option<DeviceDescription>,
}

/// Märklin CAN kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Seconds between node discovery pings
    pub node_ping_interval: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            node_ping_interval: 10,
        }
    }
}

/// Domain callbacks, invoked on the event loop thread
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(String) + Send + Sync>>,
    pub on_go: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_halt: Option<Arc<dyn Fn() + Send + Sync>>,
    /// A node appeared or its description completed
    pub on_node_changed: Option<Arc<dyn Fn(Node) + Send + Sync>>,
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

/// Märklin CAN protocol engine; lives on its I/O thread
pub struct Kernel {
    log_id: String,
    config: KernelConfig,
    simulation: bool,
    handle: KernelHandle<Kernel>,
    event_loop: EventLoop,
    logger: Logger,
    io: Io,
    framer: Framer,
    world: WorldSnapshot,
    controllers: ControllerLinks,
    callbacks: Callbacks,
    hash: u16,
    power_on: TriState,
    emergency_stop: TriState,
    input_values: HashMap<u16, bool>,
    accessory_values: HashMap<u32, u8>,
    nodes: HashMap<u32, Node>,
    status_assembler: StatusDataAssembler,
    probing_node: Option<u32>,
    ping_task: Option<tokio::task::JoinHandle<()>>,
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
        "marklin-can",
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
                    world,
                    controllers,
                    callbacks,
                    hash: messages::hash_from_uid(OWN_UID),
                    power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    input_values: HashMap::new(),
                    accessory_values: HashMap::new(),
                    nodes: HashMap::new(),
                    status_assembler: StatusDataAssembler::new(),
                    probing_node: None,
                    ping_task: None,
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
        let messages = self.framer.feed(&chunk);
        for message in messages {
            self.receive(message);
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
        if let Some(task) = self.ping_task.take() {
            task.abort();
        }
    }
}

impl Kernel {
    /// Startup delay expired: reconcile, start node discovery
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if !self.world.run {
            self.send(&messages::system_halt(self.hash, 0));
            self.emergency_stop = TriState::True;
        }
        if self.world.power_on {
            self.send(&messages::system_go(self.hash, 0));
        } else {
            self.send(&messages::system_stop(self.hash, 0));
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

        let ping = messages::ping(self.hash);
        self.send(&ping);
        if self.config.node_ping_interval > 0 {
            let interval = Duration::from_secs(u64::from(self.config.node_ping_interval));
            self.ping_task = Some(self.handle.post_interval(interval, move |kernel| {
                let ping = messages::ping(kernel.hash);
                kernel.send(&ping);
            }));
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

    /// Dispatch one CAN record
    pub fn receive(&mut self, message: Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::rx(self.log_id.clone(), message.to_string_dump()));
        }

        match message.command {
            command::SYSTEM if message.dlc >= 5 => match message.data[4] {
                system_subcommand::GO => {
                    if self.power_on != TriState::True {
                        self.power_on = TriState::True;
                        if let Some(callback) = self.callbacks.on_go.clone() {
                            self.event_loop.call(move || callback());
                        }
                    }
                }
                system_subcommand::STOP => {
                    if self.power_on != TriState::False {
                        self.power_on = TriState::False;
                        if let Some(callback) = self.callbacks.on_stop.clone() {
                            self.event_loop.call(move || callback());
                        }
                    }
                }
                system_subcommand::HALT => {
                    if self.emergency_stop != TriState::True {
                        self.emergency_stop = TriState::True;
                        if let Some(callback) = self.callbacks.on_halt.clone() {
                            self.event_loop.call(move || callback());
                        }
                    }
                }
                _ => {}
            },
            command::S88_EVENT => {
                if let Some(event) = messages::parse_s88_event(&message) {
                    let address = u32::from(event.contact);
                    if (INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address)
                        && self.input_values.get(&event.contact) != Some(&event.value)
                    {
                        self.input_values.insert(event.contact, event.value);
                        let tri = TriState::from(event.value);
                        if let Some(input) = self.controllers.input.clone() {
                            self.event_loop.call(move || {
                                if let Some(controller) = input.upgrade() {
                                    controller.update_input_value(
                                        input::CHANNEL_DEFAULT,
                                        address,
                                        tri,
                                    );
                                }
                            });
                        }
                    }
                }
            }
            command::PING if message.response && message.dlc >= 4 => {
                let uid = message.uid();
                if uid != OWN_UID && !self.nodes.contains_key(&uid) {
                    self.nodes.insert(uid, Node { uid, description: None });
                    self.notify_node(uid);
                    // Probe one node at a time; the reply completes it.
                    if self.probing_node.is_none() {
                        self.probing_node = Some(uid);
                        let probe = messages::status_data_config(self.hash, uid, 0);
                        self.send(&probe);
                    }
                }
            }
            command::STATUS_DATA_CONFIG => {
                if let Some((index, payload)) = self.status_assembler.feed(&message) {
                    if index == 0 {
                        if let (Some(uid), Some(description)) =
                            (self.probing_node.take(), DeviceDescription::from_bytes(&payload))
                        {
                            self.logger.log(LogEntry::info(
                                self.log_id.clone(),
                                codes::STARTED,
                                format!(
                                    "node {:#010X}: {} ({})",
                                    uid, description.device_name, description.article_number
                                ),
                            ));
                            if let Some(node) = self.nodes.get_mut(&uid) {
                                node.description = Some(description);
                            }
                            self.notify_node(uid);
                            // continue with the next undescribed node
                            let next = self
                                .nodes
                                .values()
                                .find(|node| node.description.is_none())
                                .map(|node| node.uid);
                            if let Some(uid) = next {
                                self.probing_node = Some(uid);
                                let probe = messages::status_data_config(self.hash, uid, 0);
                                self.send(&probe);
                            }
                        }
                    }
                }
            }
            command::ACCESSORY_SWITCH if message.dlc >= 6 => {
                let uid = message.uid();
                let position = message.data[4];
                let address = accessory_address(uid);
                if let Some(address) = address {
                    self.accessory_values.insert(uid, position);
                    let value = if position == 1 {
                        OutputValue::PairFirst
                    } else {
                        OutputValue::PairSecond
                    };
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
            _ => {}
        }
    }

    fn notify_node(&mut self, uid: u32) {
        if let (Some(callback), Some(node)) =
            (self.callbacks.on_node_changed.clone(), self.nodes.get(&uid))
        {
            let node = node.clone();
            self.event_loop.call(move || callback(node));
        }
    }

    /// The discovered node table
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    // === domain-facing commands (arrive via post) ===

    pub fn power_on(&mut self) {
        if self.power_on != TriState::True {
            self.send(&messages::system_go(self.hash, 0));
        }
    }

    pub fn power_off(&mut self) {
        if self.power_on != TriState::False {
            self.send(&messages::system_stop(self.hash, 0));
        }
    }

    pub fn emergency_stop(&mut self) {
        if self.emergency_stop != TriState::True {
            self.send(&messages::system_halt(self.hash, 0));
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
        let Some(uid) = loco_uid(&decoder) else {
            return;
        };
        if changes.has(DecoderChangeFlags::SPEED) {
            if decoder.emergency_stop {
                let halt = messages::loco_speed(self.hash, uid, 0);
                self.send(&halt);
            } else {
                let wire_speed = (decoder.throttle.clamp(0.0, 1.0) * 1000.0).round() as u16;
                let speed = messages::loco_speed(self.hash, uid, wire_speed);
                self.send(&speed);
            }
            if changes.has(DecoderChangeFlags::DIRECTION) {
                let direction = messages::loco_direction(self.hash, uid, decoder.direction);
                self.send(&direction);
            }
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE) && function_number <= 31 {
            let function = messages::loco_function(
                self.hash,
                uid,
                function_number as u8,
                decoder.function(function_number),
            );
            self.send(&function);
        }
    }

    /// Command an accessory; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, value: OutputValue) {
        let position = match value {
            OutputValue::PairFirst => 1,
            OutputValue::PairSecond => 0,
            _ => return,
        };
        let uid = uid_base::ACCESSORY_DCC + (address - OUTPUT_ADDRESS_MIN);
        if self.accessory_values.get(&uid) == Some(&position) {
            return;
        }
        let on = messages::accessory_switch(self.hash, uid, position, true);
        self.send(&on);
        let off = messages::accessory_switch(self.hash, uid, position, false);
        self.send(&off);
    }

    /// Inject a sensor change; only valid in simulation mode
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let contact = address as u16;
        let current = self.input_values.get(&contact).copied().unwrap_or(false);
        let value = match action {
            SimulateInputAction::SetFalse => {
                if !current {
                    return;
                }
                false
            }
            SimulateInputAction::SetTrue => {
                if current {
                    return;
                }
                true
            }
            SimulateInputAction::Toggle => !current,
        };
        let event = messages::build_s88_event(self.hash, 0, contact, current, value);
        self.receive(event);
    }

    fn send(&mut self, message: &Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::tx(self.log_id.clone(), message.to_string_dump()));
        }
        match &mut self.io {
            Io::Hardware { tx } => {
                if tx
                    .try_send(Bytes::copy_from_slice(&message.serialize()))
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

/// Locomotive UID for a decoder snapshot, by protocol base
fn loco_uid(decoder: &DecoderSnapshot) -> Option<u32> {
    match decoder.protocol {
        DecoderProtocol::Motorola => Some(uid_base::MOTOROLA + u32::from(decoder.address)),
        DecoderProtocol::Selectrix => Some(uid_base::SELECTRIX + u32::from(decoder.address)),
        DecoderProtocol::DccShort | DecoderProtocol::DccLong => {
            Some(uid_base::DCC + u32::from(decoder.address))
        }
        DecoderProtocol::Mfx => Some(uid_base::MFX + decoder.mfx_uid),
        DecoderProtocol::Auto => None,
    }
}

/// 1-based accessory address for an accessory UID
fn accessory_address(uid: u32) -> Option<u32> {
    if (uid_base::ACCESSORY_DCC..uid_base::DCC).contains(&uid) {
        Some(uid - uid_base::ACCESSORY_DCC + OUTPUT_ADDRESS_MIN)
    } else if (uid_base::ACCESSORY_MOTOROLA..uid_base::ACCESSORY_DCC).contains(&uid) {
        Some(uid - uid_base::ACCESSORY_MOTOROLA + OUTPUT_ADDRESS_MIN)
    } else {
        None
    }
}
