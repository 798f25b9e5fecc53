//! ECoS kernel

use super::messages::{
    self, object_id, option, Block, Framer, ReplyHeader, Status,
};
use super::object::{EcosProtocol, Feedback, LocoChange, Locomotive, Switch};
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{Direction, EventLoop, SimulateInputAction, TriState};
use crate::decoder::{
    speed_step_to_throttle, throttle_to_speed_step, DecoderChangeFlags, DecoderProtocol,
    DecoderSnapshot,
};
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

/// Inputs: up to one hundred S88 modules with sixteen ports each
pub const INPUT_ADDRESS_MIN: u32 = 1;
pub const INPUT_ADDRESS_MAX: u32 = 1600;
/// Outputs are addressed by their switch object id
pub const OUTPUT_ADDRESS_MIN: u32 = object_id::SWITCH_MIN as u32;
pub const OUTPUT_ADDRESS_MAX: u32 = object_id::SWITCH_MAX as u32;

/// ECoS kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
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

/// ECoS protocol engine; lives on its I/O thread
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
    go: TriState,
    locomotives: HashMap<u16, Locomotive>,
    switches: HashMap<u16, Switch>,
    feedbacks: HashMap<u16, Feedback>,
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
        "ecos",
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
                    go: TriState::Undefined,
                    locomotives: HashMap::new(),
                    switches: HashMap::new(),
                    feedbacks: HashMap::new(),
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
        let (blocks, dropped) = self.framer.feed(&chunk);
        if dropped > 0 {
            self.logger.log(LogEntry::malformed(self.log_id.clone(), dropped));
        }
        for block in blocks {
            self.receive(block);
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
        // Release everything we requested a view or control on.
        let controlled: Vec<u16> = self
            .locomotives
            .values()
            .filter(|loco| loco.control)
            .map(|loco| loco.id)
            .collect();
        for id in controlled {
            self.send(&messages::release(id, &[option::CONTROL]));
        }
        self.send(&messages::release(object_id::ECOS, &[option::VIEW]));
    }
}

impl Kernel {
    /// Startup delay expired: subscribe the managers, query the object
    /// world, reconcile with the world state
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        self.send(&messages::get(object_id::ECOS, &[option::INFO, option::STATUS]));
        self.send(&messages::request(object_id::ECOS, &[option::VIEW]));
        self.send(&messages::query_objects(
            object_id::LOCOMOTIVE_MANAGER,
            &[option::ADDR, option::PROTOCOL],
        ));
        self.send(&messages::request(
            object_id::LOCOMOTIVE_MANAGER,
            &[option::VIEW],
        ));
        self.send(&messages::query_objects(
            object_id::SWITCH_MANAGER,
            &[option::ADDR],
        ));
        self.send(&messages::request(object_id::SWITCH_MANAGER, &[option::VIEW]));
        self.send(&messages::query_objects(
            object_id::FEEDBACK_MANAGER,
            &[option::PORTS],
        ));
        self.send(&messages::request(
            object_id::FEEDBACK_MANAGER,
            &[option::VIEW],
        ));

        // The station only has GO/STOP; power wins over run here, a
        // stopped-but-powered world relies on per-loco stops.
        if self.world.power_on {
            self.send(&messages::set_flag(object_id::ECOS, option::GO));
        } else {
            self.send(&messages::set_flag(object_id::ECOS, option::STOP));
        }
        if self.world.run {
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

    /// Dispatch one reply/event block
    pub fn receive(&mut self, block: Block) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::rx(self.log_id.clone(), format!("{:?}", block)));
        }
        match block {
            Block::Reply {
                header,
                lines,
                status,
                status_message,
            } => self.reply(header, lines, status, status_message),
            Block::Event {
                object_id: id,
                lines,
                ..
            } => {
                for line in &lines {
                    if let Some(line) = messages::parse_line(line) {
                        self.object_line(id, line);
                    }
                }
            }
        }
    }

    fn reply(
        &mut self,
        header: ReplyHeader,
        lines: Vec<String>,
        status: Status,
        status_message: String,
    ) {
        if !status.is_ok() {
            self.logger.log(LogEntry::warning(
                self.log_id.clone(),
                codes::PROTOCOL_FATAL,
                format!(
                    "{}({}) failed: {}",
                    header.command, header.object_id, status_message
                ),
            ));
            return;
        }

        match (header.command.as_str(), header.object_id) {
            ("queryObjects", object_id::LOCOMOTIVE_MANAGER) => {
                for line in &lines {
                    if let Some(line) = messages::parse_line(line) {
                        let loco = Locomotive::from_line(&line);
                        self.locomotives.insert(loco.id, loco);
                    }
                }
            }
            ("queryObjects", object_id::SWITCH_MANAGER) => {
                for line in &lines {
                    if let Some(line) = messages::parse_line(line) {
                        let switch = Switch::from_line(&line);
                        self.switches.insert(switch.id, switch);
                    }
                }
            }
            ("queryObjects", object_id::FEEDBACK_MANAGER) => {
                for line in &lines {
                    if let Some(line) = messages::parse_line(line) {
                        let feedback = Feedback::from_line(&line);
                        self.feedbacks.insert(feedback.id, feedback);
                    }
                }
            }
            ("request", id) => {
                if header.options.iter().any(|o| o == option::CONTROL) {
                    if let Some(loco) = self.locomotives.get_mut(&id) {
                        loco.control = true;
                    }
                }
            }
            (_, id) => {
                for line in &lines {
                    if let Some(line) = messages::parse_line(line) {
                        self.object_line(id, line);
                    }
                }
            }
        }
    }

    /// Absorb one data line addressed to an object
    fn object_line(&mut self, block_id: u16, line: messages::Line) {
        let id = if line.object_id != 0 {
            line.object_id
        } else {
            block_id
        };
        if id == object_id::ECOS {
            if let Some(status) = line.value(option::STATUS) {
                let go = status.eq_ignore_ascii_case("GO");
                if self.go != TriState::from(go) {
                    self.go = TriState::from(go);
                    let callback = if go {
                        self.callbacks.on_go.clone()
                    } else {
                        self.callbacks.on_stop.clone()
                    };
                    if let Some(callback) = callback {
                        self.event_loop.call(move || callback());
                    }
                }
            }
        } else if self.locomotives.contains_key(&id) {
            let (changes, address, protocol) = {
                let loco = self.locomotives.get_mut(&id).expect("checked");
                let changes = loco.absorb(&line);
                (changes, loco.address, loco.protocol)
            };
            self.loco_changes(address, protocol, changes);
        } else if self.switches.contains_key(&id) {
            let changed_state = {
                let switch = self.switches.get_mut(&id).expect("checked");
                switch.absorb(&line).then_some(switch.state)
            };
            if let Some(state) = changed_state {
                self.update_ecos_output(u32::from(id), state);
            }
        } else if self.feedbacks.contains_key(&id) {
            let (changes, ports) = {
                let feedback = self.feedbacks.get_mut(&id).expect("checked");
                (feedback.absorb(&line), feedback.ports)
            };
            let module = u32::from(id - object_id::S88_MIN);
            for (port, value) in changes {
                let address = module * u32::from(ports.max(1)) + u32::from(port) + 1;
                self.update_input(address, value);
            }
        }
    }

    /// Mirror device-side locomotive changes into the domain decoder
    fn loco_changes(&mut self, address: u16, protocol: EcosProtocol, changes: Vec<LocoChange>) {
        if changes.is_empty() {
            return;
        }
        let Some(decoder) = self.controllers.decoder.clone() else {
            return;
        };
        let steps = protocol.speed_steps();
        self.event_loop.call(move || {
            let Some(controller) = decoder.upgrade() else {
                return;
            };
            let candidates = [
                DecoderProtocol::DccShort,
                DecoderProtocol::DccLong,
                DecoderProtocol::Motorola,
                DecoderProtocol::Selectrix,
            ];
            let Some(decoder) = candidates
                .iter()
                .find_map(|p| controller.get_decoder(*p, address))
            else {
                return;
            };
            for change in changes {
                match change {
                    LocoChange::SpeedStep(step) => {
                        decoder.mirror_speed(
                            speed_step_to_throttle(step, steps),
                            decoder.direction(),
                            false,
                        );
                    }
                    LocoChange::Direction(direction) => {
                        decoder.mirror_speed(
                            decoder.throttle(),
                            direction,
                            decoder.emergency_stop(),
                        );
                    }
                    LocoChange::Function { index, value } => {
                        decoder.mirror_function(u32::from(index), value);
                    }
                }
            }
        });
    }

    fn update_input(&mut self, address: u32, value: bool) {
        let tri = TriState::from(value);
        if let Some(input) = self.controllers.input.clone() {
            self.event_loop.call(move || {
                if let Some(controller) = input.upgrade() {
                    controller.update_input_value(input::CHANNEL_DEFAULT, address, tri);
                }
            });
        }
    }

    fn update_ecos_output(&mut self, address: u32, state: u8) {
        if let Some(output) = self.controllers.output.clone() {
            self.event_loop.call(move || {
                if let Some(controller) = output.upgrade() {
                    controller.update_output_value(
                        crate::output::CHANNEL_DEFAULT,
                        address,
                        OutputValue::EcosState(state),
                    );
                }
            });
        }
    }

    // === domain-facing commands (arrive via post) ===

    pub fn go(&mut self) {
        if self.go != TriState::True {
            self.send(&messages::set_flag(object_id::ECOS, option::GO));
        }
    }

    pub fn stop(&mut self) {
        if self.go != TriState::False {
            self.send(&messages::set_flag(object_id::ECOS, option::STOP));
        }
    }

    /// Emit the command(s) for a decoder change
    ///
    /// Control over the station locomotive is requested lazily on the
    /// first drive command.
    pub fn decoder_changed(
        &mut self,
        decoder: DecoderSnapshot,
        changes: DecoderChangeFlags,
        function_number: u32,
    ) {
        let Some(id) = self.find_locomotive(decoder.address) else {
            self.logger.log(LogEntry::warning(
                self.log_id.clone(),
                codes::PROTOCOL_FATAL,
                format!("no station locomotive with address {}", decoder.address),
            ));
            return;
        };

        let (needs_control, steps) = {
            let loco = self.locomotives.get(&id).expect("checked");
            (!loco.control_requested, loco.protocol.speed_steps())
        };
        if needs_control {
            self.locomotives
                .get_mut(&id)
                .expect("checked")
                .control_requested = true;
            self.send(&messages::request(id, &[option::CONTROL, option::FORCE]));
        }

        if changes.has(DecoderChangeFlags::EMERGENCY_STOP) && decoder.emergency_stop {
            self.send(&messages::set_flag(id, option::STOP));
        } else if changes.has(DecoderChangeFlags::SPEED) {
            let step = throttle_to_speed_step(decoder.throttle, steps);
            let loco = self.locomotives.get_mut(&id).expect("checked");
            if loco.speed_step != step {
                loco.speed_step = step;
                self.send(&messages::set_value(id, option::SPEED_STEP, step));
            }
            let dir = u8::from(decoder.direction == Direction::Reverse);
            let loco = self.locomotives.get_mut(&id).expect("checked");
            if loco.direction != decoder.direction {
                loco.direction = decoder.direction;
                self.send(&messages::set_value(id, option::DIR, dir));
            }
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE) && function_number <= 31 {
            let value = decoder.function(function_number);
            let loco = self.locomotives.get_mut(&id).expect("checked");
            let index = function_number as u8;
            if loco.functions.get(&index).copied() != Some(value) {
                loco.functions.insert(index, value);
                self.send(&messages::set_pair(id, option::FUNC, index, u8::from(value)));
            }
        }
    }

    fn find_locomotive(&self, address: u16) -> Option<u16> {
        self.locomotives
            .values()
            .find(|loco| loco.address == address)
            .map(|loco| loco.id)
    }

    /// Command a switch; `address` is the switch object id
    pub fn set_output(&mut self, address: u32, state: u8) {
        let id = address as u16;
        let Some(switch) = self.switches.get(&id) else {
            return;
        };
        if switch.state == state && !switch.switching {
            return;
        }
        self.send(&messages::set_value(id, option::STATE, state));
    }

    /// Inject a sensor change; only valid in simulation mode
    ///
    /// Builds a feedback event block and routes it through `receive`.
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || address < INPUT_ADDRESS_MIN {
            return;
        }
        // Locate the module covering this address.
        let mut target = None;
        for feedback in self.feedbacks.values() {
            let ports = u32::from(feedback.ports.max(1));
            let module = u32::from(feedback.id - object_id::S88_MIN);
            let first = module * ports + 1;
            if (first..first + ports).contains(&address) {
                target = Some((feedback.id, (address - first) as u8, feedback.state));
                break;
            }
        }
        let Some((id, port, state)) = target else {
            return;
        };

        let current = state & (1 << port) != 0;
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
        let new_state = if value {
            state | (1 << port)
        } else {
            state & !(1 << port)
        };

        self.receive(Block::Event {
            object_id: id,
            lines: vec![format!("{} state[0x{:X}]", id, new_state)],
            status: Status::Ok,
            status_message: "OK".into(),
        });
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

    /// Snapshot of the station locomotive table
    pub fn station_locomotives(&self) -> Vec<StationLocomotive> {
        let mut locomotives: Vec<StationLocomotive> = self
            .locomotives
            .values()
            .map(|loco| StationLocomotive {
                id: loco.id,
                address: loco.address,
                protocol: loco.protocol,
                name: loco.name.clone(),
                control_requested: loco.control_requested,
            })
            .collect();
        locomotives.sort_unstable_by_key(|loco| loco.id);
        locomotives
    }
}

/// One row of the station locomotive table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationLocomotive {
    pub id: u16,
    pub address: u16,
    pub protocol: EcosProtocol,
    pub name: String,
    pub control_requested: bool,
}
