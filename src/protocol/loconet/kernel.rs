//! LocoNet kernel

use super::messages::{
    FastClock, Framer, LncvMessage, Message, SlotData, FAST_CLOCK_SLOT, INPUT_ADDRESS_MAX,
    INPUT_ADDRESS_MIN, SWITCH_ADDRESS_MIN,
};
use super::pcap::PcapWriter;
use super::simulation::SimulationIoHandler;
use crate::constants::STARTUP_DELAY_DEFAULT_MS;
use crate::core::{Direction, EventLoop, SimulateInputAction, TriState};
use crate::decoder::{
    speed_step_to_throttle, DecoderChangeFlags, DecoderSnapshot,
};
use crate::error::HubError;
use crate::input;
use crate::kernel::{self, ControllerLinks, IoConfig, KernelHandle, KernelState, WorldSnapshot};
use crate::logging::{entry::codes, LogEntry, Logger};
use crate::output::OutputValue;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Controller for LNCV module programming sessions
///
/// Implemented by the interface; read results arrive on the event loop
/// thread.
pub trait LncvProgrammingController: Send + Sync + 'static {
    fn on_lncv_read_response(&self, success: bool, lncv: u16, value: u16);
}

/// LocoNet kernel options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub startup_delay_ms: u64,
    pub debug_log_rx_tx: bool,
    /// Slot table size of the command station
    pub locomotive_slots: u8,
    pub fast_clock_sync_enabled: bool,
    /// Seconds between fast clock broadcasts
    pub fast_clock_sync_interval: u16,
    /// Never transmit; commands are refused with a warning
    pub listen_only: bool,
    /// Capture traffic to a pcap file
    pub pcap: bool,
    pub pcap_file: Option<PathBuf>,
    /// Capture traffic to stdout instead of a file
    pub pcap_output: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: STARTUP_DELAY_DEFAULT_MS,
            debug_log_rx_tx: false,
            locomotive_slots: 119,
            fast_clock_sync_enabled: false,
            fast_clock_sync_interval: 10,
            listen_only: false,
            pcap: false,
            pcap_file: None,
            pcap_output: false,
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
    pub lncv_controller: Option<Weak<dyn LncvProgrammingController>>,
    pub callbacks: Callbacks,
}

pub type KernelThread = kernel::KernelThread<Kernel>;

enum Io {
    Hardware { tx: mpsc::Sender<Bytes> },
    Simulation(SimulationIoHandler),
}

/// Commands deferred until a slot is acquired for the address
#[derive(Debug, Clone, Copy)]
enum SlotCommand {
    Speed(u8),
    DirFunc(Direction, [bool; 5]),
    Sound([bool; 4]),
}

/// LocoNet protocol engine; lives on its I/O thread
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
    lncv_controller: Option<Weak<dyn LncvProgrammingController>>,
    callbacks: Callbacks,
    power_on: TriState,
    emergency_stop: TriState,
    input_values: HashMap<u16, bool>,
    switch_values: HashMap<u16, bool>,
    address_to_slot: HashMap<u16, u8>,
    slot_to_address: HashMap<u8, u16>,
    pending_slot_commands: HashMap<u16, Vec<SlotCommand>>,
    fast_clock: FastClock,
    fast_clock_task: Option<tokio::task::JoinHandle<()>>,
    lncv_session: Option<(u16, u16)>,
    pcap: Option<PcapWriter>,
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
        lncv_controller,
        callbacks,
    } = options;

    let error_log_id = log_id.clone();
    let error_event_loop = event_loop.clone();
    let error_callbacks = callbacks.clone();

    kernel::spawn(
        "loconet",
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

            let pcap = if config.pcap {
                let writer = if config.pcap_output {
                    PcapWriter::to_stdout()
                } else {
                    let path = config
                        .pcap_file
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("loconet.pcap"));
                    PcapWriter::to_file(path)
                };
                match writer {
                    Ok(writer) => Some(writer),
                    Err(e) => {
                        logger.log(LogEntry::warning(
                            log_id.clone(),
                            codes::TRANSPORT,
                            format!("packet capture disabled: {}", e),
                        ));
                        None
                    }
                }
            } else {
                None
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
                    lncv_controller,
                    callbacks,
                    power_on: TriState::Undefined,
                    emergency_stop: TriState::Undefined,
                    input_values: HashMap::new(),
                    switch_values: HashMap::new(),
                    address_to_slot: HashMap::new(),
                    slot_to_address: HashMap::new(),
                    pending_slot_commands: HashMap::new(),
                    fast_clock: FastClock {
                        rate: 1,
                        hours: 0,
                        minutes: 0,
                    },
                    fast_clock_task: None,
                    lncv_session: None,
                    pcap,
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
            self.capture(&frame);
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

    fn stopping(&mut self) {
        if let Some(task) = self.fast_clock_task.take() {
            task.abort();
        }
    }
}

impl Kernel {
    /// Startup delay expired: reconcile with the world state, start the
    /// fast clock sync
    pub(super) fn started(&mut self) {
        if self.started {
            return;
        }
        self.started = true;

        if !self.world.run {
            self.send(&Message::Idle);
            self.emergency_stop = TriState::True;
        }
        if self.world.power_on {
            self.send(&Message::PowerOn);
        } else {
            self.send(&Message::PowerOff);
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

        self.send(&Message::RequestSlotData {
            slot: FAST_CLOCK_SLOT,
        });
        if self.config.fast_clock_sync_enabled {
            let interval = Duration::from_secs(u64::from(self.config.fast_clock_sync_interval));
            self.fast_clock_task = Some(
                self.handle
                    .post_interval(interval, |kernel| kernel.fast_clock_sync()),
            );
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

    /// Periodic fast clock broadcast
    fn fast_clock_sync(&mut self) {
        let advance =
            u32::from(self.config.fast_clock_sync_interval) * u32::from(self.fast_clock.rate);
        let total = u32::from(self.fast_clock.hours) * 3600
            + u32::from(self.fast_clock.minutes) * 60
            + advance;
        self.fast_clock.hours = ((total / 3600) % 24) as u8;
        self.fast_clock.minutes = ((total / 60) % 60) as u8;
        let clock = self.fast_clock;
        self.send(&Message::FastClockWrite(clock));
    }

    /// Dispatch one verified frame
    pub fn receive(&mut self, message: Message) {
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::rx(self.log_id.clone(), message.to_string_dump()));
        }

        match message {
            Message::PowerOn => {
                if self.power_on != TriState::True {
                    self.power_on = TriState::True;
                    if let Some(callback) = self.callbacks.on_track_power_on.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            Message::PowerOff => {
                if self.power_on != TriState::False {
                    self.power_on = TriState::False;
                    if let Some(callback) = self.callbacks.on_track_power_off.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            Message::Idle => {
                if self.emergency_stop != TriState::True {
                    self.emergency_stop = TriState::True;
                    if let Some(callback) = self.callbacks.on_emergency_stop.clone() {
                        self.event_loop.call(move || callback());
                    }
                }
            }
            Message::InputReport { address, value } => {
                if self.input_values.get(&address) != Some(&value) {
                    self.input_values.insert(address, value);
                    let domain_address = u32::from(address) + INPUT_ADDRESS_MIN;
                    let tri = TriState::from(value);
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
            Message::SwitchRequest { address, thrown, on } => {
                // Echo of our own request or another throttle's; the
                // activate pulse carries the position.
                if on {
                    self.switch_values.insert(address, thrown);
                    self.update_switch(address, thrown);
                }
            }
            Message::SlotReadData(data) => self.slot_read(data),
            Message::LocoSpeed { slot, speed } => {
                if let Some(address) = self.slot_to_address.get(&slot).copied() {
                    self.mirror_speed(address, speed, None);
                }
            }
            Message::LocoDirFunc {
                slot,
                direction,
                f0,
                f1,
                f2,
                f3,
                f4,
            } => {
                if let Some(address) = self.slot_to_address.get(&slot).copied() {
                    self.mirror_functions(
                        address,
                        Some(direction),
                        vec![(0, f0), (1, f1), (2, f2), (3, f3), (4, f4)],
                    );
                }
            }
            Message::LocoSound { slot, f5, f6, f7, f8 } => {
                if let Some(address) = self.slot_to_address.get(&slot).copied() {
                    self.mirror_functions(address, None, vec![(5, f5), (6, f6), (7, f7), (8, f8)]);
                }
            }
            Message::FastClockRead(clock) | Message::FastClockWrite(clock) => {
                self.fast_clock = clock;
            }
            Message::Lncv(LncvMessage::ReadResponse {
                module_id,
                lncv,
                value,
            }) => {
                if self
                    .lncv_session
                    .map(|(id, _)| id == module_id)
                    .unwrap_or(false)
                {
                    if let Some(controller) = self.lncv_controller.clone() {
                        self.event_loop.call(move || {
                            if let Some(controller) = controller.upgrade() {
                                controller.on_lncv_read_response(true, lncv, value);
                            }
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn slot_read(&mut self, data: SlotData) {
        if data.slot == 0 || data.slot > self.config.locomotive_slots {
            // outside the station's locomotive slot table
            return;
        }
        self.slot_to_address.insert(data.slot, data.address);
        self.address_to_slot.insert(data.address, data.slot);

        if !data.in_use() {
            // NULL MOVE marks the slot as in use by us.
            self.send(&Message::MoveSlots {
                source: data.slot,
                destination: data.slot,
            });
        }

        self.mirror_speed(data.address, data.speed, Some(data.direction()));

        if let Some(commands) = self.pending_slot_commands.remove(&data.address) {
            for command in commands {
                self.send_slot_command(data.slot, command);
            }
        }
    }

    /// Mirror a device-reported speed back into the domain decoder
    fn mirror_speed(&mut self, address: u16, speed: u8, direction: Option<Direction>) {
        let Some(decoder) = self.controllers.decoder.clone() else {
            return;
        };
        self.event_loop.call(move || {
            let Some(controller) = decoder.upgrade() else {
                return;
            };
            let Some(decoder) = find_decoder(&*controller, address) else {
                return;
            };
            let emergency_stop = speed == 1;
            let step = if speed > 1 { speed - 1 } else { 0 };
            let throttle = speed_step_to_throttle(step, 126);
            decoder.mirror_speed(
                throttle,
                direction.unwrap_or_else(|| decoder.direction()),
                emergency_stop,
            );
        });
    }

    fn mirror_functions(
        &mut self,
        address: u16,
        direction: Option<Direction>,
        functions: Vec<(u32, bool)>,
    ) {
        let Some(decoder) = self.controllers.decoder.clone() else {
            return;
        };
        self.event_loop.call(move || {
            let Some(controller) = decoder.upgrade() else {
                return;
            };
            let Some(decoder) = find_decoder(&*controller, address) else {
                return;
            };
            if let Some(direction) = direction {
                decoder.mirror_speed(decoder.throttle(), direction, decoder.emergency_stop());
            }
            for (number, value) in functions {
                decoder.mirror_function(number, value);
            }
        });
    }

    fn update_switch(&mut self, address: u16, thrown: bool) {
        let domain_address = u32::from(address) + SWITCH_ADDRESS_MIN;
        let value = OutputValue::from(TriState::from(thrown));
        if let Some(output) = self.controllers.output.clone() {
            self.event_loop.call(move || {
                if let Some(controller) = output.upgrade() {
                    controller.update_output_value(
                        crate::output::CHANNEL_DEFAULT,
                        domain_address,
                        value,
                    );
                }
            });
        }
    }

    // === domain-facing commands (arrive via post) ===

    pub fn power_on(&mut self) {
        if self.power_on != TriState::True {
            self.send(&Message::PowerOn);
        }
    }

    pub fn power_off(&mut self) {
        if self.power_on != TriState::False {
            self.send(&Message::PowerOff);
        }
    }

    pub fn emergency_stop(&mut self) {
        if self.emergency_stop != TriState::True {
            self.send(&Message::Idle);
        }
    }

    pub fn clear_emergency_stop(&mut self) {
        self.emergency_stop = TriState::False;
    }

    /// Emit the command(s) for a decoder change
    ///
    /// LocoNet carries F0-F8 natively; higher function numbers have no
    /// slot encoding and are ignored.
    pub fn decoder_changed(
        &mut self,
        decoder: DecoderSnapshot,
        changes: DecoderChangeFlags,
        function_number: u32,
    ) {
        if changes.has(DecoderChangeFlags::SPEED) {
            let speed = if decoder.emergency_stop {
                1
            } else {
                match decoder.speed_step(126) {
                    0 => 0,
                    step => step + 1,
                }
            };
            self.queue_slot_command(decoder.address, SlotCommand::Speed(speed));
            if changes.has(DecoderChangeFlags::DIRECTION) {
                self.queue_slot_command(
                    decoder.address,
                    SlotCommand::DirFunc(
                        decoder.direction,
                        [
                            decoder.function(0),
                            decoder.function(1),
                            decoder.function(2),
                            decoder.function(3),
                            decoder.function(4),
                        ],
                    ),
                );
            }
        } else if changes.has(DecoderChangeFlags::FUNCTION_VALUE) {
            match function_number {
                0..=4 => self.queue_slot_command(
                    decoder.address,
                    SlotCommand::DirFunc(
                        decoder.direction,
                        [
                            decoder.function(0),
                            decoder.function(1),
                            decoder.function(2),
                            decoder.function(3),
                            decoder.function(4),
                        ],
                    ),
                ),
                5..=8 => self.queue_slot_command(
                    decoder.address,
                    SlotCommand::Sound([
                        decoder.function(5),
                        decoder.function(6),
                        decoder.function(7),
                        decoder.function(8),
                    ]),
                ),
                _ => {}
            }
        }
    }

    /// Emit now when a slot is bound, else request one and defer
    fn queue_slot_command(&mut self, address: u16, command: SlotCommand) {
        if let Some(slot) = self.address_to_slot.get(&address).copied() {
            self.send_slot_command(slot, command);
            return;
        }
        let pending = self.pending_slot_commands.entry(address).or_default();
        let first = pending.is_empty();
        pending.push(command);
        if first {
            self.send(&Message::LocoAddress { address });
        }
    }

    fn send_slot_command(&mut self, slot: u8, command: SlotCommand) {
        let message = match command {
            SlotCommand::Speed(speed) => Message::LocoSpeed { slot, speed },
            SlotCommand::DirFunc(direction, f) => Message::LocoDirFunc {
                slot,
                direction,
                f0: f[0],
                f1: f[1],
                f2: f[2],
                f3: f[3],
                f4: f[4],
            },
            SlotCommand::Sound(f) => Message::LocoSound {
                slot,
                f5: f[0],
                f6: f[1],
                f7: f[2],
                f8: f[3],
            },
        };
        self.send(&message);
    }

    /// Command a turnout; `address` is the 1-based domain address
    pub fn set_output(&mut self, address: u32, thrown: bool) {
        let wire = (address - SWITCH_ADDRESS_MIN) as u16;
        if self.switch_values.get(&wire) == Some(&thrown) {
            return;
        }
        // Activate pulse, then coil off.
        self.send(&Message::SwitchRequest {
            address: wire,
            thrown,
            on: true,
        });
        self.send(&Message::SwitchRequest {
            address: wire,
            thrown,
            on: false,
        });
    }

    /// Inject a sensor change; only valid in simulation mode
    pub fn simulate_input_change(&mut self, address: u32, action: SimulateInputAction) {
        if !self.simulation || !(INPUT_ADDRESS_MIN..=INPUT_ADDRESS_MAX).contains(&address) {
            return;
        }
        let wire = (address - INPUT_ADDRESS_MIN) as u16;
        let current = self.input_values.get(&wire).copied();
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
        self.receive(Message::InputReport {
            address: wire,
            value,
        });
    }

    // === LNCV programming session ===

    /// Open a programming session; only one at a time
    pub fn lncv_start(&mut self, module_id: u16, module_address: u16) -> bool {
        if self.lncv_session.is_some() {
            return false;
        }
        self.lncv_session = Some((module_id, module_address));
        self.send(&Message::Lncv(LncvMessage::Start {
            module_id,
            module_address,
        }));
        true
    }

    /// Read an LNCV; only valid inside a session
    pub fn lncv_read(&mut self, lncv: u16) -> bool {
        let Some((module_id, _)) = self.lncv_session else {
            return false;
        };
        self.send(&Message::Lncv(LncvMessage::Read { module_id, lncv }));
        true
    }

    /// Write an LNCV; only valid inside a session
    pub fn lncv_write(&mut self, lncv: u16, value: u16) -> bool {
        let Some((module_id, _)) = self.lncv_session else {
            return false;
        };
        self.send(&Message::Lncv(LncvMessage::Write {
            module_id,
            lncv,
            value,
        }));
        true
    }

    /// Close the programming session
    pub fn lncv_stop(&mut self) {
        if let Some((module_id, module_address)) = self.lncv_session.take() {
            self.send(&Message::Lncv(LncvMessage::Stop {
                module_id,
                module_address,
            }));
        }
    }

    fn capture(&mut self, frame: &[u8]) {
        if let Some(pcap) = &mut self.pcap {
            if let Err(e) = pcap.record(frame) {
                self.logger.log(LogEntry::warning(
                    self.log_id.clone(),
                    codes::TRANSPORT,
                    format!("packet capture stopped: {}", e),
                ));
                self.pcap = None;
            }
        }
    }

    /// Returns `false` when the frame was not transmitted
    fn send(&mut self, message: &Message) -> bool {
        if self.config.listen_only {
            self.logger.log(LogEntry::warning(
                self.log_id.clone(),
                codes::LISTEN_ONLY_SEND_REFUSED,
                format!("listen only, refusing to send {}", message.to_string_dump()),
            ));
            return false;
        }
        if self.config.debug_log_rx_tx {
            self.logger
                .log(LogEntry::tx(self.log_id.clone(), message.to_string_dump()));
        }
        let frame = message.serialize();
        self.capture(&frame);
        match &mut self.io {
            Io::Hardware { tx } => {
                if tx.try_send(Bytes::from(frame)).is_err() {
                    self.logger.log(LogEntry::error(
                        self.log_id.clone(),
                        codes::WRITE_BUFFER_FULL,
                        "write buffer full, dropping frame",
                    ));
                    return false;
                }
                true
            }
            Io::Simulation(simulation) => {
                simulation.send(message);
                true
            }
        }
    }
}

/// Look up a decoder by LocoNet address over the DCC protocols
fn find_decoder(
    controller: &dyn crate::decoder::DecoderController,
    address: u16,
) -> Option<crate::decoder::Decoder> {
    controller
        .get_decoder(crate::decoder::DecoderProtocol::DccShort, address)
        .or_else(|| controller.get_decoder(crate::decoder::DecoderProtocol::DccLong, address))
}
