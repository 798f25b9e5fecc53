//! ECoS interface

use super::{Interface, InterfaceCore, InterfaceStatus, TransportConfig};
use crate::core::{EventLoop, SimulateInputAction, World, WorldEvent, WorldState};
use crate::decoder::{
    Decoder, DecoderChangeFlags, DecoderController, DecoderProtocol, DecoderRegistry,
};
use crate::error::{HubError, Result};
use crate::input::{InputController, InputRegistry};
use crate::kernel::{ControllerLinks, IoConfig, SimulatorConfig, WorldSnapshot};
use crate::logging::{entry::codes, Logger};
use crate::output::{OutputController, OutputRegistry, OutputType, OutputValue};
use crate::protocol::ecos::kernel::{
    self, Callbacks, KernelConfig, KernelThread, StartOptions, INPUT_ADDRESS_MAX,
    INPUT_ADDRESS_MIN, OUTPUT_ADDRESS_MAX, OUTPUT_ADDRESS_MIN,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Interface for the ESU ECoS / Central Station 1 family
pub struct EcosInterface {
    core: InterfaceCore,
    config: Mutex<KernelConfig>,
    kernel: Mutex<Option<KernelThread>>,
    simulator: Mutex<Option<SimulatorConfig>>,
    decoders: DecoderRegistry,
    inputs: InputRegistry,
    outputs: OutputRegistry,
}

impl EcosInterface {
    pub fn new(
        id: impl Into<String>,
        transport: TransportConfig,
        config: KernelConfig,
        event_loop: EventLoop,
        logger: Logger,
        world: Arc<World>,
    ) -> Arc<Self> {
        let interface = Arc::new(Self {
            core: InterfaceCore::new(id, transport, event_loop, logger, world),
            config: Mutex::new(config),
            kernel: Mutex::new(None),
            simulator: Mutex::new(None),
            decoders: DecoderRegistry::new(),
            inputs: InputRegistry::new(),
            outputs: OutputRegistry::new(),
        });
        let weak = Arc::downgrade(&interface);
        interface.core.world.subscribe(move |state, event| {
            if let Some(interface) = weak.upgrade() {
                interface.world_event(state, event);
            }
        });
        interface
    }

    /// Use an external layout simulator when going online in simulation
    pub fn set_simulator(&self, simulator: Option<SimulatorConfig>) {
        *self.simulator.lock() = simulator;
    }

    pub fn config(&self) -> KernelConfig {
        self.config.lock().clone()
    }

    pub fn set_config(&self, config: KernelConfig) {
        *self.config.lock() = config;
    }

    /// The station's locomotive table, queried from the kernel
    ///
    /// Empty while offline or when the kernel does not answer in time.
    pub fn station_locomotives(&self) -> Vec<crate::protocol::ecos::kernel::StationLocomotive> {
        let Some(kernel) = self.kernel.lock().as_ref().map(|k| k.handle().clone()) else {
            return Vec::new();
        };
        let (tx, rx) = std::sync::mpsc::channel();
        if !kernel.post(move |k| {
            let _ = tx.send(k.station_locomotives());
        }) {
            return Vec::new();
        }
        rx.recv_timeout(std::time::Duration::from_secs(1))
            .unwrap_or_default()
    }

    fn world_event(&self, state: WorldState, event: WorldEvent) {
        for decoder in self.decoders.all() {
            decoder.world_event(state, event);
        }
        {
            let guard = self.kernel.lock();
            let Some(kernel) = guard.as_ref() else {
                return;
            };
            match event {
                WorldEvent::PowerOn => {
                    kernel.handle().post(|k| k.go());
                }
                WorldEvent::PowerOff | WorldEvent::Stop => {
                    kernel.handle().post(|k| k.stop());
                }
                WorldEvent::Run => {
                    kernel.handle().post(|k| k.go());
                }
                _ => {}
            }
        }
        if event == WorldEvent::Run {
            self.restore_decoder_speed();
        }
    }
}

impl Interface for EcosInterface {
    fn id(&self) -> &str {
        &self.core.id
    }

    fn status(&self) -> InterfaceStatus {
        self.core.status()
    }

    fn set_online(self: Arc<Self>, value: bool, simulation: bool) -> Result<()> {
        EventLoop::assert_current();
        if !value {
            if let Some(mut kernel) = self.kernel.lock().take() {
                kernel.stop();
            }
            self.core.set_status(InterfaceStatus::Offline);
            return Ok(());
        }
        if self.kernel.lock().is_some() {
            return Err(HubError::AlreadyOnline {
                id: self.core.id.clone(),
            });
        }

        let transport = self.core.transport();
        transport
            .validate()
            .map_err(|reason| HubError::ConfigValidation {
                field: "transport",
                reason,
            })?;

        self.core.set_status(InterfaceStatus::Initializing);

        let world_state = self.core.world.state();
        let weak = Arc::downgrade(&self);
        let on_started = {
            let weak = weak.clone();
            Arc::new(move || {
                if let Some(interface) = weak.upgrade() {
                    interface.core.set_status(InterfaceStatus::Online);
                }
            }) as Arc<dyn Fn() + Send + Sync>
        };
        let on_error = {
            let weak = weak.clone();
            Arc::new(move |message: String| {
                if let Some(interface) = weak.upgrade() {
                    interface.core.kernel_error(codes::TRANSPORT, message);
                    if let Some(mut kernel) = interface.kernel.lock().take() {
                        kernel.stop();
                    }
                }
            }) as Arc<dyn Fn(String) + Send + Sync>
        };

        let io = if simulation {
            IoConfig::Simulation {
                simulator: self.simulator.lock().clone(),
            }
        } else {
            IoConfig::Hardware(transport)
        };

        let kernel = kernel::start(StartOptions {
            log_id: self.core.id.clone(),
            config: self.config.lock().clone(),
            io,
            world: WorldSnapshot {
                power_on: world_state.contains(WorldState::POWER_ON),
                run: world_state.contains(WorldState::RUN),
            },
            event_loop: self.core.event_loop.clone(),
            logger: self.core.logger.clone(),
            controllers: ControllerLinks {
                decoder: Some(Arc::downgrade(
                    &(self.clone() as Arc<dyn DecoderController>),
                )),
                input: Some(Arc::downgrade(&(self.clone() as Arc<dyn InputController>))),
                output: Some(Arc::downgrade(&(self.clone() as Arc<dyn OutputController>))),
            },
            callbacks: Callbacks {
                on_started: Some(on_started),
                on_error: Some(on_error),
                on_go: None,
                on_stop: None,
            },
        });
        *self.kernel.lock() = Some(kernel);
        Ok(())
    }
}

impl DecoderController for EcosInterface {
    fn decoder_protocols(&self) -> &'static [DecoderProtocol] {
        &[
            DecoderProtocol::DccShort,
            DecoderProtocol::DccLong,
            DecoderProtocol::Motorola,
            DecoderProtocol::Selectrix,
        ]
    }

    fn decoder_address_min_max(&self, protocol: DecoderProtocol) -> Option<(u16, u16)> {
        match protocol {
            DecoderProtocol::DccShort => Some((1, 127)),
            DecoderProtocol::DccLong => Some((128, 9999)),
            DecoderProtocol::Motorola => Some((1, 255)),
            DecoderProtocol::Selectrix => Some((1, 112)),
            _ => None,
        }
    }

    fn decoder_speed_steps(&self, protocol: DecoderProtocol) -> &'static [u8] {
        match protocol {
            DecoderProtocol::Motorola => &[14, 27, 28],
            DecoderProtocol::Selectrix => &[31],
            _ => &[14, 28, 128],
        }
    }

    fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    fn decoder_changed(&self, decoder: &Decoder, changes: DecoderChangeFlags, function_number: u32) {
        let snapshot = decoder.snapshot();
        if let Some(kernel) = self.kernel.lock().as_ref() {
            kernel
                .handle()
                .post(move |k| k.decoder_changed(snapshot, changes, function_number));
        }
    }
}

impl InputController for EcosInterface {
    fn input_address_min_max(&self, _channel: u16) -> (u32, u32) {
        (INPUT_ADDRESS_MIN, INPUT_ADDRESS_MAX)
    }

    fn inputs(&self) -> &InputRegistry {
        &self.inputs
    }

    fn simulate_input_change(&self, _channel: u16, address: u32, action: SimulateInputAction) {
        if let Some(kernel) = self.kernel.lock().as_ref() {
            kernel
                .handle()
                .post(move |k| k.simulate_input_change(address, action));
        }
    }
}

impl OutputController for EcosInterface {
    fn output_type(&self, _channel: u16) -> OutputType {
        OutputType::Ecos
    }

    fn output_address_min_max(&self, _channel: u16) -> (u32, u32) {
        (OUTPUT_ADDRESS_MIN, OUTPUT_ADDRESS_MAX)
    }

    fn outputs(&self) -> &OutputRegistry {
        &self.outputs
    }

    fn send_output_value(&self, _channel: u16, address: u32, value: OutputValue) -> bool {
        let OutputValue::EcosState(state) = value else {
            return false;
        };
        match self.kernel.lock().as_ref() {
            Some(kernel) => kernel.handle().post(move |k| k.set_output(address, state)),
            None => false,
        }
    }
}
