//! Commandable outputs
//!
//! An output is an accessory the hardware can switch: a solenoid, a
//! turnout motor, a signal aspect. Like inputs, outputs are keyed by
//! `(channel, address)`, created on first consumer and destroyed when the
//! last consumer releases them. Channels are typed: a value only
//! typechecks against the channel's output type.

pub mod map;

pub use map::{MatchResult, OutputAction, OutputMap, OutputMapItem};

use crate::core::{EventLoop, TriState};
use crate::input::ConsumerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Channel used by controllers with a single accessory bus
pub const CHANNEL_DEFAULT: u16 = 1;

/// Value domain of an output channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// On/off
    Single,
    /// Two mutually exclusive coils (turnout straight/branch)
    Pair,
    /// Signal aspect number
    Aspect,
    /// ECoS native switch state
    Ecos,
}

/// A value in one of the output lattices
///
/// `Undefined` is a member of every lattice; it is what mirrors hold
/// before the device reported anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputValue {
    Undefined,
    /// Single: off / on
    Low,
    High,
    /// Pair: first or second coil active
    PairFirst,
    PairSecond,
    /// Aspect number
    Aspect(i16),
    /// ECoS state ordinal
    EcosState(u8),
}

impl OutputValue {
    /// Does the value belong to the lattice of `output_type`?
    pub fn matches_type(self, output_type: OutputType) -> bool {
        match self {
            Self::Undefined => true,
            Self::Low | Self::High => output_type == OutputType::Single,
            Self::PairFirst | Self::PairSecond => output_type == OutputType::Pair,
            Self::Aspect(_) => output_type == OutputType::Aspect,
            Self::EcosState(_) => output_type == OutputType::Ecos,
        }
    }

    /// For single outputs, the boolean wire value
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Low => Some(false),
            Self::High => Some(true),
            _ => None,
        }
    }
}

impl From<TriState> for OutputValue {
    fn from(value: TriState) -> Self {
        match value {
            TriState::Undefined => Self::Undefined,
            TriState::False => Self::Low,
            TriState::True => Self::High,
        }
    }
}

struct OutputState {
    channel: u16,
    address: u32,
    value: OutputValue,
    used_by: Vec<ConsumerId>,
    observers: Vec<Box<dyn Fn(OutputValue) + Send + Sync>>,
}

/// Shared handle to one output
#[derive(Clone)]
pub struct Output {
    state: Arc<Mutex<OutputState>>,
}

impl Output {
    fn new(channel: u16, address: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutputState {
                channel,
                address,
                value: OutputValue::Undefined,
                used_by: Vec::new(),
                observers: Vec::new(),
            })),
        }
    }

    pub fn channel(&self) -> u16 {
        self.state.lock().channel
    }

    pub fn address(&self) -> u32 {
        self.state.lock().address
    }

    pub fn value(&self) -> OutputValue {
        self.state.lock().value
    }

    /// Observe value changes; fired on the event loop thread
    pub fn on_change(&self, observer: impl Fn(OutputValue) + Send + Sync + 'static) {
        self.state.lock().observers.push(Box::new(observer));
    }

    fn update_value(&self, value: OutputValue) {
        let observers_snapshot = {
            let mut state = self.state.lock();
            if state.value == value {
                return;
            }
            state.value = value;
            std::mem::take(&mut state.observers)
        };
        for observer in &observers_snapshot {
            observer(value);
        }
        self.state.lock().observers = observers_snapshot;
    }
}

/// Event delivered to an output keyboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKeyboardEvent {
    UsedChanged { address: u32, used: bool },
    ValueChanged { address: u32, value: OutputValue },
}

/// Ephemeral view of one channel's output address space
pub struct OutputKeyboard {
    channel: u16,
    output_type: OutputType,
    address_min: u32,
    address_max: u32,
    registry: Weak<RegistryInner>,
    observers: Mutex<Vec<Box<dyn Fn(OutputKeyboardEvent) + Send + Sync>>>,
}

impl OutputKeyboard {
    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    pub fn address_min(&self) -> u32 {
        self.address_min
    }

    pub fn address_max(&self) -> u32 {
        self.address_max
    }

    pub fn on_event(&self, observer: impl Fn(OutputKeyboardEvent) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    /// Current `(address, value)` of every materialized output on the
    /// channel, sorted by address
    pub fn snapshot(&self) -> Vec<(u32, OutputValue)> {
        let Some(registry) = self.registry.upgrade() else {
            return Vec::new();
        };
        let mut entries: Vec<(u32, OutputValue)> = registry
            .outputs
            .lock()
            .iter()
            .filter(|((channel, _), _)| *channel == self.channel)
            .map(|((_, address), output)| (*address, output.value()))
            .collect();
        entries.sort_unstable_by_key(|(address, _)| *address);
        entries
    }

    fn fire(&self, event: OutputKeyboardEvent) {
        for observer in self.observers.lock().iter() {
            observer(event);
        }
    }
}

struct RegistryInner {
    outputs: Mutex<HashMap<(u16, u32), Output>>,
    keyboards: Mutex<HashMap<u16, Weak<OutputKeyboard>>>,
}

/// Per-controller output storage
#[derive(Clone)]
pub struct OutputRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for OutputRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                outputs: Mutex::new(HashMap::new()),
                keyboards: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.outputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.outputs.lock().is_empty()
    }

    /// Observed value of an output, `Undefined` when not materialized
    pub fn value(&self, channel: u16, address: u32) -> OutputValue {
        self.inner
            .outputs
            .lock()
            .get(&(channel, address))
            .map(|output| output.value())
            .unwrap_or(OutputValue::Undefined)
    }

    fn keyboard(&self, channel: u16) -> Option<Arc<OutputKeyboard>> {
        self.inner
            .keyboards
            .lock()
            .get(&channel)
            .and_then(Weak::upgrade)
    }
}

/// Controller side of the output subsystem
pub trait OutputController: Send + Sync + 'static {
    /// Channels this hardware can command
    fn output_channels(&self) -> &'static [u16] {
        &[CHANNEL_DEFAULT]
    }

    /// Value domain of a channel
    fn output_type(&self, channel: u16) -> OutputType;

    /// Inclusive address range of a channel
    fn output_address_min_max(&self, channel: u16) -> (u32, u32);

    fn outputs(&self) -> &OutputRegistry;

    /// Transmit a validated value to the hardware
    ///
    /// Implementations forward to the kernel; they can assume channel,
    /// address and type have been checked.
    fn send_output_value(&self, channel: u16, address: u32, value: OutputValue) -> bool;

    fn is_output_channel(&self, channel: u16) -> bool {
        self.output_channels().contains(&channel)
    }

    /// Command an output
    ///
    /// Returns `false` without side effects when the channel is unknown,
    /// the address is out of range, or the value does not typecheck
    /// against the channel's output type.
    fn set_output_value(&self, channel: u16, address: u32, value: OutputValue) -> bool {
        EventLoop::assert_current();
        if !self.is_output_channel(channel) {
            return false;
        }
        let (min, max) = self.output_address_min_max(channel);
        if address < min || address > max {
            return false;
        }
        if value == OutputValue::Undefined || !value.matches_type(self.output_type(channel)) {
            return false;
        }
        self.send_output_value(channel, address, value)
    }

    /// Materialize an output for a consumer
    fn get_output(&self, channel: u16, address: u32, consumer: ConsumerId) -> Option<Output> {
        EventLoop::assert_current();
        if !self.is_output_channel(channel) {
            return None;
        }
        let (min, max) = self.output_address_min_max(channel);
        if address < min || address > max {
            return None;
        }

        let registry = self.outputs();
        let (output, created) = {
            let mut outputs = registry.inner.outputs.lock();
            match outputs.get(&(channel, address)) {
                Some(output) => (output.clone(), false),
                None => {
                    let output = Output::new(channel, address);
                    outputs.insert((channel, address), output.clone());
                    (output, true)
                }
            }
        };
        {
            let mut state = output.state.lock();
            if !state.used_by.contains(&consumer) {
                state.used_by.push(consumer);
            }
        }
        if created {
            if let Some(keyboard) = registry.keyboard(channel) {
                keyboard.fire(OutputKeyboardEvent::UsedChanged {
                    address,
                    used: true,
                });
            }
        }
        Some(output)
    }

    /// Release a consumer's hold; the output is destroyed when unused
    fn release_output(&self, output: &Output, consumer: ConsumerId) {
        EventLoop::assert_current();
        let (channel, address, now_unused) = {
            let mut state = output.state.lock();
            state.used_by.retain(|c| *c != consumer);
            (state.channel, state.address, state.used_by.is_empty())
        };
        if now_unused {
            let registry = self.outputs();
            registry.inner.outputs.lock().remove(&(channel, address));
            if let Some(keyboard) = registry.keyboard(channel) {
                keyboard.fire(OutputKeyboardEvent::UsedChanged {
                    address,
                    used: false,
                });
            }
        }
    }

    /// Push a device-reported output state into the domain
    ///
    /// Called by the kernel, already on the event loop thread.
    fn update_output_value(&self, channel: u16, address: u32, value: OutputValue) {
        EventLoop::assert_current();
        let registry = self.outputs();
        let output = registry.inner.outputs.lock().get(&(channel, address)).cloned();
        if let Some(output) = output {
            output.update_value(value);
        }
        if let Some(keyboard) = registry.keyboard(channel) {
            keyboard.fire(OutputKeyboardEvent::ValueChanged { address, value });
        }
    }

    /// The channel's keyboard, created on first request, cached weakly
    fn output_keyboard(&self, channel: u16) -> Option<Arc<OutputKeyboard>> {
        if !self.is_output_channel(channel) {
            return None;
        }
        let registry = self.outputs();
        let mut keyboards = registry.inner.keyboards.lock();
        if let Some(keyboard) = keyboards.get(&channel).and_then(Weak::upgrade) {
            return Some(keyboard);
        }
        let (address_min, address_max) = self.output_address_min_max(channel);
        let keyboard = Arc::new(OutputKeyboard {
            channel,
            output_type: self.output_type(channel),
            address_min,
            address_max,
            registry: Arc::downgrade(&registry.inner),
            observers: Mutex::new(Vec::new()),
        });
        keyboards.insert(channel, Arc::downgrade(&keyboard));
        Some(keyboard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestController {
        registry: OutputRegistry,
        sent: Mutex<Vec<(u16, u32, OutputValue)>>,
    }

    impl TestController {
        fn new() -> Self {
            EventLoop::mark_thread_as_event_loop();
            Self {
                registry: OutputRegistry::new(),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl OutputController for TestController {
        fn output_channels(&self) -> &'static [u16] {
            &[1, 2]
        }

        fn output_type(&self, channel: u16) -> OutputType {
            match channel {
                1 => OutputType::Single,
                _ => OutputType::Pair,
            }
        }

        fn output_address_min_max(&self, _channel: u16) -> (u32, u32) {
            (1, 2048)
        }

        fn outputs(&self) -> &OutputRegistry {
            &self.registry
        }

        fn send_output_value(&self, channel: u16, address: u32, value: OutputValue) -> bool {
            self.sent.lock().push((channel, address, value));
            true
        }
    }

    #[test]
    fn test_set_output_value_typechecks() {
        let controller = TestController::new();
        assert!(controller.set_output_value(1, 5, OutputValue::High));
        assert!(!controller.set_output_value(1, 5, OutputValue::PairFirst));
        assert!(controller.set_output_value(2, 5, OutputValue::PairSecond));
        assert!(!controller.set_output_value(2, 5, OutputValue::Low));
        assert!(!controller.set_output_value(1, 5, OutputValue::Undefined));
        assert_eq!(controller.sent.lock().len(), 2);
    }

    #[test]
    fn test_set_output_value_validates_address() {
        let controller = TestController::new();
        assert!(!controller.set_output_value(1, 0, OutputValue::High));
        assert!(controller.set_output_value(1, 1, OutputValue::High));
        assert!(controller.set_output_value(1, 2048, OutputValue::High));
        assert!(!controller.set_output_value(1, 2049, OutputValue::High));
        assert!(!controller.set_output_value(9, 1, OutputValue::High));
    }

    #[test]
    fn test_output_lifecycle_and_updates() {
        let controller = TestController::new();
        let consumer = ConsumerId::next();
        let output = controller.get_output(1, 7, consumer).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        output.on_change(move |value| seen_clone.lock().push(value));

        controller.update_output_value(1, 7, OutputValue::High);
        controller.update_output_value(1, 7, OutputValue::High);
        assert_eq!(*seen.lock(), vec![OutputValue::High]);

        controller.release_output(&output, consumer);
        assert!(controller.outputs().is_empty());
    }

    #[test]
    fn test_keyboard_events() {
        let controller = TestController::new();
        let keyboard = controller.output_keyboard(1).unwrap();
        assert_eq!(keyboard.output_type(), OutputType::Single);

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        keyboard.on_event(move |event| events_clone.lock().push(event));

        let consumer = ConsumerId::next();
        let _output = controller.get_output(1, 3, consumer).unwrap();
        controller.update_output_value(1, 3, OutputValue::Low);

        assert_eq!(
            *events.lock(),
            vec![
                OutputKeyboardEvent::UsedChanged {
                    address: 3,
                    used: true
                },
                OutputKeyboardEvent::ValueChanged {
                    address: 3,
                    value: OutputValue::Low
                },
            ]
        );
    }
}
