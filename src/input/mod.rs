//! Sensor inputs
//!
//! An input is a reported sensor bit, keyed by `(channel, address)` per
//! controller. Inputs are created on first consumer and destroyed when
//! the last consumer releases them; ephemeral monitors observe a whole
//! channel's address space for UI use.

use crate::core::{EventLoop, SimulateInputAction, TriState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Channel used by controllers with a single input bus
pub const CHANNEL_DEFAULT: u16 = 1;

/// Identifies a domain object consuming an input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

impl ConsumerId {
    /// A fresh, process-unique consumer id
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct InputState {
    channel: u16,
    address: u32,
    value: TriState,
    used_by: Vec<ConsumerId>,
    observers: Vec<Box<dyn Fn(TriState) + Send + Sync>>,
}

/// Shared handle to one sensor input
#[derive(Clone)]
pub struct Input {
    state: Arc<Mutex<InputState>>,
}

impl Input {
    fn new(channel: u16, address: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(InputState {
                channel,
                address,
                value: TriState::Undefined,
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

    pub fn value(&self) -> TriState {
        self.state.lock().value
    }

    /// Observe value changes; fired on the event loop thread
    pub fn on_change(&self, observer: impl Fn(TriState) + Send + Sync + 'static) {
        self.state.lock().observers.push(Box::new(observer));
    }

    fn update_value(&self, value: TriState) {
        let observers_snapshot = {
            let mut state = self.state.lock();
            if state.value == value {
                return;
            }
            state.value = value;
            // Run observers outside the lock.
            std::mem::take(&mut state.observers)
        };
        for observer in &observers_snapshot {
            observer(value);
        }
        self.state.lock().observers = observers_snapshot;
    }
}

/// Event delivered to an input monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMonitorEvent {
    UsedChanged { address: u32, used: bool },
    ValueChanged { address: u32, value: TriState },
}

/// Ephemeral view of one channel's address space
///
/// Held by at most one session at a time (the registry caches it weakly,
/// so it disappears when the last holder drops it).
pub struct InputMonitor {
    channel: u16,
    address_min: u32,
    address_max: u32,
    registry: Weak<RegistryInner>,
    observers: Mutex<Vec<Box<dyn Fn(InputMonitorEvent) + Send + Sync>>>,
}

impl InputMonitor {
    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn address_min(&self) -> u32 {
        self.address_min
    }

    pub fn address_max(&self) -> u32 {
        self.address_max
    }

    pub fn on_event(&self, observer: impl Fn(InputMonitorEvent) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    /// Current `(address, value)` of every materialized input on the
    /// channel, sorted by address
    pub fn snapshot(&self) -> Vec<(u32, TriState)> {
        let Some(registry) = self.registry.upgrade() else {
            return Vec::new();
        };
        let mut entries: Vec<(u32, TriState)> = registry
            .inputs
            .lock()
            .iter()
            .filter(|((channel, _), _)| *channel == self.channel)
            .map(|((_, address), input)| (*address, input.value()))
            .collect();
        entries.sort_unstable_by_key(|(address, _)| *address);
        entries
    }

    fn fire(&self, event: InputMonitorEvent) {
        for observer in self.observers.lock().iter() {
            observer(event);
        }
    }
}

struct RegistryInner {
    inputs: Mutex<HashMap<(u16, u32), Input>>,
    monitors: Mutex<HashMap<u16, Weak<InputMonitor>>>,
}

/// Per-controller input storage
///
/// Cloneable handle; monitors keep a weak reference to the same storage.
#[derive(Clone)]
pub struct InputRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for InputRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InputRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                inputs: Mutex::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.inputs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.inputs.lock().is_empty()
    }

    fn monitor(&self, channel: u16) -> Option<Arc<InputMonitor>> {
        self.inner.monitors.lock().get(&channel).and_then(Weak::upgrade)
    }
}

/// Controller side of the input subsystem
pub trait InputController: Send + Sync + 'static {
    /// Channels this hardware reports inputs on
    fn input_channels(&self) -> &'static [u16] {
        &[CHANNEL_DEFAULT]
    }

    /// Inclusive address range of a channel
    fn input_address_min_max(&self, channel: u16) -> (u32, u32);

    fn inputs(&self) -> &InputRegistry;

    /// Inject a sensor change while in simulation mode
    ///
    /// Forwarded to the kernel; outside simulation mode this is a no-op.
    fn simulate_input_change(&self, channel: u16, address: u32, action: SimulateInputAction);

    fn is_input_channel(&self, channel: u16) -> bool {
        self.input_channels().contains(&channel)
    }

    /// Materialize an input for a consumer
    ///
    /// The only way inputs come into existence. Returns `None` when the
    /// channel or address is invalid.
    fn get_input(&self, channel: u16, address: u32, consumer: ConsumerId) -> Option<Input> {
        EventLoop::assert_current();
        if !self.is_input_channel(channel) {
            return None;
        }
        let (min, max) = self.input_address_min_max(channel);
        if address < min || address > max {
            return None;
        }

        let registry = self.inputs();
        let (input, created) = {
            let mut inputs = registry.inner.inputs.lock();
            match inputs.get(&(channel, address)) {
                Some(input) => (input.clone(), false),
                None => {
                    let input = Input::new(channel, address);
                    inputs.insert((channel, address), input.clone());
                    (input, true)
                }
            }
        };
        {
            let mut state = input.state.lock();
            if !state.used_by.contains(&consumer) {
                state.used_by.push(consumer);
            }
        }
        if created {
            if let Some(monitor) = registry.monitor(channel) {
                monitor.fire(InputMonitorEvent::UsedChanged {
                    address,
                    used: true,
                });
            }
        }
        Some(input)
    }

    /// Release a consumer's hold; the input is destroyed when unused
    fn release_input(&self, input: &Input, consumer: ConsumerId) {
        EventLoop::assert_current();
        let (channel, address, now_unused) = {
            let mut state = input.state.lock();
            state.used_by.retain(|c| *c != consumer);
            (state.channel, state.address, state.used_by.is_empty())
        };
        if now_unused {
            let registry = self.inputs();
            registry.inner.inputs.lock().remove(&(channel, address));
            if let Some(monitor) = registry.monitor(channel) {
                monitor.fire(InputMonitorEvent::UsedChanged {
                    address,
                    used: false,
                });
            }
        }
    }

    /// Push a sensor reading into the domain
    ///
    /// Called by the kernel, already on the event loop thread.
    fn update_input_value(&self, channel: u16, address: u32, value: TriState) {
        EventLoop::assert_current();
        let registry = self.inputs();
        let input = registry.inner.inputs.lock().get(&(channel, address)).cloned();
        if let Some(input) = input {
            input.update_value(value);
        }
        if let Some(monitor) = registry.monitor(channel) {
            monitor.fire(InputMonitorEvent::ValueChanged { address, value });
        }
    }

    /// The channel's monitor, created on first request, cached weakly
    fn input_monitor(&self, channel: u16) -> Option<Arc<InputMonitor>> {
        if !self.is_input_channel(channel) {
            return None;
        }
        let registry = self.inputs();
        let mut monitors = registry.inner.monitors.lock();
        if let Some(monitor) = monitors.get(&channel).and_then(Weak::upgrade) {
            return Some(monitor);
        }
        let (address_min, address_max) = self.input_address_min_max(channel);
        let monitor = Arc::new(InputMonitor {
            channel,
            address_min,
            address_max,
            registry: Arc::downgrade(&registry.inner),
            observers: Mutex::new(Vec::new()),
        });
        monitors.insert(channel, Arc::downgrade(&monitor));
        Some(monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestController {
        registry: InputRegistry,
    }

    impl TestController {
        fn new() -> Self {
            EventLoop::mark_thread_as_event_loop();
            Self {
                registry: InputRegistry::new(),
            }
        }
    }

    impl InputController for TestController {
        fn input_address_min_max(&self, _channel: u16) -> (u32, u32) {
            (1, 2048)
        }

        fn inputs(&self) -> &InputRegistry {
            &self.registry
        }

        fn simulate_input_change(
            &self,
            _channel: u16,
            _address: u32,
            _action: SimulateInputAction,
        ) {
        }
    }

    #[test]
    fn test_get_input_validates_address_space() {
        let controller = TestController::new();
        let consumer = ConsumerId::next();
        assert!(controller.get_input(CHANNEL_DEFAULT, 0, consumer).is_none());
        assert!(controller.get_input(CHANNEL_DEFAULT, 1, consumer).is_some());
        assert!(controller.get_input(CHANNEL_DEFAULT, 2048, consumer).is_some());
        assert!(controller.get_input(CHANNEL_DEFAULT, 2049, consumer).is_none());
        assert!(controller.get_input(99, 1, consumer).is_none());
    }

    #[test]
    fn test_input_lifecycle() {
        let controller = TestController::new();
        let a = ConsumerId::next();
        let b = ConsumerId::next();

        let input = controller.get_input(CHANNEL_DEFAULT, 42, a).unwrap();
        let again = controller.get_input(CHANNEL_DEFAULT, 42, b).unwrap();
        assert!(Arc::ptr_eq(&input.state, &again.state));
        assert_eq!(controller.inputs().len(), 1);

        controller.release_input(&input, a);
        assert_eq!(controller.inputs().len(), 1);
        controller.release_input(&input, b);
        assert_eq!(controller.inputs().len(), 0);
    }

    #[test]
    fn test_update_input_value_notifies_once() {
        let controller = TestController::new();
        let consumer = ConsumerId::next();
        let input = controller.get_input(CHANNEL_DEFAULT, 7, consumer).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        input.on_change(move |value| seen_clone.lock().push(value));

        controller.update_input_value(CHANNEL_DEFAULT, 7, TriState::True);
        controller.update_input_value(CHANNEL_DEFAULT, 7, TriState::True);
        controller.update_input_value(CHANNEL_DEFAULT, 7, TriState::False);

        assert_eq!(*seen.lock(), vec![TriState::True, TriState::False]);
        assert_eq!(input.value(), TriState::False);
    }

    #[test]
    fn test_monitor_sees_usage_and_values() {
        let controller = TestController::new();
        let monitor = controller.input_monitor(CHANNEL_DEFAULT).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        monitor.on_event(move |event| events_clone.lock().push(event));

        let consumer = ConsumerId::next();
        let input = controller.get_input(CHANNEL_DEFAULT, 5, consumer).unwrap();
        controller.update_input_value(CHANNEL_DEFAULT, 5, TriState::True);
        controller.release_input(&input, consumer);

        assert_eq!(
            *events.lock(),
            vec![
                InputMonitorEvent::UsedChanged {
                    address: 5,
                    used: true
                },
                InputMonitorEvent::ValueChanged {
                    address: 5,
                    value: TriState::True
                },
                InputMonitorEvent::UsedChanged {
                    address: 5,
                    used: false
                },
            ]
        );
    }

    #[test]
    fn test_monitor_weak_cache() {
        let controller = TestController::new();
        let monitor = controller.input_monitor(CHANNEL_DEFAULT).unwrap();
        let again = controller.input_monitor(CHANNEL_DEFAULT).unwrap();
        assert!(Arc::ptr_eq(&monitor, &again));

        drop(monitor);
        drop(again);
        // cache entry is gone, a new monitor is created
        let fresh = controller.input_monitor(CHANNEL_DEFAULT).unwrap();
        assert_eq!(fresh.snapshot(), Vec::new());
    }

    #[test]
    fn test_monitor_snapshot() {
        let controller = TestController::new();
        let consumer = ConsumerId::next();
        controller.get_input(CHANNEL_DEFAULT, 9, consumer).unwrap();
        controller.get_input(CHANNEL_DEFAULT, 3, consumer).unwrap();
        controller.update_input_value(CHANNEL_DEFAULT, 3, TriState::True);

        let monitor = controller.input_monitor(CHANNEL_DEFAULT).unwrap();
        assert_eq!(
            monitor.snapshot(),
            vec![(3, TriState::True), (9, TriState::Undefined)]
        );
    }
}
