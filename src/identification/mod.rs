//! Identification event sources
//!
//! RFID readers and RailCom detectors report which vehicle passed a spot
//! rather than a plain occupancy bit. The registry follows the input
//! rules: `(channel, address)` unique per controller, created on first
//! consumer, destroyed when the last consumer releases.

use crate::core::{Direction, EventLoop};
use crate::input::ConsumerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Channel used by controllers with a single reader bus
pub const CHANNEL_DEFAULT: u16 = 1;

/// What the reader saw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentificationEventType {
    /// Vehicle entered the detection spot
    Present,
    /// Vehicle left the detection spot
    Absent,
    /// Momentary sighting without presence tracking
    Seen,
}

/// One reader event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentificationEvent {
    pub event_type: IdentificationEventType,
    /// Vehicle identifier as reported (tag id, decoder address)
    pub identifier: u32,
    /// Travel direction over the reader, when the hardware knows it
    pub direction: Option<Direction>,
}

struct IdentificationState {
    channel: u16,
    address: u32,
    used_by: Vec<ConsumerId>,
    observers: Vec<Box<dyn Fn(IdentificationEvent) + Send + Sync>>,
}

/// Shared handle to one identification source
#[derive(Clone)]
pub struct Identification {
    state: Arc<Mutex<IdentificationState>>,
}

impl Identification {
    fn new(channel: u16, address: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(IdentificationState {
                channel,
                address,
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

    /// Observe reader events; fired on the event loop thread
    pub fn on_event(&self, observer: impl Fn(IdentificationEvent) + Send + Sync + 'static) {
        self.state.lock().observers.push(Box::new(observer));
    }

    fn fire(&self, event: IdentificationEvent) {
        let observers_snapshot = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.observers)
        };
        for observer in &observers_snapshot {
            observer(event);
        }
        self.state.lock().observers = observers_snapshot;
    }
}

/// Per-controller identification storage
#[derive(Clone, Default)]
pub struct IdentificationRegistry {
    sources: Arc<Mutex<HashMap<(u16, u32), Identification>>>,
}

impl IdentificationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().is_empty()
    }
}

/// Controller side of the identification subsystem
pub trait IdentificationController: Send + Sync + 'static {
    fn identification_channels(&self) -> &'static [u16] {
        &[CHANNEL_DEFAULT]
    }

    fn identification_address_min_max(&self, channel: u16) -> (u32, u32);

    fn identifications(&self) -> &IdentificationRegistry;

    fn is_identification_channel(&self, channel: u16) -> bool {
        self.identification_channels().contains(&channel)
    }

    /// Materialize an identification source for a consumer
    fn get_identification(
        &self,
        channel: u16,
        address: u32,
        consumer: ConsumerId,
    ) -> Option<Identification> {
        EventLoop::assert_current();
        if !self.is_identification_channel(channel) {
            return None;
        }
        let (min, max) = self.identification_address_min_max(channel);
        if address < min || address > max {
            return None;
        }

        let mut sources = self.identifications().sources.lock();
        let source = sources
            .entry((channel, address))
            .or_insert_with(|| Identification::new(channel, address));
        {
            let mut state = source.state.lock();
            if !state.used_by.contains(&consumer) {
                state.used_by.push(consumer);
            }
        }
        Some(source.clone())
    }

    /// Release a consumer's hold; the source is destroyed when unused
    fn release_identification(&self, identification: &Identification, consumer: ConsumerId) {
        EventLoop::assert_current();
        let (channel, address, now_unused) = {
            let mut state = identification.state.lock();
            state.used_by.retain(|c| *c != consumer);
            (state.channel, state.address, state.used_by.is_empty())
        };
        if now_unused {
            self.identifications().sources.lock().remove(&(channel, address));
        }
    }

    /// Deliver a reader event; called by the kernel on the event loop
    fn identification_event(&self, channel: u16, address: u32, event: IdentificationEvent) {
        EventLoop::assert_current();
        let source = self
            .identifications()
            .sources
            .lock()
            .get(&(channel, address))
            .cloned();
        if let Some(source) = source {
            source.fire(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestController {
        registry: IdentificationRegistry,
    }

    impl TestController {
        fn new() -> Self {
            EventLoop::mark_thread_as_event_loop();
            Self {
                registry: IdentificationRegistry::new(),
            }
        }
    }

    impl IdentificationController for TestController {
        fn identification_address_min_max(&self, _channel: u16) -> (u32, u32) {
            (1, 256)
        }

        fn identifications(&self) -> &IdentificationRegistry {
            &self.registry
        }
    }

    #[test]
    fn test_lifecycle_mirrors_inputs() {
        let controller = TestController::new();
        let consumer = ConsumerId::next();
        assert!(controller.get_identification(CHANNEL_DEFAULT, 0, consumer).is_none());
        let source = controller
            .get_identification(CHANNEL_DEFAULT, 12, consumer)
            .unwrap();
        assert_eq!(controller.identifications().len(), 1);
        controller.release_identification(&source, consumer);
        assert!(controller.identifications().is_empty());
    }

    #[test]
    fn test_event_delivery() {
        let controller = TestController::new();
        let consumer = ConsumerId::next();
        let source = controller
            .get_identification(CHANNEL_DEFAULT, 12, consumer)
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        source.on_event(move |event| seen_clone.lock().push(event));

        let event = IdentificationEvent {
            event_type: IdentificationEventType::Present,
            identifier: 4711,
            direction: Some(Direction::Forward),
        };
        controller.identification_event(CHANNEL_DEFAULT, 12, event);
        controller.identification_event(CHANNEL_DEFAULT, 99, event); // not materialized

        assert_eq!(*seen.lock(), vec![event]);
    }
}
