//! World state
//!
//! The intended system mode: edit, online, power, run, mute, no-smoke,
//! simulation. Interfaces subscribe to world events and forward the
//! actionable ones to their kernel (power on/off, emergency stop, resume).

use parking_lot::RwLock;
use std::sync::Arc;

/// Bitmask of active world states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldState(u16);

impl WorldState {
    pub const EDIT: WorldState = WorldState(1 << 0);
    pub const ONLINE: WorldState = WorldState(1 << 1);
    pub const POWER_ON: WorldState = WorldState(1 << 2);
    pub const RUN: WorldState = WorldState(1 << 3);
    pub const MUTE: WorldState = WorldState(1 << 4);
    pub const NO_SMOKE: WorldState = WorldState(1 << 5);
    pub const SIMULATION: WorldState = WorldState(1 << 6);

    pub fn contains(self, other: WorldState) -> bool {
        self.0 & other.0 == other.0
    }

    fn set(&mut self, other: WorldState, value: bool) {
        if value {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// State transition notifications delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldEvent {
    EditEnabled,
    EditDisabled,
    Offline,
    Online,
    PowerOff,
    PowerOn,
    Stop,
    Run,
    Mute,
    Unmute,
    NoSmoke,
    Smoke,
    SimulationEnabled,
    SimulationDisabled,
}

type Subscriber = Box<dyn Fn(WorldState, WorldEvent) + Send + Sync>;

/// Global world mode, shared by all interfaces
///
/// `run` implies `power_on`: starting the world powers it up first, and
/// powering off also stops it. Subscribers are notified in registration
/// order on the caller's thread; state transitions are made from the
/// event loop thread only.
pub struct World {
    state: RwLock<WorldState>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl World {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(WorldState::default()),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    pub fn state(&self) -> WorldState {
        *self.state.read()
    }

    /// Register a state-change subscriber (interfaces, decoders)
    pub fn subscribe(&self, subscriber: impl Fn(WorldState, WorldEvent) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(subscriber));
    }

    fn fire(&self, event: WorldEvent) {
        let state = self.state();
        for subscriber in self.subscribers.read().iter() {
            subscriber(state, event);
        }
    }

    fn transition(&self, flag: WorldState, value: bool, event: WorldEvent) -> bool {
        {
            let mut state = self.state.write();
            if state.contains(flag) == value {
                return false;
            }
            state.set(flag, value);
        }
        self.fire(event);
        true
    }

    pub fn set_edit(&self, value: bool) {
        let event = if value {
            WorldEvent::EditEnabled
        } else {
            WorldEvent::EditDisabled
        };
        self.transition(WorldState::EDIT, value, event);
    }

    pub fn set_online(&self, value: bool) {
        let event = if value {
            WorldEvent::Online
        } else {
            WorldEvent::Offline
        };
        self.transition(WorldState::ONLINE, value, event);
    }

    pub fn power_on(&self) {
        self.transition(WorldState::POWER_ON, true, WorldEvent::PowerOn);
    }

    pub fn power_off(&self) {
        // run requires power
        self.stop();
        self.transition(WorldState::POWER_ON, false, WorldEvent::PowerOff);
    }

    pub fn run(&self) {
        self.power_on();
        self.transition(WorldState::RUN, true, WorldEvent::Run);
    }

    pub fn stop(&self) {
        self.transition(WorldState::RUN, false, WorldEvent::Stop);
    }

    pub fn set_mute(&self, value: bool) {
        let event = if value {
            WorldEvent::Mute
        } else {
            WorldEvent::Unmute
        };
        self.transition(WorldState::MUTE, value, event);
    }

    pub fn set_no_smoke(&self, value: bool) {
        let event = if value {
            WorldEvent::NoSmoke
        } else {
            WorldEvent::Smoke
        };
        self.transition(WorldState::NO_SMOKE, value, event);
    }

    pub fn set_simulation(&self, value: bool) {
        let event = if value {
            WorldEvent::SimulationEnabled
        } else {
            WorldEvent::SimulationDisabled
        };
        self.transition(WorldState::SIMULATION, value, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_run_implies_power_on() {
        let world = World::new();
        world.run();
        assert!(world.state().contains(WorldState::POWER_ON));
        assert!(world.state().contains(WorldState::RUN));
    }

    #[test]
    fn test_power_off_stops_run() {
        let world = World::new();
        world.run();
        world.power_off();
        assert!(!world.state().contains(WorldState::POWER_ON));
        assert!(!world.state().contains(WorldState::RUN));
    }

    #[test]
    fn test_transition_fires_once() {
        let world = World::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        world.subscribe(move |_, event| events_clone.lock().push(event));

        world.power_on();
        world.power_on();
        assert_eq!(*events.lock(), vec![WorldEvent::PowerOn]);
    }

    #[test]
    fn test_run_event_order() {
        let world = World::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        world.subscribe(move |_, event| events_clone.lock().push(event));

        world.run();
        assert_eq!(*events.lock(), vec![WorldEvent::PowerOn, WorldEvent::Run]);
    }
}
