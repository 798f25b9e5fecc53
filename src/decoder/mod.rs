//! Locomotive decoders
//!
//! A decoder is the on-board electronics obeying a protocol address. The
//! domain owns the desired state (throttle, direction, functions); the
//! owning interface's kernel translates changes into wire commands via
//! the change hook installed on attach.

pub mod controller;

pub use controller::{DecoderController, DecoderControllerExt, DecoderRegistry};

use crate::core::{Direction, EventLoop, WorldEvent, WorldState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Addressing protocol of a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecoderProtocol {
    /// DCC with a 7 bit address
    DccShort,
    /// DCC with a 14 bit address
    DccLong,
    Motorola,
    Selectrix,
    /// Addressless, identified by UID
    Mfx,
    /// Command station decides (Z21 loco mode)
    Auto,
}

/// Which decoder attributes changed, as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderChangeFlags(u8);

impl DecoderChangeFlags {
    pub const EMERGENCY_STOP: Self = Self(1 << 0);
    pub const DIRECTION: Self = Self(1 << 1);
    pub const THROTTLE: Self = Self(1 << 2);
    pub const SPEED_STEPS: Self = Self(1 << 3);
    pub const FUNCTION_VALUE: Self = Self(1 << 4);

    /// Union of the speed-related flags
    pub const SPEED: Self =
        Self(Self::EMERGENCY_STOP.0 | Self::DIRECTION.0 | Self::THROTTLE.0 | Self::SPEED_STEPS.0);

    /// True when any flag in `mask` is set
    pub fn has(self, mask: Self) -> bool {
        self.0 & mask.0 != 0
    }

    /// True when exactly the flags in `mask` are set
    pub fn is(self, mask: Self) -> bool {
        self.0 == mask.0
    }
}

impl std::ops::BitOr for DecoderChangeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Behaviour of a decoder function output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    Hold,
    Momentary,
    OnOff,
    AlwaysOn,
    AlwaysOff,
}

/// What a function drives, used for world-wide mute / no-smoke masking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionRole {
    Generic,
    Light,
    Mute,
    Sound,
    Smoke,
}

/// One decoder function output (light, sound, smoke, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderFunction {
    pub number: u32,
    pub name: String,
    pub kind: FunctionKind,
    pub role: FunctionRole,
    pub value: bool,
}

impl DecoderFunction {
    pub fn new(number: u32, name: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            kind: FunctionKind::OnOff,
            role: FunctionRole::Generic,
            value: false,
        }
    }

    pub fn with_kind(mut self, kind: FunctionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_role(mut self, role: FunctionRole) -> Self {
        self.role = role;
        self
    }
}

struct DecoderState {
    name: String,
    protocol: DecoderProtocol,
    address: u16,
    mfx_uid: u32,
    emergency_stop: bool,
    direction: Direction,
    speed_steps: u8,
    throttle: f32,
    functions: Vec<DecoderFunction>,
    world_mute: bool,
    world_no_smoke: bool,
}

type ChangeHook = Arc<dyn Fn(&Decoder, DecoderChangeFlags, u32) + Send + Sync>;

/// Shared handle to one decoder
///
/// Attached to at most one controller at a time; the controller installs
/// a change hook so every domain-side mutation reaches its kernel.
#[derive(Clone)]
pub struct Decoder {
    state: Arc<Mutex<DecoderState>>,
    hook: Arc<Mutex<Option<ChangeHook>>>,
}

impl Decoder {
    pub fn new(
        name: impl Into<String>,
        protocol: DecoderProtocol,
        address: u16,
        speed_steps: u8,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(DecoderState {
                name: name.into(),
                protocol,
                address,
                mfx_uid: 0,
                emergency_stop: false,
                direction: Direction::Forward,
                speed_steps,
                throttle: 0.0,
                functions: Vec::new(),
                world_mute: false,
                world_no_smoke: false,
            })),
            hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Same underlying decoder
    pub fn ptr_eq(&self, other: &Decoder) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn protocol(&self) -> DecoderProtocol {
        self.state.lock().protocol
    }

    pub fn address(&self) -> u16 {
        self.state.lock().address
    }

    pub fn mfx_uid(&self) -> u32 {
        self.state.lock().mfx_uid
    }

    pub fn set_mfx_uid(&self, uid: u32) {
        self.state.lock().mfx_uid = uid;
    }

    pub fn emergency_stop(&self) -> bool {
        self.state.lock().emergency_stop
    }

    pub fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    pub fn speed_steps(&self) -> u8 {
        self.state.lock().speed_steps
    }

    pub fn throttle(&self) -> f32 {
        self.state.lock().throttle
    }

    /// Add a function; numbers are unique per decoder
    pub fn add_function(&self, function: DecoderFunction) -> bool {
        let mut state = self.state.lock();
        if state.functions.iter().any(|f| f.number == function.number) {
            return false;
        }
        state.functions.push(function);
        true
    }

    pub fn has_function(&self, number: u32) -> bool {
        self.state.lock().functions.iter().any(|f| f.number == number)
    }

    /// Effective function value as sent to the wire
    ///
    /// Applies the world mute / no-smoke masks and the always-on/off
    /// function kinds. Missing functions read as off.
    pub fn function_value(&self, number: u32) -> bool {
        let state = self.state.lock();
        let Some(function) = state.functions.iter().find(|f| f.number == number) else {
            return false;
        };
        match function.kind {
            FunctionKind::AlwaysOn => return true,
            FunctionKind::AlwaysOff => return false,
            _ => {}
        }
        if state.world_mute {
            if function.role == FunctionRole::Mute {
                return true;
            }
            if function.role == FunctionRole::Sound
                && !state.functions.iter().any(|f| f.role == FunctionRole::Mute)
            {
                return false;
            }
        }
        if state.world_no_smoke && function.role == FunctionRole::Smoke {
            return false;
        }
        function.value
    }

    /// Function numbers with a given role
    fn functions_with_role(&self, role: FunctionRole) -> Vec<(u32, bool)> {
        self.state
            .lock()
            .functions
            .iter()
            .filter(|f| f.role == role)
            .map(|f| (f.number, f.value))
            .collect()
    }

    // === mutations (event loop thread) ===

    pub fn set_emergency_stop(&self, value: bool) {
        EventLoop::assert_current();
        {
            let mut state = self.state.lock();
            if state.emergency_stop == value {
                return;
            }
            state.emergency_stop = value;
        }
        self.changed(DecoderChangeFlags::EMERGENCY_STOP, 0);
    }

    pub fn set_direction(&self, value: Direction) {
        EventLoop::assert_current();
        {
            let mut state = self.state.lock();
            if state.direction == value {
                return;
            }
            state.direction = value;
        }
        self.changed(DecoderChangeFlags::DIRECTION, 0);
    }

    /// Set the throttle, clamped to `[0, 1]`
    pub fn set_throttle(&self, value: f32) {
        EventLoop::assert_current();
        let value = value.clamp(0.0, 1.0);
        {
            let mut state = self.state.lock();
            if state.throttle == value {
                return;
            }
            state.throttle = value;
        }
        self.changed(DecoderChangeFlags::THROTTLE, 0);
    }

    pub fn set_speed_steps(&self, value: u8) {
        EventLoop::assert_current();
        {
            let mut state = self.state.lock();
            if state.speed_steps == value {
                return;
            }
            state.speed_steps = value;
        }
        self.changed(DecoderChangeFlags::SPEED_STEPS, 0);
    }

    pub fn set_function_value(&self, number: u32, value: bool) {
        EventLoop::assert_current();
        {
            let mut state = self.state.lock();
            let Some(function) = state.functions.iter_mut().find(|f| f.number == number) else {
                return;
            };
            if function.value == value {
                return;
            }
            function.value = value;
        }
        self.changed(DecoderChangeFlags::FUNCTION_VALUE, number);
    }

    /// Mirror a device-initiated change without re-emitting a command
    ///
    /// Used when a kernel reports state the device changed itself (other
    /// throttle, loopback echo).
    pub fn mirror_speed(&self, throttle: f32, direction: Direction, emergency_stop: bool) {
        EventLoop::assert_current();
        let mut state = self.state.lock();
        state.throttle = throttle.clamp(0.0, 1.0);
        state.direction = direction;
        state.emergency_stop = emergency_stop;
    }

    /// Mirror a device-initiated function change
    pub fn mirror_function(&self, number: u32, value: bool) {
        EventLoop::assert_current();
        let mut state = self.state.lock();
        if let Some(function) = state.functions.iter_mut().find(|f| f.number == number) {
            function.value = value;
        }
    }

    /// World state transitions that affect function masking
    ///
    /// Mute affects SOUND functions unless a MUTE function exists; smoke
    /// transitions affect SMOKE functions. Affected function groups are
    /// re-emitted so the wire state follows the mask.
    pub fn world_event(&self, state: WorldState, event: WorldEvent) {
        EventLoop::assert_current();
        {
            let mut inner = self.state.lock();
            inner.world_mute = state.contains(WorldState::MUTE);
            inner.world_no_smoke = state.contains(WorldState::NO_SMOKE);
        }
        match event {
            WorldEvent::Mute | WorldEvent::Unmute => {
                let mutes = self.functions_with_role(FunctionRole::Mute);
                if mutes.is_empty() {
                    for (number, value) in self.functions_with_role(FunctionRole::Sound) {
                        if value {
                            self.changed(DecoderChangeFlags::FUNCTION_VALUE, number);
                        }
                    }
                } else {
                    for (number, value) in mutes {
                        if !value {
                            self.changed(DecoderChangeFlags::FUNCTION_VALUE, number);
                        }
                    }
                }
            }
            WorldEvent::NoSmoke | WorldEvent::Smoke => {
                for (number, value) in self.functions_with_role(FunctionRole::Smoke) {
                    if value {
                        self.changed(DecoderChangeFlags::FUNCTION_VALUE, number);
                    }
                }
            }
            _ => {}
        }
    }

    fn changed(&self, changes: DecoderChangeFlags, function_number: u32) {
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(self, changes, function_number);
        }
    }

    pub(crate) fn set_change_hook(&self, hook: Option<ChangeHook>) {
        *self.hook.lock() = hook;
    }

    pub(crate) fn has_change_hook(&self) -> bool {
        self.hook.lock().is_some()
    }
}

/// Plain-value copy of a decoder's state for the kernel threads
///
/// Controllers snapshot the decoder on the event loop thread and post the
/// snapshot to the kernel, so kernels never lock domain objects. Function
/// values carry the world mute / no-smoke masking already applied.
#[derive(Debug, Clone, Copy)]
pub struct DecoderSnapshot {
    pub protocol: DecoderProtocol,
    pub address: u16,
    pub mfx_uid: u32,
    pub emergency_stop: bool,
    pub direction: Direction,
    pub speed_steps: u8,
    pub throttle: f32,
    functions: [bool; Self::FUNCTION_COUNT],
}

impl DecoderSnapshot {
    pub const FUNCTION_COUNT: usize = 29; // F0..=F28

    /// Effective (masked) function value; out-of-range numbers read off
    pub fn function(&self, number: u32) -> bool {
        self.functions
            .get(number as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Wire speed step for the snapshot's throttle at `steps`
    pub fn speed_step(&self, steps: u8) -> u8 {
        throttle_to_speed_step(self.throttle, steps)
    }
}

impl Decoder {
    /// Snapshot for posting to a kernel thread
    pub fn snapshot(&self) -> DecoderSnapshot {
        let mut functions = [false; DecoderSnapshot::FUNCTION_COUNT];
        for (number, slot) in functions.iter_mut().enumerate() {
            *slot = self.function_value(number as u32);
        }
        let state = self.state.lock();
        DecoderSnapshot {
            protocol: state.protocol,
            address: state.address,
            mfx_uid: state.mfx_uid,
            emergency_stop: state.emergency_stop,
            direction: state.direction,
            speed_steps: state.speed_steps,
            throttle: state.throttle,
            functions,
        }
    }
}

/// Map a throttle in `[0, 1]` to a speed step in `0..=steps`
///
/// Step 0 is stop; the emergency stop step of each protocol encoding is
/// inserted by the codec, not here.
pub fn throttle_to_speed_step(throttle: f32, steps: u8) -> u8 {
    (throttle.clamp(0.0, 1.0) * f32::from(steps)).round() as u8
}

/// Map a speed step back to a throttle value
pub fn speed_step_to_throttle(step: u8, steps: u8) -> f32 {
    if steps == 0 {
        0.0
    } else {
        f32::from(step.min(steps)) / f32::from(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_to_speed_step() {
        assert_eq!(throttle_to_speed_step(0.0, 126), 0);
        assert_eq!(throttle_to_speed_step(1.0, 126), 126);
        assert_eq!(throttle_to_speed_step(0.5, 126), 63);
        assert_eq!(throttle_to_speed_step(0.5, 28), 14);
        assert_eq!(throttle_to_speed_step(2.0, 14), 14);
    }

    #[test]
    fn test_speed_step_to_throttle() {
        assert_eq!(speed_step_to_throttle(0, 126), 0.0);
        assert_eq!(speed_step_to_throttle(126, 126), 1.0);
        assert_eq!(speed_step_to_throttle(200, 126), 1.0);
        assert_eq!(speed_step_to_throttle(5, 0), 0.0);
    }

    #[test]
    fn test_change_flags() {
        let changes = DecoderChangeFlags::THROTTLE | DecoderChangeFlags::DIRECTION;
        assert!(changes.has(DecoderChangeFlags::SPEED));
        assert!(changes.has(DecoderChangeFlags::THROTTLE));
        assert!(!changes.has(DecoderChangeFlags::FUNCTION_VALUE));
        assert!(!changes.is(DecoderChangeFlags::THROTTLE));
    }

    #[test]
    fn test_function_uniqueness() {
        let decoder = Decoder::new("loco", DecoderProtocol::DccShort, 3, 28);
        assert!(decoder.add_function(DecoderFunction::new(0, "light")));
        assert!(!decoder.add_function(DecoderFunction::new(0, "dup")));
    }

    #[test]
    fn test_function_value_masking() {
        let decoder = Decoder::new("loco", DecoderProtocol::DccShort, 3, 28);
        decoder.add_function(DecoderFunction::new(2, "horn").with_role(FunctionRole::Sound));
        decoder.add_function(DecoderFunction::new(3, "smoke").with_role(FunctionRole::Smoke));
        {
            let mut state = decoder.state.lock();
            state.functions[0].value = true;
            state.functions[1].value = true;
        }
        assert!(decoder.function_value(2));
        assert!(decoder.function_value(3));

        decoder.state.lock().world_mute = true;
        assert!(!decoder.function_value(2));

        decoder.state.lock().world_no_smoke = true;
        assert!(!decoder.function_value(3));
    }

    #[test]
    fn test_mute_function_reads_on_while_muted() {
        let decoder = Decoder::new("loco", DecoderProtocol::DccShort, 3, 28);
        decoder.add_function(DecoderFunction::new(8, "mute").with_role(FunctionRole::Mute));
        decoder.add_function(DecoderFunction::new(2, "horn").with_role(FunctionRole::Sound));
        decoder.state.lock().functions[1].value = true;

        decoder.state.lock().world_mute = true;
        assert!(decoder.function_value(8));
        // sound stays untouched when a mute function exists
        assert!(decoder.function_value(2));
    }

    #[test]
    fn test_always_on_off_kinds() {
        let decoder = Decoder::new("loco", DecoderProtocol::DccShort, 3, 28);
        decoder.add_function(DecoderFunction::new(1, "a").with_kind(FunctionKind::AlwaysOn));
        decoder.add_function(DecoderFunction::new(2, "b").with_kind(FunctionKind::AlwaysOff));
        assert!(decoder.function_value(1));
        assert!(!decoder.function_value(2));
    }
}
