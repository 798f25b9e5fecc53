//! Decoder controller
//!
//! Mixin implemented by every interface that can drive locomotives. It
//! owns the list of attached decoders, validates protocol/address pairs
//! against the hardware's address space, and forwards change events to
//! the kernel.

use super::{Decoder, DecoderChangeFlags, DecoderProtocol};
use crate::core::EventLoop;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// List of decoders attached to one controller
#[derive(Default)]
pub struct DecoderRegistry {
    list: Mutex<Vec<Decoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Snapshot of the attached decoders
    pub fn all(&self) -> Vec<Decoder> {
        self.list.lock().clone()
    }

    fn contains(&self, decoder: &Decoder) -> bool {
        self.list.lock().iter().any(|d| d.ptr_eq(decoder))
    }

    fn find(&self, protocol: DecoderProtocol, address: u16) -> Option<Decoder> {
        if protocol == DecoderProtocol::Mfx {
            return None;
        }
        self.list
            .lock()
            .iter()
            .find(|d| d.protocol() == protocol && d.address() == address)
            .cloned()
    }

    fn find_mfx(&self, mfx_uid: u32) -> Option<Decoder> {
        if mfx_uid == 0 {
            return None;
        }
        self.list
            .lock()
            .iter()
            .find(|d| d.protocol() == DecoderProtocol::Mfx && d.mfx_uid() == mfx_uid)
            .cloned()
    }
}

/// Controller side of the decoder subsystem
///
/// The required methods describe the hardware's address space and route
/// a change to the kernel; the provided methods implement attachment and
/// lookup uniformly.
pub trait DecoderController: Send + Sync + 'static {
    /// Protocols the underlying hardware supports
    fn decoder_protocols(&self) -> &'static [DecoderProtocol];

    /// Inclusive valid address range, or `None` when the protocol has no
    /// address (MFX uses the UID instead)
    fn decoder_address_min_max(&self, protocol: DecoderProtocol) -> Option<(u16, u16)>;

    /// Speed step counts the hardware accepts for the protocol
    fn decoder_speed_steps(&self, protocol: DecoderProtocol) -> &'static [u8];

    fn decoders(&self) -> &DecoderRegistry;

    /// Forward a decoder change to the kernel
    fn decoder_changed(&self, decoder: &Decoder, changes: DecoderChangeFlags, function_number: u32);

    /// Detach a decoder; the change hook is removed atomically
    fn remove_decoder(&self, decoder: &Decoder) -> bool {
        EventLoop::assert_current();
        if !self.decoders().contains(decoder) {
            return false;
        }
        decoder.set_change_hook(None);
        self.decoders().list.lock().retain(|d| !d.ptr_eq(decoder));
        true
    }

    fn get_decoder(&self, protocol: DecoderProtocol, address: u16) -> Option<Decoder> {
        self.decoders().find(protocol, address)
    }

    fn get_decoder_mfx(&self, mfx_uid: u32) -> Option<Decoder> {
        self.decoders().find_mfx(mfx_uid)
    }

    /// Re-emit the throttle of every moving decoder
    ///
    /// Called when the world resumes from stop so the hardware catches
    /// up with the domain's desired speeds.
    fn restore_decoder_speed(&self) {
        for decoder in self.decoders().all() {
            if !decoder.emergency_stop() && decoder.throttle() > f32::EPSILON {
                self.decoder_changed(&decoder, DecoderChangeFlags::THROTTLE, 0);
            }
        }
    }
}

/// Attachment needs a weak back-reference to the controller, so it is
/// only available on shared controllers
pub trait DecoderControllerExt {
    /// Attach a decoder
    ///
    /// Refuses when the protocol is unsupported, the address is outside
    /// the range, the speed step count is not allowed, `(protocol,
    /// address)` (or the MFX UID) is already bound, or the decoder is
    /// attached elsewhere.
    fn add_decoder(&self, decoder: &Decoder) -> bool;
}

impl<C: DecoderController> DecoderControllerExt for Arc<C> {
    fn add_decoder(&self, decoder: &Decoder) -> bool {
        EventLoop::assert_current();
        let protocol = decoder.protocol();
        if !self.decoder_protocols().contains(&protocol) {
            return false;
        }
        match self.decoder_address_min_max(protocol) {
            Some((min, max)) => {
                let address = decoder.address();
                if address < min || address > max {
                    return false;
                }
                if self.decoders().find(protocol, address).is_some() {
                    return false;
                }
            }
            None => {
                if self.decoders().find_mfx(decoder.mfx_uid()).is_some() {
                    return false;
                }
            }
        }
        if !self.decoder_speed_steps(protocol).contains(&decoder.speed_steps()) {
            return false;
        }
        if decoder.has_change_hook() {
            // already attached to some controller
            return false;
        }

        self.decoders().list.lock().push(decoder.clone());

        let weak: Weak<C> = Arc::downgrade(self);
        decoder.set_change_hook(Some(Arc::new(move |d, changes, function_number| {
            if let Some(controller) = weak.upgrade() {
                controller.decoder_changed(d, changes, function_number);
            }
        })));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    struct TestController {
        registry: DecoderRegistry,
        changes: PlMutex<Vec<(u16, u32)>>,
    }

    impl TestController {
        fn new() -> Arc<Self> {
            EventLoop::mark_thread_as_event_loop();
            Arc::new(Self {
                registry: DecoderRegistry::new(),
                changes: PlMutex::new(Vec::new()),
            })
        }
    }

    impl DecoderController for TestController {
        fn decoder_protocols(&self) -> &'static [DecoderProtocol] {
            &[DecoderProtocol::DccShort, DecoderProtocol::Mfx]
        }

        fn decoder_address_min_max(&self, protocol: DecoderProtocol) -> Option<(u16, u16)> {
            match protocol {
                DecoderProtocol::DccShort => Some((1, 127)),
                _ => None,
            }
        }

        fn decoder_speed_steps(&self, _protocol: DecoderProtocol) -> &'static [u8] {
            &[14, 28, 126]
        }

        fn decoders(&self) -> &DecoderRegistry {
            &self.registry
        }

        fn decoder_changed(
            &self,
            decoder: &Decoder,
            _changes: DecoderChangeFlags,
            function_number: u32,
        ) {
            self.changes.lock().push((decoder.address(), function_number));
        }
    }

    #[test]
    fn test_add_decoder_validates_address_space() {
        let controller = TestController::new();
        assert!(!controller.add_decoder(&Decoder::new("a", DecoderProtocol::DccShort, 0, 28)));
        assert!(controller.add_decoder(&Decoder::new("b", DecoderProtocol::DccShort, 1, 28)));
        assert!(controller.add_decoder(&Decoder::new("c", DecoderProtocol::DccShort, 127, 28)));
        assert!(!controller.add_decoder(&Decoder::new("d", DecoderProtocol::DccShort, 128, 28)));
    }

    #[test]
    fn test_add_decoder_refuses_duplicate_address() {
        let controller = TestController::new();
        assert!(controller.add_decoder(&Decoder::new("a", DecoderProtocol::DccShort, 3, 28)));
        assert!(!controller.add_decoder(&Decoder::new("b", DecoderProtocol::DccShort, 3, 28)));
    }

    #[test]
    fn test_add_decoder_refuses_unknown_protocol() {
        let controller = TestController::new();
        assert!(!controller.add_decoder(&Decoder::new("a", DecoderProtocol::Motorola, 3, 14)));
    }

    #[test]
    fn test_add_decoder_refuses_bad_speed_steps() {
        let controller = TestController::new();
        assert!(!controller.add_decoder(&Decoder::new("a", DecoderProtocol::DccShort, 3, 99)));
    }

    #[test]
    fn test_mfx_uses_uid_uniqueness() {
        let controller = TestController::new();
        let a = Decoder::new("a", DecoderProtocol::Mfx, 0, 126);
        a.set_mfx_uid(0xCAFE);
        let b = Decoder::new("b", DecoderProtocol::Mfx, 0, 126);
        b.set_mfx_uid(0xCAFE);
        assert!(controller.add_decoder(&a));
        assert!(!controller.add_decoder(&b));
        assert!(controller.get_decoder_mfx(0xCAFE).unwrap().ptr_eq(&a));
    }

    #[test]
    fn test_change_hook_reaches_controller() {
        let controller = TestController::new();
        let decoder = Decoder::new("a", DecoderProtocol::DccShort, 3, 28);
        controller.add_decoder(&decoder);
        decoder.add_function(crate::decoder::DecoderFunction::new(0, "light"));

        decoder.set_function_value(0, true);
        assert_eq!(controller.changes.lock().as_slice(), &[(3, 0)]);
    }

    #[test]
    fn test_remove_decoder_detaches_hook() {
        let controller = TestController::new();
        let decoder = Decoder::new("a", DecoderProtocol::DccShort, 3, 28);
        controller.add_decoder(&decoder);
        assert!(controller.remove_decoder(&decoder));
        assert!(!decoder.has_change_hook());
        // can be attached again
        assert!(controller.add_decoder(&decoder));
    }

    #[test]
    fn test_restore_decoder_speed_skips_stopped() {
        let controller = TestController::new();
        let moving = Decoder::new("m", DecoderProtocol::DccShort, 3, 28);
        let stopped = Decoder::new("s", DecoderProtocol::DccShort, 4, 28);
        controller.add_decoder(&moving);
        controller.add_decoder(&stopped);
        moving.set_throttle(0.5);
        controller.changes.lock().clear();

        controller.restore_decoder_speed();
        assert_eq!(controller.changes.lock().as_slice(), &[(3, 0)]);
    }
}
