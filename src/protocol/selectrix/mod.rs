//! Selectrix (Trix)
//!
//! The bus is an image of 112 byte-wide addresses; locomotives,
//! accessories and feedback modules all live in it. A locomotive byte
//! packs 31 speed steps, the direction, the horn and the light; writing
//! a byte drives it, monitoring the bus yields feedback. Gateways speak
//! either the bare two-byte native framing or the Rautenhaus variant
//! with a leading marker byte.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};
