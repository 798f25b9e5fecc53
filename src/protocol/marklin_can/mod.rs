//! Märklin CAN (CS2/CS3)
//!
//! 13-byte records on the CAN bus or tunneled over TCP: a 29-bit CAN id
//! packing priority, command, response bit and a sender hash, a DLC and
//! eight data bytes. Multi-byte fields inside the data are big endian.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};
