//! Roco/Fleischmann Z21
//!
//! UDP protocol, one datagram per frame. Every frame starts with a
//! little-endian `dataLen` covering the whole frame and a little-endian
//! `header`; the `LAN_X` family nests an X-BUS frame with its own XOR
//! checksum. R-BUS feedback modules deliver the inputs.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};
