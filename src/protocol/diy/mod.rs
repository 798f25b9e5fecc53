//! Traintastic DIY
//!
//! Protocol for self-built hardware: length-prefixed binary frames with
//! an XOR check byte over TCP, plus a heartbeat that detects dead peers
//! in both directions.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};
