//! WiThrottle
//!
//! ASCII line protocol of JMRI and compatible servers. This kernel is a
//! throttle client: it registers itself, acquires one multi-throttle
//! entry per decoder and drives velocity, direction and functions over
//! it. Track power and turnouts go through the `PPA`/`PTA` panel
//! commands.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};
