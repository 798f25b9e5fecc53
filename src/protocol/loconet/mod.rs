//! LocoNet (Digitrax)
//!
//! Bus protocol spoken over serial gateways (LocoBuffer, Intellibox) or
//! tunneled through a Z21. The command station owns a slot table;
//! driving a locomotive means acquiring a slot for its address first.
//! Every transmitted message is echoed back on the bus, so mirrors only
//! advance on the receive path.

pub mod kernel;
pub mod messages;
pub mod pcap;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread, LncvProgrammingController};
