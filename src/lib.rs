//! railhub - model railroad command station hub
//!
//! Drives command station hardware over vendor protocols (XpressNet, Z21,
//! DCC-EX, LocoNet, ECoS, Märklin CAN, Selectrix, Traintastic DIY,
//! WiThrottle) and exposes a uniform object model of decoders, inputs
//! and outputs.
//!
//! Layering, bottom to top:
//! - **transport**: byte links (serial, TCP, UDP) exposed as channels
//! - **protocol**: per-protocol message codecs and kernels; a kernel owns
//!   one I/O thread and mirrors the device state
//! - **interface**: domain objects owning a kernel plus the decoder /
//!   input / output controllers
//! - **core**: the event loop thread that owns all domain mutations
//!
//! Every kernel also has a simulation IO handler that answers the real
//! wire protocol, so the full receive path can be exercised offline.

pub mod config;
pub mod constants;
pub mod core;
pub mod decoder;
pub mod error;
pub mod identification;
pub mod input;
pub mod interface;
pub mod kernel;
pub mod logging;
pub mod output;
pub mod protocol;
pub mod simulator;
pub mod transport;

pub use error::{HubError, Result};
