//! ESU ECoS / Märklin Central Station 1 ("m6")
//!
//! ASCII request/reply/event protocol over TCP. Requests are
//! `command(objectId, option[value], ...)`; the station answers with
//! `<REPLY ...> ... <END status (text)>` blocks and pushes spontaneous
//! `<EVENT objectId> ... <END ...>` blocks for objects a view was
//! requested on. The kernel mirrors the station's object world:
//! managers, locomotives, switches and feedback modules.

pub mod kernel;
pub mod messages;
pub mod object;
pub mod simulation;
mod simulation_station;

pub use kernel::{Kernel, KernelConfig, KernelThread};
