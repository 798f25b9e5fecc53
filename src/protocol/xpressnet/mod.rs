//! XpressNet (Lenz)
//!
//! Serial protocol used by Lenz LI100/LI101F/LI-USB gateways, the
//! Digikeijs DR5000 and the RoSoft S88 gateway; also spoken over TCP by
//! some gateways. Frames are length-coded in the low nibble of the
//! header byte and carry a trailing XOR checksum.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};

use serde::{Deserialize, Serialize};

/// Which gateway flavour is on the wire
///
/// LI-USB style gateways wrap every frame in an `FF FE` lead-in (and
/// `FF FD` for errors); the framer strips it on read, the kernel
/// prepends it on write. The RoSoft S88 gateway needs its S88 bus
/// configured right after start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayVariant {
    #[default]
    Generic,
    LenzLiUsb,
    RoSoftS88,
}
