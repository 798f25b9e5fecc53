//! Vendor protocol bindings
//!
//! One module per protocol family. Each contains:
//! - `messages`: the wire codec, pure functions over byte buffers
//! - `kernel`: the protocol engine running on its own I/O thread
//! - `simulation`: an IO handler answering the real wire protocol with
//!   canned, protocol-legal replies
//!
//! Numeric layout follows the vendor document of each protocol: little
//! endian for Z21, big endian for Märklin CAN UIDs, ASCII decimal for
//! ECoS and DCC-EX.

pub mod dccex;
pub mod diy;
pub mod ecos;
pub mod loconet;
pub mod marklin_can;
pub mod selectrix;
pub mod withrottle;
pub mod xpressnet;
pub mod z21;

use std::fmt::Write;

/// Hex dump for debug logs: `"01 23 AB"`
///
/// The message `toString` implementations are the only users; hex
/// formatting lives here and nowhere else.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0x23, 0xAB]), "01 23 AB");
        assert_eq!(hex_dump(&[]), "");
    }
}
