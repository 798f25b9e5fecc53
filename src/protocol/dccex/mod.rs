//! DCC-EX
//!
//! Newline-delimited ASCII protocol of the DCC-EX command station
//! (`<command args>` requests, `<reply>` responses), spoken over serial
//! or TCP. See <https://dcc-ex.com/reference/software/command-reference.html>.

pub mod kernel;
pub mod messages;
pub mod simulation;

pub use kernel::{Kernel, KernelConfig, KernelThread};
