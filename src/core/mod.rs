//! Core domain primitives
//!
//! The event loop thread, the world state, and the small value types
//! (tri-state, direction) shared by every protocol kernel.

pub mod event_loop;
pub mod tristate;
pub mod world;

pub use event_loop::EventLoop;
pub use tristate::TriState;
pub use world::{World, WorldEvent, WorldState};

use serde::{Deserialize, Serialize};

/// Travel direction of a locomotive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    /// The opposite direction
    pub fn reverse(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }
}

/// Requested change for a simulated input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulateInputAction {
    SetFalse,
    SetTrue,
    Toggle,
}
