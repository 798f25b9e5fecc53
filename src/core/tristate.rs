//! Three-valued state for device mirrors
//!
//! Kernels seed their mirrors with `Undefined` so the first report from
//! the device (or the first command) always counts as a change.

use serde::{Deserialize, Serialize};

/// A boolean that can also be unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriState {
    #[default]
    Undefined,
    False,
    True,
}

impl TriState {
    /// True if the value is known (not `Undefined`)
    pub fn is_defined(self) -> bool {
        self != Self::Undefined
    }

    /// Known-true check; `Undefined` is not true
    pub fn is_true(self) -> bool {
        self == Self::True
    }

    /// Known-false check; `Undefined` is not false
    pub fn is_false(self) -> bool {
        self == Self::False
    }

    /// Logical negation; `Undefined` stays `Undefined`
    pub fn invert(self) -> Self {
        match self {
            Self::Undefined => Self::Undefined,
            Self::False => Self::True,
            Self::True => Self::False,
        }
    }

    /// Convert to `Option<bool>`, mapping `Undefined` to `None`
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Undefined => None,
            Self::False => Some(false),
            Self::True => Some(true),
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bool() {
        assert_eq!(TriState::from(true), TriState::True);
        assert_eq!(TriState::from(false), TriState::False);
    }

    #[test]
    fn test_invert() {
        assert_eq!(TriState::True.invert(), TriState::False);
        assert_eq!(TriState::False.invert(), TriState::True);
        assert_eq!(TriState::Undefined.invert(), TriState::Undefined);
    }

    #[test]
    fn test_default_is_undefined() {
        assert_eq!(TriState::default(), TriState::Undefined);
        assert!(!TriState::default().is_defined());
    }
}
