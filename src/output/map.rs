//! Output maps
//!
//! Translate a logical device state (turnout position, decoupler state)
//! into an ordered list of output actions, and classify how well the
//! currently observed output values match a state.

use super::{OutputRegistry, OutputValue};

/// One output action of a map item
///
/// `value: None` is a wildcard: the action does not drive the output and
/// matches any observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputAction {
    pub channel: u16,
    pub address: u32,
    pub value: Option<OutputValue>,
}

impl OutputAction {
    pub fn set(channel: u16, address: u32, value: OutputValue) -> Self {
        Self {
            channel,
            address,
            value: Some(value),
        }
    }

    pub fn wildcard(channel: u16, address: u32) -> Self {
        Self {
            channel,
            address,
            value: None,
        }
    }
}

/// How observed output values relate to a map item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Every concrete action matches
    Full,
    /// Some but not all concrete actions match
    Partial,
    /// The item only has wildcard actions
    Wildcard,
    NoMatch,
}

/// One key's actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMapItem<K> {
    pub key: K,
    pub actions: Vec<OutputAction>,
}

impl<K> OutputMapItem<K> {
    pub fn new(key: K, actions: Vec<OutputAction>) -> Self {
        Self { key, actions }
    }

    /// Classify the item against observed values
    pub fn matches(&self, observed: impl Fn(u16, u32) -> OutputValue) -> MatchResult {
        let mut concrete = 0usize;
        let mut matched = 0usize;
        for action in &self.actions {
            if let Some(value) = action.value {
                concrete += 1;
                if observed(action.channel, action.address) == value {
                    matched += 1;
                }
            }
        }
        if concrete == 0 {
            MatchResult::Wildcard
        } else if matched == concrete {
            MatchResult::Full
        } else if matched > 0 {
            MatchResult::Partial
        } else {
            MatchResult::NoMatch
        }
    }
}

/// Deterministic state-to-actions translation table
#[derive(Debug, Clone, Default)]
pub struct OutputMap<K> {
    items: Vec<OutputMapItem<K>>,
}

impl<K: PartialEq + Copy> OutputMap<K> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Add or replace the actions for a key
    pub fn insert(&mut self, key: K, actions: Vec<OutputAction>) {
        if let Some(item) = self.items.iter_mut().find(|item| item.key == key) {
            item.actions = actions;
        } else {
            self.items.push(OutputMapItem::new(key, actions));
        }
    }

    pub fn item(&self, key: K) -> Option<&OutputMapItem<K>> {
        self.items.iter().find(|item| item.key == key)
    }

    /// The actions to emit for a key, in order
    pub fn actions(&self, key: K) -> Option<&[OutputAction]> {
        self.item(key).map(|item| item.actions.as_slice())
    }

    pub fn items(&self) -> &[OutputMapItem<K>] {
        &self.items
    }

    /// Classify one key against a registry's observed values
    pub fn matches(&self, key: K, registry: &OutputRegistry) -> MatchResult {
        match self.item(key) {
            Some(item) => item.matches(|channel, address| registry.value(channel, address)),
            None => MatchResult::NoMatch,
        }
    }

    /// The key whose item currently matches fully, if exactly one does
    pub fn current_key(&self, registry: &OutputRegistry) -> Option<K> {
        let mut found = None;
        for item in &self.items {
            if item.matches(|channel, address| registry.value(channel, address)) == MatchResult::Full
            {
                if found.is_some() {
                    return None;
                }
                found = Some(item.key);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TurnoutPosition {
        Straight,
        Branch,
    }

    fn map() -> OutputMap<TurnoutPosition> {
        let mut map = OutputMap::new();
        map.insert(
            TurnoutPosition::Straight,
            vec![OutputAction::set(1, 10, OutputValue::PairFirst)],
        );
        map.insert(
            TurnoutPosition::Branch,
            vec![OutputAction::set(1, 10, OutputValue::PairSecond)],
        );
        map
    }

    #[test]
    fn test_actions_deterministic() {
        let map = map();
        assert_eq!(
            map.actions(TurnoutPosition::Straight).unwrap(),
            &[OutputAction::set(1, 10, OutputValue::PairFirst)]
        );
    }

    #[test]
    fn test_match_classification() {
        let item = OutputMapItem::new(
            0u8,
            vec![
                OutputAction::set(1, 1, OutputValue::High),
                OutputAction::set(1, 2, OutputValue::Low),
            ],
        );

        let full = item.matches(|_, address| {
            if address == 1 {
                OutputValue::High
            } else {
                OutputValue::Low
            }
        });
        assert_eq!(full, MatchResult::Full);

        let partial = item.matches(|_, address| {
            if address == 1 {
                OutputValue::High
            } else {
                OutputValue::High
            }
        });
        assert_eq!(partial, MatchResult::Partial);

        let none = item.matches(|_, _| OutputValue::Undefined);
        assert_eq!(none, MatchResult::NoMatch);
    }

    #[test]
    fn test_wildcard_only_item() {
        let item = OutputMapItem::new(0u8, vec![OutputAction::wildcard(1, 1)]);
        assert_eq!(item.matches(|_, _| OutputValue::High), MatchResult::Wildcard);
    }

    #[test]
    fn test_current_key_unique_full_match() {
        let map = map();
        let registry = OutputRegistry::new();
        // nothing observed yet
        assert_eq!(map.current_key(&registry), None);
    }

    #[test]
    fn test_insert_replaces() {
        let mut map = map();
        map.insert(
            TurnoutPosition::Straight,
            vec![OutputAction::wildcard(1, 10)],
        );
        assert_eq!(
            map.actions(TurnoutPosition::Straight).unwrap(),
            &[OutputAction::wildcard(1, 10)]
        );
        assert_eq!(map.items().len(), 2);
    }
}
