//! Message selection predicates consumed by the store and dispatch layers.
//!
//! Parsing a selector expression language is left to callers; the store only
//! needs a boolean predicate plus an optional indexing hint.

use std::fmt;

use crate::message::{Message, PropertyValue};

/// Indexing hint: the selector only matches messages whose property `name`
/// equals `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexKey {
    /// Property name
    pub name: String,
    /// Required value
    pub value: PropertyValue,
}

/// Predicate over messages.
pub trait MessageSelector: Send + Sync + fmt::Debug {
    /// Whether `message` is selected.
    fn matches(&self, message: &Message) -> bool;

    /// Keys usable to pre-filter candidates, `None` when the selector cannot
    /// be expressed as equality lookups.
    fn indexable_keys(&self) -> Option<Vec<IndexKey>> {
        None
    }
}

/// Selects every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MessageSelector for AcceptAll {
    fn matches(&self, _message: &Message) -> bool {
        true
    }
}

/// Selects messages whose property equals a value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEquals {
    key: IndexKey,
}

impl PropertyEquals {
    /// Match `name == value`.
    #[must_use]
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self { key: IndexKey { name: name.into(), value } }
    }
}

impl MessageSelector for PropertyEquals {
    fn matches(&self, message: &Message) -> bool {
        message.property(&self.key.name) == Some(&self.key.value)
    }

    fn indexable_keys(&self) -> Option<Vec<IndexKey>> {
        Some(vec![self.key.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DestinationRef, MessageBuilder};

    #[test]
    fn test_property_equals() {
        let selector = PropertyEquals::new("region", PropertyValue::String("eu".into()));
        let eu = MessageBuilder::new(DestinationRef::queue("q"))
            .with_property("region", PropertyValue::String("eu".into()))
            .build();
        let us = MessageBuilder::new(DestinationRef::queue("q"))
            .with_property("region", PropertyValue::String("us".into()))
            .build();
        let none = Message::new(DestinationRef::queue("q"));

        assert!(selector.matches(&eu));
        assert!(!selector.matches(&us));
        assert!(!selector.matches(&none));
        assert_eq!(selector.indexable_keys().map(|k| k.len()), Some(1));
    }

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.matches(&Message::new(DestinationRef::queue("q"))));
        assert!(AcceptAll.indexable_keys().is_none());
    }
}
