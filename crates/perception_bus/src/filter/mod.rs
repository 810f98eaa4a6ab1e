//! # Message Filters
//!
//! A filter is the predicate a subscriber hands to the bus to say which
//! messages it wants. Matching is two-phase:
//!
//! 1. [`Filter::match_message_type`] - a cheap set-membership test against the
//!    declared message types.
//! 2. [`Filter::match_remaining`] - the filter-specific test (namespace,
//!    perception sets, sub-objects).
//!
//! Filters are shared (`Arc<dyn Filter>`) between the delivery threads, the
//! application and the thread applying remote [`FilterUpdate`]s, so every
//! implementation synchronises internally.

pub mod namespace;
pub mod perception;
pub mod subobject;
pub mod update;

pub use namespace::NamespaceFilter;
pub use perception::PerceptionFilter;
pub use subobject::SubObjectFilter;
pub use update::{
    ChannelUpdateSink, FieldId, FilterUpdate, FilterUpdateSink, FilterUpdateTrigger, Instruction,
    NullUpdateSink, OpCode, OutboundFilterUpdate, UpdateTriggerRegistry,
};

use crate::message::Message;
use crate::types::{AgentId, MessageType, SubscriptionHandle};
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::error;

/// Predicate over bus messages.
pub trait Filter: Send + Sync + std::fmt::Debug {
    /// Snapshot of the declared message types.
    fn message_types(&self) -> Vec<MessageType>;

    /// True iff any of `types` is one of the declared message types.
    fn match_message_type(&self, types: &[MessageType]) -> bool;

    /// Filter-specific test applied after the type test passed.
    fn match_remaining(&self, message: &Message) -> bool;

    /// Full match: declared type and filter-specific test.
    fn matches(&self, message: &Message) -> bool {
        self.match_message_type(std::slice::from_ref(message.msg_type()))
            && self.match_remaining(message)
    }

    /// Applies a replicated update from a remote subscriber.
    ///
    /// Filters without replicated state reject every update.
    fn apply_filter_update(
        &self,
        update: &FilterUpdate,
        sender: &AgentId,
        handle: SubscriptionHandle,
        _registry: &UpdateTriggerRegistry,
    ) -> bool {
        error!(
            "🔴 Filter {:?} does not accept updates ({} instructions from {} for {})",
            self,
            update.len(),
            sender,
            handle
        );
        false
    }

    /// Downcast hook used by perception triggers.
    fn as_perception(&self) -> Option<&PerceptionFilter> {
        None
    }
}

/// Thread-safe set of declared message types shared by the concrete filters.
#[derive(Debug, Default)]
pub struct TypeSet {
    types: RwLock<HashSet<MessageType>>,
}

impl TypeSet {
    pub fn new(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            types: RwLock::new(types.into_iter().collect()),
        }
    }

    pub fn insert(&self, message_type: MessageType) -> bool {
        self.types.write().insert(message_type)
    }

    pub fn remove(&self, message_type: &MessageType) -> bool {
        self.types.write().remove(message_type)
    }

    pub fn contains(&self, message_type: &MessageType) -> bool {
        self.types.read().contains(message_type)
    }

    pub fn snapshot(&self) -> Vec<MessageType> {
        self.types.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.read().is_empty()
    }

    /// True iff `candidates` and the declared set intersect.
    pub fn intersects(&self, candidates: &[MessageType]) -> bool {
        let declared = self.types.read();
        if candidates.len() <= declared.len() {
            candidates.iter().any(|t| declared.contains(t))
        } else {
            declared.iter().any(|t| candidates.contains(t))
        }
    }
}

/// Filter that matches on message type alone.
#[derive(Debug, Default)]
pub struct MessageTypeFilter {
    types: TypeSet,
}

impl MessageTypeFilter {
    pub fn new(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            types: TypeSet::new(types),
        }
    }

    pub fn add_type(&self, message_type: MessageType) -> bool {
        self.types.insert(message_type)
    }

    pub fn remove_type(&self, message_type: &MessageType) -> bool {
        self.types.remove(message_type)
    }
}

impl Filter for MessageTypeFilter {
    fn message_types(&self) -> Vec<MessageType> {
        self.types.snapshot()
    }

    fn match_message_type(&self, types: &[MessageType]) -> bool {
        self.types.intersects(types)
    }

    fn match_remaining(&self, _message: &Message) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{GenericMessage, SubjectMessage};
    use crate::types::Oid;

    #[test]
    fn type_filter_matches_declared_types_only() {
        let chat = MessageType::intern("test.CHAT");
        let emote = MessageType::intern("test.EMOTE");
        let filter = MessageTypeFilter::new([chat.clone()]);

        assert!(filter.matches(&GenericMessage::new(chat.clone()).into()));
        assert!(!filter.matches(&SubjectMessage::new(emote.clone(), Oid(1)).into()));

        assert!(filter.add_type(emote.clone()));
        assert!(filter.matches(&GenericMessage::new(emote.clone()).into()));
        assert!(filter.remove_type(&chat));
        assert!(!filter.match_message_type(&[chat]));
    }

    #[test]
    fn intersection_works_from_either_side() {
        let declared: Vec<MessageType> = (0..5)
            .map(|i| MessageType::intern(&format!("test.D{i}")))
            .collect();
        let filter = MessageTypeFilter::new(declared.clone());

        let mut many: Vec<MessageType> = (0..20)
            .map(|i| MessageType::intern(&format!("test.X{i}")))
            .collect();
        assert!(!filter.match_message_type(&many));
        many.push(declared[3].clone());
        assert!(filter.match_message_type(&many));
        assert!(filter.match_message_type(&declared[..1]));
        assert!(!filter.match_message_type(&[]));
    }

    #[test]
    fn default_filters_reject_updates() {
        let filter = MessageTypeFilter::default();
        let registry = UpdateTriggerRegistry::new();
        let mut update = FilterUpdate::new();
        update.add_target(Oid(1));
        assert!(!filter.apply_filter_update(
            &update,
            &AgentId::new("peer"),
            SubscriptionHandle(1),
            &registry
        ));
    }
}
