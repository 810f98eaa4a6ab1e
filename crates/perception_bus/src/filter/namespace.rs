//! Namespace filtering.

use super::{Filter, TypeSet};
use crate::error::WireError;
use crate::message::Message;
use crate::types::{MessageType, Namespace};
use crate::wire::{self, Marshal};
use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use std::collections::HashSet;

/// Matches messages of the declared types that carry one of the allowed
/// namespaces.
///
/// Messages without the namespace capability never match: the filter fails
/// closed.
#[derive(Debug, Default)]
pub struct NamespaceFilter {
    types: TypeSet,
    namespaces: RwLock<HashSet<Namespace>>,
}

impl NamespaceFilter {
    pub fn new(
        types: impl IntoIterator<Item = MessageType>,
        namespaces: impl IntoIterator<Item = Namespace>,
    ) -> Self {
        Self {
            types: TypeSet::new(types),
            namespaces: RwLock::new(namespaces.into_iter().collect()),
        }
    }

    pub fn add_type(&self, message_type: MessageType) -> bool {
        self.types.insert(message_type)
    }

    pub fn add_namespace(&self, namespace: Namespace) -> bool {
        self.namespaces.write().insert(namespace)
    }

    pub fn remove_namespace(&self, namespace: &Namespace) -> bool {
        self.namespaces.write().remove(namespace)
    }

    pub fn has_namespace(&self, namespace: &Namespace) -> bool {
        self.namespaces.read().contains(namespace)
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.namespaces.read().iter().cloned().collect()
    }

    /// Namespace half of the match, usable by composing filters.
    pub fn match_namespace(&self, message: &Message) -> bool {
        match message.namespace() {
            Some(namespace) => self.namespaces.read().contains(namespace),
            None => false,
        }
    }
}

impl Filter for NamespaceFilter {
    fn message_types(&self) -> Vec<MessageType> {
        self.types.snapshot()
    }

    fn match_message_type(&self, types: &[MessageType]) -> bool {
        self.types.intersects(types)
    }

    fn match_remaining(&self, message: &Message) -> bool {
        self.match_namespace(message)
    }
}

/// `[int count][MessageType...][int count][Namespace...]`
impl Marshal for NamespaceFilter {
    fn marshal(&self, buf: &mut BytesMut) {
        let types = self.types.snapshot();
        wire::put_len(buf, types.len());
        for message_type in &types {
            wire::put_message_type(buf, message_type);
        }
        let namespaces = self.namespaces.read();
        wire::put_len(buf, namespaces.len());
        for namespace in namespaces.iter() {
            wire::put_string(buf, namespace.as_str());
        }
    }

    fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let type_count = wire::get_len(buf)?;
        let mut types = Vec::with_capacity(type_count.min(64));
        for _ in 0..type_count {
            types.push(wire::get_message_type(buf)?);
        }
        let namespace_count = wire::get_len(buf)?;
        let mut namespaces = Vec::with_capacity(namespace_count.min(64));
        for _ in 0..namespace_count {
            namespaces.push(Namespace::intern(&wire::get_string(buf)?));
        }
        Ok(Self::new(types, namespaces))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{GenericMessage, PerceptionMessage, SubjectMessage};
    use crate::property::PropertyMessage;
    use crate::types::Oid;

    fn combat_filter() -> (NamespaceFilter, MessageType, Namespace) {
        let property = MessageType::intern("test.NS_PROPERTY");
        let combat = Namespace::intern("combat");
        let filter = NamespaceFilter::new([property.clone()], [combat.clone()]);
        (filter, property, combat)
    }

    #[test]
    fn requires_type_and_namespace() {
        let (filter, property, combat) = combat_filter();
        let quest = Namespace::intern("quest");

        let in_combat = SubjectMessage::new(property.clone(), Oid(1)).in_namespace(combat);
        let in_quest = SubjectMessage::new(property.clone(), Oid(1)).in_namespace(quest);
        assert!(filter.matches(&in_combat.into()));
        assert!(!filter.matches(&in_quest.into()));
    }

    #[test]
    fn messages_without_namespace_fail_closed() {
        let (filter, property, _) = combat_filter();
        assert!(!filter.match_remaining(&SubjectMessage::new(property.clone(), Oid(1)).into()));
        assert!(!filter.match_remaining(&GenericMessage::new(property.clone()).into()));
        assert!(!filter.match_remaining(&PerceptionMessage::new(Oid(1)).into()));
    }

    #[test]
    fn property_messages_carry_the_capability() {
        let (filter, property, combat) = combat_filter();
        let msg = PropertyMessage::with_type(property, Oid(4)).in_namespace(combat);
        assert!(filter.matches(&msg.into()));
    }

    #[test]
    fn marshal_round_trip_keeps_sets() {
        let (filter, property, combat) = combat_filter();
        filter.add_namespace(Namespace::intern("quest"));

        let decoded = NamespaceFilter::from_slice(&filter.to_bytes()).unwrap();
        assert_eq!(decoded.message_types(), vec![property]);
        assert!(decoded.has_namespace(&combat));
        assert!(decoded.has_namespace(&Namespace::intern("quest")));
        assert_eq!(decoded.namespaces().len(), 2);
    }
}
