//! # Message Triggers
//!
//! A trigger is a hook the local bus runs when a message passed a
//! subscription's filter, before the handler sees it. [`PerceptionTrigger`]
//! turns perception gain/lose deltas into subject set changes on the
//! subscription's [`PerceptionFilter`].
//!
//! The trigger keeps its own reference counts, separate from the filter's:
//! they track this subscriber's view of the perception union. Only OIDs
//! whose count crosses zero reach the filter, in one batched call per
//! message.

use crate::filter::{Filter, FilterUpdateSink};
use crate::message::Message;
use crate::types::{MessageType, ObjectType, Oid};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

/// Hook run for messages that matched a subscription's filter.
pub trait MessageTrigger: Send + Sync + std::fmt::Debug {
    /// Whether this trigger wants to see `message`.
    fn matches(&self, message: &Message) -> bool;

    /// Reacts to `message`. `filter` is the subscription's filter and `sink`
    /// carries any resulting filter updates to remote publishers.
    fn trigger(&self, message: &Message, filter: &dyn Filter, sink: &dyn FilterUpdateSink);
}

/// Maintains a [`PerceptionFilter`](crate::filter::PerceptionFilter)'s
/// subject set from perception traffic.
#[derive(Debug, Default)]
pub struct PerceptionTrigger {
    trigger_types: Option<HashSet<MessageType>>,
    counts: Mutex<HashMap<Oid, u32>>,
}

impl PerceptionTrigger {
    /// Trigger for perception messages only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger for messages of any of `types`.
    pub fn for_types(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            trigger_types: Some(types.into_iter().collect()),
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// This trigger's reference count for `oid`, 0 when untracked.
    pub fn ref_count(&self, oid: Oid) -> u32 {
        self.counts.lock().get(&oid).copied().unwrap_or(0)
    }

    pub fn tracked(&self) -> usize {
        self.counts.lock().len()
    }
}

impl MessageTrigger for PerceptionTrigger {
    fn matches(&self, message: &Message) -> bool {
        match &self.trigger_types {
            Some(types) => types.contains(message.msg_type()),
            None => matches!(message, Message::Perception(_)),
        }
    }

    fn trigger(&self, message: &Message, filter: &dyn Filter, sink: &dyn FilterUpdateSink) {
        let Message::Perception(perception) = message else {
            debug!(
                "Perception trigger ignoring {} message {}",
                message.kind_name(),
                message.msg_type()
            );
            return;
        };
        let Some(filter) = filter.as_perception() else {
            warn!(
                "⚠️ Perception trigger attached to a non-perception filter: {:?}",
                filter
            );
            return;
        };

        let mut new_subjects: Vec<(Oid, ObjectType)> = Vec::new();
        let mut freed_subjects: Vec<Oid> = Vec::new();
        // Held until the filter has seen the transitions. Lock order is
        // always trigger then filter.
        let mut counts = self.counts.lock();
        for note in &perception.gain {
            let count = counts.entry(note.subject).or_insert(0);
            *count += 1;
            if *count == 1 {
                new_subjects.push((note.subject, note.object_type));
            }
        }
        for note in &perception.lost {
            match counts.get_mut(&note.subject) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    counts.remove(&note.subject);
                    freed_subjects.push(note.subject);
                }
                None => error!(
                    "🔴 Perception trigger: {} lost {} which was never gained",
                    note.target, note.subject
                ),
            }
        }

        if !new_subjects.is_empty() {
            filter.add_subjects(&new_subjects, sink);
        }
        if !freed_subjects.is_empty() {
            filter.remove_subjects(&freed_subjects, sink);
        }
        drop(counts);
    }
}
