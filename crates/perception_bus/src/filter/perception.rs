//! # Perception Filter
//!
//! Tracks two reference-counted OID sets for one subscription:
//!
//! - **targets**: objects the subscriber explicitly watches (usually a
//!   player's own avatar). Perception notifications about a target, and
//!   messages addressed to it, match.
//! - **subjects**: objects currently perceivable by at least one target.
//!   Messages about a subject match. The set is maintained incrementally from
//!   gain/lose deltas, never recomputed.
//!
//! Both maps live behind one mutex. Readers take the same lock, so a match
//! always sees a consistent view of targets and subjects together.
//!
//! ## Replication
//!
//! Remote publishers keep copies of this filter. The `*_replicated` methods
//! perform the local mutation and hand the matching [`FilterUpdate`] to a
//! [`FilterUpdateSink`] under a single lock hold, so peers observe updates in
//! the same order as the local state changed. Subject changes are only
//! replicated when `match_subjects` is set.

use super::update::{FieldId, FilterUpdate, FilterUpdateSink, OpCode, UpdateTriggerRegistry};
use super::{Filter, TypeSet};
use crate::error::{UpdateError, WireError};
use crate::message::Message;
use crate::types::{AgentId, MessageType, ObjectType, Oid, SubscriptionHandle};
use crate::wire::{self, Marshal};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SubjectEntry {
    count: u32,
    object_type: ObjectType,
}

#[derive(Debug, Default)]
struct PerceptionState {
    targets: HashMap<Oid, u32>,
    subjects: HashMap<Oid, SubjectEntry>,
    subject_types: Option<HashSet<ObjectType>>,
    match_all_subjects: bool,
    match_subjects: bool,
}

impl PerceptionState {
    fn add_target(&mut self, oid: Oid) -> bool {
        let count = self.targets.entry(oid).or_insert(0);
        *count += 1;
        *count == 1
    }

    fn remove_target(&mut self, oid: Oid) -> Result<bool, UpdateError> {
        match self.targets.get_mut(&oid) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(false)
            }
            Some(_) => {
                self.targets.remove(&oid);
                Ok(true)
            }
            None => Err(UpdateError::MissingTarget(oid)),
        }
    }

    fn add_subject(&mut self, oid: Oid, object_type: ObjectType) -> bool {
        let entry = self.subjects.entry(oid).or_insert(SubjectEntry {
            count: 0,
            object_type,
        });
        entry.count += 1;
        entry.count == 1
    }

    fn add_subject_if_missing(&mut self, oid: Oid, object_type: ObjectType) -> bool {
        if self.subjects.contains_key(&oid) {
            return false;
        }
        self.subjects.insert(
            oid,
            SubjectEntry {
                count: 1,
                object_type,
            },
        );
        true
    }

    fn remove_subject(&mut self, oid: Oid) -> Result<bool, UpdateError> {
        match self.subjects.get_mut(&oid) {
            Some(entry) if entry.count > 1 => {
                entry.count -= 1;
                Ok(false)
            }
            Some(_) => {
                self.subjects.remove(&oid);
                Ok(true)
            }
            None => Err(UpdateError::MissingSubject(oid)),
        }
    }

    fn subject_matches(&self, subject: Oid) -> bool {
        if self.match_all_subjects {
            return true;
        }
        if let Some(entry) = self.subjects.get(&subject) {
            let type_allowed = match &self.subject_types {
                Some(allowed) => allowed.contains(&entry.object_type),
                None => true,
            };
            if type_allowed {
                return true;
            }
        }
        // Objects always perceive messages about themselves.
        self.targets.contains_key(&subject)
    }

    fn apply(&mut self, op: OpCode, field: FieldId, oid: Oid) -> Result<bool, UpdateError> {
        match (op, field) {
            (_, FieldId::Unknown(code)) => Err(UpdateError::UnknownField(code)),
            (OpCode::Set, field) => Err(UpdateError::UnsupportedOp {
                op: op.name(),
                field: field.name(),
            }),
            (OpCode::Add, FieldId::Targets) => Ok(self.add_target(oid)),
            (OpCode::Remove, FieldId::Targets) => self.remove_target(oid),
            (OpCode::Add, FieldId::Subjects) => Ok(self.add_subject(oid, ObjectType::UNKNOWN)),
            (OpCode::Remove, FieldId::Subjects) => self.remove_subject(oid),
        }
    }
}

/// Filter matching perception, target-addressed and subject messages against
/// reference-counted target and subject sets.
///
/// # Examples
///
/// ```
/// use perception_bus::filter::{Filter, PerceptionFilter};
/// use perception_bus::message::SubjectMessage;
/// use perception_bus::{MessageType, Oid};
///
/// let property = MessageType::intern("ao.PROPERTY");
/// let filter = PerceptionFilter::new([property.clone()]);
/// filter.add_target(Oid(1));
/// filter.add_subject(Oid(2));
///
/// assert!(filter.matches(&SubjectMessage::new(property.clone(), Oid(2)).into()));
/// assert!(!filter.matches(&SubjectMessage::new(property, Oid(3)).into()));
/// ```
#[derive(Debug, Default)]
pub struct PerceptionFilter {
    types: TypeSet,
    state: Mutex<PerceptionState>,
}

impl PerceptionFilter {
    pub fn new(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            types: TypeSet::new(types),
            state: Mutex::new(PerceptionState::default()),
        }
    }

    pub fn add_type(&self, message_type: MessageType) -> bool {
        self.types.insert(message_type)
    }

    pub fn remove_type(&self, message_type: &MessageType) -> bool {
        self.types.remove(message_type)
    }

    // ------------------------------------------------------------------
    // Subjects
    // ------------------------------------------------------------------

    /// Increments the subject's count, creating it with an unknown object
    /// type. Returns true iff the subject is new.
    pub fn add_subject(&self, oid: Oid) -> bool {
        self.state.lock().add_subject(oid, ObjectType::UNKNOWN)
    }

    /// Creates the subject at count 1 unless it already exists.
    pub fn add_subject_if_missing(&self, oid: Oid) -> bool {
        self.state
            .lock()
            .add_subject_if_missing(oid, ObjectType::UNKNOWN)
    }

    /// Decrements the subject's count. Returns true iff the subject was
    /// removed. Removing an absent subject is logged and returns false.
    pub fn remove_subject(&self, oid: Oid) -> bool {
        match self.state.lock().remove_subject(oid) {
            Ok(removed) => removed,
            Err(err) => {
                error!("🔴 remove_subject: {}", err);
                false
            }
        }
    }

    pub fn add_subject_replicated(&self, oid: Oid, sink: &dyn FilterUpdateSink) -> bool {
        let mut state = self.state.lock();
        let added = state.add_subject(oid, ObjectType::UNKNOWN);
        if added && state.match_subjects {
            let mut update = FilterUpdate::new();
            update.add_subject(oid);
            sink.send_update(update);
        }
        added
    }

    pub fn remove_subject_replicated(&self, oid: Oid, sink: &dyn FilterUpdateSink) -> bool {
        let mut state = self.state.lock();
        match state.remove_subject(oid) {
            Ok(true) => {
                if state.match_subjects {
                    let mut update = FilterUpdate::new();
                    update.remove_subject(oid);
                    sink.send_update(update);
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!("🔴 remove_subject_replicated: {}", err);
                false
            }
        }
    }

    /// Bulk insert used by perception triggers.
    ///
    /// Each subject must be new: the caller only passes OIDs whose own
    /// reference count just went 0 -> 1, so an existing entry is a logic
    /// error and is skipped. Returns how many subjects were added.
    pub fn add_subjects(&self, subjects: &[(Oid, ObjectType)], sink: &dyn FilterUpdateSink) -> usize {
        let mut state = self.state.lock();
        let mut update = FilterUpdate::new();
        for &(oid, object_type) in subjects {
            if state.add_subject_if_missing(oid, object_type) {
                update.add_subject(oid);
            } else {
                error!("🔴 add_subjects: {}", UpdateError::DuplicateSubject(oid));
            }
        }
        let added = update.len();
        if added > 0 && state.match_subjects {
            sink.send_update(update);
        }
        added
    }

    /// Bulk removal used by perception triggers. Each listed subject loses
    /// one reference; only subjects whose count reaches zero leave the set
    /// and are replicated. Returns how many were removed.
    pub fn remove_subjects(&self, subjects: &[Oid], sink: &dyn FilterUpdateSink) -> usize {
        let mut state = self.state.lock();
        let mut update = FilterUpdate::new();
        for &oid in subjects {
            match state.remove_subject(oid) {
                Ok(true) => {
                    update.remove_subject(oid);
                }
                Ok(false) => {}
                Err(err) => error!("🔴 remove_subjects: {}", err),
            }
        }
        let removed = update.len();
        if removed > 0 && state.match_subjects {
            sink.send_update(update);
        }
        removed
    }

    pub fn has_subject(&self, oid: Oid) -> bool {
        self.state.lock().subjects.contains_key(&oid)
    }

    pub fn subject_count(&self) -> usize {
        self.state.lock().subjects.len()
    }

    /// Reference count of a subject, 0 when absent.
    pub fn subject_ref_count(&self, oid: Oid) -> u32 {
        self.state
            .lock()
            .subjects
            .get(&oid)
            .map_or(0, |entry| entry.count)
    }

    pub fn subject_object_type(&self, oid: Oid) -> Option<ObjectType> {
        self.state
            .lock()
            .subjects
            .get(&oid)
            .map(|entry| entry.object_type)
    }

    pub fn subjects(&self) -> Vec<Oid> {
        self.state.lock().subjects.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Targets
    // ------------------------------------------------------------------

    /// Increments the target's count. Returns true iff the target is new.
    ///
    /// This does not replicate; see [`PerceptionFilter::add_target_replicated`].
    pub fn add_target(&self, oid: Oid) -> bool {
        self.state.lock().add_target(oid)
    }

    /// Decrements the target's count. Returns true iff the target was removed.
    pub fn remove_target(&self, oid: Oid) -> bool {
        match self.state.lock().remove_target(oid) {
            Ok(removed) => removed,
            Err(err) => {
                error!("🔴 remove_target: {}", err);
                false
            }
        }
    }

    /// Adds a target and, if it is new, sends `ADD TARGETS oid` through
    /// `sink` before the lock is released.
    pub fn add_target_replicated(&self, oid: Oid, sink: &dyn FilterUpdateSink) -> bool {
        let mut state = self.state.lock();
        let added = state.add_target(oid);
        if added {
            let mut update = FilterUpdate::new();
            update.add_target(oid);
            sink.send_update(update);
        }
        added
    }

    /// Removes a target and, if its count reached zero, sends
    /// `REMOVE TARGETS oid` through `sink` before the lock is released.
    pub fn remove_target_replicated(&self, oid: Oid, sink: &dyn FilterUpdateSink) -> bool {
        let mut state = self.state.lock();
        match state.remove_target(oid) {
            Ok(true) => {
                let mut update = FilterUpdate::new();
                update.remove_target(oid);
                sink.send_update(update);
                true
            }
            Ok(false) => false,
            Err(err) => {
                error!("🔴 remove_target_replicated: {}", err);
                false
            }
        }
    }

    pub fn has_target(&self, oid: Oid) -> bool {
        self.state.lock().targets.contains_key(&oid)
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }

    pub fn targets(&self) -> Vec<Oid> {
        self.state.lock().targets.keys().copied().collect()
    }

    // ------------------------------------------------------------------
    // Flags
    // ------------------------------------------------------------------

    /// Installs (`Some`) or clears (`None`) the object type allow-list for
    /// subject matching.
    pub fn set_subject_object_types(&self, types: Option<&[ObjectType]>) {
        self.state.lock().subject_types = types.map(|types| types.iter().copied().collect());
    }

    pub fn subject_object_types(&self) -> Option<Vec<ObjectType>> {
        self.state
            .lock()
            .subject_types
            .as_ref()
            .map(|types| types.iter().copied().collect())
    }

    pub fn set_match_all_subjects(&self, value: bool) {
        self.state.lock().match_all_subjects = value;
    }

    pub fn match_all_subjects(&self) -> bool {
        self.state.lock().match_all_subjects
    }

    pub fn set_match_subjects(&self, value: bool) {
        self.state.lock().match_subjects = value;
    }

    pub fn match_subjects(&self) -> bool {
        self.state.lock().match_subjects
    }

    /// Applies every instruction of `update` under one lock hold. Bad
    /// instructions are logged and skipped. Returns true iff a target or
    /// subject was created or removed.
    pub(super) fn apply_instructions(
        &self,
        update: &FilterUpdate,
        sender: &AgentId,
        handle: SubscriptionHandle,
    ) -> bool {
        let mut changed = false;
        let mut state = self.state.lock();
        for instruction in update {
            match state.apply(instruction.op, instruction.field, instruction.oid) {
                Ok(true) => changed = true,
                Ok(false) => {}
                Err(err) => error!(
                    "🔴 Filter update from {} for {}: {} (oid {})",
                    sender, handle, err, instruction.oid
                ),
            }
        }
        changed
    }
}

impl Filter for PerceptionFilter {
    fn message_types(&self) -> Vec<MessageType> {
        self.types.snapshot()
    }

    fn match_message_type(&self, types: &[MessageType]) -> bool {
        self.types.intersects(types)
    }

    fn match_remaining(&self, message: &Message) -> bool {
        let state = self.state.lock();
        match message {
            Message::Perception(perception) => {
                state.targets.contains_key(&perception.target)
                    || perception
                        .gain
                        .iter()
                        .chain(perception.lost.iter())
                        .any(|note| state.targets.contains_key(&note.target))
            }
            Message::Target(target) => state.targets.contains_key(&target.target),
            Message::Subject(subject) => state.subject_matches(subject.subject),
            Message::Property(property) => state.subject_matches(property.subject),
            Message::Other(_) => false,
        }
    }

    fn apply_filter_update(
        &self,
        update: &FilterUpdate,
        sender: &AgentId,
        handle: SubscriptionHandle,
        registry: &UpdateTriggerRegistry,
    ) -> bool {
        registry.pre_update(self, update, sender, handle);
        let changed = self.apply_instructions(update, sender, handle);
        registry.post_update(self, update, sender, handle);
        debug!(
            "Applied {} filter update instructions from {} to {} (changed: {})",
            update.len(),
            sender,
            handle,
            changed
        );
        changed
    }

    fn as_perception(&self) -> Option<&PerceptionFilter> {
        Some(self)
    }
}

/// `[int count][MessageType...][bool matchSubjects][int count][long target...]`
/// followed by `[int count][long subject...]` when `matchSubjects` is set.
///
/// Reference counts and subject object types are not encoded: every decoded
/// entry starts at count 1 and subjects come back as [`ObjectType::UNKNOWN`].
impl Marshal for PerceptionFilter {
    fn marshal(&self, buf: &mut BytesMut) {
        let types = self.types.snapshot();
        wire::put_len(buf, types.len());
        for message_type in &types {
            wire::put_message_type(buf, message_type);
        }

        let state = self.state.lock();
        wire::put_bool(buf, state.match_subjects);
        wire::put_oids(buf, state.targets.keys());
        if state.match_subjects {
            wire::put_oids(buf, state.subjects.keys());
        }
    }

    fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let type_count = wire::get_len(buf)?;
        let mut types = Vec::with_capacity(type_count.min(64));
        for _ in 0..type_count {
            types.push(wire::get_message_type(buf)?);
        }

        let filter = PerceptionFilter::new(types);
        {
            let mut state = filter.state.lock();
            state.match_subjects = wire::get_bool(buf)?;
            for oid in wire::get_oids(buf)? {
                state.targets.insert(oid, 1);
            }
            if state.match_subjects {
                for oid in wire::get_oids(buf)? {
                    state.subjects.insert(
                        oid,
                        SubjectEntry {
                            count: 1,
                            object_type: ObjectType::UNKNOWN,
                        },
                    );
                }
            }
        }
        Ok(filter)
    }
}
