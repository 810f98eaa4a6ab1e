//! Sub-object routing.
//!
//! Some objects own sub-objects whose messages travel in their own namespace
//! (persistence records, inventories). A [`SubObjectFilter`] matches those
//! messages when the sub-object is registered with it directly, or when the
//! object is known to a shared [`PerceptionFilter`].

use super::update::{FieldId, FilterUpdate, OpCode, UpdateTriggerRegistry};
use super::{Filter, NamespaceFilter, PerceptionFilter};
use crate::error::UpdateError;
use crate::message::Message;
use crate::types::{AgentId, MessageType, Namespace, Oid, SubscriptionHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

#[derive(Debug)]
pub struct SubObjectFilter {
    namespace: NamespaceFilter,
    sub_objects: Mutex<HashMap<Oid, u32>>,
    perception: Option<Arc<PerceptionFilter>>,
}

impl SubObjectFilter {
    pub fn new(
        types: impl IntoIterator<Item = MessageType>,
        namespaces: impl IntoIterator<Item = Namespace>,
    ) -> Self {
        Self {
            namespace: NamespaceFilter::new(types, namespaces),
            sub_objects: Mutex::new(HashMap::new()),
            perception: None,
        }
    }

    /// Also match subjects and targets known to `perception`.
    pub fn with_perception(mut self, perception: Arc<PerceptionFilter>) -> Self {
        self.perception = Some(perception);
        self
    }

    pub fn namespace_filter(&self) -> &NamespaceFilter {
        &self.namespace
    }

    pub fn perception(&self) -> Option<&Arc<PerceptionFilter>> {
        self.perception.as_ref()
    }

    /// Returns true iff the sub-object is new.
    pub fn add_sub_object(&self, oid: Oid) -> bool {
        let mut sub_objects = self.sub_objects.lock();
        let count = sub_objects.entry(oid).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true iff the sub-object's count reached zero.
    pub fn remove_sub_object(&self, oid: Oid) -> bool {
        match remove_counted(&mut self.sub_objects.lock(), oid) {
            Ok(removed) => removed,
            Err(err) => {
                error!("🔴 remove_sub_object: {}", err);
                false
            }
        }
    }

    pub fn has_sub_object(&self, oid: Oid) -> bool {
        self.sub_objects.lock().contains_key(&oid)
    }

    pub fn sub_object_count(&self) -> usize {
        self.sub_objects.lock().len()
    }

    fn knows(&self, oid: Oid) -> bool {
        if self.sub_objects.lock().contains_key(&oid) {
            return true;
        }
        self.perception
            .as_ref()
            .is_some_and(|perception| perception.has_subject(oid) || perception.has_target(oid))
    }
}

/// Applies one sub-object instruction to the already locked map.
fn apply_sub_object(
    sub_objects: &mut HashMap<Oid, u32>,
    op: OpCode,
    field: FieldId,
    oid: Oid,
) -> Result<bool, UpdateError> {
    match (op, field) {
        (_, FieldId::Unknown(code)) => Err(UpdateError::UnknownField(code)),
        (OpCode::Set, field) => Err(UpdateError::UnsupportedOp {
            op: op.name(),
            field: field.name(),
        }),
        (OpCode::Add, FieldId::Subjects) => {
            let count = sub_objects.entry(oid).or_insert(0);
            *count += 1;
            Ok(*count == 1)
        }
        (OpCode::Remove, FieldId::Subjects) => remove_counted(sub_objects, oid),
        (_, FieldId::Targets) => Err(UpdateError::UnknownField(FieldId::TARGETS)),
    }
}

fn remove_counted(counts: &mut HashMap<Oid, u32>, oid: Oid) -> Result<bool, UpdateError> {
    match counts.get_mut(&oid) {
        Some(count) if *count > 1 => {
            *count -= 1;
            Ok(false)
        }
        Some(_) => {
            counts.remove(&oid);
            Ok(true)
        }
        None => Err(UpdateError::MissingSubject(oid)),
    }
}

impl Filter for SubObjectFilter {
    fn message_types(&self) -> Vec<MessageType> {
        self.namespace.message_types()
    }

    fn match_message_type(&self, types: &[MessageType]) -> bool {
        self.namespace.match_message_type(types)
    }

    fn match_remaining(&self, message: &Message) -> bool {
        if !self.namespace.match_namespace(message) {
            return false;
        }
        match message.subject() {
            Some(subject) => self.knows(subject),
            None => false,
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
        let mut changed = false;
        {
            let mut sub_objects = self.sub_objects.lock();
            let mut targets = FilterUpdate::new();
            for instruction in update {
                if instruction.field == FieldId::Targets && self.perception.is_some() {
                    targets.push(*instruction);
                    continue;
                }
                match apply_sub_object(&mut sub_objects, instruction.op, instruction.field, instruction.oid) {
                    Ok(true) => changed = true,
                    Ok(false) => {}
                    Err(err) => error!(
                        "🔴 Sub-object update from {} for {}: {} (oid {})",
                        sender, handle, err, instruction.oid
                    ),
                }
            }
            // Lock order is sub-objects then perception.
            if let Some(perception) = self.perception.as_ref().filter(|_| !targets.is_empty()) {
                changed |= perception.apply_instructions(&targets, sender, handle);
            }
        }
        registry.post_update(self, update, sender, handle);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{SubjectMessage, TargetMessage};

    fn persistence() -> (MessageType, Namespace) {
        (
            MessageType::intern("test.SUB_PROPERTY"),
            Namespace::intern("persistence"),
        )
    }

    fn message(oid: u64, namespace: &Namespace) -> Message {
        let (msg_type, _) = persistence();
        SubjectMessage::new(msg_type, Oid(oid))
            .in_namespace(namespace.clone())
            .into()
    }

    #[test]
    fn matches_own_sub_objects_in_namespace() {
        let (msg_type, ns) = persistence();
        let filter = SubObjectFilter::new([msg_type.clone()], [ns.clone()]);
        filter.add_sub_object(Oid(5));

        assert!(filter.matches(&message(5, &ns)));
        assert!(!filter.matches(&message(6, &ns)));
        assert!(!filter.matches(&message(5, &Namespace::intern("combat"))));
        assert!(!filter.matches(&TargetMessage::new(msg_type, Oid(5), Oid(5)).into()));
    }

    #[test]
    fn perception_filter_extends_the_known_set() {
        let (msg_type, ns) = persistence();
        let perception = Arc::new(PerceptionFilter::new([msg_type.clone()]));
        perception.add_target(Oid(1));
        perception.add_subject(Oid(2));
        let filter = SubObjectFilter::new([msg_type], [ns.clone()]).with_perception(perception.clone());

        assert!(filter.matches(&message(1, &ns)));
        assert!(filter.matches(&message(2, &ns)));
        assert!(!filter.matches(&message(3, &ns)));

        perception.remove_subject(Oid(2));
        assert!(!filter.matches(&message(2, &ns)));
    }

    #[test]
    fn updates_route_subjects_locally_and_targets_to_perception() {
        let (msg_type, ns) = persistence();
        let perception = Arc::new(PerceptionFilter::default());
        let filter = SubObjectFilter::new([msg_type], [ns]).with_perception(perception.clone());
        let registry = UpdateTriggerRegistry::new();

        let mut update = FilterUpdate::new();
        update.add_subject(Oid(10)).add_target(Oid(20));
        assert!(filter.apply_filter_update(&update, &AgentId::new("db"), SubscriptionHandle(4), &registry));
        assert!(filter.has_sub_object(Oid(10)));
        assert!(perception.has_target(Oid(20)));
        assert!(!perception.has_subject(Oid(10)));

        let mut removal = FilterUpdate::new();
        removal.remove_subject(Oid(10)).remove_subject(Oid(11));
        assert!(filter.apply_filter_update(&removal, &AgentId::new("db"), SubscriptionHandle(4), &registry));
        assert_eq!(filter.sub_object_count(), 0);
    }

    #[test]
    fn readers_never_observe_a_half_applied_batch() {
        let (msg_type, ns) = persistence();
        let perception = Arc::new(PerceptionFilter::default());
        let filter = SubObjectFilter::new([msg_type], [ns]).with_perception(perception.clone());
        filter.add_sub_object(Oid(5));
        let registry = UpdateTriggerRegistry::new();
        let sender = AgentId::new("db");

        let mut forward = FilterUpdate::new();
        forward.remove_subject(Oid(5)).add_subject(Oid(6)).add_target(Oid(1));
        let mut back = FilterUpdate::new();
        back.remove_subject(Oid(6)).add_subject(Oid(5)).remove_target(Oid(1));

        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..2000 {
                    filter.apply_filter_update(&forward, &sender, SubscriptionHandle(6), &registry);
                    filter.apply_filter_update(&back, &sender, SubscriptionHandle(6), &registry);
                }
                done.store(true, std::sync::atomic::Ordering::SeqCst);
            });
            scope.spawn(|| {
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    assert_eq!(filter.sub_object_count(), 1);
                }
            });
        });

        assert!(filter.has_sub_object(Oid(5)));
        assert!(!filter.has_sub_object(Oid(6)));
        assert_eq!(perception.target_count(), 0);
    }

    #[test]
    fn target_updates_without_perception_are_skipped() {
        let (msg_type, ns) = persistence();
        let filter = SubObjectFilter::new([msg_type], [ns]);
        let mut update = FilterUpdate::new();
        update.add_target(Oid(1));
        assert!(!filter.apply_filter_update(
            &update,
            &AgentId::new("db"),
            SubscriptionHandle(5),
            &UpdateTriggerRegistry::new()
        ));
    }
}
