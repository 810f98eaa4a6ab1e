//! # Bus Messages
//!
//! Messages are a closed sum type. Filters dispatch on the variant instead of
//! probing for capabilities at runtime, and anything a filter does not
//! recognise falls through to "no match".
//!
//! | Variant       | Carries                                   | Matched by               |
//! |---------------|-------------------------------------------|--------------------------|
//! | `Perception`  | perceiver OID, gained and lost objects    | target set               |
//! | `Target`      | target OID, subject OID                   | target set               |
//! | `Subject`     | subject OID, optional namespace           | subject set / target set |
//! | `Property`    | subject OID, namespace, property bag      | subject set / target set |
//! | `Other`       | type and optional namespace only          | type/namespace filters   |

use crate::property::PropertyMessage;
use crate::types::{MessageType, Namespace, ObjectType, Oid};
use serde::{Deserialize, Serialize};

/// Well-known message type names.
pub mod msg_types {
    use crate::types::MessageType;

    pub const PERCEPTION: &str = "ao.PERCEPTION";
    pub const PERCEPTION_INFO: &str = "ao.PERCEPTION_INFO";
    pub const PROPERTY: &str = "ao.PROPERTY";
    pub const TARGETED_PROPERTY: &str = "ao.TARGETED_PROPERTY";
    pub const UPDATE_WNODE: &str = "ao.UPDATEWNODE";

    pub fn perception() -> MessageType {
        MessageType::intern(PERCEPTION)
    }

    pub fn property() -> MessageType {
        MessageType::intern(PROPERTY)
    }
}

/// One object entering or leaving a perceiver's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectNote {
    /// The perceiver
    pub target: Oid,
    /// The perceived object
    pub subject: Oid,
    /// Kind of the perceived object, when known
    #[serde(default)]
    pub object_type: ObjectType,
}

impl ObjectNote {
    pub fn new(target: Oid, subject: Oid, object_type: ObjectType) -> Self {
        Self {
            target,
            subject,
            object_type,
        }
    }
}

/// Notification that objects entered or left the view of a perceiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionMessage {
    pub msg_type: MessageType,
    /// The perceiver this message is addressed to
    pub target: Oid,
    #[serde(default)]
    pub gain: Vec<ObjectNote>,
    #[serde(default)]
    pub lost: Vec<ObjectNote>,
}

impl PerceptionMessage {
    pub fn new(target: Oid) -> Self {
        Self::with_type(msg_types::perception(), target)
    }

    pub fn with_type(msg_type: MessageType, target: Oid) -> Self {
        Self {
            msg_type,
            target,
            gain: Vec::new(),
            lost: Vec::new(),
        }
    }

    pub fn gain_object(&mut self, target: Oid, subject: Oid, object_type: ObjectType) {
        self.gain.push(ObjectNote::new(target, subject, object_type));
    }

    pub fn lose_object(&mut self, target: Oid, subject: Oid) {
        self.lost
            .push(ObjectNote::new(target, subject, ObjectType::UNKNOWN));
    }

    pub fn is_empty(&self) -> bool {
        self.gain.is_empty() && self.lost.is_empty()
    }
}

/// A message directed at one object on behalf of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMessage {
    pub msg_type: MessageType,
    pub target: Oid,
    pub subject: Oid,
}

impl TargetMessage {
    pub fn new(msg_type: MessageType, target: Oid, subject: Oid) -> Self {
        Self {
            msg_type,
            target,
            subject,
        }
    }
}

/// A message about one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectMessage {
    pub msg_type: MessageType,
    pub subject: Oid,
    #[serde(default)]
    pub namespace: Option<Namespace>,
}

impl SubjectMessage {
    pub fn new(msg_type: MessageType, subject: Oid) -> Self {
        Self {
            msg_type,
            subject,
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }
}

/// Any message the perception filters have no special knowledge of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericMessage {
    pub msg_type: MessageType,
    #[serde(default)]
    pub namespace: Option<Namespace>,
}

impl GenericMessage {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            namespace: None,
        }
    }
}

/// A message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Perception(PerceptionMessage),
    Target(TargetMessage),
    Subject(SubjectMessage),
    Property(PropertyMessage),
    Other(GenericMessage),
}

impl Message {
    pub fn msg_type(&self) -> &MessageType {
        match self {
            Message::Perception(m) => &m.msg_type,
            Message::Target(m) => &m.msg_type,
            Message::Subject(m) => &m.msg_type,
            Message::Property(m) => &m.msg_type,
            Message::Other(m) => &m.msg_type,
        }
    }

    /// The namespace capability. `None` for messages that do not carry one.
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Message::Subject(m) => m.namespace.as_ref(),
            Message::Property(m) => m.namespace.as_ref(),
            Message::Other(m) => m.namespace.as_ref(),
            Message::Perception(_) | Message::Target(_) => None,
        }
    }

    /// Subject OID for subject-style messages.
    pub fn subject(&self) -> Option<Oid> {
        match self {
            Message::Subject(m) => Some(m.subject),
            Message::Property(m) => Some(m.subject),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Perception(_) => "perception",
            Message::Target(_) => "target",
            Message::Subject(_) => "subject",
            Message::Property(_) => "property",
            Message::Other(_) => "other",
        }
    }
}

impl From<PerceptionMessage> for Message {
    fn from(message: PerceptionMessage) -> Self {
        Message::Perception(message)
    }
}

impl From<TargetMessage> for Message {
    fn from(message: TargetMessage) -> Self {
        Message::Target(message)
    }
}

impl From<SubjectMessage> for Message {
    fn from(message: SubjectMessage) -> Self {
        Message::Subject(message)
    }
}

impl From<PropertyMessage> for Message {
    fn from(message: PropertyMessage) -> Self {
        Message::Property(message)
    }
}

impl From<GenericMessage> for Message {
    fn from(message: GenericMessage) -> Self {
        Message::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_capability_only_on_subject_like_messages() {
        let combat = Namespace::intern("combat");
        let subject: Message = SubjectMessage::new(MessageType::intern("t.S"), Oid(1))
            .in_namespace(combat.clone())
            .into();
        assert_eq!(subject.namespace(), Some(&combat));

        let target: Message = TargetMessage::new(MessageType::intern("t.T"), Oid(1), Oid(2)).into();
        assert_eq!(target.namespace(), None);

        let perception: Message = PerceptionMessage::new(Oid(1)).into();
        assert_eq!(perception.namespace(), None);
        assert_eq!(perception.msg_type().as_str(), msg_types::PERCEPTION);
    }

    #[test]
    fn messages_deserialize_from_tagged_json() {
        let json = r#"{
            "kind": "perception",
            "msg_type": "ao.PERCEPTION",
            "target": 7,
            "gain": [{"target": 7, "subject": 9, "object_type": "mob"}]
        }"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::Perception(p) => {
                assert_eq!(p.target, Oid(7));
                assert_eq!(p.gain[0].object_type, ObjectType::MOB);
                assert!(p.lost.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
