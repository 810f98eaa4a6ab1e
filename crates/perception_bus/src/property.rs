//! # Property Messages
//!
//! A [`PropertyMessage`] carries a typed property bag for one subject. Much of
//! the perception traffic is property sync, so the bag has two compact
//! encodings:
//!
//! - **Binary** (`to_buffer` / `decode`): server-to-server bulk sync.
//!   Layout: `[long subject][int 62][int count]` followed by
//!   `[string key][byte tag][value]` per property.
//! - **Client strings** (`to_client_strings`): flattened
//!   `[key, tag, value]` triples for client-facing transmission.
//!
//! Values with no wire representation ([`PropertyValue::Json`]) are dropped
//! from both encodings with a debug log rather than failing the whole message.
//! Both encodings accept an exclusion set so a namespace-specific subset can be
//! sent without rebuilding the bag.

use crate::error::WireError;
use crate::message::msg_types;
use crate::types::{MessageType, Namespace, Oid, Quaternion, Vec2, Vec3};
use crate::wire::{self, Marshal};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error};

/// Format sentinel written after the subject OID.
pub const PROPERTY_FORMAT_VERSION: i32 = 62;

const TAG_BOOL: u8 = 1;
const TAG_BYTE: u8 = 2;
const TAG_SHORT: u8 = 3;
const TAG_INT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_FLOAT: u8 = 6;
const TAG_DOUBLE: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_POINT2: u8 = 9;
const TAG_POINT3: u8 = 10;
const TAG_QUATERNION: u8 = 11;

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Point2(Vec2),
    Point3(Vec3),
    Quaternion(Quaternion),
    /// In-process structured value. Never written to either wire encoding.
    Json(serde_json::Value),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Byte(_) => "byte",
            PropertyValue::Short(_) => "short",
            PropertyValue::Int(_) => "int",
            PropertyValue::Long(_) => "long",
            PropertyValue::Float(_) => "float",
            PropertyValue::Double(_) => "double",
            PropertyValue::String(_) => "string",
            PropertyValue::Point2(_) => "point2",
            PropertyValue::Point3(_) => "point3",
            PropertyValue::Quaternion(_) => "quaternion",
            PropertyValue::Json(_) => "json",
        }
    }

    /// Writes `[byte tag][value]`. Returns false, writing nothing, for values
    /// without a binary form.
    fn marshal_tagged(&self, buf: &mut BytesMut) -> bool {
        match self {
            PropertyValue::Bool(v) => {
                buf.put_u8(TAG_BOOL);
                wire::put_bool(buf, *v);
            }
            PropertyValue::Byte(v) => {
                buf.put_u8(TAG_BYTE);
                buf.put_i8(*v);
            }
            PropertyValue::Short(v) => {
                buf.put_u8(TAG_SHORT);
                buf.put_i16(*v);
            }
            PropertyValue::Int(v) => {
                buf.put_u8(TAG_INT);
                buf.put_i32(*v);
            }
            PropertyValue::Long(v) => {
                buf.put_u8(TAG_LONG);
                buf.put_i64(*v);
            }
            PropertyValue::Float(v) => {
                buf.put_u8(TAG_FLOAT);
                buf.put_f32(*v);
            }
            PropertyValue::Double(v) => {
                buf.put_u8(TAG_DOUBLE);
                buf.put_f64(*v);
            }
            PropertyValue::String(v) => {
                buf.put_u8(TAG_STRING);
                wire::put_string(buf, v);
            }
            PropertyValue::Point2(p) => {
                buf.put_u8(TAG_POINT2);
                buf.put_f64(p.x);
                buf.put_f64(p.y);
            }
            PropertyValue::Point3(p) => {
                buf.put_u8(TAG_POINT3);
                buf.put_f64(p.x);
                buf.put_f64(p.y);
                buf.put_f64(p.z);
            }
            PropertyValue::Quaternion(q) => {
                buf.put_u8(TAG_QUATERNION);
                buf.put_f64(q.x);
                buf.put_f64(q.y);
                buf.put_f64(q.z);
                buf.put_f64(q.w);
            }
            PropertyValue::Json(_) => return false,
        }
        true
    }

    fn unmarshal_tagged(buf: &mut impl Buf) -> Result<Self, WireError> {
        let tag = wire::get_u8(buf)?;
        let value = match tag {
            TAG_BOOL => PropertyValue::Bool(wire::get_bool(buf)?),
            TAG_BYTE => PropertyValue::Byte(wire::get_i8(buf)?),
            TAG_SHORT => PropertyValue::Short(wire::get_i16(buf)?),
            TAG_INT => PropertyValue::Int(wire::get_i32(buf)?),
            TAG_LONG => PropertyValue::Long(wire::get_i64(buf)?),
            TAG_FLOAT => PropertyValue::Float(wire::get_f32(buf)?),
            TAG_DOUBLE => PropertyValue::Double(wire::get_f64(buf)?),
            TAG_STRING => PropertyValue::String(wire::get_string(buf)?),
            TAG_POINT2 => PropertyValue::Point2(Vec2::new(wire::get_f64(buf)?, wire::get_f64(buf)?)),
            TAG_POINT3 => PropertyValue::Point3(Vec3::new(
                wire::get_f64(buf)?,
                wire::get_f64(buf)?,
                wire::get_f64(buf)?,
            )),
            TAG_QUATERNION => PropertyValue::Quaternion(Quaternion::new(
                wire::get_f64(buf)?,
                wire::get_f64(buf)?,
                wire::get_f64(buf)?,
                wire::get_f64(buf)?,
            )),
            unknown => return Err(WireError::UnknownValueTag(unknown)),
        };
        Ok(value)
    }

    /// Client tag and text, or `None` when the value is not sent to clients
    /// speaking this protocol version.
    fn to_client_pair(&self, version: Option<&str>) -> Option<(&'static str, String)> {
        let pair = match self {
            PropertyValue::Bool(v) => ("B", v.to_string()),
            PropertyValue::Byte(v) => ("I", v.to_string()),
            PropertyValue::Short(v) => ("I", v.to_string()),
            PropertyValue::Int(v) => ("I", v.to_string()),
            PropertyValue::Long(v) => ("L", v.to_string()),
            PropertyValue::Float(v) => ("F", v.to_string()),
            PropertyValue::Double(v) => ("F", v.to_string()),
            PropertyValue::String(v) => ("S", v.clone()),
            PropertyValue::Point2(p) if version.is_some() => ("V", format!("({},{})", p.x, p.y)),
            PropertyValue::Point3(p) if version.is_some() => {
                ("V", format!("({},{},{})", p.x, p.y, p.z))
            }
            PropertyValue::Quaternion(q) if version.is_some() => {
                ("Q", format!("({},{},{},{})", q.x, q.y, q.z, q.w))
            }
            _ => return None,
        };
        Some(pair)
    }

    fn from_client_pair(key: &str, tag: &str, text: &str) -> Result<Self, WireError> {
        let malformed = |reason: String| WireError::MalformedClientValue {
            key: key.to_string(),
            reason,
        };
        let value = match tag {
            "B" => PropertyValue::Bool(text.parse().map_err(|e| malformed(format!("{e}")))?),
            "I" => PropertyValue::Int(text.parse().map_err(|e| malformed(format!("{e}")))?),
            "L" => PropertyValue::Long(text.parse().map_err(|e| malformed(format!("{e}")))?),
            "F" => PropertyValue::Double(text.parse().map_err(|e| malformed(format!("{e}")))?),
            "S" => PropertyValue::String(text.to_string()),
            "V" | "Q" => {
                let parts = parse_tuple(text).map_err(malformed)?;
                match (tag, parts.as_slice()) {
                    ("V", [x, y]) => PropertyValue::Point2(Vec2::new(*x, *y)),
                    ("V", [x, y, z]) => PropertyValue::Point3(Vec3::new(*x, *y, *z)),
                    ("Q", [x, y, z, w]) => PropertyValue::Quaternion(Quaternion::new(*x, *y, *z, *w)),
                    _ => return Err(malformed(format!("wrong component count {}", parts.len()))),
                }
            }
            other => return Err(malformed(format!("unknown tag '{other}'"))),
        };
        Ok(value)
    }
}

fn parse_tuple(text: &str) -> Result<Vec<f64>, String> {
    let inner = text
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| format!("expected parenthesised tuple, got '{text}'"))?;
    inner
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|e| e.to_string()))
        .collect()
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<Vec3> for PropertyValue {
    fn from(v: Vec3) -> Self {
        PropertyValue::Point3(v)
    }
}

impl From<Quaternion> for PropertyValue {
    fn from(v: Quaternion) -> Self {
        PropertyValue::Quaternion(v)
    }
}

/// Typed key/value properties of one subject.
///
/// # Examples
///
/// ```rust
/// use perception_bus::{Oid, PropertyMessage};
///
/// let mut msg = PropertyMessage::new(Oid(12));
/// msg.set_property("health", 80i32);
/// msg.set_property("name", "Grimwald");
///
/// let bytes = msg.to_buffer();
/// let decoded = PropertyMessage::decode(&bytes).unwrap();
/// assert_eq!(decoded.properties(), msg.properties());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMessage {
    pub msg_type: MessageType,
    pub subject: Oid,
    #[serde(default)]
    pub namespace: Option<Namespace>,
    #[serde(default)]
    properties: BTreeMap<String, PropertyValue>,
}

impl PropertyMessage {
    pub fn new(subject: Oid) -> Self {
        Self::with_type(msg_types::property(), subject)
    }

    pub fn with_type(msg_type: MessageType, subject: Oid) -> Self {
        Self {
            msg_type,
            subject,
            namespace: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn in_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Sets a property, returning the previous value if any.
    pub fn set_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        self.properties.insert(key.into(), value.into())
    }

    pub fn get_property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn remove_property(&mut self, key: &str) -> Option<PropertyValue> {
        self.properties.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, PropertyValue> {
        &self.properties
    }

    // ------------------------------------------------------------------------
    // Binary encoding
    // ------------------------------------------------------------------------

    pub fn to_buffer(&self) -> Bytes {
        self.to_buffer_filtered(&HashSet::new())
    }

    /// Encodes the message, leaving out every key in `exclude`.
    pub fn to_buffer_filtered(&self, exclude: &HashSet<String>) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_oid(&mut buf, self.subject);
        buf.put_i32(PROPERTY_FORMAT_VERSION);
        marshal_property_map(&mut buf, &self.properties, exclude);
        buf.freeze()
    }

    /// Decodes a complete binary property message.
    ///
    /// The message type and namespace are not part of the binary form; the
    /// result carries the default property message type and no namespace.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Self::from_slice(data)
    }

    /// Replaces this message's subject and properties with the contents of
    /// `data`.
    ///
    /// On any decode failure the error is logged and `self` is left exactly as
    /// it was; returns whether the buffer was applied.
    pub fn from_buffer(&mut self, data: &[u8]) -> bool {
        match Self::decode(data) {
            Ok(decoded) => {
                self.subject = decoded.subject;
                self.properties = decoded.properties;
                true
            }
            Err(e) => {
                error!(
                    "🔴 Dropping property message for subject {}: {}",
                    self.subject, e
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Client string encoding
    // ------------------------------------------------------------------------

    /// Flattens the properties into `[key, tag, value]` triples.
    ///
    /// Points and quaternions are only emitted when `version` is supplied;
    /// older client protocols cannot parse them.
    pub fn to_client_strings(&self, version: Option<&str>) -> Vec<String> {
        self.to_client_strings_filtered(version, &HashSet::new())
    }

    pub fn to_client_strings_filtered(
        &self,
        version: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Vec<String> {
        let mut out = Vec::with_capacity(self.properties.len() * 3);
        for (key, value) in &self.properties {
            if exclude.contains(key) {
                continue;
            }
            match value.to_client_pair(version) {
                Some((tag, text)) => {
                    out.push(key.clone());
                    out.push(tag.to_string());
                    out.push(text);
                }
                None => debug!(
                    "Property '{}' of type {} has no client encoding (version {:?}), dropped",
                    key,
                    value.type_name(),
                    version
                ),
            }
        }
        out
    }

    /// Parses flattened `[key, tag, value]` triples back into a property map.
    ///
    /// The client format has one integer tag and one float tag, so byte and
    /// short values come back as [`PropertyValue::Int`] and float values as
    /// [`PropertyValue::Double`].
    pub fn from_client_strings(
        triples: &[String],
    ) -> Result<BTreeMap<String, PropertyValue>, WireError> {
        if triples.len() % 3 != 0 {
            return Err(WireError::MalformedClientValue {
                key: String::new(),
                reason: format!("{} strings is not a whole number of triples", triples.len()),
            });
        }
        triples
            .chunks_exact(3)
            .map(|triple| {
                let value = PropertyValue::from_client_pair(&triple[0], &triple[1], &triple[2])?;
                Ok((triple[0].clone(), value))
            })
            .collect()
    }
}

/// Writes `[int count]` then `[string key][byte tag][value]` per property.
///
/// The count only covers properties that were actually written.
pub fn marshal_property_map(
    buf: &mut BytesMut,
    properties: &BTreeMap<String, PropertyValue>,
    exclude: &HashSet<String>,
) {
    let mut body = BytesMut::new();
    let mut written = 0usize;
    for (key, value) in properties {
        if exclude.contains(key) {
            continue;
        }
        let mut entry = BytesMut::new();
        wire::put_string(&mut entry, key);
        if value.marshal_tagged(&mut entry) {
            body.put(entry);
            written += 1;
        } else {
            debug!(
                "Property '{}' of type {} has no wire encoding, dropped",
                key,
                value.type_name()
            );
        }
    }
    wire::put_len(buf, written);
    buf.put(body);
}

pub fn unmarshal_property_map(
    buf: &mut impl Buf,
) -> Result<BTreeMap<String, PropertyValue>, WireError> {
    let count = wire::get_len(buf)?;
    let mut properties = BTreeMap::new();
    for _ in 0..count {
        let key = wire::get_string(buf)?;
        let value = PropertyValue::unmarshal_tagged(buf)?;
        properties.insert(key, value);
    }
    Ok(properties)
}

impl Marshal for PropertyMessage {
    fn marshal(&self, buf: &mut BytesMut) {
        buf.put(self.to_buffer());
    }

    fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let subject = wire::get_oid(buf)?;
        let found = wire::get_i32(buf)?;
        if found != PROPERTY_FORMAT_VERSION {
            return Err(WireError::VersionMismatch {
                expected: PROPERTY_FORMAT_VERSION,
                found,
            });
        }
        let mut message = PropertyMessage::new(subject);
        message.properties = unmarshal_property_map(buf)?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PropertyMessage {
        let mut msg = PropertyMessage::new(Oid(5150));
        msg.set_property("alive", true);
        msg.set_property("level", 12i32);
        msg.set_property("xp", 9_000_000_000i64);
        msg.set_property("speed", 3.5f32);
        msg.set_property("name", "Brannoc");
        msg
    }

    #[test]
    fn binary_encoding_preserves_subject_and_properties() {
        let msg = sample();
        let decoded = PropertyMessage::decode(&msg.to_buffer()).unwrap();
        assert_eq!(decoded.subject, Oid(5150));
        assert_eq!(decoded.properties(), msg.properties());
    }

    #[test]
    fn corrupted_sentinel_leaves_message_untouched() {
        let mut bytes = sample().to_buffer().to_vec();
        // sentinel sits right after the 8-byte subject
        bytes[8..12].copy_from_slice(&61i32.to_be_bytes());

        assert_eq!(
            PropertyMessage::decode(&bytes),
            Err(WireError::VersionMismatch { expected: 62, found: 61 })
        );

        let mut target = PropertyMessage::new(Oid(1));
        target.set_property("keep", 1i32);
        let before = target.clone();
        assert!(!target.from_buffer(&bytes));
        assert_eq!(target, before);
    }

    #[test]
    fn from_buffer_replaces_contents_on_success() {
        let mut target = PropertyMessage::new(Oid(1));
        target.set_property("stale", 1i32);
        assert!(target.from_buffer(&sample().to_buffer()));
        assert_eq!(target.subject, Oid(5150));
        assert!(!target.contains("stale"));
        assert_eq!(target.get_property("level"), Some(&PropertyValue::Int(12)));
    }

    #[test]
    fn excluded_and_json_values_are_not_written() {
        let mut msg = sample();
        msg.set_property("ai_state", PropertyValue::Json(serde_json::json!({"goal": "patrol"})));
        let exclude: HashSet<String> = ["xp".to_string()].into_iter().collect();

        let decoded = PropertyMessage::decode(&msg.to_buffer_filtered(&exclude)).unwrap();
        assert_eq!(decoded.len(), 4);
        assert!(!decoded.contains("xp"));
        assert!(!decoded.contains("ai_state"));
    }

    #[test]
    fn geometry_values_survive_binary_encoding() {
        let mut msg = PropertyMessage::new(Oid(3));
        msg.set_property("loc", Vec3::new(1.0, -2.5, 3.25));
        msg.set_property("orient", Quaternion::new(0.0, 0.7, 0.0, 0.7));
        msg.set_property("offset", PropertyValue::Point2(Vec2::new(4.0, 5.0)));
        msg.set_property("tier", PropertyValue::Byte(-3));
        msg.set_property("slot", PropertyValue::Short(300));
        msg.set_property("ratio", PropertyValue::Double(0.125));

        let decoded = PropertyMessage::decode(&msg.to_buffer()).unwrap();
        assert_eq!(decoded.properties(), msg.properties());
    }

    #[test]
    fn unknown_value_tag_is_a_decode_error() {
        let mut buf = BytesMut::new();
        wire::put_oid(&mut buf, Oid(1));
        buf.put_i32(PROPERTY_FORMAT_VERSION);
        buf.put_i32(1);
        wire::put_string(&mut buf, "mystery");
        buf.put_u8(200);
        assert_eq!(
            PropertyMessage::decode(&buf),
            Err(WireError::UnknownValueTag(200))
        );
    }

    #[test]
    fn client_strings_gate_geometry_on_version() {
        let mut msg = PropertyMessage::new(Oid(3));
        msg.set_property("hp", 10i32);
        msg.set_property("loc", Vec3::new(1.0, 2.0, 3.0));

        let legacy = msg.to_client_strings(None);
        assert_eq!(legacy, vec!["hp", "I", "10"]);

        let current = msg.to_client_strings(Some("2.1"));
        assert_eq!(current, vec!["hp", "I", "10", "loc", "V", "(1,2,3)"]);
    }

    #[test]
    fn client_strings_parse_back() {
        let mut msg = PropertyMessage::new(Oid(3));
        msg.set_property("hp", 10i32);
        msg.set_property("gold", 77i64);
        msg.set_property("title", "Warden");
        msg.set_property("flying", false);
        msg.set_property("loc", Vec3::new(1.5, 2.0, -3.0));
        msg.set_property("rot", Quaternion::identity());

        let strings = msg.to_client_strings(Some("2.1"));
        let parsed = PropertyMessage::from_client_strings(&strings).unwrap();
        assert_eq!(&parsed, msg.properties());
    }

    #[test]
    fn client_strings_widen_narrow_numbers() {
        let mut msg = PropertyMessage::new(Oid(3));
        msg.set_property("level", PropertyValue::Byte(7));
        msg.set_property("armor", PropertyValue::Short(-300));
        msg.set_property("speed", PropertyValue::Float(2.5));

        let strings = msg.to_client_strings(None);
        let parsed = PropertyMessage::from_client_strings(&strings).unwrap();
        assert_eq!(parsed["level"], PropertyValue::Int(7));
        assert_eq!(parsed["armor"], PropertyValue::Int(-300));
        assert_eq!(parsed["speed"], PropertyValue::Double(2.5));
    }

    #[test]
    fn client_strings_reject_partial_triples() {
        let strings = vec!["hp".to_string(), "I".to_string()];
        assert!(PropertyMessage::from_client_strings(&strings).is_err());

        let bad = vec!["hp".to_string(), "I".to_string(), "ten".to_string()];
        assert!(matches!(
            PropertyMessage::from_client_strings(&bad),
            Err(WireError::MalformedClientValue { .. })
        ));
    }
}
