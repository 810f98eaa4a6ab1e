//! # Core Type Definitions
//!
//! Identifier and token types shared by every filter, trigger and message in
//! the perception bus.
//!
//! ## Key Types
//!
//! - [`Oid`] - Opaque 64-bit object identifier
//! - [`MessageType`] - Interned message type token
//! - [`Namespace`] - Interned property-domain token
//! - [`ObjectType`] - Coarse kind of a world object (player, mob, ...)
//! - [`SubscriptionHandle`] / [`AgentId`] - Bus bookkeeping identities
//!
//! ## Interning
//!
//! `MessageType` and `Namespace` are interned through a process-wide table so
//! two tokens built from the same name share one allocation. Equality checks
//! pointer identity first and only falls back to comparing text when the two
//! tokens came from different tables (e.g. one was built in a test with
//! [`MessageType::uninterned`]).

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// Object identifiers
// ============================================================================

/// Opaque 64-bit object identifier.
///
/// OIDs carry no structure; they are only compared, hashed and copied.
///
/// # Examples
///
/// ```rust
/// use perception_bus::Oid;
///
/// let oid = Oid::new(42);
/// assert_eq!(oid.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(pub u64);

impl Oid {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for Oid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Interned tokens
// ============================================================================

lazy_static! {
    static ref MESSAGE_TYPES: DashMap<String, Arc<str>> = DashMap::new();
    static ref NAMESPACES: DashMap<String, Arc<str>> = DashMap::new();
}

fn intern_in(table: &DashMap<String, Arc<str>>, name: &str) -> Arc<str> {
    if let Some(existing) = table.get(name) {
        return existing.value().clone();
    }
    table
        .entry(name.to_string())
        .or_insert_with(|| Arc::from(name))
        .value()
        .clone()
}

macro_rules! interned_token {
    ($(#[$meta:meta])* $name:ident, $table:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Returns the shared token for `name`, creating it on first use.
            pub fn intern(name: &str) -> Self {
                Self(intern_in(&$table, name))
            }

            /// Builds a token that bypasses the intern table.
            pub fn uninterned(name: &str) -> Self {
                Self(Arc::from(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.0.hash(state);
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({:?})", stringify!($name), &*self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::intern(name)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = String::deserialize(deserializer)?;
                Ok(Self::intern(&name))
            }
        }
    };
}

interned_token!(
    /// Interned message type token, used as a map key and as filter criteria.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use perception_bus::MessageType;
    ///
    /// let a = MessageType::intern("ao.PERCEPTION");
    /// let b = MessageType::intern("ao.PERCEPTION");
    /// assert_eq!(a, b);
    /// ```
    MessageType,
    MESSAGE_TYPES
);

interned_token!(
    /// Interned namespace token.
    ///
    /// A namespace partitions the properties of one object into independently
    /// owned domains (combat data, quest data, ...).
    Namespace,
    NAMESPACES
);

// ============================================================================
// Object types
// ============================================================================

/// Coarse kind of a world object, as last reported by perception.
///
/// The set is closed; objects whose kind was never reported are
/// [`ObjectType::UNKNOWN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectType(u16);

impl ObjectType {
    pub const UNKNOWN: ObjectType = ObjectType(0);
    pub const STRUCTURE: ObjectType = ObjectType(1);
    pub const MOB: ObjectType = ObjectType(2);
    pub const PLAYER: ObjectType = ObjectType(3);
    pub const LIGHT: ObjectType = ObjectType(4);
    pub const TERRAIN_DECAL: ObjectType = ObjectType(5);
    pub const POINT_SOUND: ObjectType = ObjectType(6);
    pub const ITEM: ObjectType = ObjectType(7);

    const NAMES: [&'static str; 8] = [
        "unknown",
        "structure",
        "mob",
        "player",
        "light",
        "terrain_decal",
        "point_sound",
        "item",
    ];

    pub fn id(self) -> u16 {
        self.0
    }

    pub fn name(self) -> &'static str {
        Self::NAMES
            .get(self.0 as usize)
            .copied()
            .unwrap_or("unknown")
    }

    /// Looks up a well-known object type by its lowercase name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .position(|candidate| candidate.eq_ignore_ascii_case(name))
            .map(|index| ObjectType(index as u16))
    }

    /// Looks up a well-known object type by id.
    pub fn from_id(id: u16) -> Option<Self> {
        ((id as usize) < Self::NAMES.len()).then_some(ObjectType(id))
    }

    pub fn is_player(self) -> bool {
        self == Self::PLAYER
    }
}

impl Default for ObjectType {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for ObjectType {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Self::from_name(&name).ok_or_else(|| format!("unknown object type: {name}"))
    }
}

impl From<ObjectType> for String {
    fn from(object_type: ObjectType) -> Self {
        object_type.name().to_string()
    }
}

// ============================================================================
// Bus identities
// ============================================================================

/// Handle identifying one subscription on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(pub u64);

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Name of a cooperating server process (world manager, proxy, mob server, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Geometry carried in property values
// ============================================================================

/// Two-component point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Three-component point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Rotation quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::identity()
    }
}
