//! # Perception Bus
//!
//! Message filtering and perception tracking for a distributed virtual-world
//! message bus. Each server process declares which messages it wants through
//! filters; perception filters keep an incrementally maintained "what can this
//! connection see" set in sync across processes with small add/remove deltas.
//!
//! ## Core Features
//!
//! - **Two-phase matching**: cheap message-type test, then filter-specific checks
//! - **Perception tracking**: reference-counted target and subject OID sets
//! - **Incremental replication**: [`FilterUpdate`] deltas, sent atomically with the local change
//! - **Namespace routing**: [`NamespaceFilter`] and [`SubObjectFilter`] for per-domain traffic
//! - **Compact marshaling**: big-endian binary encodings for filters and [`PropertyMessage`]
//!
//! ## Architecture Overview
//!
//! - [`filter`] - the [`Filter`] trait and the concrete filters
//! - [`trigger`] - [`PerceptionTrigger`], which feeds perception deltas into a filter
//! - [`bus`] - [`LocalBus`], the in-process delivery engine
//! - [`message`] / [`property`] - the closed [`Message`] sum type and property bags
//! - [`wire`] - binary primitives and the [`Marshal`] trait
//!
//! ## Quick Start Example
//!
//! ```rust
//! use perception_bus::*;
//! use std::sync::Arc;
//!
//! let (sink, _outbound) = ChannelUpdateSink::channel(AgentId::new("proxy-1"));
//! let bus = LocalBus::new(sink, Arc::new(UpdateTriggerRegistry::new()));
//!
//! let filter = Arc::new(PerceptionFilter::new([msg_types::perception(), msg_types::property()]));
//! let handle = bus.subscribe(filter.clone(), Some(Arc::new(PerceptionTrigger::new())), |_, _| {});
//! bus.add_target(handle, Oid(1)).unwrap();
//!
//! let mut seen = PerceptionMessage::new(Oid(1));
//! seen.gain_object(Oid(1), Oid(2), ObjectType::MOB);
//! bus.publish(&seen.into());
//!
//! assert!(filter.has_subject(Oid(2)));
//! assert_eq!(bus.publish(&PropertyMessage::new(Oid(2)).into()), 1);
//! ```

pub mod bus;
pub mod error;
pub mod filter;
pub mod message;
pub mod property;
pub mod trigger;
pub mod types;
pub mod wire;

#[cfg(test)]
mod tests;

pub use bus::{BusStats, LocalBus, MessageHandler};
pub use error::{BusError, UpdateError, WireError};
pub use filter::{
    ChannelUpdateSink, FieldId, Filter, FilterUpdate, FilterUpdateSink, FilterUpdateTrigger,
    Instruction, MessageTypeFilter, NamespaceFilter, NullUpdateSink, OpCode,
    OutboundFilterUpdate, PerceptionFilter, SubObjectFilter, UpdateTriggerRegistry,
};
pub use message::{
    msg_types, GenericMessage, Message, ObjectNote, PerceptionMessage, SubjectMessage,
    TargetMessage,
};
pub use property::{PropertyMessage, PropertyValue, PROPERTY_FORMAT_VERSION};
pub use trigger::{MessageTrigger, PerceptionTrigger};
pub use types::*;
pub use wire::Marshal;
