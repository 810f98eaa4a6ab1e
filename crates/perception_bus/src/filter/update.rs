//! # Filter Update Protocol
//!
//! A [`FilterUpdate`] is an ordered list of add/remove instructions against a
//! filter's target and subject sets. Subscribers send them to the remote
//! publishers holding copies of their filter, so every copy converges without
//! the full sets ever being re-sent.
//!
//! ## Wire shape
//!
//! ```text
//! [int count] ( [int opCode] [int fieldId] [long oid] ) * count
//! ```
//!
//! | opCode | meaning              | fieldId | meaning  |
//! |--------|----------------------|---------|----------|
//! | 1      | ADD                  | 1       | TARGETS  |
//! | 2      | REMOVE               | 2       | SUBJECTS |
//! | 3      | SET (never applied)  |         |          |
//!
//! Unknown field ids survive decoding so the applying filter can log and skip
//! that one instruction; an unknown opcode makes the whole buffer undecodable.
//!
//! ## Observers
//!
//! [`UpdateTriggerRegistry`] holds observers that run before and after a
//! filter applies an update, outside the filter's lock. The registry is an
//! ordinary value owned by whoever owns the filters; there is no process-wide
//! instance.

use super::Filter;
use crate::error::WireError;
use crate::types::{AgentId, Oid, SubscriptionHandle};
use crate::wire::{self, Marshal};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Instruction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Add,
    Remove,
    /// Defined by the protocol but rejected by every filter.
    Set,
}

impl OpCode {
    pub fn code(self) -> i32 {
        match self {
            OpCode::Add => 1,
            OpCode::Remove => 2,
            OpCode::Set => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            1 => Ok(OpCode::Add),
            2 => Ok(OpCode::Remove),
            3 => Ok(OpCode::Set),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Add => "ADD",
            OpCode::Remove => "REMOVE",
            OpCode::Set => "SET",
        }
    }
}

/// Which set an instruction addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum FieldId {
    Targets,
    Subjects,
    /// A field id this build does not know.
    Unknown(i32),
}

impl FieldId {
    pub const TARGETS: i32 = 1;
    pub const SUBJECTS: i32 = 2;

    pub fn code(self) -> i32 {
        match self {
            FieldId::Targets => Self::TARGETS,
            FieldId::Subjects => Self::SUBJECTS,
            FieldId::Unknown(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldId::Targets => "TARGETS",
            FieldId::Subjects => "SUBJECTS",
            FieldId::Unknown(_) => "UNKNOWN",
        }
    }
}

impl From<i32> for FieldId {
    fn from(code: i32) -> Self {
        match code {
            Self::TARGETS => FieldId::Targets,
            Self::SUBJECTS => FieldId::Subjects,
            other => FieldId::Unknown(other),
        }
    }
}

impl From<FieldId> for i32 {
    fn from(field: FieldId) -> Self {
        field.code()
    }
}

/// One add/remove/set step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    pub field: FieldId,
    pub oid: Oid,
}

impl Instruction {
    pub fn new(op: OpCode, field: FieldId, oid: Oid) -> Self {
        Self { op, field, oid }
    }
}

/// Ordered instruction list replicated to remote copies of a filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterUpdate {
    instructions: Vec<Instruction>,
}

impl FilterUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            instructions: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    pub fn add_target(&mut self, oid: Oid) -> &mut Self {
        self.push(Instruction::new(OpCode::Add, FieldId::Targets, oid))
    }

    pub fn remove_target(&mut self, oid: Oid) -> &mut Self {
        self.push(Instruction::new(OpCode::Remove, FieldId::Targets, oid))
    }

    pub fn add_subject(&mut self, oid: Oid) -> &mut Self {
        self.push(Instruction::new(OpCode::Add, FieldId::Subjects, oid))
    }

    pub fn remove_subject(&mut self, oid: Oid) -> &mut Self {
        self.push(Instruction::new(OpCode::Remove, FieldId::Subjects, oid))
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl<'a> IntoIterator for &'a FilterUpdate {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

impl Marshal for FilterUpdate {
    fn marshal(&self, buf: &mut BytesMut) {
        wire::put_len(buf, self.instructions.len());
        for instruction in &self.instructions {
            buf.put_i32(instruction.op.code());
            buf.put_i32(instruction.field.code());
            wire::put_oid(buf, instruction.oid);
        }
    }

    fn unmarshal(buf: &mut impl Buf) -> Result<Self, WireError> {
        let count = wire::get_len(buf)?;
        let mut update = FilterUpdate::with_capacity(count.min(1024));
        for _ in 0..count {
            let op = OpCode::from_code(wire::get_i32(buf)?)?;
            let field = FieldId::from(wire::get_i32(buf)?);
            let oid = wire::get_oid(buf)?;
            update.push(Instruction::new(op, field, oid));
        }
        Ok(update)
    }
}

// ============================================================================
// Outbound hand-off
// ============================================================================

/// Hand-off point between a filter and the transport that replicates its
/// updates.
///
/// Filters call `send_update` while holding their own lock, so
/// implementations must not block.
pub trait FilterUpdateSink: Send + Sync {
    fn send_update(&self, update: FilterUpdate);
}

/// A filter update queued for transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFilterUpdate {
    pub subscription: SubscriptionHandle,
    pub sender: AgentId,
    pub update: FilterUpdate,
}

/// Sink that queues updates on an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelUpdateSink {
    subscription: SubscriptionHandle,
    sender: AgentId,
    tx: mpsc::UnboundedSender<OutboundFilterUpdate>,
}

impl ChannelUpdateSink {
    /// Creates a sink and the receiver the transport drains.
    pub fn channel(
        sender: AgentId,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundFilterUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            subscription: SubscriptionHandle(0),
            sender,
            tx,
        };
        (sink, rx)
    }

    /// Returns a sink sharing this channel that stamps updates with
    /// `subscription`.
    pub fn bind(&self, subscription: SubscriptionHandle) -> Self {
        Self {
            subscription,
            sender: self.sender.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn subscription(&self) -> SubscriptionHandle {
        self.subscription
    }
}

impl FilterUpdateSink for ChannelUpdateSink {
    fn send_update(&self, update: FilterUpdate) {
        let outbound = OutboundFilterUpdate {
            subscription: self.subscription,
            sender: self.sender.clone(),
            update,
        };
        if self.tx.send(outbound).is_err() {
            warn!(
                "Filter update for {} dropped: transport receiver closed",
                self.subscription
            );
        }
    }
}

/// Sink that discards every update. Used for filters with no remote copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullUpdateSink;

impl FilterUpdateSink for NullUpdateSink {
    fn send_update(&self, _update: FilterUpdate) {}
}

// ============================================================================
// Update observers
// ============================================================================

/// Observer notified around every applied filter update.
///
/// Both hooks run outside the filter's lock; `post_update` sees the state
/// after the whole batch was applied.
pub trait FilterUpdateTrigger: Send + Sync {
    fn pre_update(
        &self,
        _filter: &dyn Filter,
        _update: &FilterUpdate,
        _sender: &AgentId,
        _subscription: SubscriptionHandle,
    ) {
    }

    fn post_update(
        &self,
        _filter: &dyn Filter,
        _update: &FilterUpdate,
        _sender: &AgentId,
        _subscription: SubscriptionHandle,
    ) {
    }
}

/// Registry of [`FilterUpdateTrigger`]s, passed to whatever applies updates.
#[derive(Default)]
pub struct UpdateTriggerRegistry {
    triggers: RwLock<Vec<Arc<dyn FilterUpdateTrigger>>>,
}

impl std::fmt::Debug for UpdateTriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateTriggerRegistry")
            .field("triggers", &self.len())
            .finish()
    }
}

impl UpdateTriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, trigger: Arc<dyn FilterUpdateTrigger>) {
        self.triggers.write().push(trigger);
    }

    pub fn len(&self) -> usize {
        self.triggers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.read().is_empty()
    }

    // The list is copied out so no registry lock is held during callbacks.
    fn snapshot(&self) -> Vec<Arc<dyn FilterUpdateTrigger>> {
        self.triggers.read().clone()
    }

    pub fn pre_update(
        &self,
        filter: &dyn Filter,
        update: &FilterUpdate,
        sender: &AgentId,
        subscription: SubscriptionHandle,
    ) {
        for trigger in self.snapshot() {
            trigger.pre_update(filter, update, sender, subscription);
        }
    }

    pub fn post_update(
        &self,
        filter: &dyn Filter,
        update: &FilterUpdate,
        sender: &AgentId,
        subscription: SubscriptionHandle,
    ) {
        for trigger in self.snapshot() {
            trigger.post_update(filter, update, sender, subscription);
        }
    }
}
