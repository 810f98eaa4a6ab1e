//! # Local Bus
//!
//! In-process delivery engine. It owns the subscriptions of one agent and
//! decides, per published message, which of them receive it:
//!
//! 1. the subscription's filter is consulted (`Filter::matches`);
//! 2. if the subscription has a trigger that wants the message, it runs
//!    first, so subject sets are current before the handler sees the message;
//! 3. the handler is called.
//!
//! Filter updates produced by triggers, or by [`LocalBus::add_target`] /
//! [`LocalBus::remove_target`], leave through a [`ChannelUpdateSink`] bound
//! to the owning subscription. Updates arriving from remote agents are
//! applied with [`LocalBus::apply_filter_update`].

use crate::error::BusError;
use crate::filter::{ChannelUpdateSink, Filter, FilterUpdate, UpdateTriggerRegistry};
use crate::message::Message;
use crate::trigger::MessageTrigger;
use crate::types::{AgentId, Oid, SubscriptionHandle};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Callback invoked for every delivered message.
pub type MessageHandler = Arc<dyn Fn(SubscriptionHandle, &Message) + Send + Sync>;

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages passed to `publish`
    pub messages_published: u64,
    /// Handler invocations
    pub deliveries: u64,
    /// Trigger invocations
    pub triggers_run: u64,
    /// Remote filter updates applied
    pub filter_updates_applied: u64,
    /// Live subscriptions
    pub subscriptions: usize,
}

struct Subscription {
    filter: Arc<dyn Filter>,
    trigger: Option<Arc<dyn MessageTrigger>>,
    handler: MessageHandler,
    sink: ChannelUpdateSink,
}

pub struct LocalBus {
    sink: ChannelUpdateSink,
    registry: Arc<UpdateTriggerRegistry>,
    subscriptions: DashMap<SubscriptionHandle, Arc<Subscription>>,
    next_handle: AtomicU64,
    stats: RwLock<BusStats>,
}

impl std::fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBus")
            .field("subscriptions", &self.subscriptions.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl LocalBus {
    pub fn new(sink: ChannelUpdateSink, registry: Arc<UpdateTriggerRegistry>) -> Self {
        Self {
            sink,
            registry,
            subscriptions: DashMap::new(),
            next_handle: AtomicU64::new(1),
            stats: RwLock::new(BusStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<UpdateTriggerRegistry> {
        &self.registry
    }

    /// Registers a subscription and returns its handle.
    pub fn subscribe<F>(
        &self,
        filter: Arc<dyn Filter>,
        trigger: Option<Arc<dyn MessageTrigger>>,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(SubscriptionHandle, &Message) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            filter,
            trigger,
            handler: Arc::new(handler),
            sink: self.sink.bind(handle),
        };
        debug!(
            "Subscribed {} for types {:?} (trigger: {})",
            handle,
            subscription.filter.message_types(),
            subscription.trigger.is_some()
        );
        self.subscriptions.insert(handle, Arc::new(subscription));
        self.stats.write().subscriptions = self.subscriptions.len();
        handle
    }

    /// Removes a subscription. Returns false for unknown handles.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let removed = self.subscriptions.remove(&handle).is_some();
        if removed {
            self.stats.write().subscriptions = self.subscriptions.len();
            info!("Unsubscribed {}", handle);
        }
        removed
    }

    pub fn filter(&self, handle: SubscriptionHandle) -> Option<Arc<dyn Filter>> {
        self.subscriptions
            .get(&handle)
            .map(|entry| entry.filter.clone())
    }

    /// Delivers `message` to every matching subscription. Returns the number
    /// of deliveries.
    pub fn publish(&self, message: &Message) -> usize {
        // Snapshot first so handlers may subscribe or unsubscribe.
        let matching: Vec<(SubscriptionHandle, Arc<Subscription>)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().filter.matches(message))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        trace!(
            "{} message {} matched {} subscriptions",
            message.kind_name(),
            message.msg_type(),
            matching.len()
        );

        let mut triggers_run = 0u64;
        for (handle, subscription) in &matching {
            if let Some(trigger) = &subscription.trigger {
                if trigger.matches(message) {
                    trigger.trigger(message, subscription.filter.as_ref(), &subscription.sink);
                    triggers_run += 1;
                }
            }
            (subscription.handler)(*handle, message);
        }

        let mut stats = self.stats.write();
        stats.messages_published += 1;
        stats.deliveries += matching.len() as u64;
        stats.triggers_run += triggers_run;
        matching.len()
    }

    /// Applies a filter update received from `sender` to the subscription's
    /// filter. Returns whether its target or subject sets changed.
    pub fn apply_filter_update(
        &self,
        handle: SubscriptionHandle,
        update: &FilterUpdate,
        sender: &AgentId,
    ) -> Result<bool, BusError> {
        let filter = self
            .filter(handle)
            .ok_or(BusError::UnknownSubscription(handle))?;
        let changed = filter.apply_filter_update(update, sender, handle, &self.registry);
        self.stats.write().filter_updates_applied += 1;
        Ok(changed)
    }

    /// Adds a target to the subscription's perception filter and replicates
    /// the change. Non-perception subscriptions report `Ok(false)`.
    pub fn add_target(&self, handle: SubscriptionHandle, oid: Oid) -> Result<bool, BusError> {
        let subscription = self.subscription(handle)?;
        Ok(subscription
            .filter
            .as_perception()
            .is_some_and(|filter| filter.add_target_replicated(oid, &subscription.sink)))
    }

    pub fn remove_target(&self, handle: SubscriptionHandle, oid: Oid) -> Result<bool, BusError> {
        let subscription = self.subscription(handle)?;
        Ok(subscription
            .filter
            .as_perception()
            .is_some_and(|filter| filter.remove_target_replicated(oid, &subscription.sink)))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn stats(&self) -> BusStats {
        self.stats.read().clone()
    }

    fn subscription(&self, handle: SubscriptionHandle) -> Result<Arc<Subscription>, BusError> {
        self.subscriptions
            .get(&handle)
            .map(|entry| entry.value().clone())
            .ok_or(BusError::UnknownSubscription(handle))
    }
}
