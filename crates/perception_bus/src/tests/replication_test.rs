//! Two agents keeping copies of one perception filter in sync.
//!
//! The proxy owns the subscription and its trigger. The world server holds a
//! copy decoded from the proxy's marshaled filter and applies every filter
//! update the proxy queues.

use crate::filter::{
    ChannelUpdateSink, Filter, FilterUpdate, FilterUpdateTrigger, OutboundFilterUpdate,
    PerceptionFilter, UpdateTriggerRegistry,
};
use crate::message::{msg_types, PerceptionMessage};
use crate::property::PropertyMessage;
use crate::trigger::PerceptionTrigger;
use crate::types::{AgentId, ObjectType, Oid, SubscriptionHandle};
use crate::wire::Marshal;
use crate::LocalBus;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const PLAYER: Oid = Oid(1);
const ORC: Oid = Oid(100);

struct Agent {
    bus: LocalBus,
    outbound: UnboundedReceiver<OutboundFilterUpdate>,
}

fn agent(name: &str, registry: Arc<UpdateTriggerRegistry>) -> Agent {
    let (sink, outbound) = ChannelUpdateSink::channel(AgentId::new(name));
    Agent {
        bus: LocalBus::new(sink, registry),
        outbound,
    }
}

fn proxy_filter() -> Arc<PerceptionFilter> {
    let filter = PerceptionFilter::new([msg_types::perception(), msg_types::property()]);
    filter.set_match_subjects(true);
    Arc::new(filter)
}

/// Applies everything `from` has queued to the `to` subscription.
fn pump(from: &mut Agent, to: &Agent, remote: SubscriptionHandle) -> usize {
    let mut applied = 0;
    while let Ok(outbound) = from.outbound.try_recv() {
        to.bus
            .apply_filter_update(remote, &outbound.update, &outbound.sender)
            .unwrap();
        applied += 1;
    }
    applied
}

#[test]
fn remote_copy_converges_through_filter_updates() {
    let mut proxy = agent("proxy-1", Arc::new(UpdateTriggerRegistry::new()));
    let world = agent("world", Arc::new(UpdateTriggerRegistry::new()));

    let local = proxy_filter();
    let handle = proxy
        .bus
        .subscribe(local.clone(), Some(Arc::new(PerceptionTrigger::new())), |_, _| {});
    proxy.bus.add_target(handle, PLAYER).unwrap();

    // The world server receives the filter when the subscription opens.
    let copy = Arc::new(PerceptionFilter::from_slice(&local.to_bytes()).unwrap());
    let remote = world.bus.subscribe(copy.clone(), None, |_, _| {});
    assert!(copy.has_target(PLAYER));

    // The target add was already part of the marshaled state.
    let _ = proxy.outbound.try_recv();

    let mut seen = PerceptionMessage::new(PLAYER);
    seen.gain_object(PLAYER, ORC, ObjectType::MOB);
    proxy.bus.publish(&seen.into());
    assert_eq!(pump(&mut proxy, &world, remote), 1);
    assert!(copy.has_subject(ORC));
    assert_eq!(world.bus.publish(&PropertyMessage::new(ORC).into()), 1);

    let mut gone = PerceptionMessage::new(PLAYER);
    gone.lose_object(PLAYER, ORC);
    proxy.bus.publish(&gone.into());
    assert_eq!(pump(&mut proxy, &world, remote), 1);
    assert!(!copy.has_subject(ORC));
    assert_eq!(world.bus.publish(&PropertyMessage::new(ORC).into()), 0);

    proxy.bus.remove_target(handle, PLAYER).unwrap();
    pump(&mut proxy, &world, remote);
    assert_eq!(copy.target_count(), 0);
    assert_eq!(world.bus.stats().filter_updates_applied, 3);
}

#[test]
fn one_update_per_perception_message() {
    let mut proxy = agent("proxy-1", Arc::new(UpdateTriggerRegistry::new()));
    let local = proxy_filter();
    let handle = proxy
        .bus
        .subscribe(local, Some(Arc::new(PerceptionTrigger::new())), |_, _| {});
    proxy.bus.add_target(handle, PLAYER).unwrap();
    let _ = proxy.outbound.try_recv();

    let mut crowd = PerceptionMessage::new(PLAYER);
    for oid in 200..210 {
        crowd.gain_object(PLAYER, Oid(oid), ObjectType::MOB);
    }
    proxy.bus.publish(&crowd.into());

    let outbound = proxy.outbound.try_recv().unwrap();
    assert_eq!(outbound.subscription, handle);
    assert_eq!(outbound.update.len(), 10);
    assert!(proxy.outbound.try_recv().is_err());
}

#[test]
fn registry_observers_see_remote_churn() {
    #[derive(Default)]
    struct Audit {
        applied: Mutex<Vec<(String, usize, usize)>>,
    }

    impl FilterUpdateTrigger for Audit {
        fn post_update(
            &self,
            filter: &dyn Filter,
            update: &FilterUpdate,
            sender: &AgentId,
            _subscription: SubscriptionHandle,
        ) {
            let subjects = filter.as_perception().map_or(0, |f| f.subject_count());
            self.applied
                .lock()
                .push((sender.to_string(), update.len(), subjects));
        }
    }

    let audit = Arc::new(Audit::default());
    let registry = Arc::new(UpdateTriggerRegistry::new());
    registry.register(audit.clone());
    let world = agent("world", registry);
    let remote = world.bus.subscribe(proxy_filter(), None, |_, _| {});

    let mut update = FilterUpdate::new();
    update.add_subject(Oid(7)).add_subject(Oid(8));
    world
        .bus
        .apply_filter_update(remote, &update, &AgentId::new("proxy-2"))
        .unwrap();

    assert_eq!(*audit.applied.lock(), vec![("proxy-2".to_string(), 2, 2)]);
}
