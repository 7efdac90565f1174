use model::{DistributionGroup, RegionEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::trace;

type Subscribers = HashMap<DistributionGroup, Vec<(u64, mpsc::UnboundedSender<RegionEvent>)>>;

/// Publish/subscribe registry for partitioner changes, keyed by distribution group.
#[derive(Default)]
pub struct RegionEventBus {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl RegionEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        self: &Arc<Self>,
        group: DistributionGroup,
    ) -> (UnsubscribeHandle, mpsc::UnboundedReceiver<RegionEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("No one should panic while holding this lock")
            .entry(group.clone())
            .or_default()
            .push((id, tx));
        let handle = UnsubscribeHandle {
            id,
            group,
            bus: Arc::downgrade(self),
        };
        (handle, rx)
    }

    pub fn publish(&self, event: RegionEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("No one should panic while holding this lock");
        let Some(group) = subscribers.get_mut(&event.region().group) else {
            return;
        };
        // Receivers that went away without unsubscribing are dropped here
        group.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        trace!(group = %event.region().group, subscribers = group.len(), "Published region event");
    }

    pub fn subscriber_count(&self, group: &DistributionGroup) -> usize {
        self.subscribers
            .lock()
            .expect("No one should panic while holding this lock")
            .get(group)
            .map_or(0, Vec::len)
    }

    fn unsubscribe(&self, group: &DistributionGroup, id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("No one should panic while holding this lock");
        let Some(entries) = subscribers.get_mut(group) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(subscriber, _)| *subscriber != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            subscribers.remove(group);
        }
        removed
    }
}

/// Removes one subscription from its bus. The matching receiver yields `None`
/// afterwards.
#[derive(Debug)]
pub struct UnsubscribeHandle {
    id: u64,
    group: DistributionGroup,
    bus: Weak<RegionEventBus>,
}

impl UnsubscribeHandle {
    pub fn group(&self) -> &DistributionGroup {
        &self.group
    }

    pub fn unsubscribe(self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.unsubscribe(&self.group, self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{DistributionRegion, Hyperrectangle, RegionId};

    fn added(group: &str, id: u64) -> RegionEvent {
        RegionEvent::Added(DistributionRegion {
            group: DistributionGroup::new(group),
            id: RegionId(id),
            covering_box: Hyperrectangle::full_space(),
            systems: vec![],
        })
    }

    #[tokio::test]
    async fn events_only_reach_subscribers_of_their_group() {
        let bus = RegionEventBus::new();
        let (_osm, mut osm_events) = bus.subscribe(DistributionGroup::new("osm"));
        let (_other, mut other_events) = bus.subscribe(DistributionGroup::new("other"));

        bus.publish(added("osm", 1));

        assert_eq!(osm_events.recv().await, Some(added("osm", 1)));
        assert!(other_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_receiver() {
        let bus = RegionEventBus::new();
        let group = DistributionGroup::new("osm");
        let (handle, mut events) = bus.subscribe(group.clone());
        assert_eq!(bus.subscriber_count(&group), 1);

        assert!(handle.unsubscribe());
        assert_eq!(bus.subscriber_count(&group), 0);
        bus.publish(added("osm", 1));
        assert_eq!(events.recv().await, None);
    }
}
