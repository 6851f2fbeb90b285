use compact_str::CompactString;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::types::TrackerEvent;

/// Broadcast channels. Observers pick one of three granularities; an update
/// for an assigned vehicle fans out to all three.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Vehicle(CompactString),
    Route(CompactString),
    Global,
}

impl Topic {
    /// Wire form: `vehicle:<id>`, `route:<id>`, `global`.
    pub fn parse(s: &str) -> Option<Topic> {
        if s == "global" {
            return Some(Topic::Global);
        }
        if let Some(id) = s.strip_prefix("vehicle:") {
            if !id.is_empty() {
                return Some(Topic::Vehicle(CompactString::from(id)));
            }
        }
        if let Some(id) = s.strip_prefix("route:") {
            if !id.is_empty() {
                return Some(Topic::Route(CompactString::from(id)));
            }
        }
        None
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Vehicle(id) => write!(f, "vehicle:{}", id),
            Topic::Route(id) => write!(f, "route:{}", id),
            Topic::Global => write!(f, "global"),
        }
    }
}

/// A live subscription. Dropping the receiver is enough to end it; the
/// sender side is purged on the next failed delivery.
pub struct Subscription {
    pub topic: Topic,
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<TrackerEvent>,
}

/// Topic-based fan-out table. One instance per process, constructed in main
/// and passed around explicitly; there is no ambient global.
///
/// Delivery is at-most-once to currently-subscribed observers, with no
/// replay for late subscribers. Publication never blocks: each observer gets
/// an unbounded channel, and a closed peer only costs one failed send.
pub struct Broadcaster {
    subs: DashMap<Topic, DashMap<u64, mpsc::UnboundedSender<TrackerEvent>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subs: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.entry(topic.clone()).or_default().insert(id, tx);
        Subscription { topic, id, rx }
    }

    pub fn unsubscribe(&self, topic: &Topic, id: u64) {
        if let Some(table) = self.subs.get(topic) {
            table.remove(&id);
        }
    }

    pub fn publish(&self, topic: &Topic, event: &TrackerEvent) {
        let Some(table) = self.subs.get(topic) else {
            return;
        };

        let mut dead: Vec<u64> = Vec::new();
        for entry in table.iter() {
            if entry.value().send(event.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        // Disconnected observers are removed lazily, here, so one dead peer
        // never interferes with delivery to the rest.
        for id in dead {
            table.remove(&id);
        }
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.subs.get(topic).map(|t| t.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, Point, VehicleStatus};

    fn sample_event(kind: EventKind) -> TrackerEvent {
        TrackerEvent {
            vehicle_id: CompactString::from("BUS_001"),
            route_id: Some(CompactString::from("route_42")),
            position: Point {
                lat: 19.0760,
                lng: 72.8777,
            },
            status: VehicleStatus::Running,
            occupancy_percentage: 40,
            timestamp: 1_700_000_000,
            event_kind: kind,
        }
    }

    #[test]
    fn test_topic_parse_roundtrip() {
        for raw in ["vehicle:BUS_001", "route:route_42", "global"] {
            let topic = Topic::parse(raw).expect("should parse");
            assert_eq!(topic.to_string(), raw);
        }
        assert_eq!(Topic::parse("vehicle:"), None);
        assert_eq!(Topic::parse("nonsense"), None);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_in_order() {
        let b = Broadcaster::new();
        let topic = Topic::Vehicle(CompactString::from("BUS_001"));
        let mut sub = b.subscribe(topic.clone());

        b.publish(&topic, &sample_event(EventKind::CameOnline));
        b.publish(&topic, &sample_event(EventKind::Position));

        let first = sub.rx.recv().await.unwrap();
        let second = sub.rx.recv().await.unwrap();
        assert_eq!(first.event_kind, EventKind::CameOnline);
        assert_eq!(second.event_kind, EventKind::Position);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let b = Broadcaster::new();
        let topic = Topic::Global;
        b.publish(&topic, &sample_event(EventKind::Position));

        let mut sub = b.subscribe(topic.clone());
        b.publish(&topic, &sample_event(EventKind::WentOffline));

        let got = sub.rx.recv().await.unwrap();
        assert_eq!(got.event_kind, EventKind::WentOffline);
        assert!(sub.rx.try_recv().is_err(), "no backlog should be delivered");
    }

    #[tokio::test]
    async fn test_dead_subscriber_removed_without_breaking_others() {
        let b = Broadcaster::new();
        let topic = Topic::Route(CompactString::from("route_42"));

        let dead = b.subscribe(topic.clone());
        let mut alive = b.subscribe(topic.clone());
        assert_eq!(b.subscriber_count(&topic), 2);

        drop(dead.rx);
        b.publish(&topic, &sample_event(EventKind::Position));

        assert_eq!(
            b.subscriber_count(&topic),
            1,
            "dead subscription should be purged on failed delivery"
        );
        assert_eq!(
            alive.rx.recv().await.unwrap().event_kind,
            EventKind::Position
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let b = Broadcaster::new();
        let topic = Topic::Global;
        let mut sub = b.subscribe(topic.clone());

        b.unsubscribe(&topic, sub.id);
        b.publish(&topic, &sample_event(EventKind::Position));

        assert!(sub.rx.try_recv().is_err());
        assert_eq!(b.subscriber_count(&topic), 0);
    }
}
