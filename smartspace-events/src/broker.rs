//! Fanout broker: per-scope live channels with a bounded trailing window.
//!
//! The broker is the low-latency path and is allowed to lose things. Every
//! event is durable before it is published here, so anything missing from a
//! channel can be recovered from the store. Publishing never fails.

use dashmap::DashMap;
use smartspace_core::{Event, RuntimeConfig, ScopeId, Seq};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Item delivered on a scope's live channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerItem {
    /// An event of this scope's own log.
    Event(Arc<Event>),
    /// An event of another scope mirrored here for live observers. Carries
    /// its origin scope and seq and is never part of this scope's history.
    Projection(Arc<Event>),
}

struct Window {
    events: VecDeque<Arc<Event>>,
    touched: Instant,
}

impl Window {
    /// Insert in seq order. Publishes from concurrent writers can arrive out
    /// of order; duplicates are ignored.
    fn insert(&mut self, event: Arc<Event>, capacity: usize) {
        match self.events.back() {
            None => self.events.push_back(event),
            Some(last) if event.seq > last.seq => self.events.push_back(event),
            Some(_) => match self.events.binary_search_by_key(&event.seq, |e| e.seq) {
                Ok(_) => return,
                Err(pos) => self.events.insert(pos, event),
            },
        }
        while self.events.len() > capacity {
            self.events.pop_front();
        }
    }

    /// Events `after+1..=up_to`, only if all of them are present.
    fn range(&self, after: Seq, up_to: Seq) -> Option<Vec<Arc<Event>>> {
        if up_to <= after {
            return Some(Vec::new());
        }
        let start = self.events.partition_point(|e| e.seq <= after);
        let mut expected = after + 1;
        let mut out = Vec::with_capacity((up_to - after) as usize);
        for event in self.events.iter().skip(start) {
            if event.seq > up_to {
                break;
            }
            if event.seq != expected {
                return None;
            }
            out.push(Arc::clone(event));
            expected += 1;
        }
        (expected == up_to + 1).then_some(out)
    }
}

struct ScopeChannel {
    tx: broadcast::Sender<BrokerItem>,
    head: watch::Sender<Seq>,
    window: Mutex<Window>,
}

impl ScopeChannel {
    fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        let (head, _head_rx) = watch::channel(0);
        Self {
            tx,
            head,
            window: Mutex::new(Window {
                events: VecDeque::new(),
                touched: Instant::now(),
            }),
        }
    }
}

/// Per-scope broadcast channels with trailing windows and head notifications.
pub struct FanoutBroker {
    channels: DashMap<ScopeId, ScopeChannel>,
    window: usize,
    capacity: usize,
}

impl FanoutBroker {
    /// Create a broker retaining `window` events per scope, with broadcast
    /// buffers of `capacity` items.
    pub fn new(window: usize, capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            window: window.max(1),
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.broker_window, config.broker_capacity)
    }

    /// Publish a persisted event on its scope's channel.
    pub fn publish(&self, event: Arc<Event>) {
        let scope = event.scope;
        let seq = event.seq;
        let channel = self
            .channels
            .entry(scope)
            .or_insert_with(|| ScopeChannel::new(self.capacity));

        match channel.window.lock() {
            Ok(mut window) => {
                window.insert(Arc::clone(&event), self.window);
                window.touched = Instant::now();
            }
            Err(_) => warn!(scope = %scope, seq, "Broker window lock poisoned, skipping window"),
        }
        channel.head.send_if_modified(|head| {
            if seq > *head {
                *head = seq;
                true
            } else {
                false
            }
        });

        match channel.tx.send(BrokerItem::Event(event)) {
            Ok(receivers) => debug!(scope = %scope, seq, receivers, "Published event"),
            Err(_) => debug!(scope = %scope, seq, "No live subscribers for event"),
        }
    }

    /// Mirror an event of another scope onto `target`'s live channel.
    pub fn project(&self, target: ScopeId, event: Arc<Event>) {
        let channel = self
            .channels
            .entry(target)
            .or_insert_with(|| ScopeChannel::new(self.capacity));
        if let Ok(mut window) = channel.window.lock() {
            window.touched = Instant::now();
        }
        let event_type = event.event_type();
        if channel.tx.send(BrokerItem::Projection(event)).is_err() {
            debug!(scope = %target, event_type, "No live subscribers for projection");
        }
    }

    /// Open a live receiver for `scope`. Items published after this call are
    /// delivered to it.
    pub fn subscribe(&self, scope: ScopeId) -> broadcast::Receiver<BrokerItem> {
        self.channels
            .entry(scope)
            .or_insert_with(|| ScopeChannel::new(self.capacity))
            .tx
            .subscribe()
    }

    /// Highest seq published on `scope`, 0 if nothing was.
    pub fn head(&self, scope: ScopeId) -> Seq {
        self.channels
            .get(&scope)
            .map(|channel| *channel.head.borrow())
            .unwrap_or(0)
    }

    /// Cheap "something new happened" notification for polling readers.
    pub fn watch_head(&self, scope: ScopeId) -> watch::Receiver<Seq> {
        self.channels
            .entry(scope)
            .or_insert_with(|| ScopeChannel::new(self.capacity))
            .head
            .subscribe()
    }

    /// Events `after+1..=up_to` from the trailing window, or `None` when the
    /// window does not hold the whole range.
    pub fn window_range(&self, scope: ScopeId, after: Seq, up_to: Seq) -> Option<Vec<Arc<Event>>> {
        let channel = self.channels.get(&scope)?;
        let window = channel.window.lock().ok()?;
        window.range(after, up_to)
    }

    /// Drop channels nobody listens to that have been quiet for `idle`.
    /// Returns how many were evicted.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, channel| {
            if channel.tx.receiver_count() > 0 || channel.head.receiver_count() > 0 {
                return true;
            }
            match channel.window.lock() {
                Ok(window) => window.touched.elapsed() < idle,
                Err(_) => false,
            }
        });
        before.saturating_sub(self.channels.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use smartspace_core::{EntityIdType, EventPayload, RunId, SpaceId};

    fn event(scope: ScopeId, seq: Seq) -> Arc<Event> {
        Arc::new(Event {
            scope,
            seq,
            timestamp: Utc::now(),
            payload: EventPayload::Custom {
                name: "test".to_string(),
                data: serde_json::json!(seq),
            },
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_live_receiver() {
        let broker = FanoutBroker::new(8, 16);
        let scope = ScopeId::Space(SpaceId::now_v7());
        let mut rx = broker.subscribe(scope);

        broker.publish(event(scope, 1));
        match rx.recv().await.unwrap() {
            BrokerItem::Event(e) => assert_eq!(e.seq, 1),
            other => panic!("unexpected item {:?}", other),
        }
        assert_eq!(broker.head(scope), 1);
    }

    #[test]
    fn test_publish_without_receivers_is_fine() {
        let broker = FanoutBroker::new(8, 16);
        let scope = ScopeId::Space(SpaceId::now_v7());
        broker.publish(event(scope, 1));
        assert_eq!(broker.head(scope), 1);
    }

    #[test]
    fn test_window_keeps_trailing_events_in_order() {
        let broker = FanoutBroker::new(3, 16);
        let scope = ScopeId::Space(SpaceId::now_v7());
        for seq in [1, 2, 4, 3, 5, 5] {
            broker.publish(event(scope, seq));
        }
        let range = broker.window_range(scope, 2, 5).unwrap();
        let seqs: Vec<Seq> = range.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        // Seq 2 has fallen out of the window.
        assert!(broker.window_range(scope, 1, 5).is_none());
        assert_eq!(broker.head(scope), 5);
    }

    #[test]
    fn test_window_range_requires_contiguity() {
        let broker = FanoutBroker::new(8, 16);
        let scope = ScopeId::Run(RunId::now_v7());
        broker.publish(event(scope, 1));
        broker.publish(event(scope, 3));
        assert!(broker.window_range(scope, 0, 3).is_none());
        assert_eq!(broker.window_range(scope, 0, 1).unwrap().len(), 1);
        assert!(broker.window_range(scope, 3, 3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_head_watch_notifies() {
        let broker = FanoutBroker::new(8, 16);
        let scope = ScopeId::Space(SpaceId::now_v7());
        let mut head = broker.watch_head(scope);
        broker.publish(event(scope, 1));
        head.changed().await.unwrap();
        assert_eq!(*head.borrow(), 1);
    }

    #[tokio::test]
    async fn test_projection_is_tagged() {
        let broker = FanoutBroker::new(8, 16);
        let space = ScopeId::Space(SpaceId::now_v7());
        let run = ScopeId::Run(RunId::now_v7());
        let mut rx = broker.subscribe(space);

        broker.project(space, event(run, 1));
        assert!(matches!(rx.recv().await.unwrap(), BrokerItem::Projection(_)));
        // Projections do not move the space head.
        assert_eq!(broker.head(space), 0);
    }

    #[test]
    fn test_evict_idle_keeps_subscribed_channels() {
        let broker = FanoutBroker::new(8, 16);
        let quiet = ScopeId::Space(SpaceId::now_v7());
        let watched = ScopeId::Space(SpaceId::now_v7());
        broker.publish(event(quiet, 1));
        let _rx = broker.subscribe(watched);

        assert_eq!(broker.evict_idle(Duration::ZERO), 1);
        assert_eq!(broker.channel_count(), 1);
        assert_eq!(broker.head(quiet), 0);
    }
}
