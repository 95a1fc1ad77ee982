//! Stream gateway: replay durable history, then tail the live channel.
//!
//! # Stitching
//!
//! 1. Open the broker receiver first. Everything published from here on is
//!    captured in it.
//! 2. Record the cutover: the larger of the broker head and the durable head.
//! 3. Replay `start+1..=cutover` from the broker window when it covers the
//!    range, otherwise from the store in pages, draining the receiver into a
//!    buffer between pages so it cannot lag.
//! 4. Flush the buffer, then pass live items through. Any event at or below
//!    the last delivered seq is dropped; any event that skips ahead triggers
//!    a fill of the missing range before it is forwarded. Broadcast lag
//!    triggers the same fill up to the current head.
//!
//! The delivered sequence is therefore strictly increasing and gap-free.
//! A read failure ends only this subscription; the caller reconnects with
//! [`Subscription::cursor`].

use crate::broker::BrokerItem;
use crate::retry::with_retry;
use crate::{EventLog, EventStore, FanoutBroker};
use async_stream::stream;
use futures_util::{Stream, StreamExt};
use smartspace_core::{
    Event, ResumeCursor, RetryConfig, RuntimeConfig, ScopeId, Seq, SpaceResult, StreamError,
};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

/// Where a subscription starts replaying from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFrom {
    /// Only events newer than the moment of subscribing.
    Latest,
    /// The whole durable history.
    Beginning,
    /// Everything after this seq (reconnect).
    After(Seq),
}

impl ReplayFrom {
    /// `None` is a fresh subscribe; a cursor must belong to `scope`.
    pub fn from_cursor(scope: ScopeId, cursor: Option<&ResumeCursor>) -> Result<Self, StreamError> {
        match cursor {
            None => Ok(Self::Latest),
            Some(cursor) if cursor.scope != scope => Err(StreamError::ScopeMismatch {
                scope,
                cursor_scope: cursor.scope,
            }),
            Some(cursor) => Ok(Self::After(cursor.seq)),
        }
    }
}

/// Item yielded by a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// Next event of the subscribed scope.
    Event(Arc<Event>),
    /// Live-only copy of another scope's event (run lifecycle on a space).
    Projection(Arc<Event>),
    /// Nothing happened for a keep-alive interval.
    KeepAlive,
}

/// Creates replay+live subscriptions.
#[derive(Clone)]
pub struct StreamGateway {
    store: Arc<dyn EventStore>,
    broker: Arc<FanoutBroker>,
    retry: RetryConfig,
    page_size: usize,
    keepalive: Duration,
}

impl StreamGateway {
    pub fn new(log: &EventLog, config: &RuntimeConfig) -> Self {
        Self {
            store: Arc::clone(log.store()),
            broker: Arc::clone(log.broker()),
            retry: log.retry_config().clone(),
            page_size: config.replay_page_size.max(1),
            keepalive: config.keepalive_interval,
        }
    }

    /// Subscribe with an optional resume cursor.
    pub async fn subscribe_with_cursor(
        &self,
        scope: ScopeId,
        cursor: Option<&ResumeCursor>,
    ) -> SpaceResult<Subscription> {
        let from = ReplayFrom::from_cursor(scope, cursor)?;
        self.subscribe(scope, from).await
    }

    /// Subscribe to `scope`, replaying per `from` and then tailing live.
    pub async fn subscribe(&self, scope: ScopeId, from: ReplayFrom) -> SpaceResult<Subscription> {
        let rx = self.broker.subscribe(scope);
        let reader = Reader {
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            retry: self.retry.clone(),
            scope,
            page_size: self.page_size,
        };
        let cutover = reader.head().await?;

        let start = match from {
            ReplayFrom::Latest => cutover,
            ReplayFrom::Beginning => 0,
            ReplayFrom::After(seq) if seq > cutover => {
                return Err(StreamError::CursorAhead {
                    scope,
                    seq,
                    head: cutover,
                }
                .into())
            }
            ReplayFrom::After(seq) => seq,
        };

        debug!(scope = %scope, start, cutover, "Subscription opened");
        let delivered = Arc::new(AtomicU64::new(start));
        let inner = stitch(reader, rx, start, cutover, self.keepalive, Arc::clone(&delivered));
        Ok(Subscription {
            scope,
            delivered,
            inner: Box::pin(inner),
        })
    }
}

/// An ordered, gap-free, duplicate-free stream of one scope's events.
///
/// Ends after yielding an error; reconnect with [`Subscription::cursor`].
pub struct Subscription {
    scope: ScopeId,
    delivered: Arc<AtomicU64>,
    inner: Pin<Box<dyn Stream<Item = SpaceResult<StreamItem>> + Send>>,
}

impl Subscription {
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    /// Seq of the last event delivered (the replay start before any).
    pub fn last_seq(&self) -> Seq {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Cursor to resume from after a disconnect.
    pub fn cursor(&self) -> ResumeCursor {
        ResumeCursor::new(self.scope, self.last_seq())
    }

    pub async fn next_item(&mut self) -> Option<SpaceResult<StreamItem>> {
        self.inner.next().await
    }

    /// Next scope event, skipping keep-alives and projections.
    pub async fn next_event(&mut self) -> Option<SpaceResult<Arc<Event>>> {
        loop {
            match self.inner.next().await? {
                Ok(StreamItem::Event(event)) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Stream for Subscription {
    type Item = SpaceResult<StreamItem>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// History reads for one scope: broker window first, durable store second.
struct Reader {
    store: Arc<dyn EventStore>,
    broker: Arc<FanoutBroker>,
    retry: RetryConfig,
    scope: ScopeId,
    page_size: usize,
}

impl Reader {
    async fn head(&self) -> SpaceResult<Seq> {
        let store = &self.store;
        let scope = self.scope;
        let durable = with_retry(&self.retry, "stream_head", move || store.head(scope)).await?;
        Ok(durable.max(self.broker.head(scope)))
    }

    /// Up to one page of events in `after+1..=up_to`.
    async fn page(&self, after: Seq, up_to: Seq) -> SpaceResult<Vec<Arc<Event>>> {
        let end = up_to.min(after.saturating_add(self.page_size as Seq));
        if let Some(events) = self.broker.window_range(self.scope, after, end) {
            return Ok(events);
        }
        let store = &self.store;
        let scope = self.scope;
        let limit = (end - after) as usize;
        let events =
            with_retry(&self.retry, "stream_replay", move || store.read_from(scope, after, limit))
                .await?;
        Ok(events
            .into_iter()
            .filter(|e| e.seq <= end)
            .map(Arc::new)
            .collect())
    }

    /// Every event in `after+1..=up_to`, contiguous or an error.
    async fn range(&self, after: Seq, up_to: Seq) -> SpaceResult<Vec<Arc<Event>>> {
        let mut out = Vec::new();
        let mut last = after;
        while last < up_to {
            let before = last;
            for event in self.page(last, up_to).await? {
                if event.seq == last + 1 {
                    last = event.seq;
                    out.push(event);
                }
            }
            if last == before {
                return Err(StreamError::Gap {
                    scope: self.scope,
                    expected: last + 1,
                    found: last,
                }
                .into());
            }
        }
        Ok(out)
    }
}

fn drain(rx: &mut broadcast::Receiver<BrokerItem>, buffer: &mut VecDeque<BrokerItem>) -> bool {
    let mut lagged = false;
    loop {
        match rx.try_recv() {
            Ok(item) => buffer.push_back(item),
            Err(TryRecvError::Lagged(_)) => lagged = true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return lagged,
        }
    }
}

enum Next {
    Item(BrokerItem),
    Resync,
    Idle,
    Closed,
}

fn stitch(
    reader: Reader,
    mut rx: broadcast::Receiver<BrokerItem>,
    start: Seq,
    cutover: Seq,
    keepalive: Duration,
    delivered: Arc<AtomicU64>,
) -> impl Stream<Item = SpaceResult<StreamItem>> + Send {
    stream! {
        let scope = reader.scope;
        let mut last = start;
        let mut buffer = VecDeque::new();
        let mut resync = false;

        // Replay up to the cutover.
        while last < cutover {
            let page = match reader.page(last, cutover).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Replay failed, closing subscription");
                    yield Err(e);
                    return;
                }
            };
            let before = last;
            for event in page {
                if event.seq == last + 1 {
                    last = event.seq;
                    delivered.store(last, Ordering::SeqCst);
                    yield Ok(StreamItem::Event(event));
                }
            }
            if last == before {
                let err = StreamError::Gap { scope, expected: last + 1, found: last };
                warn!(scope = %scope, error = %err, "Replay stalled, closing subscription");
                yield Err(err.into());
                return;
            }
            resync |= drain(&mut rx, &mut buffer);
        }

        // Buffered items first, then live.
        loop {
            let next = if let Some(item) = buffer.pop_front() {
                Next::Item(item)
            } else if resync {
                resync = false;
                Next::Resync
            } else {
                match tokio::time::timeout(keepalive, rx.recv()).await {
                    Ok(Ok(item)) => Next::Item(item),
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        warn!(scope = %scope, skipped, "Subscriber lagged, resyncing from history");
                        Next::Resync
                    }
                    Ok(Err(RecvError::Closed)) => Next::Closed,
                    Err(_) => Next::Idle,
                }
            };

            let fill_to = match next {
                Next::Idle => {
                    yield Ok(StreamItem::KeepAlive);
                    continue;
                }
                Next::Closed => {
                    info!(scope = %scope, last, "Live channel closed, ending subscription");
                    return;
                }
                Next::Item(BrokerItem::Projection(event)) => {
                    yield Ok(StreamItem::Projection(event));
                    continue;
                }
                Next::Item(BrokerItem::Event(event)) => {
                    if event.seq <= last {
                        continue;
                    }
                    if event.seq == last + 1 {
                        last = event.seq;
                        delivered.store(last, Ordering::SeqCst);
                        yield Ok(StreamItem::Event(event));
                        continue;
                    }
                    event.seq
                }
                Next::Resync => match reader.head().await {
                    Ok(head) if head > last => head,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(scope = %scope, error = %e, "Resync failed, closing subscription");
                        yield Err(e);
                        return;
                    }
                },
            };

            debug!(scope = %scope, from = last + 1, to = fill_to, "Filling gap from history");
            match reader.range(last, fill_to).await {
                Ok(missing) => {
                    for event in missing {
                        last = event.seq;
                        delivered.store(last, Ordering::SeqCst);
                        yield Ok(StreamItem::Event(event));
                    }
                }
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Gap fill failed, closing subscription");
                    yield Err(e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryEventStore;
    use smartspace_core::{EntityIdType, EventPayload, IdentityId, SpaceId};

    fn setup(page_size: usize) -> (EventLog, StreamGateway) {
        let config = RuntimeConfig {
            replay_page_size: page_size,
            keepalive_interval: Duration::from_millis(200),
            ..RuntimeConfig::development()
        };
        let log = EventLog::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(FanoutBroker::new(4, 64)),
            config.retry.clone(),
        );
        let gateway = StreamGateway::new(&log, &config);
        (log, gateway)
    }

    fn message(n: usize) -> EventPayload {
        EventPayload::UserMessage {
            sender: IdentityId::now_v7(),
            content: format!("m{}", n),
        }
    }

    async fn collect(sub: &mut Subscription, count: usize) -> Vec<Seq> {
        let mut seqs = Vec::new();
        while seqs.len() < count {
            let event = tokio::time::timeout(Duration::from_secs(2), sub.next_event())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("stream error");
            seqs.push(event.seq);
        }
        seqs
    }

    #[tokio::test]
    async fn test_beginning_replays_full_history_across_pages() {
        let (log, gateway) = setup(3);
        let scope = ScopeId::Space(SpaceId::now_v7());
        for n in 0..10 {
            log.append(scope, message(n)).await.unwrap();
        }
        let mut sub = gateway.subscribe(scope, ReplayFrom::Beginning).await.unwrap();
        assert_eq!(collect(&mut sub, 10).await, (1..=10).collect::<Vec<_>>());
        assert_eq!(sub.cursor().seq, 10);
    }

    #[tokio::test]
    async fn test_latest_skips_history_and_tails_live() {
        let (log, gateway) = setup(8);
        let scope = ScopeId::Space(SpaceId::now_v7());
        log.append(scope, message(0)).await.unwrap();

        let mut sub = gateway.subscribe(scope, ReplayFrom::Latest).await.unwrap();
        log.append(scope, message(1)).await.unwrap();
        log.append(scope, message(2)).await.unwrap();
        assert_eq!(collect(&mut sub, 2).await, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_gap_in_live_channel_is_filled_from_store() {
        let (log, gateway) = setup(8);
        let scope = ScopeId::Space(SpaceId::now_v7());
        let mut sub = gateway.subscribe(scope, ReplayFrom::Latest).await.unwrap();

        // Persist without publishing, then publish a later event.
        log.store().append(scope, message(1)).await.unwrap();
        log.store().append(scope, message(2)).await.unwrap();
        log.append(scope, message(3)).await.unwrap();

        assert_eq!(collect(&mut sub, 3).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicates_are_dropped() {
        let (log, gateway) = setup(8);
        let scope = ScopeId::Space(SpaceId::now_v7());
        let mut sub = gateway.subscribe(scope, ReplayFrom::Latest).await.unwrap();

        let first = log.append(scope, message(1)).await.unwrap();
        log.broker().publish(Arc::new(first));
        log.append(scope, message(2)).await.unwrap();
        assert_eq!(collect(&mut sub, 2).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_keepalive_on_idle() {
        let (_log, gateway) = setup(8);
        let scope = ScopeId::Space(SpaceId::now_v7());
        let mut sub = gateway.subscribe(scope, ReplayFrom::Latest).await.unwrap();
        let item = tokio::time::timeout(Duration::from_secs(2), sub.next_item())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item, StreamItem::KeepAlive);
    }

    #[tokio::test]
    async fn test_cursor_for_other_scope_is_rejected() {
        let (_log, gateway) = setup(8);
        let scope = ScopeId::Space(SpaceId::now_v7());
        let other = ResumeCursor::new(ScopeId::Space(SpaceId::now_v7()), 0);
        let result = gateway.subscribe_with_cursor(scope, Some(&other)).await;
        assert!(matches!(
            result.err(),
            Some(smartspace_core::SpaceError::Stream(StreamError::ScopeMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn test_cursor_ahead_of_head_is_rejected() {
        let (log, gateway) = setup(8);
        let scope = ScopeId::Space(SpaceId::now_v7());
        log.append(scope, message(0)).await.unwrap();
        let result = gateway.subscribe(scope, ReplayFrom::After(5)).await;
        assert!(matches!(
            result.err(),
            Some(smartspace_core::SpaceError::Stream(StreamError::CursorAhead { head: 1, .. }))
        ));
    }

    #[tokio::test]
    async fn test_projection_passes_through() {
        let (log, gateway) = setup(8);
        let space = ScopeId::Space(SpaceId::now_v7());
        let run = ScopeId::Run(smartspace_core::RunId::now_v7());
        let mut sub = gateway.subscribe(space, ReplayFrom::Latest).await.unwrap();

        let run_event = log.append(run, message(0)).await.unwrap();
        log.project(space, &run_event);
        match tokio::time::timeout(Duration::from_secs(2), sub.next_item())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            StreamItem::Projection(event) => assert_eq!(event.scope, run),
            other => panic!("expected projection, got {:?}", other),
        }
        assert_eq!(sub.last_seq(), 0);
    }
}
