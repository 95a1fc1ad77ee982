//! Dual-sink event writer: durable store first, then the fanout broker.

use crate::retry::with_retry;
use crate::{EventStore, FanoutBroker};
use smartspace_core::{Event, EventPayload, RetryConfig, ScopeId, Seq, SpaceResult};
use std::sync::Arc;
use tracing::{debug, error};

/// Writes events to the durable store and publishes them live.
///
/// An append returns only once the event is durable. Publishing happens
/// afterwards and cannot fail the append.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    broker: Arc<FanoutBroker>,
    retry: RetryConfig,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, broker: Arc<FanoutBroker>, retry: RetryConfig) -> Self {
        Self {
            store,
            broker,
            retry,
        }
    }

    /// Append `payload` to `scope` and publish the persisted event.
    pub async fn append(&self, scope: ScopeId, payload: EventPayload) -> SpaceResult<Event> {
        let event_type = payload.event_type();
        let store = &self.store;
        let event = with_retry(&self.retry, "event_append", move || {
            store.append(scope, payload.clone())
        })
        .await
        .map_err(|e| {
            error!(scope = %scope, event_type, error = %e, "Event append failed");
            e
        })?;

        debug!(scope = %scope, seq = event.seq, event_type, "Event appended");
        self.broker.publish(Arc::new(event.clone()));
        Ok(event)
    }

    /// Mirror an already persisted event onto another scope's live channel.
    pub fn project(&self, target: ScopeId, event: &Event) {
        self.broker.project(target, Arc::new(event.clone()));
    }

    /// Durable history of `scope` after `after`, at most `limit` events.
    pub async fn read_from(&self, scope: ScopeId, after: Seq, limit: usize) -> SpaceResult<Vec<Event>> {
        let store = &self.store;
        with_retry(&self.retry, "event_read", move || store.read_from(scope, after, limit)).await
    }

    /// The last `limit` events of `scope`, oldest first.
    pub async fn read_tail(&self, scope: ScopeId, limit: usize) -> SpaceResult<Vec<Event>> {
        let head = self.head(scope).await?;
        let after = head.saturating_sub(limit as Seq);
        self.read_from(scope, after, limit).await
    }

    pub async fn head(&self, scope: ScopeId) -> SpaceResult<Seq> {
        let store = &self.store;
        with_retry(&self.retry, "event_head", move || store.head(scope)).await
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<FanoutBroker> {
        &self.broker
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }
}
